use crate::api::PlannerApi;
use crate::model::{format_local_time, Block, Preview};
use crate::{config, ui};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{Local, NaiveDate};

pub fn blocks(date: Option<String>) -> Result<()> {
    let date = parse_date(date.as_deref())?;
    let api = backend()?;
    let blocks = api
        .list_blocks(date)
        .with_context(|| format!("listing blocks for {}", date))?;
    print_day(date, &blocks);
    Ok(())
}

pub fn preview(text: String, priority: Option<u32>, confirm: bool) -> Result<()> {
    let api = backend()?;
    let preview = api
        .preview_note(&text, priority.filter(|p| *p > 0))
        .context("requesting note preview")?;
    print_preview(&preview);
    if confirm {
        api.confirm_plan(&preview, &text).context("confirming plan")?;
        println!("Plan gespeichert.");
    }
    Ok(())
}

pub fn plan(text: String, confirm: bool) -> Result<()> {
    let api = backend()?;
    let preview = api
        .plan_from_text(&text)
        .context("requesting plan from command")?;
    print_preview(&preview);
    if confirm {
        api.confirm_plan(&preview, &text).context("confirming plan")?;
        println!("Plan gespeichert.");
    }
    Ok(())
}

pub fn adjust(
    block_id: String,
    date: Option<String>,
    shift: Option<i64>,
    extend: Option<i64>,
) -> Result<()> {
    if shift.is_none() && extend.is_none() {
        bail!("nothing to do: pass --shift or --extend");
    }
    let date = parse_date(date.as_deref())?;
    let api = backend()?;
    let blocks = api
        .list_blocks(date)
        .with_context(|| format!("listing blocks for {}", date))?;
    let block = blocks
        .iter()
        .find(|b| b.id == block_id)
        .ok_or_else(|| anyhow!("block {} not found on {}", block_id, date))?;
    let request = match (shift, extend) {
        (Some(minutes), _) => block.shifted(minutes),
        (None, Some(minutes)) => block.extended(minutes),
        (None, None) => unreachable!(),
    };
    api.adjust_block(&request)
        .with_context(|| format!("adjusting block {}", block_id))?;
    let refreshed = api
        .list_blocks(date)
        .with_context(|| format!("listing blocks for {}", date))?;
    println!("Plan aktualisiert.");
    print_day(date, &refreshed);
    Ok(())
}

pub fn tui() -> Result<()> {
    ui::run(backend()?)
}

fn backend() -> Result<PlannerApi> {
    let url = config::backend_url()?;
    PlannerApi::new(&url).with_context(|| format!("building client for {}", url))
}

fn parse_date(input: Option<&str>) -> Result<NaiveDate> {
    match input {
        None => Ok(Local::now().date_naive()),
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map_err(|_| anyhow!("invalid date format (use YYYY-MM-DD): {}", raw)),
    }
}

fn print_day(date: NaiveDate, blocks: &[Block]) {
    println!("Tagesplan {}", date);
    if blocks.is_empty() {
        println!("  Keine Blöcke für diesen Tag.");
        return;
    }
    for block in blocks {
        println!("  - {}: {}", block.id, block.title);
        println!("    {}", block_summary(block));
    }
}

fn print_preview(preview: &Preview) {
    println!("Schritte:");
    if preview.steps.is_empty() {
        println!("  (keine)");
    }
    for step in &preview.steps {
        let priority = step
            .priority
            .map(|p| format!(" • Priorität {}", p))
            .unwrap_or_default();
        println!("  - {} ({} Min{})", step.title, step.duration_minutes, priority);
    }
    println!("Vorgeschlagene Blöcke:");
    if preview.suggested_blocks.is_empty() {
        println!("  (keine)");
    }
    for block in &preview.suggested_blocks {
        println!("  - {}", block.title);
        println!("    {}", block_summary(block));
    }
    if !preview.conflicts.is_empty() {
        println!("Konflikte:");
        for conflict in &preview.conflicts {
            println!("  - {}", conflict);
        }
    }
}

fn block_summary(block: &Block) -> String {
    let mut summary = format!(
        "{} – {} • {} Min • {}",
        format_local_time(&block.start_iso),
        format_local_time(&block.end_iso),
        block.duration_minutes,
        block.category_label()
    );
    if block.fixed {
        summary.push_str(" • fest");
    }
    summary
}
