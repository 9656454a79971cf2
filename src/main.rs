use anyhow::Result;
use clap::Parser;

use tagplan::{cli, commands, config};

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    match args.command.unwrap_or(cli::Command::Tui) {
        cli::Command::Blocks { date } => {
            init_stderr_logging();
            commands::blocks(date)
        }
        cli::Command::Preview {
            text,
            priority,
            confirm,
        } => {
            init_stderr_logging();
            commands::preview(text, priority, confirm)
        }
        cli::Command::Plan { text, confirm } => {
            init_stderr_logging();
            commands::plan(text, confirm)
        }
        cli::Command::Adjust {
            block_id,
            date,
            shift,
            extend,
        } => {
            init_stderr_logging();
            commands::adjust(block_id, date, shift, extend)
        }
        cli::Command::Tui => {
            // The alternate screen owns stdout/stderr, so the interactive
            // view logs to a file instead.
            let _guard = init_file_logging()?;
            commands::tui()
        }
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_env("TAGPLAN_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tagplan=info"))
}

fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

fn init_file_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let dir = config::data_dir()?;
    std::fs::create_dir_all(&dir)?;
    let appender = tracing_appender::rolling::daily(dir, "tagplan.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}
