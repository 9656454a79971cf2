use crate::api::{spawn_worker, Job, Outcome, PlannerApi};
use crate::model::{format_local_time, parse_priority, Block, Preview};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::prelude::{Alignment, Color, Modifier, Rect, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block as UiBlock, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::Terminal;
use std::io::{stdout, Stdout};
use std::sync::mpsc::{Receiver, Sender};
use std::time::Duration;

const MSG_PREVIEW_ERROR: &str = "Fehler bei der Vorschau.";
const MSG_CONFIRM_ERROR: &str = "Fehler beim Speichern.";
const MSG_PLAN_ERROR: &str = "Fehler bei der NLP-Planung.";
const MSG_ADJUST_ERROR: &str = "Fehler bei der Anpassung.";
const MSG_CONFIRM_OK: &str = "Plan gespeichert.";
const MSG_ADJUST_OK: &str = "Plan aktualisiert.";
const MSG_BUSY: &str = "Bitte warten…";
const MSG_NO_BLOCKS: &str = "Keine Blöcke für diesen Tag.";
const MSG_PREVIEW_DISCARDED: &str = "Vorschau verworfen.";
const MSG_NO_SELECTION: &str = "Kein Block ausgewählt.";

pub fn run(api: PlannerApi) -> Result<()> {
    let backend = api.base_url().to_string();
    let (jobs, outcomes) = spawn_worker(api);
    let mut terminal = setup_terminal()?;
    let mut app = App::new(jobs, outcomes, backend, Local::now().date_naive());
    let result = app.event_loop(&mut terminal);
    teardown_terminal(&mut terminal)?;
    result
}

#[derive(Debug, Clone, PartialEq)]
enum RequestState {
    Idle,
    Pending,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionKind {
    ListBlocks,
    PreviewNote,
    ConfirmPlan,
    PlanCommand,
    AdjustBlock,
}

#[derive(Debug)]
struct Slot {
    state: RequestState,
    generation: u64,
}

/// One request slot per user action. Each submission bumps the slot's
/// generation; an outcome carrying an older generation is ignored.
#[derive(Debug)]
struct RequestTracker {
    slots: [Slot; 5],
}

impl RequestTracker {
    fn new() -> Self {
        RequestTracker {
            slots: std::array::from_fn(|_| Slot {
                state: RequestState::Idle,
                generation: 0,
            }),
        }
    }

    fn index(kind: ActionKind) -> usize {
        match kind {
            ActionKind::ListBlocks => 0,
            ActionKind::PreviewNote => 1,
            ActionKind::ConfirmPlan => 2,
            ActionKind::PlanCommand => 3,
            ActionKind::AdjustBlock => 4,
        }
    }

    fn begin(&mut self, kind: ActionKind) -> u64 {
        let slot = &mut self.slots[Self::index(kind)];
        slot.generation += 1;
        slot.state = RequestState::Pending;
        slot.generation
    }

    /// Returns false when the outcome belongs to a superseded submission.
    fn settle(&mut self, kind: ActionKind, generation: u64, state: RequestState) -> bool {
        let slot = &mut self.slots[Self::index(kind)];
        if slot.generation != generation {
            return false;
        }
        slot.state = state;
        true
    }

    fn any_pending(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.state == RequestState::Pending)
    }
}

enum Mode {
    Normal,
    EditingNote(NoteForm),
    EditingCommand(FieldValue),
}

struct NoteForm {
    text: FieldValue,
    priority: FieldValue,
    field: NoteField,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum NoteField {
    Text,
    Priority,
}

impl NoteForm {
    fn new(text: &str, priority: &str) -> Self {
        NoteForm {
            text: FieldValue::new(text),
            priority: FieldValue::new(priority),
            field: NoteField::Text,
        }
    }

    fn next_field(&mut self) {
        self.field = match self.field {
            NoteField::Text => NoteField::Priority,
            NoteField::Priority => NoteField::Text,
        };
    }

    fn active_field_mut(&mut self) -> &mut FieldValue {
        match self.field {
            NoteField::Text => &mut self.text,
            NoteField::Priority => &mut self.priority,
        }
    }
}

#[derive(Clone)]
struct FieldValue {
    value: String,
    cursor: usize,
}

impl FieldValue {
    fn new(value: &str) -> Self {
        FieldValue {
            value: value.to_string(),
            cursor: value.len(),
        }
    }

    fn move_left(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.cursor = prev_grapheme(self.cursor, &self.value);
    }

    fn move_right(&mut self) {
        if self.cursor >= self.value.len() {
            return;
        }
        self.cursor = next_grapheme(self.cursor, &self.value);
    }

    fn backspace(&mut self) {
        if self.cursor == 0 {
            return;
        }
        let prev = prev_grapheme(self.cursor, &self.value);
        self.value.drain(prev..self.cursor);
        self.cursor = prev;
    }

    fn insert_char(&mut self, ch: char) {
        self.value.insert(self.cursor, ch);
        self.cursor += ch.len_utf8();
    }

    fn with_caret(&self) -> String {
        let mut text = self.value.clone();
        text.insert_str(self.cursor, "▌");
        text
    }
}

struct App {
    jobs: Sender<Job>,
    outcomes: Receiver<Outcome>,
    backend: String,
    date: NaiveDate,
    blocks: Vec<Block>,
    preview: Option<Preview>,
    note_text: String,
    priority_text: String,
    command_text: String,
    selected_block: usize,
    status: String,
    mode: Mode,
    requests: RequestTracker,
}

impl App {
    fn new(
        jobs: Sender<Job>,
        outcomes: Receiver<Outcome>,
        backend: String,
        date: NaiveDate,
    ) -> Self {
        let mut app = App {
            jobs,
            outcomes,
            backend,
            date,
            blocks: Vec::new(),
            preview: None,
            note_text: String::new(),
            priority_text: "3".to_string(),
            command_text: String::new(),
            selected_block: 0,
            status: String::new(),
            mode: Mode::Normal,
            requests: RequestTracker::new(),
        };
        app.refresh_blocks();
        app
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        loop {
            while let Ok(outcome) = self.outcomes.try_recv() {
                self.apply_outcome(outcome);
            }
            terminal.draw(|f| self.draw(f))?;
            if event::poll(Duration::from_millis(200))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    if self.handle_key(key)? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        match self.mode {
            Mode::Normal => self.handle_normal_key(key),
            Mode::EditingNote(_) => {
                self.handle_note_key(key);
                Ok(false)
            }
            Mode::EditingCommand(_) => {
                self.handle_command_key(key);
                Ok(false)
            }
        }
    }

    fn handle_normal_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('n') => {
                self.mode = Mode::EditingNote(NoteForm::new(&self.note_text, &self.priority_text));
                self.status =
                    "Notiz bearbeiten (Tab wechselt Feld, Ctrl+Enter Vorschau, Esc abbrechen)"
                        .into();
            }
            KeyCode::Char('c') => {
                self.mode = Mode::EditingCommand(FieldValue::new(&self.command_text));
                self.status = "Befehl eingeben (Enter planen, Esc abbrechen)".into();
            }
            KeyCode::Char('y') => self.confirm_preview(),
            KeyCode::Char('v') => self.discard_preview(),
            KeyCode::Char('r') => self.refresh_blocks(),
            KeyCode::Char('[') => self.set_date(self.date - ChronoDuration::days(1)),
            KeyCode::Char(']') => self.set_date(self.date + ChronoDuration::days(1)),
            KeyCode::Char('t') => self.set_date(Local::now().date_naive()),
            KeyCode::Up | KeyCode::Char('k') => {
                if self.selected_block > 0 {
                    self.selected_block -= 1;
                }
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.selected_block + 1 < self.blocks.len() {
                    self.selected_block += 1;
                }
            }
            KeyCode::Char('+') => self.shift_selected(15),
            KeyCode::Char('-') => self.shift_selected(-15),
            KeyCode::Char('e') => self.extend_selected(15),
            _ => {}
        }
        Ok(false)
    }

    fn handle_note_key(&mut self, key: KeyEvent) {
        let mut close_form = false;
        let mut mode = std::mem::replace(&mut self.mode, Mode::Normal);
        if let Mode::EditingNote(form) = &mut mode {
            match key.code {
                KeyCode::Esc => {
                    close_form = true;
                    self.status = "Abgebrochen.".into();
                }
                KeyCode::Tab | KeyCode::BackTab => form.next_field(),
                KeyCode::Left => form.active_field_mut().move_left(),
                KeyCode::Right => form.active_field_mut().move_right(),
                KeyCode::Backspace => form.active_field_mut().backspace(),
                KeyCode::Enter => {
                    let control = key.modifiers.contains(KeyModifiers::CONTROL);
                    if form.field == NoteField::Text && !control {
                        form.active_field_mut().insert_char('\n');
                    } else {
                        self.note_text = form.text.value.clone();
                        self.priority_text = form.priority.value.clone();
                        close_form = self.submit_preview();
                    }
                }
                KeyCode::Char(ch) => {
                    if !key
                        .modifiers
                        .intersects(KeyModifiers::CONTROL | KeyModifiers::ALT)
                    {
                        form.active_field_mut().insert_char(ch);
                    }
                }
                _ => {}
            }
        }
        self.mode = if close_form { Mode::Normal } else { mode };
    }

    fn handle_command_key(&mut self, key: KeyEvent) {
        let mut close_form = false;
        let mut mode = std::mem::replace(&mut self.mode, Mode::Normal);
        if let Mode::EditingCommand(field) = &mut mode {
            match key.code {
                KeyCode::Esc => {
                    close_form = true;
                    self.status = "Abgebrochen.".into();
                }
                KeyCode::Left => field.move_left(),
                KeyCode::Right => field.move_right(),
                KeyCode::Backspace => field.backspace(),
                KeyCode::Enter => {
                    self.command_text = field.value.clone();
                    close_form = self.submit_command();
                }
                KeyCode::Char(ch) => {
                    if !key
                        .modifiers
                        .intersects(KeyModifiers::CONTROL | KeyModifiers::ALT)
                    {
                        field.insert_char(ch);
                    }
                }
                _ => {}
            }
        }
        self.mode = if close_form { Mode::Normal } else { mode };
    }

    /// While any request is pending the trigger does nothing and the
    /// status line asks the user to wait.
    fn submit_preview(&mut self) -> bool {
        if self.requests.any_pending() {
            self.status = MSG_BUSY.into();
            return false;
        }
        let generation = self.requests.begin(ActionKind::PreviewNote);
        let _ = self.jobs.send(Job::PreviewNote {
            generation,
            text: self.note_text.clone(),
            priority: parse_priority(&self.priority_text),
        });
        self.status.clear();
        true
    }

    fn submit_command(&mut self) -> bool {
        if self.requests.any_pending() {
            self.status = MSG_BUSY.into();
            return false;
        }
        let generation = self.requests.begin(ActionKind::PlanCommand);
        let _ = self.jobs.send(Job::PlanCommand {
            generation,
            text: self.command_text.clone(),
        });
        self.status.clear();
        true
    }

    fn confirm_preview(&mut self) {
        let Some(preview) = self.preview.clone() else {
            return;
        };
        if self.requests.any_pending() {
            self.status = MSG_BUSY.into();
            return;
        }
        let generation = self.requests.begin(ActionKind::ConfirmPlan);
        let _ = self.jobs.send(Job::ConfirmPlan {
            generation,
            preview,
            note_text: self.note_text.clone(),
        });
        self.status.clear();
    }

    fn discard_preview(&mut self) {
        if self.preview.take().is_some() {
            self.status = MSG_PREVIEW_DISCARDED.into();
        }
    }

    fn shift_selected(&mut self, minutes: i64) {
        let Some(block) = self.blocks.get(self.selected_block) else {
            self.status = MSG_NO_SELECTION.into();
            return;
        };
        let request = block.shifted(minutes);
        let generation = self.requests.begin(ActionKind::AdjustBlock);
        let _ = self.jobs.send(Job::AdjustBlock {
            generation,
            request,
        });
        self.status.clear();
    }

    fn extend_selected(&mut self, minutes: i64) {
        let Some(block) = self.blocks.get(self.selected_block) else {
            self.status = MSG_NO_SELECTION.into();
            return;
        };
        let request = block.extended(minutes);
        let generation = self.requests.begin(ActionKind::AdjustBlock);
        let _ = self.jobs.send(Job::AdjustBlock {
            generation,
            request,
        });
        self.status.clear();
    }

    fn set_date(&mut self, date: NaiveDate) {
        if date == self.date {
            return;
        }
        self.date = date;
        self.selected_block = 0;
        self.refresh_blocks();
    }

    fn refresh_blocks(&mut self) {
        let generation = self.requests.begin(ActionKind::ListBlocks);
        let _ = self.jobs.send(Job::FetchBlocks {
            generation,
            date: self.date,
        });
    }

    fn apply_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Blocks {
                generation,
                date,
                result,
            } => {
                let state = match &result {
                    Ok(_) => RequestState::Succeeded,
                    Err(err) => RequestState::Failed(err.to_string()),
                };
                if !self.requests.settle(ActionKind::ListBlocks, generation, state) {
                    return;
                }
                if date != self.date {
                    // The selected date moved on while the request was in
                    // flight; a stale day must not overwrite the list.
                    return;
                }
                if let Ok(blocks) = result {
                    self.blocks = blocks;
                    self.selected_block = self
                        .selected_block
                        .min(self.blocks.len().saturating_sub(1));
                }
            }
            Outcome::NotePreview { generation, result } => match result {
                Ok(preview) => {
                    if !self.requests.settle(
                        ActionKind::PreviewNote,
                        generation,
                        RequestState::Succeeded,
                    ) {
                        return;
                    }
                    self.preview = Some(preview);
                    self.status.clear();
                }
                Err(err) => {
                    if !self.requests.settle(
                        ActionKind::PreviewNote,
                        generation,
                        RequestState::Failed(err.to_string()),
                    ) {
                        return;
                    }
                    self.status = MSG_PREVIEW_ERROR.into();
                }
            },
            Outcome::CommandPlan { generation, result } => match result {
                Ok(preview) => {
                    if !self.requests.settle(
                        ActionKind::PlanCommand,
                        generation,
                        RequestState::Succeeded,
                    ) {
                        return;
                    }
                    self.preview = Some(preview);
                    self.status.clear();
                }
                Err(err) => {
                    if !self.requests.settle(
                        ActionKind::PlanCommand,
                        generation,
                        RequestState::Failed(err.to_string()),
                    ) {
                        return;
                    }
                    self.status = MSG_PLAN_ERROR.into();
                }
            },
            Outcome::Confirmed { generation, result } => match result {
                Ok(()) => {
                    if !self.requests.settle(
                        ActionKind::ConfirmPlan,
                        generation,
                        RequestState::Succeeded,
                    ) {
                        return;
                    }
                    self.preview = None;
                    self.status = MSG_CONFIRM_OK.into();
                    self.refresh_blocks();
                }
                Err(err) => {
                    if !self.requests.settle(
                        ActionKind::ConfirmPlan,
                        generation,
                        RequestState::Failed(err.to_string()),
                    ) {
                        return;
                    }
                    // Preview stays so the user can retry the confirm.
                    self.status = MSG_CONFIRM_ERROR.into();
                }
            },
            Outcome::Adjusted { generation, result } => match result {
                Ok(()) => {
                    if !self.requests.settle(
                        ActionKind::AdjustBlock,
                        generation,
                        RequestState::Succeeded,
                    ) {
                        return;
                    }
                    self.status = MSG_ADJUST_OK.into();
                    self.refresh_blocks();
                }
                Err(err) => {
                    if !self.requests.settle(
                        ActionKind::AdjustBlock,
                        generation,
                        RequestState::Failed(err.to_string()),
                    ) {
                        return;
                    }
                    self.status = MSG_ADJUST_ERROR.into();
                }
            },
        }
    }

    fn draw(&self, f: &mut ratatui::Frame<'_>) {
        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(8),
                Constraint::Length(4),
            ])
            .split(f.size());

        self.draw_header(f, layout[0]);
        self.draw_body(f, layout[1]);
        self.draw_footer(f, layout[2]);

        match &self.mode {
            Mode::EditingNote(form) => self.draw_note_form(f, form),
            Mode::EditingCommand(field) => self.draw_command_form(f, field),
            Mode::Normal => {}
        }
    }

    fn draw_header(&self, f: &mut ratatui::Frame<'_>, area: Rect) {
        let mut spans = vec![
            Span::styled(
                "tagplan ",
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                "Intelligenter Kalender",
                Style::default().add_modifier(Modifier::BOLD),
            ),
            Span::raw("  •  "),
            Span::styled(
                self.date.format("%Y-%m-%d").to_string(),
                Style::default().fg(Color::Green),
            ),
            Span::raw("  •  "),
            Span::styled(self.backend.clone(), Style::default().fg(Color::DarkGray)),
        ];
        if self.requests.any_pending() {
            spans.push(Span::raw("  •  "));
            spans.push(Span::styled(
                MSG_BUSY,
                Style::default().fg(Color::LightYellow),
            ));
        }

        let block = UiBlock::default()
            .borders(Borders::BOTTOM)
            .border_style(Style::default().fg(Color::DarkGray));
        let paragraph = Paragraph::new(Line::from(spans))
            .alignment(Alignment::Center)
            .block(block);
        f.render_widget(paragraph, area);
    }

    fn draw_body(&self, f: &mut ratatui::Frame<'_>, area: Rect) {
        let rows = if self.preview.is_some() {
            Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(6),
                    Constraint::Min(8),
                    Constraint::Min(6),
                ])
                .split(area)
        } else {
            Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Length(6), Constraint::Min(8)])
                .split(area)
        };

        self.draw_inputs(f, rows[0]);
        if let Some(preview) = &self.preview {
            self.draw_preview(f, rows[1], preview);
            self.draw_day_plan(f, rows[2]);
        } else {
            self.draw_day_plan(f, rows[1]);
        }
    }

    fn draw_inputs(&self, f: &mut ratatui::Frame<'_>, area: Rect) {
        let halves = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(area);

        let note_line = if self.note_text.trim().is_empty() {
            Line::from(Span::styled(
                "Kurze Notiz oder Idee eingeben (n)",
                Style::default().fg(Color::DarkGray),
            ))
        } else {
            Line::from(self.note_text.replace('\n', " "))
        };
        let note = Paragraph::new(vec![
            note_line,
            Line::from(vec![
                Span::styled("Priorität ", Style::default().fg(Color::Gray)),
                Span::raw(self.priority_text.clone()),
            ]),
        ])
        .wrap(Wrap { trim: true })
        .block(section_block("Intelligente Notiz"));
        f.render_widget(note, halves[0]);

        let command_line = if self.command_text.trim().is_empty() {
            Line::from(Span::styled(
                "z.B. 'Verschiebe Sport auf 18 Uhr' (c)",
                Style::default().fg(Color::DarkGray),
            ))
        } else {
            Line::from(self.command_text.clone())
        };
        let command = Paragraph::new(vec![command_line])
            .wrap(Wrap { trim: true })
            .block(section_block("Natürliche Sprache"));
        f.render_widget(command, halves[1]);
    }

    fn draw_preview(&self, f: &mut ratatui::Frame<'_>, area: Rect, preview: &Preview) {
        let outer = section_block("Vorschau (y bestätigen, v verwerfen)");
        let inner = outer.inner(area);
        f.render_widget(outer, area);

        let halves = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(inner);

        let mut step_lines = vec![Line::from(Span::styled(
            "Schritte",
            Style::default().add_modifier(Modifier::BOLD),
        ))];
        if preview.steps.is_empty() {
            step_lines.push(Line::from(Span::styled(
                "(keine)",
                Style::default().fg(Color::DarkGray),
            )));
        }
        for step in &preview.steps {
            let mut text = format!("- {} • {} Min", step.title, step.duration_minutes);
            if let Some(priority) = step.priority {
                text.push_str(&format!(" • Priorität {}", priority));
            }
            step_lines.push(Line::from(text));
        }
        f.render_widget(Paragraph::new(step_lines).wrap(Wrap { trim: true }), halves[0]);

        let mut block_lines = vec![Line::from(Span::styled(
            "Vorgeschlagene Blöcke",
            Style::default().add_modifier(Modifier::BOLD),
        ))];
        if preview.suggested_blocks.is_empty() {
            block_lines.push(Line::from(Span::styled(
                "(keine)",
                Style::default().fg(Color::DarkGray),
            )));
        }
        for block in &preview.suggested_blocks {
            block_lines.push(Line::from(format!(
                "- {} {}",
                block.title,
                block_summary(block)
            )));
        }
        if !preview.conflicts.is_empty() {
            block_lines.push(Line::from(Span::styled(
                "Konflikte:",
                Style::default()
                    .fg(Color::LightYellow)
                    .add_modifier(Modifier::BOLD),
            )));
            for conflict in &preview.conflicts {
                block_lines.push(Line::from(Span::styled(
                    format!("• {}", conflict),
                    Style::default().fg(Color::LightYellow),
                )));
            }
        }
        f.render_widget(
            Paragraph::new(block_lines).wrap(Wrap { trim: true }),
            halves[1],
        );
    }

    fn draw_day_plan(&self, f: &mut ratatui::Frame<'_>, area: Rect) {
        let title = format!("Tagesplan {}", self.date.format("%Y-%m-%d"));
        let block = section_block(&title);

        if self.blocks.is_empty() {
            let empty = Paragraph::new(Span::styled(
                MSG_NO_BLOCKS,
                Style::default().fg(Color::Gray),
            ))
            .block(block);
            f.render_widget(empty, area);
            return;
        }

        let items = self
            .blocks
            .iter()
            .map(day_plan_item)
            .collect::<Vec<_>>();
        let list = List::new(items).block(block).highlight_style(
            Style::default()
                .bg(Color::LightCyan)
                .fg(Color::Black)
                .add_modifier(Modifier::BOLD),
        );
        let mut state = ListState::default();
        state.select(Some(self.selected_block.min(self.blocks.len() - 1)));
        f.render_stateful_widget(list, area, &mut state);
    }

    fn draw_footer(&self, f: &mut ratatui::Frame<'_>, area: Rect) {
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(2), Constraint::Length(2)])
            .split(area);

        let help = Paragraph::new(footer_help_line())
            .alignment(Alignment::Center)
            .block(
                UiBlock::default()
                    .borders(Borders::TOP)
                    .border_style(Style::default().fg(Color::DarkGray)),
            );
        f.render_widget(help, rows[0]);

        let status = Paragraph::new(self.status.clone())
            .wrap(Wrap { trim: true })
            .block(
                UiBlock::default()
                    .borders(Borders::TOP)
                    .border_style(Style::default().fg(Color::DarkGray)),
            );
        f.render_widget(status, rows[1]);
    }

    fn draw_note_form(&self, f: &mut ratatui::Frame<'_>, form: &NoteForm) {
        let area = centered_rect(70, 50, f.size());
        let mut lines = Vec::new();
        lines.extend(field_lines(
            "Notiz",
            &form.text,
            form.field == NoteField::Text,
        ));
        lines.extend(field_lines(
            "Priorität (1-5)",
            &form.priority,
            form.field == NoteField::Priority,
        ));
        lines.push(Line::from(Span::styled(
            "Ctrl+Enter Vorschau anfordern • Esc abbrechen • Tab Feld wechseln",
            Style::default().fg(Color::Gray),
        )));
        let dialog = Paragraph::new(lines)
            .wrap(Wrap { trim: true })
            .block(dialog_block("Intelligente Notiz"));
        f.render_widget(Clear, area);
        f.render_widget(dialog, area);
    }

    fn draw_command_form(&self, f: &mut ratatui::Frame<'_>, field: &FieldValue) {
        let area = centered_rect(70, 30, f.size());
        let lines = vec![
            Line::from(Span::styled(
                field.with_caret(),
                Style::default().fg(Color::Cyan),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "Enter automatisch planen • Esc abbrechen",
                Style::default().fg(Color::Gray),
            )),
        ];
        let dialog = Paragraph::new(lines)
            .wrap(Wrap { trim: true })
            .block(dialog_block("Natürliche Sprache"));
        f.render_widget(Clear, area);
        f.render_widget(dialog, area);
    }
}

fn section_block(title: &str) -> UiBlock<'static> {
    UiBlock::default()
        .title(Span::styled(
            title.to_string(),
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
}

fn dialog_block(title: &str) -> UiBlock<'static> {
    UiBlock::default()
        .title(Span::styled(
            title.to_string(),
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
}

fn day_plan_item(block: &Block) -> ListItem<'static> {
    let mut spans = vec![
        Span::styled(
            block.title.clone(),
            Style::default()
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw("  "),
        Span::styled(block_summary(block), Style::default().fg(Color::Gray)),
    ];
    if !block.id.is_empty() {
        spans.push(Span::raw("  "));
        spans.push(Span::styled(
            format!("[{}]", block.id),
            Style::default().fg(Color::DarkGray),
        ));
    }
    ListItem::new(Line::from(spans))
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

fn footer_help_line() -> Line<'static> {
    Line::from(vec![
        Span::styled("n", Style::default().fg(Color::LightMagenta)),
        Span::raw(" Notiz  "),
        Span::styled("c", Style::default().fg(Color::LightMagenta)),
        Span::raw(" Befehl  "),
        Span::styled("y", Style::default().fg(Color::LightGreen)),
        Span::raw(" bestätigen  "),
        Span::styled("v", Style::default().fg(Color::LightRed)),
        Span::raw(" verwerfen  "),
        Span::styled("↑↓", Style::default().fg(Color::LightCyan)),
        Span::raw(" wählen  "),
        Span::styled("+/-", Style::default().fg(Color::LightCyan)),
        Span::raw(" verschieben  "),
        Span::styled("e", Style::default().fg(Color::LightCyan)),
        Span::raw(" verlängern  "),
        Span::styled("[ ]", Style::default().fg(Color::LightYellow)),
        Span::raw(" Tag  "),
        Span::styled("r", Style::default().fg(Color::LightYellow)),
        Span::raw(" neu laden  "),
        Span::styled("q", Style::default().fg(Color::LightRed)),
        Span::raw(" beenden"),
    ])
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

fn teardown_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Percentage((100 - percent_y) / 2),
                Constraint::Percentage(percent_y),
                Constraint::Percentage((100 - percent_y) / 2),
            ]
            .as_ref(),
        )
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints(
            [
                Constraint::Percentage((100 - percent_x) / 2),
                Constraint::Percentage(percent_x),
                Constraint::Percentage((100 - percent_x) / 2),
            ]
            .as_ref(),
        )
        .split(popup_layout[1])[1]
}

fn field_lines(label: &str, field: &FieldValue, active: bool) -> Vec<Line<'static>> {
    let label_style = Style::default()
        .fg(Color::Gray)
        .add_modifier(Modifier::BOLD | Modifier::DIM);
    let value_style = Style::default().fg(if active { Color::Cyan } else { Color::White });
    let prefix = format!("{}: ", label);
    let spacer = " ".repeat(prefix.chars().count());
    let text = if active {
        field.with_caret()
    } else {
        field.value.clone()
    };
    let segments: Vec<&str> = if text.is_empty() {
        vec![""]
    } else {
        text.split('\n').collect()
    };
    segments
        .iter()
        .enumerate()
        .map(|(idx, line)| {
            Line::from(vec![
                Span::styled(
                    if idx == 0 {
                        prefix.clone()
                    } else {
                        spacer.clone()
                    },
                    label_style,
                ),
                Span::styled((*line).to_string(), value_style),
            ])
        })
        .collect()
}

fn prev_grapheme(cursor: usize, text: &str) -> usize {
    if cursor == 0 {
        return 0;
    }
    let mut prev = 0;
    for (idx, _) in text.char_indices() {
        if idx >= cursor {
            break;
        }
        prev = idx;
    }
    prev
}

fn next_grapheme(cursor: usize, text: &str) -> usize {
    for (idx, ch) in text.char_indices() {
        if idx > cursor {
            return idx;
        }
        if idx == cursor {
            return cursor + ch.len_utf8();
        }
    }
    text.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use std::sync::mpsc::channel;

    fn test_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn test_block(id: &str, title: &str) -> Block {
        Block {
            id: id.to_string(),
            title: title.to_string(),
            start_iso: "2024-01-01T09:00:00Z".parse().unwrap(),
            end_iso: "2024-01-01T10:00:00Z".parse().unwrap(),
            duration_minutes: 60,
            category: None,
            fixed: false,
        }
    }

    fn test_preview(conflicts: Vec<&str>) -> Preview {
        Preview {
            steps: vec![crate::model::Step {
                title: "Recherche".into(),
                duration_minutes: 30,
                priority: Some(3),
            }],
            suggested_blocks: vec![test_block("", "Recherche")],
            conflicts: conflicts.into_iter().map(str::to_string).collect(),
        }
    }

    struct Harness {
        app: App,
        submitted: Receiver<Job>,
    }

    fn harness() -> Harness {
        let (job_tx, job_rx) = channel();
        let (_outcome_tx, outcome_rx) = channel();
        let app = App::new(
            job_tx,
            outcome_rx,
            "http://localhost:8000".to_string(),
            test_date(),
        );
        Harness {
            app,
            submitted: job_rx,
        }
    }

    impl Harness {
        /// Answers the fetch App::new fires on startup so no request is
        /// pending any more.
        fn settle_initial_fetch(&mut self, blocks: Vec<Block>) {
            let generation = match self.submitted.try_recv().expect("initial fetch job") {
                Job::FetchBlocks { generation, .. } => generation,
                other => panic!("unexpected startup job: {:?}", other),
            };
            self.app.apply_outcome(Outcome::Blocks {
                generation,
                date: self.app.date,
                result: Ok(blocks),
            });
        }

        fn next_job(&self) -> Job {
            self.submitted.try_recv().expect("expected a submitted job")
        }

        fn assert_no_job(&self) {
            assert!(self.submitted.try_recv().is_err(), "unexpected job queued");
        }
    }

    fn http_error() -> ApiError {
        ApiError::Status {
            status: 500,
            body: "kaputt".into(),
        }
    }

    fn buffer_text(terminal: &mut Terminal<ratatui::backend::TestBackend>) -> String {
        let buf = terminal.backend().buffer();
        let area = buf.area;
        let mut out = String::new();
        for y in 0..area.height {
            for x in 0..area.width {
                out.push_str(buf.get(x, y).symbol());
            }
            out.push('\n');
        }
        out
    }

    fn render(app: &App) -> String {
        let backend = ratatui::backend::TestBackend::new(100, 32);
        let mut terminal = Terminal::new(backend).unwrap();
        terminal.draw(|f| app.draw(f)).unwrap();
        buffer_text(&mut terminal)
    }

    #[test]
    fn startup_fetches_blocks_for_the_selected_date() {
        let h = harness();
        match h.next_job() {
            Job::FetchBlocks { date, .. } => assert_eq!(date, test_date()),
            other => panic!("unexpected job: {:?}", other),
        }
    }

    #[test]
    fn date_change_submits_exactly_one_fetch_for_the_new_date() {
        let mut h = harness();
        h.settle_initial_fetch(vec![]);

        let next_day = test_date() + ChronoDuration::days(1);
        h.app.set_date(next_day);
        match h.next_job() {
            Job::FetchBlocks { date, .. } => assert_eq!(date, next_day),
            other => panic!("unexpected job: {:?}", other),
        }
        h.assert_no_job();

        // Re-selecting the already selected date is not a change.
        h.app.set_date(next_day);
        h.assert_no_job();
    }

    #[test]
    fn stale_block_response_for_old_date_is_discarded() {
        let mut h = harness();
        let first_generation = match h.next_job() {
            Job::FetchBlocks { generation, .. } => generation,
            other => panic!("unexpected job: {:?}", other),
        };

        let next_day = test_date() + ChronoDuration::days(1);
        h.app.set_date(next_day);
        let second_generation = match h.next_job() {
            Job::FetchBlocks { generation, .. } => generation,
            other => panic!("unexpected job: {:?}", other),
        };

        // The slow answer for the old date arrives after the date moved on.
        h.app.apply_outcome(Outcome::Blocks {
            generation: first_generation,
            date: test_date(),
            result: Ok(vec![test_block("old", "Alt")]),
        });
        assert!(h.app.blocks.is_empty());

        h.app.apply_outcome(Outcome::Blocks {
            generation: second_generation,
            date: next_day,
            result: Ok(vec![test_block("new", "Neu")]),
        });
        assert_eq!(h.app.blocks.len(), 1);
        assert_eq!(h.app.blocks[0].id, "new");
    }

    #[test]
    fn failed_block_fetch_keeps_previous_list() {
        let mut h = harness();
        h.settle_initial_fetch(vec![test_block("b-1", "Lernen")]);

        h.app.refresh_blocks();
        let generation = match h.next_job() {
            Job::FetchBlocks { generation, .. } => generation,
            other => panic!("unexpected job: {:?}", other),
        };
        h.app.apply_outcome(Outcome::Blocks {
            generation,
            date: h.app.date,
            result: Err(http_error()),
        });
        assert_eq!(h.app.blocks.len(), 1);
    }

    #[test]
    fn preview_trigger_is_inert_while_a_request_is_pending() {
        let mut h = harness();
        // Startup fetch still pending.
        assert!(!h.app.submit_preview());
        assert_eq!(h.app.status, MSG_BUSY);
        match h.next_job() {
            Job::FetchBlocks { .. } => {}
            other => panic!("unexpected job: {:?}", other),
        }
        h.assert_no_job();

        h.app.apply_outcome(Outcome::Blocks {
            generation: 1,
            date: h.app.date,
            result: Ok(vec![]),
        });
        assert!(h.app.submit_preview());
        match h.next_job() {
            Job::PreviewNote { .. } => {}
            other => panic!("unexpected job: {:?}", other),
        }
    }

    #[test]
    fn confirm_waits_while_another_request_is_in_flight() {
        let mut h = harness();
        // Startup fetch still pending.
        h.app.preview = Some(test_preview(vec![]));
        h.app.confirm_preview();
        assert_eq!(h.app.status, MSG_BUSY);
        match h.next_job() {
            Job::FetchBlocks { .. } => {}
            other => panic!("unexpected job: {:?}", other),
        }
        h.assert_no_job();
        assert!(h.app.preview.is_some());
    }

    #[test]
    fn note_preview_failure_sets_message_and_no_preview() {
        let mut h = harness();
        h.settle_initial_fetch(vec![]);

        h.app.note_text = "Ich muss heute Ads erstellen.".into();
        assert!(h.app.submit_preview());
        let generation = match h.next_job() {
            Job::PreviewNote { generation, .. } => generation,
            other => panic!("unexpected job: {:?}", other),
        };
        h.app.apply_outcome(Outcome::NotePreview {
            generation,
            result: Err(http_error()),
        });
        assert!(h.app.preview.is_none());
        assert_eq!(h.app.status, MSG_PREVIEW_ERROR);
    }

    #[test]
    fn command_plan_failure_sets_nlp_message() {
        let mut h = harness();
        h.settle_initial_fetch(vec![]);

        h.app.command_text = "Plane 2 Stunden Lernen ein.".into();
        assert!(h.app.submit_command());
        let generation = match h.next_job() {
            Job::PlanCommand { generation, .. } => generation,
            other => panic!("unexpected job: {:?}", other),
        };
        h.app.apply_outcome(Outcome::CommandPlan {
            generation,
            result: Err(http_error()),
        });
        assert_eq!(h.app.status, MSG_PLAN_ERROR);
    }

    #[test]
    fn confirm_success_clears_preview_and_refetches_blocks() {
        let mut h = harness();
        h.settle_initial_fetch(vec![]);
        h.app.preview = Some(test_preview(vec![]));
        h.app.note_text = "Notiztext".into();

        h.app.confirm_preview();
        let generation = match h.next_job() {
            Job::ConfirmPlan {
                generation,
                note_text,
                ..
            } => {
                assert_eq!(note_text, "Notiztext");
                generation
            }
            other => panic!("unexpected job: {:?}", other),
        };
        h.app.apply_outcome(Outcome::Confirmed {
            generation,
            result: Ok(()),
        });

        assert!(h.app.preview.is_none());
        assert_eq!(h.app.status, MSG_CONFIRM_OK);
        match h.next_job() {
            Job::FetchBlocks { date, .. } => assert_eq!(date, h.app.date),
            other => panic!("unexpected job: {:?}", other),
        }
    }

    #[test]
    fn confirm_failure_keeps_preview_for_retry() {
        let mut h = harness();
        h.settle_initial_fetch(vec![]);
        h.app.preview = Some(test_preview(vec![]));

        h.app.confirm_preview();
        let generation = match h.next_job() {
            Job::ConfirmPlan { generation, .. } => generation,
            other => panic!("unexpected job: {:?}", other),
        };
        h.app.apply_outcome(Outcome::Confirmed {
            generation,
            result: Err(http_error()),
        });

        assert!(h.app.preview.is_some());
        assert_eq!(h.app.status, MSG_CONFIRM_ERROR);
        h.assert_no_job();
    }

    #[test]
    fn shift_submits_moved_endpoints_without_extend() {
        let mut h = harness();
        h.settle_initial_fetch(vec![test_block("b-1", "Lernen")]);

        h.app.shift_selected(15);
        match h.next_job() {
            Job::AdjustBlock { request, .. } => {
                assert_eq!(request.block_id, "b-1");
                assert_eq!(
                    request.new_start_iso.as_deref(),
                    Some("2024-01-01T09:15:00Z")
                );
                assert_eq!(request.new_end_iso.as_deref(), Some("2024-01-01T10:15:00Z"));
                assert_eq!(request.extend_minutes, None);
            }
            other => panic!("unexpected job: {:?}", other),
        }
    }

    #[test]
    fn extend_submits_minutes_without_new_endpoints() {
        let mut h = harness();
        h.settle_initial_fetch(vec![test_block("b-1", "Lernen")]);

        h.app.extend_selected(15);
        match h.next_job() {
            Job::AdjustBlock { request, .. } => {
                assert_eq!(request.block_id, "b-1");
                assert_eq!(request.new_start_iso, None);
                assert_eq!(request.new_end_iso, None);
                assert_eq!(request.extend_minutes, Some(15));
            }
            other => panic!("unexpected job: {:?}", other),
        }
    }

    #[test]
    fn adjust_success_refetches_and_reports() {
        let mut h = harness();
        h.settle_initial_fetch(vec![test_block("b-1", "Lernen")]);

        h.app.shift_selected(-15);
        let generation = match h.next_job() {
            Job::AdjustBlock { generation, .. } => generation,
            other => panic!("unexpected job: {:?}", other),
        };
        h.app.apply_outcome(Outcome::Adjusted {
            generation,
            result: Ok(()),
        });
        assert_eq!(h.app.status, MSG_ADJUST_OK);
        match h.next_job() {
            Job::FetchBlocks { date, .. } => assert_eq!(date, h.app.date),
            other => panic!("unexpected job: {:?}", other),
        }
    }

    #[test]
    fn adjust_without_blocks_reports_missing_selection() {
        let mut h = harness();
        h.settle_initial_fetch(vec![]);

        h.app.shift_selected(15);
        assert_eq!(h.app.status, MSG_NO_SELECTION);
        h.assert_no_job();
    }

    #[test]
    fn empty_day_renders_explicit_no_blocks_state() {
        let mut h = harness();
        h.settle_initial_fetch(vec![]);

        let text = render(&h.app);
        assert!(text.contains(MSG_NO_BLOCKS));
    }

    #[test]
    fn day_plan_renders_block_titles_and_durations() {
        let mut h = harness();
        h.settle_initial_fetch(vec![test_block("b-1", "Lernen")]);

        let text = render(&h.app);
        assert!(text.contains("Lernen"));
        assert!(text.contains("60 Min"));
        assert!(!text.contains(MSG_NO_BLOCKS));
    }

    #[test]
    fn conflicts_render_once_each_in_order() {
        let mut h = harness();
        h.settle_initial_fetch(vec![]);
        h.app.preview = Some(test_preview(vec!["Konflikt A", "Konflikt B"]));

        let text = render(&h.app);
        assert_eq!(text.matches("Konflikt A").count(), 1);
        assert_eq!(text.matches("Konflikt B").count(), 1);
        assert!(text.find("Konflikt A").unwrap() < text.find("Konflikt B").unwrap());
    }

    #[test]
    fn pending_request_shows_wait_indicator() {
        let h = harness();
        let text = render(&h.app);
        assert!(text.contains(MSG_BUSY));
    }
}
