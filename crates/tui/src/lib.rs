use std::collections::HashMap;
use std::io::{self, Stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, Paragraph};
use ratatui::{Frame, Terminal};
use thiserror::Error;
use tokio::runtime::Runtime;
use trellis_adapters::export::export_page_to_csv;
use trellis_adapters::mysql::MysqlTableBackend;
use trellis_core::audit::{self, AuditOperation, AuditOutcome, AuditRecord, FileAuditTrail};
use trellis_core::config::{self, ViewerConfig};
use trellis_core::dirty_registry::{DirtyRegistry, TableKey};
use trellis_core::mutations::{
    self, AppliedMutation, MutationBackend, MutationCompletion, MutationJob, PreparedMutation,
};
use trellis_core::page_loader::{
    self, CompletionQueue, LoadCompletion, LoadRequest, LoadResult, PageBackend,
};
use trellis_core::profiles::FileProfilesStore;
use trellis_core::query_spec::QuerySpec;
use trellis_core::schema_catalog::SchemaCatalogService;
use trellis_core::table_view::{TableView, ViewId};
use trellis_core::value::{TableSchema, Value};

const TICK_RATE: Duration = Duration::from_millis(120);
const SCHEMA_CACHE_TTL: Duration = Duration::from_secs(60);
const SYSTEM_SCHEMAS: [&str; 4] = ["information_schema", "mysql", "performance_schema", "sys"];

#[derive(Debug, Error)]
pub enum TuiError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("profiles error: {0}")]
    Profiles(#[from] trellis_core::profiles::ProfilesError),
    #[error("schema catalog error: {0}")]
    Catalog(#[from] trellis_core::schema_catalog::SchemaCatalogError),
    #[error("no connection profile configured; add one to profiles.toml")]
    MissingProfile,
    #[error("no browsable table found on the connection")]
    NoBrowsableTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectionKey {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Browse,
    EditCell { buffer: String },
    FilterInput { buffer: String },
    InsertRow { buffer: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Msg {
    Quit,
    ToggleHelp,
    NextTab,
    DuplicateTab,
    CloseTab,
    Navigate(DirectionKey),
    PageMove(i64),
    JumpHome,
    JumpEnd,
    BeginEdit,
    BeginFilter,
    BeginInsert,
    DeleteRow,
    Refresh,
    ExportCsv,
    InputChar(char),
    InputBackspace,
    ConfirmInput,
    CancelInput,
    Tick,
}

/// A completed background operation handed back to the UI loop.
#[derive(Debug)]
enum Completion {
    Load(LoadCompletion),
    Mutation(MutationCompletion),
}

/// The whole client state driven by the single-threaded event loop.
///
/// Worker tasks only ever touch the completion queue; every view, the
/// registry, and the mode machine are mutated exclusively from here.
struct TuiApp<B> {
    backend: Arc<B>,
    config: ViewerConfig,
    queue: CompletionQueue<Completion>,
    registry: DirtyRegistry,
    views: Vec<TableView>,
    active: usize,
    next_view_id: u64,
    mode: Mode,
    mutating: HashMap<ViewId, AuditOperation>,
    pending_jobs: Vec<MutationJob>,
    audit: Option<FileAuditTrail>,
    viewport_rows: u64,
    show_help: bool,
    should_quit: bool,
    status_line: String,
    connection_name: String,
}

impl<B> TuiApp<B>
where
    B: PageBackend + MutationBackend + Send + Sync + 'static,
{
    fn new(backend: Arc<B>, config: ViewerConfig, connection_name: impl Into<String>) -> Self {
        Self {
            backend,
            config,
            queue: CompletionQueue::new(),
            registry: DirtyRegistry::new(),
            views: Vec::new(),
            active: 0,
            next_view_id: 0,
            mode: Mode::Browse,
            mutating: HashMap::new(),
            pending_jobs: Vec::new(),
            audit: None,
            viewport_rows: 20,
            show_help: false,
            should_quit: false,
            status_line: "Ready".to_string(),
            connection_name: connection_name.into(),
        }
    }

    fn open_table(&mut self, spec: QuerySpec, schema: Arc<TableSchema>) -> ViewId {
        self.next_view_id += 1;
        let id = ViewId::new(self.next_view_id);
        let view = TableView::new(id, self.connection_name.clone(), spec, schema);
        self.registry.register(TableKey::for_view(&view), id);
        self.views.push(view);
        self.active = self.views.len() - 1;
        id
    }

    fn close_active_tab(&mut self) {
        if self.views.len() <= 1 {
            self.status_line = "Cannot close the last tab".to_string();
            return;
        }
        let view = self.views.remove(self.active);
        self.registry
            .unregister(&TableKey::for_view(&view), view.id());
        if self.active >= self.views.len() {
            self.active = self.views.len() - 1;
        }
    }

    fn active_view(&self) -> &TableView {
        &self.views[self.active]
    }

    fn active_view_mut(&mut self) -> &mut TableView {
        &mut self.views[self.active]
    }

    fn view_mut(&mut self, id: ViewId) -> Option<&mut TableView> {
        self.views.iter_mut().find(|view| view.id() == id)
    }

    /// Fold every completed background operation into its view. Runs once
    /// per loop iteration, before redrawing.
    fn drain_completions(&mut self) {
        for completion in self.queue.drain() {
            match completion {
                Completion::Load(load) => {
                    let Some(view) = self.view_mut(load.view) else {
                        continue;
                    };
                    let key = TableKey::for_view(view);
                    let (rows, error) = match &load.result {
                        LoadResult::Loaded { page, .. } => (Some(page.len() as u64), None),
                        LoadResult::Failed { message } => (None, Some(message.clone())),
                    };
                    let failed = error.is_some();
                    let applied = page_loader::apply_completion(view, load);
                    let outcome = if !applied {
                        AuditOutcome::Discarded
                    } else if failed {
                        AuditOutcome::Failed
                    } else {
                        AuditOutcome::Succeeded
                    };
                    self.record_audit(&key, AuditOperation::Load, outcome, rows, error);
                }
                Completion::Mutation(mutation) => {
                    let id = mutation.view;
                    let operation = self
                        .mutating
                        .remove(&id)
                        .unwrap_or(AuditOperation::Update);
                    let Some(view) = self.view_mut(id) else {
                        continue;
                    };
                    let key = TableKey::for_view(view);
                    let error = match &mutation.outcome {
                        mutations::MutationOutcome::Failed { message } => Some(message.clone()),
                        _ => None,
                    };
                    let applied = mutations::apply_completion(view, mutation);
                    let outcome = if error.is_some() {
                        AuditOutcome::Failed
                    } else {
                        AuditOutcome::Succeeded
                    };
                    self.record_audit(&key, operation, outcome, None, error);
                    if applied == AppliedMutation::Changed {
                        for peer in self.registry.peers_of(&key, id) {
                            if let Some(peer_view) = self.view_mut(peer) {
                                peer_view.mark_dirty();
                            }
                        }
                    }
                }
            }
        }
    }

    fn record_audit(
        &self,
        key: &TableKey,
        operation: AuditOperation,
        outcome: AuditOutcome,
        rows: Option<u64>,
        error: Option<String>,
    ) {
        let Some(trail) = &self.audit else {
            return;
        };
        let record = AuditRecord {
            timestamp_unix_ms: audit::unix_timestamp_millis(),
            profile_name: Some(self.connection_name.clone()),
            database: key.database.clone(),
            table: Some(key.table.clone()),
            operation,
            outcome,
            rows,
            elapsed_ms: None,
            error,
        };
        let _ = trail.append(&record);
    }

    /// A dirty view reloads when it is about to be shown, not before.
    fn activate_dirty(&mut self) {
        if let Some(view) = self.views.get_mut(self.active) {
            if view.is_dirty() && !view.is_loading() {
                view.prepare_dirty_reload();
            }
        }
    }

    /// Ask the trigger policy whether the active view needs data; stamp
    /// and return the request for the loop to spawn.
    fn take_planned_load(&mut self) -> Option<LoadRequest> {
        let config = self.config;
        let view = self.views.get_mut(self.active)?;
        let planned = page_loader::plan_request(view, &config)?;
        Some(page_loader::dispatch_request(view, planned))
    }

    fn take_pending_jobs(&mut self) -> Vec<MutationJob> {
        std::mem::take(&mut self.pending_jobs)
    }

    /// Serialize mutations per view: a second change is refused while one
    /// is still in flight.
    fn queue_mutation(&mut self, job: MutationJob) {
        if self.mutating.contains_key(&job.view) {
            self.status_line = "Another change for this view is still in flight".to_string();
            return;
        }
        let operation = match &job.mutation {
            PreparedMutation::UpdateCell { .. } => AuditOperation::Update,
            PreparedMutation::DeleteRows { .. } => AuditOperation::Delete,
            PreparedMutation::InsertRow { .. } => AuditOperation::Insert,
        };
        self.mutating.insert(job.view, operation);
        self.pending_jobs.push(job);
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Quit => self.should_quit = true,
            Msg::ToggleHelp => self.show_help = !self.show_help,
            Msg::NextTab => {
                self.active = (self.active + 1) % self.views.len();
                self.status_line = format!("Tab {} of {}", self.active + 1, self.views.len());
            }
            Msg::DuplicateTab => {
                let spec = self.active_view().spec().clone();
                let schema = Arc::clone(self.active_view().schema());
                self.open_table(spec, schema);
                self.status_line = "Opened another view of the table".to_string();
            }
            Msg::CloseTab => self.close_active_tab(),
            Msg::Navigate(direction) => self.navigate(direction),
            Msg::PageMove(direction) => {
                let step = i64::try_from(self.viewport_rows.max(1)).unwrap_or(i64::MAX);
                self.active_view_mut().move_cursor(direction * step, 0);
                self.ensure_cursor_visible();
            }
            Msg::JumpHome => {
                let col = self.active_view().cursor().1;
                self.active_view_mut().set_cursor(0, col);
                self.ensure_cursor_visible();
            }
            Msg::JumpEnd => {
                let view = self.active_view_mut();
                let (_, col) = view.cursor();
                let last = view.max_known_row();
                view.set_cursor(last, col);
                self.ensure_cursor_visible();
            }
            Msg::BeginEdit => self.begin_edit(),
            Msg::BeginFilter => {
                let current = self
                    .active_view()
                    .spec()
                    .filter
                    .clone()
                    .unwrap_or_default();
                self.mode = Mode::FilterInput { buffer: current };
            }
            Msg::BeginInsert => {
                self.mode = Mode::InsertRow {
                    buffer: String::new(),
                };
                self.status_line = "Insert: column=value, column=value, …".to_string();
            }
            Msg::DeleteRow => self.delete_cursor_row(),
            Msg::Refresh => {
                let view = self.active_view_mut();
                view.clear_status();
                view.request_reload();
                self.status_line = "Reloading".to_string();
            }
            Msg::ExportCsv => self.export_active_page(),
            Msg::InputChar(c) => match &mut self.mode {
                Mode::EditCell { buffer }
                | Mode::FilterInput { buffer }
                | Mode::InsertRow { buffer } => buffer.push(c),
                Mode::Browse => {}
            },
            Msg::InputBackspace => match &mut self.mode {
                Mode::EditCell { buffer }
                | Mode::FilterInput { buffer }
                | Mode::InsertRow { buffer } => {
                    buffer.pop();
                }
                Mode::Browse => {}
            },
            Msg::ConfirmInput => self.confirm_input(),
            Msg::CancelInput => self.mode = Mode::Browse,
            Msg::Tick => {}
        }
    }

    fn navigate(&mut self, direction: DirectionKey) {
        let view = self.active_view_mut();
        match direction {
            DirectionKey::Up => view.move_cursor(-1, 0),
            DirectionKey::Down => view.move_cursor(1, 0),
            DirectionKey::Left => view.move_cursor(0, -1),
            DirectionKey::Right => view.move_cursor(0, 1),
        }
        self.ensure_cursor_visible();
    }

    fn ensure_cursor_visible(&mut self) {
        let rows = self.viewport_rows.max(1);
        let view = self.active_view_mut();
        let (cursor, _) = view.cursor();
        let (mut top, scroll_col) = view.scroll();
        if cursor < top {
            top = cursor;
        } else if cursor >= top + rows {
            top = cursor + 1 - rows;
        }
        view.set_scroll(top, scroll_col);
    }

    fn begin_edit(&mut self) {
        let view = self.active_view();
        if !view.schema().has_primary_key() {
            self.status_line =
                "Cannot edit: the table declares no primary key".to_string();
            return;
        }
        let (row, col) = view.cursor();
        let Some(current) = view.cell(row, col) else {
            self.status_line = "Cell is not loaded yet".to_string();
            return;
        };
        let buffer = if current.is_null() {
            String::new()
        } else {
            current.to_string()
        };
        self.mode = Mode::EditCell { buffer };
    }

    fn confirm_input(&mut self) {
        let mode = std::mem::replace(&mut self.mode, Mode::Browse);
        match mode {
            Mode::EditCell { buffer } => {
                let (row, col) = self.active_view().cursor();
                let value = parse_cell_input(&buffer);
                let prepared = mutations::prepare_update(self.active_view(), row, col, value);
                match prepared {
                    Ok(job) => self.queue_mutation(job),
                    Err(error) => {
                        let key = TableKey::for_view(self.active_view());
                        self.record_audit(
                            &key,
                            AuditOperation::Update,
                            AuditOutcome::Refused,
                            None,
                            Some(error.to_string()),
                        );
                        self.status_line = error.to_string();
                    }
                }
            }
            Mode::FilterInput { buffer } => {
                let view = self.active_view_mut();
                let filter = (!buffer.trim().is_empty()).then(|| buffer.trim().to_string());
                let spec = view.spec().clone().with_filter(filter);
                if view.set_query_spec(spec) {
                    self.status_line = "Filter applied".to_string();
                } else {
                    self.status_line = "Filter unchanged".to_string();
                }
            }
            Mode::InsertRow { buffer } => match parse_insert_input(&buffer) {
                Ok(values) => {
                    let prepared = mutations::prepare_insert(self.active_view(), values);
                    match prepared {
                        Ok(job) => self.queue_mutation(job),
                        Err(error) => {
                            let key = TableKey::for_view(self.active_view());
                            self.record_audit(
                                &key,
                                AuditOperation::Insert,
                                AuditOutcome::Refused,
                                None,
                                Some(error.to_string()),
                            );
                            self.status_line = error.to_string();
                        }
                    }
                }
                Err(message) => self.status_line = message,
            },
            Mode::Browse => {}
        }
    }

    fn delete_cursor_row(&mut self) {
        let (row, _) = self.active_view().cursor();
        let prepared = mutations::prepare_delete(self.active_view(), &[row]);
        match prepared {
            Ok(job) => self.queue_mutation(job),
            Err(error) => {
                let key = TableKey::for_view(self.active_view());
                self.record_audit(
                    &key,
                    AuditOperation::Delete,
                    AuditOutcome::Refused,
                    None,
                    Some(error.to_string()),
                );
                self.status_line = error.to_string();
            }
        }
    }

    fn export_active_page(&mut self) {
        let view = self.active_view();
        let path = PathBuf::from(format!("{}-page.csv", view.spec().table));
        match export_page_to_csv(&path, view.page()) {
            Ok(rows) => {
                self.status_line = format!("Exported {rows} rows to {}", path.display());
            }
            Err(error) => self.status_line = format!("Export failed: {error}"),
        }
    }
}

/// `column=value, column=value` input for a new row.
fn parse_insert_input(raw: &str) -> Result<Vec<(String, Value)>, String> {
    let mut values = Vec::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((column, value)) = pair.split_once('=') else {
            return Err(format!("expected column=value, got `{pair}`"));
        };
        let column = column.trim();
        if column.is_empty() {
            return Err(format!("missing column name in `{pair}`"));
        }
        values.push((column.to_string(), parse_cell_input(value.trim())));
    }
    if values.is_empty() {
        return Err("nothing to insert".to_string());
    }
    Ok(values)
}

fn parse_cell_input(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("null") || trimmed.is_empty() {
        Value::Null
    } else if let Ok(integer) = trimmed.parse::<i64>() {
        Value::Integer(integer)
    } else if let Ok(float) = trimmed.parse::<f64>() {
        Value::Float(float)
    } else {
        Value::Text(raw.to_string())
    }
}

fn map_key_event(mode: &Mode, key: KeyEvent) -> Option<Msg> {
    if !matches!(mode, Mode::Browse) {
        return match key.code {
            KeyCode::Esc => Some(Msg::CancelInput),
            KeyCode::Enter => Some(Msg::ConfirmInput),
            KeyCode::Backspace => Some(Msg::InputBackspace),
            KeyCode::Char(c) => Some(Msg::InputChar(c)),
            _ => None,
        };
    }

    match key.code {
        KeyCode::Char('q') => Some(Msg::Quit),
        KeyCode::Char('?') => Some(Msg::ToggleHelp),
        KeyCode::Tab => Some(Msg::NextTab),
        KeyCode::Char('t') => Some(Msg::DuplicateTab),
        KeyCode::Char('w') => Some(Msg::CloseTab),
        KeyCode::Up | KeyCode::Char('k') => Some(Msg::Navigate(DirectionKey::Up)),
        KeyCode::Down | KeyCode::Char('j') => Some(Msg::Navigate(DirectionKey::Down)),
        KeyCode::Left | KeyCode::Char('h') => Some(Msg::Navigate(DirectionKey::Left)),
        KeyCode::Right | KeyCode::Char('l') => Some(Msg::Navigate(DirectionKey::Right)),
        KeyCode::PageUp => Some(Msg::PageMove(-1)),
        KeyCode::PageDown => Some(Msg::PageMove(1)),
        KeyCode::Char('g') => Some(Msg::JumpHome),
        KeyCode::Char('G') => Some(Msg::JumpEnd),
        KeyCode::Enter | KeyCode::Char('e') => Some(Msg::BeginEdit),
        KeyCode::Char('/') => Some(Msg::BeginFilter),
        KeyCode::Char('i') => Some(Msg::BeginInsert),
        KeyCode::Char('d') => Some(Msg::DeleteRow),
        KeyCode::Char('r') => Some(Msg::Refresh),
        KeyCode::Char('x') => Some(Msg::ExportCsv),
        _ => None,
    }
}

pub fn run() -> Result<(), TuiError> {
    let runtime = Runtime::new()?;
    let config = config::load_default()?;
    let store = FileProfilesStore::load_default()?;
    let profile = std::env::var("TRELLIS_PROFILE")
        .ok()
        .and_then(|name| store.profile(&name).cloned())
        .or_else(|| store.profiles().first().cloned())
        .ok_or(TuiError::MissingProfile)?;

    let backend = Arc::new(MysqlTableBackend::from_profile(&profile));
    let mut catalog_service =
        SchemaCatalogService::new(backend.as_ref().clone(), SCHEMA_CACHE_TTL);
    // Connecting is the one deliberately blocking step; the dialog owns it.
    let catalog = runtime.block_on(catalog_service.catalog())?;

    let mut first_table = None;
    'outer: for database in &catalog.databases {
        if SYSTEM_SCHEMAS.contains(&database.name.as_str()) {
            continue;
        }
        if let Some(preferred) = &profile.database {
            if &database.name != preferred {
                continue;
            }
        }
        for table in &database.tables {
            first_table = Some((
                database.name.clone(),
                table.name.clone(),
                Arc::clone(&table.schema),
            ));
            break 'outer;
        }
    }
    let (database, table, schema) = first_table.ok_or(TuiError::NoBrowsableTable)?;

    let mut app = TuiApp::new(backend, config, profile.name.clone());
    app.audit = FileAuditTrail::load_default().ok();
    app.open_table(QuerySpec::for_table(Some(database), table), schema);

    let mut terminal = setup_terminal()?;
    let run_result = run_loop(&mut terminal, &mut app, &runtime);
    let restore_result = restore_terminal(&mut terminal);

    if let Err(error) = run_result {
        restore_result?;
        return Err(error);
    }

    restore_result?;
    Ok(())
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>, TuiError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<(), TuiError> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

fn run_loop<B>(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut TuiApp<B>,
    runtime: &Runtime,
) -> Result<(), TuiError>
where
    B: PageBackend + MutationBackend + Send + Sync + 'static,
{
    let mut last_tick = Instant::now();

    loop {
        app.drain_completions();
        app.activate_dirty();

        if let Some(request) = app.take_planned_load() {
            let backend = Arc::clone(&app.backend);
            let sender = app.queue.sender();
            let max_result_rows = app.config.max_result_rows;
            runtime.spawn(async move {
                let completion =
                    page_loader::run_load(backend.as_ref(), request, max_result_rows).await;
                sender.push(Completion::Load(completion));
            });
        }
        for job in app.take_pending_jobs() {
            let backend = Arc::clone(&app.backend);
            let sender = app.queue.sender();
            runtime.spawn(async move {
                let completion = mutations::run_mutation(backend.as_ref(), job).await;
                sender.push(Completion::Mutation(completion));
            });
        }

        let size = terminal.size()?;
        app.viewport_rows = u64::from(size.height.saturating_sub(8).max(1));
        terminal.draw(|frame| render(frame, app))?;

        let timeout = TICK_RATE
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    if let Some(message) = map_key_event(&app.mode, key) {
                        app.handle(message);
                    }
                }
            }
        }

        if last_tick.elapsed() >= TICK_RATE {
            app.handle(Msg::Tick);
            last_tick = Instant::now();
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}

fn render<B>(frame: &mut Frame<'_>, app: &TuiApp<B>)
where
    B: PageBackend + MutationBackend + Send + Sync + 'static,
{
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, app, chunks[0]);
    render_grid(frame, app, chunks[1]);
    render_footer(frame, app, chunks[2]);

    if app.show_help {
        render_help_popup(frame);
    }
}

fn render_header<B>(frame: &mut Frame<'_>, app: &TuiApp<B>, area: Rect)
where
    B: PageBackend + MutationBackend + Send + Sync + 'static,
{
    let view = app.active_view();
    let total_marker = if view.is_approximate() { "~" } else { "" };
    let mut spans = vec![
        Span::styled(
            format!(" {} ", app.connection_name),
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" | "),
        Span::raw(format!(
            "{}.{}",
            view.spec().database.as_deref().unwrap_or("-"),
            view.spec().table
        )),
        Span::raw(" | "),
        Span::raw(format!("rows: {total_marker}{}", view.total_rows())),
        Span::raw(" | "),
        Span::raw(format!("tab {}/{}", app.active + 1, app.views.len())),
    ];
    if view.is_loading() {
        spans.push(Span::raw(" | "));
        spans.push(Span::styled(
            "loading…",
            Style::default().fg(Color::Cyan),
        ));
    }
    if view.is_dirty() {
        spans.push(Span::raw(" | "));
        spans.push(Span::styled("*dirty", Style::default().fg(Color::Red)));
    }
    if let Some(filter) = &view.spec().filter {
        spans.push(Span::raw(" | "));
        spans.push(Span::raw(format!("filter: {filter}")));
    }

    let header = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .title("Trellis Table Browser"),
    );
    frame.render_widget(header, area);
}

fn render_grid<B>(frame: &mut Frame<'_>, app: &TuiApp<B>, area: Rect)
where
    B: PageBackend + MutationBackend + Send + Sync + 'static,
{
    let view = app.active_view();
    let schema = view.schema();
    let (cursor_row, cursor_col) = view.cursor();
    let (top, _) = view.scroll();

    let header_line = Line::from(
        schema
            .columns
            .iter()
            .enumerate()
            .map(|(index, column)| {
                let style = if index == cursor_col {
                    Style::default().add_modifier(Modifier::BOLD | Modifier::UNDERLINED)
                } else {
                    Style::default().add_modifier(Modifier::BOLD)
                };
                Span::styled(format!("{} | ", column.name), style)
            })
            .collect::<Vec<_>>(),
    );

    let visible = usize::from(area.height.saturating_sub(3)).max(1);
    let mut lines = vec![header_line];
    let last_known = view.max_known_row();
    for offset in 0..visible as u64 {
        let row = top + offset;
        if view.total_rows() == 0 && view.loaded_len() == 0 {
            break;
        }
        if row > last_known {
            break;
        }
        let marker = if row == cursor_row { ">" } else { " " };
        let mut rendered = format!("{marker} {row:>7} | ");
        if view.page().contains_row(row) {
            let cells = (0..schema.column_count())
                .map(|col| {
                    view.cell(row, col)
                        .map_or_else(String::new, std::string::ToString::to_string)
                })
                .collect::<Vec<_>>()
                .join(" | ");
            rendered.push_str(&cells);
            let style = if row == cursor_row {
                Style::default().add_modifier(Modifier::REVERSED)
            } else {
                Style::default()
            };
            lines.push(Line::from(Span::styled(rendered, style)));
        } else {
            rendered.push('…');
            lines.push(Line::from(Span::styled(
                rendered,
                Style::default().fg(Color::DarkGray),
            )));
        }
    }
    if lines.len() == 1 {
        lines.push(Line::from("No rows"));
    }

    let grid = Paragraph::new(lines)
        .block(
            Block::default().borders(Borders::ALL).title(format!(
                "Window [{}..{})",
                view.loaded_offset(),
                view.loaded_offset() + view.loaded_len() as u64
            )),
        )
        .alignment(Alignment::Left);
    frame.render_widget(grid, area);
}

fn render_footer<B>(frame: &mut Frame<'_>, app: &TuiApp<B>, area: Rect)
where
    B: PageBackend + MutationBackend + Send + Sync + 'static,
{
    let first_line = match &app.mode {
        Mode::Browse => Line::from(
            "q:quit  tab:next  t:dup  w:close  e:edit  i:insert  d:delete  /:filter  r:refresh  x:csv  ?:help",
        ),
        Mode::EditCell { buffer } => Line::from(format!("edit cell> {buffer}_")),
        Mode::FilterInput { buffer } => Line::from(format!("filter> {buffer}_")),
        Mode::InsertRow { buffer } => Line::from(format!("insert row> {buffer}_")),
    };
    let status = app
        .active_view()
        .status()
        .unwrap_or(app.status_line.as_str());
    let footer = Paragraph::new(vec![first_line, Line::from(format!("Status: {status}"))])
        .block(Block::default().borders(Borders::ALL).title("Actions"));
    frame.render_widget(footer, area);
}

fn render_help_popup(frame: &mut Frame<'_>) {
    let area = centered_rect(70, 60, frame.area());
    frame.render_widget(Clear, area);
    let help = Paragraph::new(vec![
        Line::from("Global keymap"),
        Line::from("q: quit"),
        Line::from("?: toggle help"),
        Line::from("Tab: next tab, t: duplicate tab, w: close tab"),
        Line::from("Arrows or hjkl: move cursor"),
        Line::from("PgUp/PgDn: page, g/G: first/last row"),
        Line::from("Enter or e: edit cell (needs a primary key)"),
        Line::from("i: insert row, d: delete row, /: filter, r: refresh"),
        Line::from("x: export resident page as CSV"),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    frame.render_widget(help, area);
}

fn centered_rect(width_percent: u16, height_percent: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100_u16 - height_percent) / 2),
            Constraint::Percentage(height_percent),
            Constraint::Percentage((100_u16 - height_percent) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100_u16 - width_percent) / 2),
            Constraint::Percentage(width_percent),
            Constraint::Percentage((100_u16 - width_percent) / 2),
        ])
        .split(vertical[1])[1]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use trellis_core::config::ViewerConfig;
    use trellis_core::mutations::{MutationBackend, MutationBackendError, MutationCompletion, MutationOutcome};
    use trellis_core::page_loader::{self, PageBackend, PageBackendError};
    use trellis_core::query_spec::QuerySpec;
    use trellis_core::value::{Column, Page, Row, RowCount, TableSchema, Value};

    use super::{
        map_key_event, parse_cell_input, parse_insert_input, Completion, DirectionKey, Mode, Msg,
        TuiApp,
    };

    #[derive(Debug, Default)]
    struct FakeBackend;

    #[async_trait::async_trait]
    impl PageBackend for FakeBackend {
        async fn fetch_page(
            &self,
            _spec: &QuerySpec,
            schema: Arc<TableSchema>,
            offset: u64,
            limit: usize,
        ) -> Result<Page, PageBackendError> {
            let rows = (offset..offset + limit as u64)
                .map(|id| {
                    Row::new(vec![
                        Value::Integer(i64::try_from(id).unwrap_or_default()),
                        Value::Text(format!("row-{id}")),
                    ])
                })
                .collect();
            Page::new(schema, offset, rows)
                .map_err(|error| PageBackendError::new(error.to_string()))
        }

        async fn count_rows(
            &self,
            _spec: &QuerySpec,
            _budget: u64,
        ) -> Result<RowCount, PageBackendError> {
            Ok(RowCount {
                total: 10_000,
                exact: true,
            })
        }
    }

    #[async_trait::async_trait]
    impl MutationBackend for FakeBackend {
        async fn update_cell(
            &self,
            _database: Option<&str>,
            _table: &str,
            _key: &[(String, Value)],
            _column: &str,
            _value: &Value,
        ) -> Result<(), MutationBackendError> {
            Ok(())
        }

        async fn delete_row(
            &self,
            _database: Option<&str>,
            _table: &str,
            _key: &[(String, Value)],
        ) -> Result<(), MutationBackendError> {
            Ok(())
        }

        async fn insert_row(
            &self,
            _database: Option<&str>,
            _table: &str,
            _values: &[(String, Value)],
        ) -> Result<(), MutationBackendError> {
            Ok(())
        }
    }

    fn schema() -> Arc<TableSchema> {
        Arc::new(TableSchema::new(vec![
            Column::new("id", "bigint").primary_key(),
            Column::new("name", "varchar(64)"),
        ]))
    }

    fn app_with_view() -> TuiApp<FakeBackend> {
        let mut app = TuiApp::new(
            Arc::new(FakeBackend),
            ViewerConfig::default(),
            "local",
        );
        app.open_table(
            QuerySpec::for_table(Some("app".to_string()), "users"),
            schema(),
        );
        app
    }

    /// Run one synchronous "loop iteration" against the fake backend,
    /// executing the spawned work inline on a current-thread runtime.
    fn step(app: &mut TuiApp<FakeBackend>) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime should build");

        app.drain_completions();
        app.activate_dirty();
        if let Some(request) = app.take_planned_load() {
            let completion = runtime.block_on(page_loader::run_load(
                app.backend.as_ref(),
                request,
                app.config.max_result_rows,
            ));
            app.queue.sender().push(Completion::Load(completion));
        }
        for job in app.take_pending_jobs() {
            let completion =
                runtime.block_on(trellis_core::mutations::run_mutation(app.backend.as_ref(), job));
            app.queue.sender().push(Completion::Mutation(completion));
        }
        app.drain_completions();
    }

    #[test]
    fn keymap_maps_browse_keys() {
        let browse = Mode::Browse;
        assert_eq!(
            map_key_event(&browse, KeyEvent::new(KeyCode::Char('q'), KeyModifiers::NONE)),
            Some(Msg::Quit)
        );
        assert_eq!(
            map_key_event(&browse, KeyEvent::new(KeyCode::Tab, KeyModifiers::NONE)),
            Some(Msg::NextTab)
        );
        assert_eq!(
            map_key_event(&browse, KeyEvent::new(KeyCode::Char('j'), KeyModifiers::NONE)),
            Some(Msg::Navigate(DirectionKey::Down))
        );
        assert_eq!(
            map_key_event(&browse, KeyEvent::new(KeyCode::Char('G'), KeyModifiers::SHIFT)),
            Some(Msg::JumpEnd)
        );
        assert_eq!(
            map_key_event(&browse, KeyEvent::new(KeyCode::Char('d'), KeyModifiers::NONE)),
            Some(Msg::DeleteRow)
        );
    }

    #[test]
    fn keymap_routes_text_into_input_modes() {
        let editing = Mode::EditCell {
            buffer: String::new(),
        };
        assert_eq!(
            map_key_event(&editing, KeyEvent::new(KeyCode::Char('q'), KeyModifiers::NONE)),
            Some(Msg::InputChar('q'))
        );
        assert_eq!(
            map_key_event(&editing, KeyEvent::new(KeyCode::Esc, KeyModifiers::NONE)),
            Some(Msg::CancelInput)
        );
        assert_eq!(
            map_key_event(&editing, KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE)),
            Some(Msg::ConfirmInput)
        );
    }

    #[test]
    fn cell_input_parses_typed_values() {
        assert_eq!(parse_cell_input("42"), Value::Integer(42));
        assert_eq!(parse_cell_input("2.5"), Value::Float(2.5));
        assert_eq!(parse_cell_input("NULL"), Value::Null);
        assert_eq!(parse_cell_input(""), Value::Null);
        assert_eq!(
            parse_cell_input("plain text"),
            Value::Text("plain text".to_string())
        );
    }

    #[test]
    fn first_step_loads_the_initial_page() {
        let mut app = app_with_view();
        step(&mut app);

        let view = app.active_view();
        assert_eq!(view.loaded_offset(), 0);
        assert_eq!(view.loaded_len(), 500);
        assert_eq!(view.total_rows(), 10_000);
        assert!(!view.is_loading());
    }

    #[test]
    fn edit_flow_patches_the_cell_through_the_queue() {
        let mut app = app_with_view();
        step(&mut app);

        app.handle(Msg::Navigate(DirectionKey::Right));
        app.handle(Msg::BeginEdit);
        assert!(matches!(app.mode, Mode::EditCell { .. }));
        // The buffer is seeded with the current value; replace it wholesale.
        if let Mode::EditCell { buffer } = &mut app.mode {
            buffer.clear();
        }
        for c in "patched".chars() {
            app.handle(Msg::InputChar(c));
        }
        app.handle(Msg::ConfirmInput);
        assert!(matches!(app.mode, Mode::Browse));
        assert_eq!(app.pending_jobs.len(), 1);

        step(&mut app);
        assert_eq!(
            app.active_view().cell(0, 1),
            Some(&Value::Text("patched".to_string()))
        );
        assert!(app.mutating.is_empty());
    }

    #[test]
    fn insert_input_parses_column_value_pairs() {
        let values = parse_insert_input("name=fresh, id=7").expect("pairs should parse");
        assert_eq!(
            values,
            vec![
                ("name".to_string(), Value::Text("fresh".to_string())),
                ("id".to_string(), Value::Integer(7)),
            ]
        );
        assert!(parse_insert_input("garbage").is_err());
        assert!(parse_insert_input("").is_err());
        assert!(parse_insert_input("=7").is_err());
    }

    #[test]
    fn insert_flow_bumps_the_total_and_reloads_the_window() {
        let mut app = app_with_view();
        step(&mut app);

        app.handle(Msg::BeginInsert);
        for c in "name=fresh".chars() {
            app.handle(Msg::InputChar(c));
        }
        app.handle(Msg::ConfirmInput);
        assert_eq!(app.pending_jobs.len(), 1);

        step(&mut app);
        assert_eq!(app.active_view().total_rows(), 10_001);
        assert!(!app.active_view().has_loaded());
    }

    #[test]
    fn mutations_serialize_per_view() {
        let mut app = app_with_view();
        step(&mut app);

        app.handle(Msg::DeleteRow);
        assert_eq!(app.pending_jobs.len(), 1);
        // A second mutation before the first drains is refused.
        app.handle(Msg::DeleteRow);
        assert_eq!(app.pending_jobs.len(), 1);
        assert!(app.status_line.contains("still in flight"));
    }

    #[test]
    fn duplicated_tabs_share_the_registry_key_and_go_dirty_together() {
        let mut app = app_with_view();
        step(&mut app);
        let first = app.active_view().id();

        app.handle(Msg::DuplicateTab);
        let second = app.active_view().id();
        assert_ne!(first, second);
        step(&mut app);

        // Mutate through the second (active) view.
        app.handle(Msg::DeleteRow);
        step(&mut app);

        let first_view = app
            .views
            .iter()
            .find(|view| view.id() == first)
            .expect("first view should exist");
        assert!(first_view.is_dirty());
        let second_view = app
            .views
            .iter()
            .find(|view| view.id() == second)
            .expect("second view should exist");
        assert!(!second_view.is_dirty());
    }

    #[test]
    fn closing_a_tab_unregisters_it() {
        let mut app = app_with_view();
        app.handle(Msg::DuplicateTab);
        assert_eq!(app.views.len(), 2);

        app.handle(Msg::CloseTab);
        assert_eq!(app.views.len(), 1);

        // Mutations on the remaining view no longer find peers.
        step(&mut app);
        app.handle(Msg::DeleteRow);
        step(&mut app);
        assert!(!app.active_view().is_dirty() || app.views.len() == 1);

        app.handle(Msg::CloseTab);
        assert_eq!(app.views.len(), 1);
        assert!(app.status_line.contains("last tab"));
    }

    #[test]
    fn filter_input_bumps_the_spec_and_resets_the_view() {
        let mut app = app_with_view();
        step(&mut app);
        assert_eq!(app.active_view().loaded_len(), 500);
        let generation_before = app.active_view().generation();

        app.handle(Msg::BeginFilter);
        for c in "`id` > 100".chars() {
            app.handle(Msg::InputChar(c));
        }
        app.handle(Msg::ConfirmInput);

        let view = app.active_view();
        assert_eq!(view.spec().filter.as_deref(), Some("`id` > 100"));
        assert!(view.generation() > generation_before);
        assert_eq!(view.loaded_len(), 0);
        assert!(!view.has_loaded());
    }

    #[test]
    fn stale_mutation_completions_for_closed_views_are_ignored() {
        let mut app = app_with_view();
        step(&mut app);
        let gone = trellis_core::table_view::ViewId::new(999);
        app.queue.sender().push(Completion::Mutation(MutationCompletion {
            view: gone,
            outcome: MutationOutcome::RowInserted,
        }));
        app.drain_completions();
        assert_eq!(app.active_view().total_rows(), 10_000);
    }
}
