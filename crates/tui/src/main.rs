//! Docling Dashboard TUI
//!
//! Terminal interface for watching batch progress, queue depths and host load.
//! Polls the orchestrator status endpoint, http://127.0.0.1:7878/status by
//! default or `$DTOP_STATUS_URL` when set.

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Cell, Chart, Dataset, Gauge, Paragraph, Row, Table, Wrap},
    Frame, Terminal,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    io::{self, Stdout},
    time::{Duration, Instant},
};

const DEFAULT_STATUS_URL: &str = "http://127.0.0.1:7878/status";
const POLL_INTERVAL_MS: u64 = 500;
const MAX_THROUGHPUT_POINTS: usize = 60;
const MAX_EVENT_LOG_ENTRIES: usize = 100;

// ============================================================================
// Data Models (mirroring the daemon status report)
// ============================================================================

/// Per-batch progress as derived by the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub batch_id: String,
    /// complete, in_progress or stalled
    pub status: String,
    pub summary: String,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub fallback_pending: u64,
    pub in_flight: u64,
    pub progress_percent: f32,
    pub has_failures: bool,
    pub stalled: bool,
    pub primary_mode: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete status snapshot served by the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StatusReport {
    pub timestamp_unix_ms: i64,
    pub instance_id: String,
    pub pid: u32,
    pub lifecycle: String,
    pub batches: Vec<BatchReport>,
    pub queue_depths: BTreeMap<String, usize>,
    pub running_jobs: usize,
    pub completed_files: u64,
    pub failed_files: u64,
    pub system: SystemMetrics,
}

impl StatusReport {
    fn queued(&self) -> usize {
        self.queue_depths.values().sum()
    }
}

/// Events worth logging between two consecutive snapshots
fn status_events(prev: Option<&StatusReport>, next: &StatusReport) -> Vec<String> {
    let mut events = Vec::new();
    let Some(prev) = prev else {
        events.push(format!("Connected to daemon (pid {}, {})", next.pid, next.lifecycle));
        return events;
    };

    if prev.lifecycle != next.lifecycle {
        events.push(format!("Daemon {} -> {}", prev.lifecycle, next.lifecycle));
    }

    for batch in &next.batches {
        match prev.batches.iter().find(|b| b.batch_id == batch.batch_id) {
            None => events.push(format!(
                "New batch {} ({} files, {})",
                batch.batch_id, batch.total, batch.primary_mode
            )),
            Some(old) => {
                if batch.failed > old.failed {
                    events.push(format!(
                        "{}: {} file(s) failed on both pipelines",
                        batch.batch_id,
                        batch.failed - old.failed
                    ));
                }
                if batch.fallback_pending > old.fallback_pending {
                    events.push(format!("{}: file re-routed to fallback", batch.batch_id));
                }
                if old.status != batch.status {
                    events.push(format!("{}: {}", batch.batch_id, batch.summary));
                }
            }
        }
    }
    events
}

// ============================================================================
// App State
// ============================================================================

/// Main application state for the TUI dashboard
pub struct App {
    pub status: Option<StatusReport>,
    pub event_log: VecDeque<String>,
    /// (elapsed secs, files converted by the current daemon instance)
    pub throughput_history: VecDeque<(f64, f64)>,
    pub connected: bool,
    client: reqwest::Client,
    url: String,
    start_time: Instant,
}

impl App {
    pub fn new(url: String) -> Self {
        Self {
            status: None,
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG_ENTRIES),
            throughput_history: VecDeque::with_capacity(MAX_THROUGHPUT_POINTS),
            connected: false,
            client: reqwest::Client::new(),
            url,
            start_time: Instant::now(),
        }
    }

    /// Add an event to the log
    pub fn log_event(&mut self, event: String) {
        if self.event_log.len() >= MAX_EVENT_LOG_ENTRIES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }

    /// Fetch status from the daemon HTTP endpoint
    pub async fn fetch_status(&mut self) {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    match response.json::<StatusReport>().await {
                        Ok(report) => self.apply(report),
                        Err(e) => {
                            self.log_event(format!("JSON parse error: {}", e));
                            self.connected = false;
                        }
                    }
                } else {
                    self.log_event(format!("HTTP error: {}", response.status()));
                    self.connected = false;
                }
            }
            Err(e) => {
                if self.connected {
                    self.log_event(format!("Connection lost: {}", e));
                }
                self.connected = false;
            }
        }
    }

    /// Take a new snapshot into the app state
    fn apply(&mut self, report: StatusReport) {
        let prev = if self.connected { self.status.as_ref() } else { None };
        for event in status_events(prev, &report) {
            self.log_event(event);
        }

        if self.throughput_history.len() >= MAX_THROUGHPUT_POINTS {
            self.throughput_history.pop_front();
        }
        let elapsed_secs = self.start_time.elapsed().as_secs_f64();
        self.throughput_history
            .push_back((elapsed_secs, report.completed_files as f64));

        self.status = Some(report);
        self.connected = true;
    }
}

// ============================================================================
// Terminal Setup/Teardown
// ============================================================================

fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

// ============================================================================
// Widget Rendering
// ============================================================================

fn status_color(batch: &BatchReport) -> Color {
    match batch.status.as_str() {
        "complete" if batch.has_failures => Color::Yellow,
        "complete" => Color::Green,
        "stalled" => Color::Red,
        "cancelled" => Color::Magenta,
        _ => Color::White,
    }
}

/// Render the batch table with per-batch counters
fn render_batch_table(f: &mut Frame, area: Rect, app: &App) {
    let header_cells = ["Batch", "Mode", "Progress", "OK", "Failed", "Fallback", "In flight", "State"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells).height(1).bottom_margin(1);

    let rows: Vec<Row> = match app.status {
        Some(ref status) => status
            .batches
            .iter()
            .map(|batch| {
                Row::new(vec![
                    Cell::from(batch.batch_id.clone()),
                    Cell::from(batch.primary_mode.clone()),
                    Cell::from(format!("{:.1}%", batch.progress_percent)),
                    Cell::from(format!("{}/{}", batch.succeeded, batch.total)),
                    Cell::from(batch.failed.to_string()),
                    Cell::from(batch.fallback_pending.to_string()),
                    Cell::from(batch.in_flight.to_string()),
                    Cell::from(batch.summary.clone()),
                ])
                .style(Style::default().fg(status_color(batch)))
            })
            .collect(),
        None => vec![],
    };

    let widths = [
        Constraint::Min(16),
        Constraint::Length(9),
        Constraint::Length(9),
        Constraint::Length(10),
        Constraint::Length(7),
        Constraint::Length(9),
        Constraint::Length(10),
        Constraint::Length(17),
    ];

    let title = if app.connected {
        " Batches "
    } else {
        " Batches (Disconnected) "
    };

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title));

    f.render_widget(table, area);
}

/// Render CPU and memory usage gauges
fn render_system_gauges(f: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Length(3), Constraint::Min(0)])
        .split(area);

    let (cpu, mem) = match app.status {
        Some(ref status) => (
            status.system.cpu_usage_percent as f64 / 100.0,
            status.system.mem_usage_percent as f64 / 100.0,
        ),
        None => (0.0, 0.0),
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" CPU "))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(cpu.clamp(0.0, 1.0))
        .label(format!("{:.1}%", cpu * 100.0));

    let mem_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Memory "))
        .gauge_style(Style::default().fg(Color::Magenta))
        .ratio(mem.clamp(0.0, 1.0))
        .label(format!("{:.1}%", mem * 100.0));

    f.render_widget(cpu_gauge, chunks[0]);
    f.render_widget(mem_gauge, chunks[1]);
}

/// Render waiting jobs per queue
fn render_queues(f: &mut Frame, area: Rect, app: &App) {
    let rows: Vec<Row> = match app.status {
        Some(ref status) => status
            .queue_depths
            .iter()
            .map(|(name, depth)| Row::new(vec![Cell::from(name.clone()), Cell::from(depth.to_string())]))
            .chain(std::iter::once(Row::new(vec![
                Cell::from("running"),
                Cell::from(status.running_jobs.to_string()),
            ])))
            .collect(),
        None => vec![],
    };

    let widths = [Constraint::Length(12), Constraint::Length(8)];
    let table = Table::new(rows, widths).block(Block::default().borders(Borders::ALL).title(" Queues "));
    f.render_widget(table, area);
}

/// Render files converted over time
fn render_throughput_chart(f: &mut Frame, area: Rect, app: &App) {
    let data: Vec<(f64, f64)> = app.throughput_history.iter().cloned().collect();
    let title = " Converted files ";

    if data.is_empty() {
        f.render_widget(Block::default().borders(Borders::ALL).title(title), area);
        return;
    }

    let min_x = data.first().map(|(x, _)| *x).unwrap_or(0.0);
    let max_x = data.last().map(|(x, _)| *x).unwrap_or(60.0).max(min_x + 1.0);
    let max_y = data.iter().map(|(_, y)| *y).fold(0.0f64, f64::max).max(1.0);

    let datasets = vec![Dataset::default()
        .name("files")
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(Color::Green))
        .data(&data)];

    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(title))
        .x_axis(
            Axis::default()
                .title("Time (s)")
                .style(Style::default().fg(Color::Gray))
                .bounds([min_x, max_x])
                .labels(vec![
                    Span::raw(format!("{:.0}", min_x)),
                    Span::raw(format!("{:.0}", max_x)),
                ]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, max_y])
                .labels(vec![Span::raw("0"), Span::raw(format!("{:.0}", max_y))]),
        );

    f.render_widget(chart, area);
}

fn render_event_log(f: &mut Frame, area: Rect, app: &App) {
    let events: Vec<Line> = app
        .event_log
        .iter()
        .rev()
        .take((area.height as usize).saturating_sub(2))
        .map(|e| Line::from(e.as_str()))
        .collect();

    let paragraph = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title(" Event Log "))
        .wrap(Wrap { trim: true });

    f.render_widget(paragraph, area);
}

fn status_line(app: &App) -> String {
    match app.status {
        Some(ref status) if app.connected => format!(
            " Daemon: {} | Queued: {} | Running: {} | Converted: {} | Failed: {} | Load: {:.2} | Press 'q' to quit ",
            status.lifecycle,
            status.queued(),
            status.running_jobs,
            status.completed_files,
            status.failed_files,
            status.system.load_avg_1
        ),
        Some(_) => " Daemon unreachable, showing last snapshot | Press 'q' to quit ".to_string(),
        None => " Connecting to daemon... | Press 'q' to quit ".to_string(),
    }
}

// ============================================================================
// Main UI Layout
// ============================================================================

fn ui(f: &mut Frame, app: &App) {
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(f.area());

    let content_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
        .split(main_chunks[0]);

    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(content_chunks[0]);

    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6), // CPU + Memory gauges
            Constraint::Length(6), // Queues
            Constraint::Min(0),
        ])
        .split(content_chunks[1]);

    render_batch_table(f, left_chunks[0], app);
    render_event_log(f, left_chunks[1], app);
    render_system_gauges(f, right_chunks[0], app);
    render_queues(f, right_chunks[1], app);
    render_throughput_chart(f, right_chunks[2], app);

    let bar = Paragraph::new(status_line(app)).style(Style::default().fg(Color::White).bg(Color::DarkGray));
    f.render_widget(bar, main_chunks[1]);
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> io::Result<()> {
    let url = std::env::var("DTOP_STATUS_URL").unwrap_or_else(|_| DEFAULT_STATUS_URL.to_string());
    let mut terminal = setup_terminal()?;

    let mut app = App::new(url);
    app.log_event("Docling dashboard started".to_string());

    let result = run_app(&mut terminal, &mut app).await;
    restore_terminal(&mut terminal)?;
    result
}

async fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> io::Result<()> {
    let poll_interval = Duration::from_millis(POLL_INTERVAL_MS);
    let mut last_fetch: Option<Instant> = None;

    loop {
        if last_fetch.map_or(true, |t| t.elapsed() >= poll_interval) {
            app.fetch_status().await;
            last_fetch = Some(Instant::now());
        }

        terminal.draw(|f| ui(f, app))?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }
}
