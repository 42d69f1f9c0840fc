use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::app::{ProgressEvent, ProgressSink, ProgressSinkKind};
use crate::error::HarvestError;

const EVENTS_MAX: usize = 8;
const LOGS_MAX: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolve,
    Fetch,
    Store,
    Aggregate,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Resolve => "Resolve",
            Phase::Fetch => "Fetch",
            Phase::Store => "Store",
            Phase::Aggregate => "Aggregate",
        }
    }
}

#[derive(Debug)]
struct AppState {
    status: String,
    phase: Phase,
    progress: Option<(usize, usize)>,
    latency_ms: Option<u128>,
    retries: u32,
    failures: u32,
    events: VecDeque<String>,
    logs: VecDeque<String>,
    started: Instant,
    active: bool,
}

pub struct Tui {
    kind: ProgressSinkKind,
    state: Arc<Mutex<AppState>>,
    log_scroll: u16,
    show_logs: bool,
}

struct TuiProgress {
    state: Arc<Mutex<AppState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            let message = event.message.trim().to_string();
            if let Some((phase, payload)) = parse_phase(&message) {
                state.phase = phase;
                state.status = payload.to_string();
            } else {
                state.status = message.clone();
            }
            if let Some(latency) = parse_latency(&message) {
                state.latency_ms = Some(latency);
            }
            if is_retry_notice(&message) {
                state.retries = state.retries.saturating_add(1);
            }
            if message.contains("failed") {
                state.failures = state.failures.saturating_add(1);
            }
            if let Some(progress) = event.progress {
                state.progress = Some(progress);
            }

            push_bounded(&mut state.events, message.clone(), EVENTS_MAX);
            push_bounded(
                &mut state.logs,
                format!("[{}] {message}", timestamp()),
                LOGS_MAX,
            );
        }
    }
}

impl Tui {
    pub fn new(kind: ProgressSinkKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(AppState {
                status: "starting".to_string(),
                phase: Phase::Resolve,
                progress: None,
                latency_ms: None,
                retries: 0,
                failures: 0,
                events: VecDeque::new(),
                logs: VecDeque::new(),
                started: Instant::now(),
                active: false,
            })),
            log_scroll: 0,
            show_logs: false,
        }
    }

    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, HarvestError> + Send + 'static,
        R: Send + 'static,
    {
        self.set_active(true);

        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        loop {
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| draw_ui(frame, self, &state, tick))
                    .into_diagnostic()?;
            }

            if let Ok(result) = rx.try_recv() {
                self.set_active(false);
                restore_terminal()?;
                handle.join().ok();
                return result.map_err(miette::Report::new);
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if self.handle_key(key) {
                        break;
                    }
                }
            }

            tick = tick.wrapping_add(1);
        }

        self.set_active(false);
        restore_terminal()?;
        Err(miette::Report::new(HarvestError::Aborted))
    }

    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        match key.code {
            KeyCode::Esc => return true,
            KeyCode::Char('q') => return !self.is_active(),
            KeyCode::Char('l') | KeyCode::F(4) => self.show_logs = !self.show_logs,
            KeyCode::PageUp => self.scroll_logs(-5),
            KeyCode::PageDown => self.scroll_logs(5),
            _ => {}
        }
        false
    }

    fn is_active(&self) -> bool {
        self.state.lock().map(|state| state.active).unwrap_or(false)
    }

    fn set_active(&self, active: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.active = active;
            if active {
                state.started = Instant::now();
                state.phase = Phase::Resolve;
                state.progress = None;
                state.retries = 0;
                state.failures = 0;
                state.latency_ms = None;
            }
        }
    }

    fn scroll_logs(&mut self, delta: i16) {
        let max = self.state.lock().map(|state| state.logs.len()).unwrap_or(0);
        let max_scroll = max.saturating_sub(1) as i16;
        let next = (self.log_scroll as i16 + delta).clamp(0, max_scroll);
        self.log_scroll = next as u16;
    }
}

fn restore_terminal() -> miette::Result<()> {
    disable_raw_mode().into_diagnostic()?;
    io::stdout()
        .execute(LeaveAlternateScreen)
        .into_diagnostic()?;
    Ok(())
}

fn draw_ui(frame: &mut ratatui::Frame, tui: &Tui, state: &AppState, tick: usize) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(2),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(tui.kind, tick), chunks[0]);
    if tui.show_logs {
        frame.render_widget(draw_logs_view(state, tui.log_scroll), chunks[1]);
    } else {
        frame.render_widget(draw_status_panel(state), chunks[1]);
    }

    let footer = Paragraph::new(Line::from(Span::styled(
        "Esc abort   l logs   PgUp/PgDn scroll",
        Style::default().fg(Color::Gray),
    )));
    frame.render_widget(footer, chunks[2]);
}

fn draw_header(kind: ProgressSinkKind, tick: usize) -> Paragraph<'static> {
    let hb = if tick % 2 == 0 { "*" } else { " " };
    let op_label = match kind {
        ProgressSinkKind::Run => "Run",
        ProgressSinkKind::Reviews => "Reviews",
    };
    Paragraph::new(Line::from(vec![
        Span::styled(
            "LEAFLY-HARVEST",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw("   Op: "),
        Span::styled(op_label, Style::default().fg(Color::Cyan)),
        Span::raw("   "),
        Span::styled(hb, Style::default().fg(Color::Green)),
    ]))
    .alignment(Alignment::Left)
    .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_status_panel(state: &AppState) -> Paragraph<'static> {
    let percent = state
        .progress
        .map(|(done, total)| progress_percent(done, total))
        .unwrap_or(0);
    let counts = state
        .progress
        .map(|(done, total)| format!(" {done}/{total}"))
        .unwrap_or_default();
    let phase_color = if state.active {
        Color::Cyan
    } else {
        Color::Green
    };
    let latency = state
        .latency_ms
        .map(|v| format!("{v} ms"))
        .unwrap_or_else(|| "--".to_string());
    let mut lines = vec![
        Line::from(Span::styled(
            "STATUS / PROGRESS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![
            Span::styled("Phase: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!("{:<9} ", state.phase.label()),
                Style::default().fg(phase_color),
            ),
            Span::raw(progress_bar(percent)),
            Span::raw(format!(" {percent:>3}%{counts}")),
        ]),
        Line::from(vec![
            Span::styled("Elapsed: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{}s", state.started.elapsed().as_secs())),
            Span::styled("   Last strain: ", Style::default().fg(Color::Gray)),
            Span::raw(latency),
        ]),
        Line::from(vec![
            Span::styled("Retries: ", Style::default().fg(Color::Gray)),
            Span::raw(state.retries.to_string()),
            Span::styled("   Failures: ", Style::default().fg(Color::Gray)),
            Span::raw(state.failures.to_string()),
        ]),
        Line::from(vec![
            Span::styled("Now: ", Style::default().fg(Color::Gray)),
            Span::raw(state.status.clone()),
        ]),
        Line::from(Span::styled(
            "Recent events:",
            Style::default().fg(Color::Gray),
        )),
    ];
    for event in state.events.iter().rev().take(5) {
        lines.push(Line::from(format!("- {event}")));
    }

    Paragraph::new(lines).wrap(Wrap { trim: true })
}

fn draw_logs_view(state: &AppState, scroll: u16) -> Paragraph<'static> {
    let lines = state
        .logs
        .iter()
        .map(|line| Line::from(line.clone()))
        .collect::<Vec<_>>();
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Logs"))
        .scroll((scroll, 0))
        .wrap(Wrap { trim: false })
}

fn progress_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

fn progress_bar(percent: u8) -> String {
    let total = 20;
    let filled = (percent as usize * total) / 100;
    let mut out = String::from("[");
    for i in 0..total {
        out.push(if i < filled { '#' } else { '.' });
    }
    out.push(']');
    out
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (name, payload) = rest.split_once(';')?;
    let phase = match name {
        "Resolve" => Phase::Resolve,
        "Fetch" => Phase::Fetch,
        "Store" => Phase::Store,
        "Aggregate" => Phase::Aggregate,
        _ => return None,
    };
    Some((phase, payload.trim()))
}

fn parse_latency(message: &str) -> Option<u128> {
    message
        .split("latency_ms=")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse::<u128>().ok())
}

fn push_bounded(buffer: &mut VecDeque<String>, item: String, max: usize) {
    buffer.push_back(item);
    while buffer.len() > max {
        buffer.pop_front();
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

fn is_retry_notice(message: &str) -> bool {
    message.contains(": status ") && message.contains(", retry ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_and_failure_events_move_counters() {
        let tui = Tui::new(ProgressSinkKind::Reviews);
        let progress = TuiProgress {
            state: tui.state.clone(),
        };
        progress.event(ProgressEvent::message(
            "phase=Fetch; og-kush page 2: status 429, retry 1 in 4.0s",
        ));
        progress.event(ProgressEvent::message("phase=Fetch; reviews for og-kush"));
        progress.event(ProgressEvent::message(
            "phase=Fetch; og-kush failed: rate limited (status 429, Retry-After: 4)",
        ));

        let state = tui.state.lock().unwrap();
        assert_eq!(state.retries, 1);
        assert_eq!(state.failures, 1);
        assert_eq!(state.phase, Phase::Fetch);
        assert_eq!(state.events.len(), 3);
    }

    #[test]
    fn phase_prefix_parsing() {
        assert_eq!(
            parse_phase("phase=Fetch; strain 1 of 3: og-kush"),
            Some((Phase::Fetch, "strain 1 of 3: og-kush"))
        );
        assert_eq!(parse_phase("phase=Verify; x"), None);
        assert_eq!(parse_phase("no phase"), None);
    }

    #[test]
    fn latency_and_progress() {
        assert_eq!(
            parse_latency("phase=Store; a: 3 reviews in 1 pages latency_ms=42"),
            Some(42)
        );
        assert_eq!(progress_percent(1, 4), 25);
        assert_eq!(progress_percent(0, 0), 100);
        assert_eq!(progress_bar(50), "[##########..........]");
    }
}
