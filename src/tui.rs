use std::fmt;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph},
    Terminal,
};
use tokio::runtime::Runtime;

use crate::estimator::Estimate;
use crate::session::{Outcome, SpeedTest, StopHandle};

#[derive(Clone, Debug)]
pub enum Update {
    Started,
    Progress(Estimate),
    Ended(Outcome),
    Failed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Status {
    Idle,
    Running,
    Finished,
    Stopped,
    NetworkError(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle => write!(f, "idle"),
            Status::Running => write!(f, "running"),
            Status::Finished => write!(f, "finished"),
            Status::Stopped => write!(f, "stopped"),
            Status::NetworkError(msg) => write!(f, "network error: {msg}"),
        }
    }
}

pub struct View {
    pub status: Status,
    pub estimate: Estimate,
    pub logs: Vec<String>,
}

impl View {
    pub fn new() -> Self {
        Self { status: Status::Idle, estimate: Estimate::default(), logs: Vec::new() }
    }

    pub fn apply(&mut self, update: Update) {
        match update {
            Update::Started => {
                self.status = Status::Running;
                self.estimate = Estimate::default();
                self.log("Started".into());
            }
            Update::Progress(estimate) => self.estimate = estimate,
            Update::Ended(outcome) => {
                let summary = outcome.summary();
                self.log(format!(
                    "{} {} bytes in {:.1}s, average {:.1} Mbps",
                    match outcome {
                        Outcome::Finished(_) => "Finished:",
                        Outcome::Stopped(_) => "Stopped:",
                    },
                    summary.bytes,
                    summary.elapsed_secs,
                    summary.mean_mbps
                ));
                self.status = match outcome {
                    Outcome::Finished(_) => Status::Finished,
                    Outcome::Stopped(_) => Status::Stopped,
                };
            }
            Update::Failed(msg) => {
                self.log(format!("Failed: {msg}"));
                self.status = Status::NetworkError(msg);
            }
        }
    }

    fn log(&mut self, line: String) {
        self.logs.push(line);
        if self.logs.len() > 100 {
            self.logs.remove(0);
        }
    }
}

/// Spawn a session on `runtime` unless one is already running.
pub fn launch(runtime: &Runtime, test: &SpeedTest, updates: Sender<Update>) -> Option<StopHandle> {
    let session = test.start()?;
    let stop = session.stop_handle();
    let _ = updates.send(Update::Started);
    runtime.spawn(async move {
        let progress = updates.clone();
        let update = match session
            .run(move |e| {
                let _ = progress.send(Update::Progress(e.clone()));
            })
            .await
        {
            Ok(outcome) => Update::Ended(outcome),
            Err(e) => Update::Failed(e.to_string()),
        };
        let _ = updates.send(update);
    });
    Some(stop)
}

pub fn run_tui(runtime: &Runtime, test: &SpeedTest) -> Result<()> {
    let (tx, rx): (Sender<Update>, Receiver<Update>) = crossbeam_channel::unbounded();

    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut view = View::new();
    view.log(format!("Target: {} ({} bytes)", test.url(), test.expected_bytes()));
    // Measure right away, like the browser page does on load.
    let mut stop = launch(runtime, test, tx.clone());

    loop {
        while let Ok(update) = rx.try_recv() {
            view.apply(update);
        }

        terminal.draw(|f| {
            let outer = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(5), // Speed
                    Constraint::Length(3), // Progress
                    Constraint::Min(0),    // Events
                    Constraint::Length(1), // Footer
                ].as_ref())
                .split(f.size());

            let speed = Paragraph::new(format!("\n{:.1} Mbps", view.estimate.mbps))
                .style(Style::default().add_modifier(Modifier::BOLD))
                .alignment(Alignment::Center)
                .block(Block::default().title(format!("Throughput | {}", view.status)).borders(Borders::ALL));
            f.render_widget(speed, outer[0]);

            let percent = view.estimate.percent.clamp(0.0, 100.0);
            let gauge = Gauge::default()
                .block(Block::default().title("Progress").borders(Borders::ALL))
                .gauge_style(Style::default().fg(Color::Rgb(0xf4, 0x81, 0x20)))
                .ratio(percent / 100.0)
                .label(format!("{percent:.0}% ({} / {} bytes)", view.estimate.received, view.estimate.total));
            f.render_widget(gauge, outer[1]);

            let viewport = outer[2].height.saturating_sub(2) as usize;
            let start = view.logs.len().saturating_sub(viewport);
            let items: Vec<ListItem> = view.logs.iter().skip(start).map(|l| ListItem::new(l.clone())).collect();
            let list = List::new(items).block(Block::default().title("Events").borders(Borders::ALL));
            f.render_widget(list, outer[2]);

            f.render_widget(Paragraph::new("s/Enter: start | x: stop | q: quit"), outer[3]);
        })?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Char('q') => break,
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
                    KeyCode::Char('s') | KeyCode::Enter => {
                        if let Some(handle) = launch(runtime, test, tx.clone()) {
                            stop = Some(handle);
                        }
                    }
                    KeyCode::Char('x') => {
                        if let Some(handle) = stop.as_ref().filter(|h| !h.is_stopped()) {
                            handle.stop();
                            view.log("Stopping".into());
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(handle) = stop {
        handle.stop();
    }
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
