//! TUI for a qualification run with live progress

use crate::proxy::{Latency, Progress, QualificationOutcome, RunHandle, RunReport};
use crate::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Duration;

/// Maximum number of recent outcomes kept per list
const MAX_RECENT: usize = 100;

/// Recent outcomes split by result
#[derive(Debug, Default)]
struct OutcomeLog {
    working: VecDeque<QualificationOutcome>,
    unreachable: VecDeque<QualificationOutcome>,
    working_count: usize,
    unreachable_count: usize,
}

impl OutcomeLog {
    fn record(&mut self, outcome: QualificationOutcome) {
        let (list, count) = if outcome.is_working() {
            (&mut self.working, &mut self.working_count)
        } else {
            (&mut self.unreachable, &mut self.unreachable_count)
        };
        *count += 1;
        list.push_back(outcome);
        if list.len() > MAX_RECENT {
            list.pop_front();
        }
    }

    fn list(&self, selected: usize) -> &VecDeque<QualificationOutcome> {
        if selected == 0 {
            &self.working
        } else {
            &self.unreachable
        }
    }
}

/// Qualification TUI application state
pub struct QualifierApp {
    handle: Option<RunHandle>,
    events: UnboundedReceiver<QualificationOutcome>,
    log: OutcomeLog,
    progress: Progress,
    /// Selected list (0 = working, 1 = unreachable)
    selected_list: usize,
    list_state: ListState,
    status_message: String,
    report: Option<RunReport>,
    should_quit: bool,
}

impl QualifierApp {
    /// Create the view over a spawned run and its outcome stream
    pub fn new(handle: RunHandle, events: UnboundedReceiver<QualificationOutcome>) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            progress: handle.progress(),
            handle: Some(handle),
            events,
            log: OutcomeLog::default(),
            selected_list: 0,
            list_state,
            status_message: "Qualifying... Press 'q' to stop.".to_string(),
            report: None,
            should_quit: false,
        }
    }

    /// Run the TUI until the operator quits; returns the run's report
    pub async fn run(mut self) -> Result<RunReport> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal).await;

        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        if let Err(e) = result {
            if let Some(handle) = self.handle.take() {
                let _ = handle.stop().await;
            }
            return Err(e);
        }
        match self.report.take() {
            Some(report) => Ok(report),
            None => self.finish(true).await,
        }
    }

    async fn run_app<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        loop {
            terminal.draw(|f| self.ui(f))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                    }
                }
            }

            if self.should_quit {
                if self.report.is_none() {
                    self.status_message = "Stopping...".to_string();
                    terminal.draw(|f| self.ui(f))?;
                    let report = self.finish(true).await?;
                    self.report = Some(report);
                }
                break;
            }

            self.drain_events();
            if let Some(handle) = &self.handle {
                self.progress = handle.progress();
            }

            if self.report.is_none() && self.run_finished() {
                self.drain_events();
                let report = self.finish(false).await?;
                self.status_message = format!(
                    "Complete! Tested: {} | Working: {} | Stored: {} | Press 'q' to quit",
                    report.outcomes.len(),
                    report.working.len(),
                    report.persisted.len()
                );
                self.report = Some(report);
            }
        }

        Ok(())
    }

    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(outcome) => self.log.record(outcome),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn run_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, RunHandle::is_finished)
    }

    async fn finish(&mut self, stop: bool) -> Result<RunReport> {
        match self.handle.take() {
            Some(handle) if stop => handle.stop().await,
            Some(handle) => handle.join().await,
            None => Ok(RunReport::default()),
        }
    }

    fn handle_input(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
            }
            KeyCode::Tab => {
                self.selected_list = (self.selected_list + 1) % 2;
                self.list_state.select(Some(0));
            }
            KeyCode::Down => {
                let len = self.log.list(self.selected_list).len();
                let i = match self.list_state.selected() {
                    Some(i) if i + 1 < len => i + 1,
                    _ => 0,
                };
                self.list_state.select(Some(i));
            }
            KeyCode::Up => {
                let len = self.log.list(self.selected_list).len();
                let i = match self.list_state.selected() {
                    Some(0) | None => len.saturating_sub(1),
                    Some(i) => i - 1,
                };
                self.list_state.select(Some(i));
            }
            _ => {}
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title
                Constraint::Length(3), // Progress bar
                Constraint::Min(0),    // Outcome lists
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        let title = Paragraph::new("Share-Link Qualifier")
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let Progress {
            total,
            tested,
            working,
        } = self.progress;
        let percent = if total > 0 {
            (tested.min(total) as f64 / total as f64 * 100.0) as u16
        } else {
            0
        };
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(percent)
            .label(format!(
                "{}/{} ({}%) | working: {}",
                tested, total, percent, working
            ));
        f.render_widget(gauge, chunks[1]);

        let list_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[2]);

        Self::render_outcomes(
            f,
            list_chunks[0],
            "Working",
            &self.log.working,
            self.log.working_count,
            Color::Green,
            (self.selected_list == 0).then_some(&mut self.list_state),
        );
        Self::render_outcomes(
            f,
            list_chunks[1],
            "Unreachable",
            &self.log.unreachable,
            self.log.unreachable_count,
            Color::Red,
            (self.selected_list == 1).then_some(&mut self.list_state),
        );

        let status = Paragraph::new(self.status_message.clone())
            .style(if self.report.is_some() {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[3]);
    }

    fn render_outcomes(
        f: &mut Frame,
        area: Rect,
        title: &str,
        outcomes: &VecDeque<QualificationOutcome>,
        total_count: usize,
        color: Color,
        list_state: Option<&mut ListState>,
    ) {
        let items: Vec<ListItem> = outcomes
            .iter()
            .rev() // newest first
            .map(|outcome| {
                let content = match outcome.latency {
                    Latency::Millis(ms) => format!("{} ({}ms)", outcome.uri, ms),
                    Latency::Unreachable => outcome.uri.clone(),
                };
                ListItem::new(content).style(Style::default().fg(color))
            })
            .collect();

        let border_style = if list_state.is_some() {
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };

        let list = List::new(items)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(format!("{} ({})", title, total_count))
                    .border_style(border_style),
            )
            .highlight_style(Style::default().bg(Color::DarkGray))
            .highlight_symbol(">> ");

        match list_state {
            Some(state) => f.render_stateful_widget(list, area, state),
            None => f.render_widget(list, area),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_log_splits_and_caps() {
        let mut log = OutcomeLog::default();
        for i in 0..(MAX_RECENT + 5) {
            log.record(QualificationOutcome::working(format!("vless://{}", i), 10));
        }
        log.record(QualificationOutcome::unreachable("ss://x"));

        assert_eq!(log.working_count, MAX_RECENT + 5);
        assert_eq!(log.working.len(), MAX_RECENT);
        assert_eq!(log.working.front().unwrap().uri, "vless://5");
        assert_eq!(log.unreachable_count, 1);
        assert_eq!(log.list(1).len(), 1);
    }
}
