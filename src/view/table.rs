//! Terminal table for the live view.

use std::io;

use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use futures::{Stream, StreamExt, future};
use ratatui::Frame;
use ratatui::Terminal;
use ratatui::backend::Backend;
use ratatui::layout::Constraint;
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Cell, Row, Table, TableState};
use tracing::warn;

use super::{KeyInput, Renderer, ViewEvent, ViewState};
use crate::hits::RankedRow;

const FLAG_LABEL: &str = "MALWARE";

/// Puts the terminal in raw mode on the alternate screen until dropped.
pub struct TerminalGuard {
    active: bool,
}

impl TerminalGuard {
    pub fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        execute!(io::stdout(), EnterAlternateScreen)?;
        Ok(Self { active: true })
    }

    pub fn restore(&mut self) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        disable_raw_mode()?;
        execute!(io::stdout(), LeaveAlternateScreen)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

/// Renders the ranking as a bordered three-column table.
pub struct TableRenderer<B: Backend> {
    terminal: Terminal<B>,
    table_state: TableState,
}

impl<B: Backend> TableRenderer<B> {
    pub fn new(terminal: Terminal<B>) -> Self {
        Self {
            terminal,
            table_state: TableState::default(),
        }
    }

    pub fn terminal(&self) -> &Terminal<B> {
        &self.terminal
    }
}

impl<B: Backend> Renderer for TableRenderer<B> {
    fn render(&mut self, rows: &[RankedRow], state: &ViewState) -> io::Result<()> {
        self.table_state.select(state.selected);
        let table_state = &mut self.table_state;
        self.terminal
            .draw(|frame| draw_table(frame, rows, state, table_state))?;
        Ok(())
    }
}

fn draw_table(frame: &mut Frame, rows: &[RankedRow], state: &ViewState, table_state: &mut TableState) {
    let header = Row::new(["DNS Query", "Hits", "Flag"])
        .style(Style::default().add_modifier(Modifier::BOLD));

    let body = rows.iter().map(|row| {
        let (flag, style) = if row.flagged {
            (FLAG_LABEL, Style::default().fg(Color::Red))
        } else {
            ("", Style::default())
        };
        Row::new([
            Cell::from(row.domain.as_str()),
            Cell::from(row.hits.to_string()),
            Cell::from(flag),
        ])
        .style(style)
    });

    let total: u64 = rows.iter().map(|row| row.hits).sum();
    let title = format!(" {} domains, {} queries ", rows.len(), total);

    let highlight = if state.focused {
        Style::default().fg(Color::Black).bg(Color::Green)
    } else {
        Style::default()
    };

    let table = Table::new(
        body,
        [
            Constraint::Min(20),
            Constraint::Length(8),
            Constraint::Length(10),
        ],
    )
    .header(header)
    .block(
        Block::bordered()
            .title(title)
            .border_style(Style::default().fg(Color::DarkGray)),
    )
    .row_highlight_style(highlight);

    frame.render_stateful_widget(table, frame.area(), table_state);
}

/// Terminal input as view events.
///
/// A broken input stream closes the view rather than spinning on errors.
pub fn terminal_events() -> impl Stream<Item = ViewEvent> {
    EventStream::new().filter_map(|event| {
        future::ready(match event {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                Some(ViewEvent::Key(key_input(key)))
            }
            Ok(Event::Resize(width, height)) => Some(ViewEvent::Resize { width, height }),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "terminal input failed, closing view");
                Some(ViewEvent::Quit)
            }
        })
    })
}

fn key_input(key: KeyEvent) -> KeyInput {
    match key.code {
        KeyCode::Char('q') => KeyInput::Quit,
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => KeyInput::Quit,
        KeyCode::Esc => KeyInput::ToggleFocus,
        KeyCode::Up | KeyCode::Char('k') => KeyInput::Up,
        KeyCode::Down | KeyCode::Char('j') => KeyInput::Down,
        _ => KeyInput::Other,
    }
}
