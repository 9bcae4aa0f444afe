//! Terminal User Interface (TUI) rendering and management.
//!
//! This module handles initializing the terminal in raw mode, restoring it on exit,
//! and drawing the dashboard using `ratatui`.

use std::io::{self, Stdout};

use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::{Frame, Terminal};

use crate::app::{AddField, AddForm, App, InputMode, StatusLevel};
use crate::output::StreamKind;
use crate::service::ServiceSnapshot;
use crate::state::ServiceState;

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

const HELP: &str =
    "↑/↓ select | Enter start/stop | a start all | x stop all | r restart | n add | c copy fix | l log | q quit";
const ADD_HELP: &str = "Tab/↑/↓ field | Enter next/submit | Esc cancel";

/// Initializes the terminal for TUI mode.
///
/// Enables raw mode, enters the alternate screen, and creates a `ratatui` Terminal instance.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, SetTitle("devrack"))?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restores the terminal to its original state.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Draws the current application state to the terminal.
pub fn draw(app: &mut App, terminal: &mut TuiTerminal) -> io::Result<()> {
    terminal.draw(|frame| render(app, frame))?;
    Ok(())
}

fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.size();
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(1), Constraint::Length(4)])
        .split(area);
    let main = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(30), Constraint::Percentage(70)])
        .split(vertical[0]);

    render_service_list(app, frame, main[0]);

    let adding = app.input_mode == InputMode::Add;
    let details = if adding {
        add_form_lines(&app.add_form)
    } else {
        app.selected_service().map(hint_lines).unwrap_or_default()
    };
    let hint_height = details.lines.len().max(1) as u16 + 2;
    let right = if app.show_log {
        Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(hint_height), Constraint::Min(3)])
            .split(main[1])
    } else {
        Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(3)])
            .split(main[1])
    };

    let details = Paragraph::new(details)
        .block(panel(if adding { "Add service" } else { "Details" }))
        .wrap(Wrap { trim: false });
    frame.render_widget(details, right[0]);

    if app.show_log {
        render_log(app, frame, right[1]);
    }

    let help_line = match app.status_message() {
        Some((message, StatusLevel::Warning)) => {
            Span::styled(message.to_string(), Style::default().fg(Color::Yellow))
        }
        Some((message, StatusLevel::Info)) => Span::raw(message.to_string()),
        None if adding => Span::styled(ADD_HELP, Style::default().fg(Color::DarkGray)),
        None => Span::styled(HELP, Style::default().fg(Color::DarkGray)),
    };
    let status = Paragraph::new(Text::from(vec![
        Line::from(Span::raw(app.status_line())),
        Line::from(help_line),
    ]))
    .block(panel(""));
    frame.render_widget(status, vertical[1]);
}

fn render_service_list(app: &App, frame: &mut Frame, area: Rect) {
    let width = area.width.saturating_sub(4) as usize;
    let items: Vec<ListItem> = app
        .services
        .iter()
        .enumerate()
        .map(|(index, service)| {
            let is_selected = index == app.selected;
            let marker = if is_selected { "▶ " } else { "  " };
            let name_style = if is_selected {
                Style::default().add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::Gray)
            };
            let mut text = Text::from(Line::from(vec![
                Span::styled(marker, Style::default().fg(Color::Cyan)),
                Span::styled(format!("{} ", state_char(service.state)), state_style(service.state)),
                Span::styled(service.name.clone(), name_style),
                Span::styled(
                    format!("  {}", service.state),
                    state_style(service.state).add_modifier(Modifier::DIM),
                ),
            ]));
            if !service.detail.is_empty() {
                text.lines.push(Line::from(Span::styled(
                    format!("    {}", truncate(&service.detail, width.saturating_sub(4))),
                    Style::default().fg(Color::DarkGray),
                )));
            }
            ListItem::new(text)
        })
        .collect();

    let mut state = ListState::default();
    if !app.services.is_empty() {
        state.select(Some(app.selected.min(app.services.len() - 1)));
    }
    let list = List::new(items).block(panel("Services"));
    frame.render_stateful_widget(list, area, &mut state);
}

fn render_log(app: &mut App, frame: &mut Frame, area: Rect) {
    let title = match app.selected_service() {
        Some(service) => format!("Log - {}", service.name),
        None => "Log".to_string(),
    };
    let block = panel(&title);
    let inner = block.inner(area);
    app.set_log_view_height(inner.height as usize);

    let scroll = app.log_scroll();
    let height = inner.height as usize;
    let width = inner.width as usize;
    let lines: Vec<Line> = app
        .selected_service()
        .map(|service| {
            service
                .log_tail
                .iter()
                .skip(scroll)
                .take(height)
                .map(|line| {
                    let style = match line.stream {
                        StreamKind::Stdout => Style::default(),
                        StreamKind::Stderr => Style::default().fg(Color::LightRed),
                    };
                    Line::from(Span::styled(truncate(&line.text, width), style))
                })
                .collect()
        })
        .unwrap_or_default();

    if lines.is_empty() {
        let empty = Paragraph::new("No output yet")
            .style(Style::default().fg(Color::DarkGray))
            .block(block);
        frame.render_widget(empty, area);
    } else {
        frame.render_widget(Paragraph::new(lines).block(block), area);
    }
}

// State line, URL and the current hint with its suggested command.
fn hint_lines(service: &ServiceSnapshot) -> Text<'static> {
    let mut lines = vec![Line::from(vec![
        Span::styled(service.state.to_string(), state_style(service.state)),
        Span::raw(if service.detail.is_empty() {
            String::new()
        } else {
            format!(" - {}", service.detail)
        }),
    ])];
    if let Some(url) = &service.url {
        let style = if service.can_open {
            Style::default().fg(Color::Cyan).add_modifier(Modifier::UNDERLINED)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        lines.push(Line::from(Span::styled(url.clone(), style)));
    }
    if let Some(hint) = &service.hint {
        lines.push(Line::from(Span::styled(
            hint.text.clone(),
            Style::default().fg(Color::Yellow),
        )));
        if let Some(command) = &hint.command {
            lines.push(Line::from(vec![
                Span::styled("$ ", Style::default().fg(Color::DarkGray)),
                Span::styled(command.clone(), Style::default().add_modifier(Modifier::BOLD)),
                Span::styled("  (c to copy)", Style::default().fg(Color::DarkGray)),
            ]));
        }
    }
    Text::from(lines)
}

fn add_form_lines(form: &AddForm) -> Text<'static> {
    let lines = AddField::ALL
        .iter()
        .map(|&field| {
            let focused = field == form.focus;
            let label_style = if focused {
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::DarkGray)
            };
            let mut spans = vec![
                Span::styled(format!("{:<16}", field.label()), label_style),
                Span::raw(form.value(field).to_string()),
            ];
            if focused {
                spans.push(Span::styled("_", Style::default().fg(Color::Cyan)));
            }
            Line::from(spans)
        })
        .collect::<Vec<_>>();
    Text::from(lines)
}

fn panel(title: &str) -> Block<'_> {
    Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(Color::DarkGray))
}

fn state_char(state: ServiceState) -> char {
    match state {
        ServiceState::Off => '·',
        ServiceState::Starting => '↻',
        ServiceState::Running => '▲',
        ServiceState::Errors => '▲',
        ServiceState::Error => '■',
    }
}

fn state_style(state: ServiceState) -> Style {
    match state {
        ServiceState::Off => Style::default().fg(Color::DarkGray),
        ServiceState::Starting => Style::default().fg(Color::Yellow),
        ServiceState::Running => Style::default().fg(Color::Green),
        ServiceState::Errors => Style::default().fg(Color::LightRed),
        ServiceState::Error => Style::default().fg(Color::Red),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('~');
    out
}
