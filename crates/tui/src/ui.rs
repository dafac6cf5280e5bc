use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
};

use autotap_core::logger::{Level, LogLine};
use autotap_core::supervisor::SupervisorState;
use autotap_core::types::{EngineState, StopReason};
use crate::App;

fn key(k: &'static str) -> Span<'static> {
    Span::styled(k, Style::default().fg(Color::Yellow))
}

pub fn draw(f: &mut Frame, app: &App) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(f.area());

    {
        let state = app.lock_state();
        draw_scenarios(f, app, &state, columns[0]);

        let right = if app.log_visible {
            Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
                .split(columns[1])
        } else {
            Layout::default()
                .constraints([Constraint::Percentage(100)])
                .split(columns[1])
        };
        draw_live(f, &state, right[0]);
        if app.log_visible && right.len() > 1 {
            draw_logs(f, app, right[1]);
        }
    } // state lock dropped here

    if let Some(dialog) = &app.confirm {
        dialog.render(f);
    }
}

fn banner(engine: &EngineState) -> (String, Color) {
    match engine {
        EngineState::Idle => ("IDLE (Press S to start)".into(), Color::DarkGray),
        EngineState::Running => ("RUNNING (S to stop, P to pause)".into(), Color::Green),
        EngineState::Paused => ("PAUSED (P to resume)".into(), Color::Yellow),
        EngineState::Stopped(StopReason::Error(e)) => (format!("STOPPED: {}", e), Color::Red),
        EngineState::Stopped(StopReason::AllEventsDisabled) => ("STOPPED: all events disabled".into(), Color::Red),
        EngineState::Stopped(StopReason::Requested) => ("STOPPED (Press S to start)".into(), Color::Red),
    }
}

fn draw_scenarios(f: &mut Frame, app: &App, state: &SupervisorState, area: Rect) {
    let (label, bg) = banner(&state.engine);
    let mut lines: Vec<Line> = vec![
        Line::from(vec![
            Span::raw(" "),
            key("j"),
            Span::raw("/"),
            key("k"),
            Span::raw(" select, "),
            key("s"),
            Span::raw(" start/stop, "),
            key("p"),
            Span::raw(" pause, "),
            key("r"),
            Span::raw(" reload"),
        ]),
        Line::from(""),
    ];

    if state.entries.is_empty() {
        lines.push(Line::from(Span::styled(
            "  no scenarios found under ./scenarios",
            Style::default().fg(Color::DarkGray),
        )));
    }

    for (i, entry) in state.entries.iter().enumerate() {
        let prefix = if i == app.selected { "> " } else { "  " };
        let is_active = state.active.as_deref() == Some(entry.name.as_str()) && state.engine.is_active();
        let marker = if is_active { "[●]" } else { "[ ]" };

        let mut spans = vec![
            Span::raw(prefix),
            Span::styled(marker, Style::default().fg(bg)),
            Span::raw(" "),
            Span::styled(entry.name.clone(), Style::default().fg(Color::White).add_modifier(Modifier::BOLD)),
        ];
        match (&entry.scenario, &entry.error) {
            (Some(s), _) => spans.push(Span::styled(
                format!("  {} ({} events)", s.name, s.events.len()),
                Style::default().fg(Color::DarkGray),
            )),
            (None, Some(e)) => spans.push(Span::styled(
                format!("  err: {}", e.lines().next().unwrap_or_default()),
                Style::default().fg(Color::Red),
            )),
            (None, None) => {}
        }
        lines.push(Line::from(spans));
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(0)])
        .split(area);

    // Full-width centered banner
    let width = chunks[0].width as usize;
    let pad_total = width.saturating_sub(label.chars().count());
    let pad_left = pad_total / 2;
    let centered = format!("{}{}{}", " ".repeat(pad_left), label, " ".repeat(pad_total - pad_left));
    f.render_widget(
        Paragraph::new(Span::styled(
            centered,
            Style::default().fg(Color::Black).bg(bg).add_modifier(Modifier::BOLD),
        )),
        chunks[0],
    );

    let list = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::LEFT | Borders::RIGHT | Borders::BOTTOM)
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(list, chunks[1]);
}

fn draw_live(f: &mut Frame, state: &SupervisorState, area: Rect) {
    let live = &state.live;
    let dim = Style::default().fg(Color::DarkGray);
    let mut lines: Vec<Line> = Vec::new();

    if live.scenario_name.is_empty() {
        lines.push(Line::from(Span::styled("no session yet", dim)));
    } else {
        lines.push(Line::from(vec![
            Span::styled(live.scenario_name.clone(), Style::default().fg(Color::White).add_modifier(Modifier::BOLD)),
            Span::styled(
                format!("  tick {}  avg {:.1}ms  last {:.1}ms", live.tick, live.average_tick_ms(), live.last_tick_us as f64 / 1000.0),
                dim,
            ),
        ]));
        if state.dropped_records > 0 {
            lines.push(Line::from(Span::styled(
                format!("{} debug records dropped", state.dropped_records),
                Style::default().fg(Color::Yellow),
            )));
        }
        if let Some((event, tick)) = live.last_fulfilled {
            lines.push(Line::from(vec![
                Span::raw("last fulfilled: "),
                Span::styled(live.event_name(event).to_string(), Style::default().fg(Color::Green)),
                Span::styled(format!(" @{}", tick), dim),
            ]));
        }
        if let Some(reason) = &live.ended {
            lines.push(Line::from(Span::styled(format!("ended: {}", reason), Style::default().fg(Color::Red))));
        }

        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled("conditions", Style::default().fg(Color::Cyan))));
        for (event, result) in &live.conditions {
            let color = if result.error.is_some() {
                Color::Red
            } else if result.fulfilled {
                Color::Green
            } else {
                Color::Gray
            };
            let detail = match (&result.error, result.confidence) {
                (Some(e), _) => e.clone(),
                (None, Some(c)) => format!("{:.0}%", c * 100.0),
                (None, None) => String::new(),
            };
            lines.push(Line::from(vec![
                Span::styled(format!("  {} #{} ", live.event_name(*event), result.condition_id), dim),
                Span::styled(detail, Style::default().fg(color)),
            ]));
        }

        if !live.counters.is_empty() {
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled("counters", Style::default().fg(Color::Cyan))));
            for (name, value) in &live.counters {
                lines.push(Line::from(format!("  {} = {}", name, value)));
            }
        }

        let disabled: Vec<&str> = live
            .enabled
            .iter()
            .filter(|(_, on)| !**on)
            .map(|(id, _)| live.event_name(*id))
            .collect();
        if !disabled.is_empty() {
            lines.push(Line::from(Span::styled(format!("disabled: {}", disabled.join(", ")), dim)));
        }

        if !live.recent_actions.is_empty() {
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled("actions", Style::default().fg(Color::Cyan))));
            for action in live.recent_actions.iter().rev().take(8) {
                lines.push(Line::from(format!("  {}", action)));
            }
        }
    }

    let panel = Paragraph::new(lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Live ")
                .border_style(Style::default().fg(Color::Green)),
        )
        .wrap(Wrap { trim: false });
    f.render_widget(panel, area);
}

fn draw_logs(f: &mut Frame, app: &App, area: Rect) {
    let visible_height = area.height.saturating_sub(2) as usize;
    let total = app.log_lines.len();
    let max_scroll = total.saturating_sub(visible_height);
    let scroll = app.log_scroll.min(max_scroll);
    let start = total.saturating_sub(visible_height + scroll);
    let end = total.saturating_sub(scroll);
    let lines: Vec<Line> = app.log_lines[start..end].iter().map(log_line).collect();

    let panel = Paragraph::new(lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Logs ")
                .border_style(Style::default().fg(Color::Yellow)),
        )
        .wrap(Wrap { trim: false });
    f.render_widget(panel, area);
}

fn log_line(line: &LogLine) -> Line<'_> {
    let color = match line.color {
        1 => Color::DarkGray,  // COLOR_GRAY
        2 => Color::LightBlue, // COLOR_BLUE
        3 => Color::Green,     // COLOR_GREEN
        4 => Color::Magenta,   // COLOR_MAGENTA
        _ => Color::White,
    };

    let mut spans = vec![
        Span::styled(line.timestamp.as_str(), Style::default().fg(Color::DarkGray)),
        Span::raw(" "),
    ];
    match line.level {
        Level::Error => spans.push(Span::styled("error ", Style::default().fg(Color::Red))),
        Level::Warn => spans.push(Span::styled("warn ", Style::default().fg(Color::Yellow))),
        Level::Debug => spans.push(Span::styled("debug ", Style::default().fg(Color::DarkGray))),
        Level::Info => {}
    }
    if !line.prefix.is_empty() {
        spans.push(Span::styled(line.prefix.as_str(), Style::default().fg(color).add_modifier(Modifier::BOLD)));
        spans.push(Span::raw(" "));
    }
    spans.push(Span::styled(line.message.as_str(), Style::default().fg(color)));
    Line::from(spans)
}
