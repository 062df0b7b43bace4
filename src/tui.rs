use std::{
    io,
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols::{self, border},
    text::Span,
    widgets::{Axis, Block, Borders, Chart, Clear, Dataset, Gauge, GraphType, List, ListItem, ListState},
    Frame, Terminal,
};

use iq_ring::monitor::{Monitor, MonitorSnapshot, SCOPE_LEN};

use crate::console::Console;

pub enum ExitStatus {
    /// Leave the dashboard, keep the session running.
    Detach,
    /// Stop the session.
    Quit,
    /// The session ended on its own.
    Finished,
}

/// Terminal set up for the dashboard, restored on drop.
pub(crate) struct Dashboard {
    terminal: Terminal<CrosstermBackend<io::Stdout>>,
}

impl Dashboard {
    pub fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        Ok(Self { terminal })
    }

    pub fn terminal(&mut self) -> &mut Terminal<CrosstermBackend<io::Stdout>> {
        &mut self.terminal
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(
            self.terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        );
        let _ = self.terminal.show_cursor();
    }
}

pub(crate) fn run_app<B: Backend>(
    console: &Console,
    terminal: &mut Terminal<B>,
    tick_rate: Duration,
    monitor: &Monitor,
    info: &str,
    keep_going: impl Fn() -> bool,
) -> io::Result<ExitStatus> {
    let mut last_tick = Instant::now();

    loop {
        if !keep_going() {
            return Ok(ExitStatus::Finished);
        }

        let snapshot = monitor.snapshot();
        let paused = monitor.paused.load(Ordering::Relaxed);
        terminal.draw(|f| ui(f, &snapshot, paused, info, console))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);

        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Esc => return Ok(ExitStatus::Detach),
                    KeyCode::Char('q') => return Ok(ExitStatus::Quit),
                    KeyCode::Char('p' | ' ') => {
                        // only this thread writes the flag
                        monitor.paused.store(!paused, Ordering::Relaxed);
                    }
                    _ => (),
                }
            }
        }

        if last_tick.elapsed() >= tick_rate {
            last_tick = Instant::now();
        }
    }
}

fn ui(f: &mut Frame, snapshot: &MonitorSnapshot, paused: bool, info: &str, console: &Console) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3),
                Constraint::Percentage(75),
                Constraint::Min(4),
            ]
            .as_ref(),
        )
        .split(f.size());

    let label = Span::styled(
        format!(
            "{:.1}% of {} | blocks {} | dropped {} | {:.1} dBFS | esc detach, q quit",
            snapshot.fill * 100.0,
            snapshot.capacity,
            snapshot.blocks,
            snapshot.dropped_chunks,
            snapshot.last.power_dbfs(),
        ),
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::ITALIC | Modifier::BOLD),
    );

    let gauge_color = if snapshot.fill > 0.9 {
        Color::Red
    } else {
        Color::Green
    };
    let gauge = Gauge::default()
        .block(Block::default().title(" ring fill ").borders(Borders::ALL))
        .gauge_style(Style::default().fg(gauge_color))
        .ratio(snapshot.fill as f64)
        .label(label)
        .use_unicode(true);
    f.render_widget(gauge, chunks[0]);

    let in_phase: Vec<(f64, f64)> = snapshot
        .scope
        .iter()
        .enumerate()
        .map(|(x, (i, _))| (x as f64, *i as f64))
        .collect();
    let quadrature: Vec<(f64, f64)> = snapshot
        .scope
        .iter()
        .enumerate()
        .map(|(x, (_, q))| (x as f64, *q as f64))
        .collect();

    let datasets = vec![
        Dataset::default()
            .name("I")
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Blue))
            .data(&in_phase),
        Dataset::default()
            .name("Q")
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Red))
            .data(&quadrature),
    ];

    let chart = Chart::new(datasets)
        .block(
            Block::default()
                .title(Span::styled(
                    info.to_owned(),
                    Style::default()
                        .fg(Color::Cyan)
                        .add_modifier(Modifier::BOLD),
                ))
                .borders(Borders::NONE),
        )
        .x_axis(
            Axis::default()
                .title("sample")
                .style(Style::default().fg(Color::Gray))
                .labels(vec![
                    Span::raw("0"),
                    Span::styled(
                        SCOPE_LEN.to_string(),
                        Style::default().add_modifier(Modifier::BOLD),
                    ),
                ])
                .bounds([0., SCOPE_LEN as f64]),
        )
        .y_axis(
            Axis::default()
                .title("amplitude")
                .style(Style::default().fg(Color::Gray))
                .labels(vec![
                    Span::styled("-1", Style::default().add_modifier(Modifier::BOLD)),
                    Span::raw("0"),
                    Span::styled("1", Style::default().add_modifier(Modifier::BOLD)),
                ])
                .bounds([-1., 1.]),
        );
    f.render_widget(chart, chunks[1]);

    if paused {
        render_paused(f);
    }

    render_console(f, chunks[2], console);
}

fn render_paused(f: &mut Frame) {
    let area = f.size();
    let (width, height) = (10, 3);
    if area.width < width || area.height < height {
        return;
    }
    let block_rect = Rect {
        x: (area.width - width) / 2,
        y: (area.height - height) / 2,
        width,
        height,
    };

    let block = Block::bordered()
        .border_set(border::DOUBLE)
        .border_style(Style::new().fg(Color::White));
    let mut label_rect = block.inner(block_rect);
    label_rect.x += 1;

    f.render_widget(Clear, block_rect);
    f.render_widget(block, block_rect);
    f.render_widget(
        Span::styled("PAUSED", Style::new().fg(Color::Red).add_modifier(Modifier::BOLD)),
        label_rect,
    );
}

fn render_console(f: &mut Frame<'_>, area: Rect, console: &Console) {
    let items = console
        .lock()
        .lines()
        .map(|line| ListItem::new(line.clone()))
        .collect::<Vec<_>>();

    let list = List::new(items).block(
        Block::bordered()
            .title("console")
            .border_set(border::ROUNDED),
    );
    let mut state = ListState::default().with_selected(Some(list.len()));

    f.render_stateful_widget(list, area, &mut state);
}
