use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use anyhow::{Context, Result};
use crossterm::{
    execute,
    event::{EnableMouseCapture, DisableMouseCapture},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{Terminal, backend::CrosstermBackend};

use autotap_core::{loader, logger, settings::Settings};
use autotap_core::platform::{create_platform, PlatformOptions};
use autotap_core::supervisor::{Supervisor, SupervisorPaths, SupervisorState};
use autotap_core::types::Command;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let force_stub = args.iter().any(|a| a == "--stub");
    // --frame <png>: replay a still image through the stub frame source
    let stub_frame = args
        .iter()
        .position(|a| a == "--frame")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let paths = SupervisorPaths {
        scenarios: cwd.join("scenarios"),
        logs: cwd.join("logs"),
        settings: cwd.join("settings.json"),
    };

    logger::init(&paths.logs).with_context(|| format!("creating {}", paths.logs.display()))?;
    logger::register_prefix("engine", logger::COLOR_GREEN);
    logger::register_prefix("exec", logger::COLOR_MAGENTA);
    logger::register_prefix("loader", logger::COLOR_GRAY);
    logger::register_prefix("bitmaps", logger::COLOR_GRAY);

    let settings = Settings::load(&paths.settings);
    let entries = loader::load_scenarios(&paths.scenarios);
    logger::info(&format!("loaded {} scenario(s) from {}", entries.len(), paths.scenarios.display()));

    let state = Arc::new(Mutex::new(SupervisorState::new(entries, settings.last_scenario.as_deref())));

    // Channels
    let (log_tx, log_rx) = mpsc::channel();
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
    logger::set_tui_sender(log_tx);
    logger::info("autotap started");

    let options = PlatformOptions {
        force_stub: force_stub || stub_frame.is_some(),
        stub_frame,
        window_pattern: settings.window_pattern.clone(),
    };
    let supervisor = Supervisor::new(
        Arc::clone(&state),
        settings,
        paths,
        Box::new(move || create_platform(&options)),
    );
    let supervisor_thread = thread::Builder::new()
        .name("autotap-supervisor".into())
        .spawn(move || supervisor.supervise(cmd_rx))?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = autotap_tui::App::new(Arc::clone(&state), log_rx, cmd_tx.clone());
    let result = autotap_tui::event::run(&mut terminal, &mut app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    // Let the supervisor stop a running scenario before exiting.
    cmd_tx.send(Command::Quit).ok();
    supervisor_thread.join().ok();

    result
}
