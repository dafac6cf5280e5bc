use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{mpsc, Mutex, OnceLock, PoisonError};

use chrono::Local;

static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

struct Logger {
    file: File,
    tui_tx: Option<mpsc::Sender<LogLine>>,
    prefixes: HashMap<String, u8>, // prefix -> color index
}

// Color indices for TUI rendering (mapped in ui.rs)
pub const COLOR_GRAY: u8 = 1;
pub const COLOR_BLUE: u8 = 2;
pub const COLOR_GREEN: u8 = 3;
pub const COLOR_MAGENTA: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// One log record as the TUI receives it.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: Level,
    pub prefix: String,
    pub color: u8,
    pub timestamp: String,
    pub message: String,
}

impl LogLine {
    /// Plain-text rendering used for the log file.
    pub fn to_file_line(&self) -> String {
        if self.prefix.is_empty() {
            format!("[{}] [{}] {}", self.timestamp, self.level.as_str(), self.message)
        } else {
            format!("[{}] [{}] [{}] {}", self.timestamp, self.level.as_str(), self.prefix, self.message)
        }
    }
}

/// Initialize the global logger. Clears the log file.
///
/// Logging calls made before `init` are dropped.
pub fn init(log_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_dir.join("app.log"))?;

    LOGGER
        .set(Mutex::new(Logger { file, tui_tx: None, prefixes: HashMap::new() }))
        .ok();
    Ok(())
}

/// Wire the TUI log channel.
pub fn set_tui_sender(tx: mpsc::Sender<LogLine>) {
    if let Some(logger) = LOGGER.get() {
        logger.lock().unwrap_or_else(PoisonError::into_inner).tui_tx = Some(tx);
    }
}

/// Register a prefix with a color used by the `*_p` calls.
pub fn register_prefix(prefix: &str, color: u8) {
    if let Some(logger) = LOGGER.get() {
        logger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .prefixes
            .insert(prefix.to_string(), color);
    }
}

fn write_log(level: Level, prefix: &str, msg: &str) {
    let Some(logger) = LOGGER.get() else { return };
    let mut l = logger.lock().unwrap_or_else(PoisonError::into_inner);

    let line = LogLine {
        level,
        prefix: prefix.to_string(),
        color: l.prefixes.get(prefix).copied().unwrap_or(0),
        timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        message: msg.to_string(),
    };

    writeln!(l.file, "{}", line.to_file_line()).ok();
    if let Some(tx) = &l.tui_tx {
        // Receiver gone means the TUI has shut down.
        if tx.send(line).is_err() {
            l.tui_tx = None;
        }
    }
}

pub fn debug(msg: &str) {
    write_log(Level::Debug, "", msg);
}

pub fn info(msg: &str) {
    write_log(Level::Info, "", msg);
}

pub fn warn(msg: &str) {
    write_log(Level::Warn, "", msg);
}

pub fn error(msg: &str) {
    write_log(Level::Error, "", msg);
}

pub fn debug_p(prefix: &str, msg: &str) {
    write_log(Level::Debug, prefix, msg);
}

/// Log with a registered prefix. Unregistered prefixes render uncolored.
pub fn info_p(prefix: &str, msg: &str) {
    write_log(Level::Info, prefix, msg);
}

pub fn warn_p(prefix: &str, msg: &str) {
    write_log(Level::Warn, prefix, msg);
}

pub fn error_p(prefix: &str, msg: &str) {
    write_log(Level::Error, prefix, msg);
}
