use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};

use autotap_core::logger::LogLine;
use autotap_core::supervisor::SupervisorState;
use autotap_core::types::Command;

use crate::confirm::ConfirmDialog;

/// Lines kept for the log panel.
const LOG_CAPACITY: usize = 2000;

pub struct App {
    pub state: Arc<Mutex<SupervisorState>>,
    pub selected: usize,
    pub log_visible: bool,
    pub log_lines: Vec<LogLine>,
    pub log_scroll: usize, // scroll offset from bottom (0 = latest)
    pub log_rx: mpsc::Receiver<LogLine>,
    pub cmd_tx: mpsc::Sender<Command>,
    pub confirm: Option<ConfirmDialog>,
    pub should_quit: bool,
}

impl App {
    pub fn new(
        state: Arc<Mutex<SupervisorState>>,
        log_rx: mpsc::Receiver<LogLine>,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        let selected = state.lock().unwrap_or_else(PoisonError::into_inner).selected;
        Self {
            state,
            selected,
            log_visible: true,
            log_lines: Vec::new(),
            log_scroll: 0,
            log_rx,
            cmd_tx,
            confirm: None,
            should_quit: false,
        }
    }

    pub fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn drain_logs(&mut self) {
        let mut added = 0;
        while let Ok(line) = self.log_rx.try_recv() {
            self.log_lines.push(line);
            added += 1;
        }
        if self.log_lines.len() > LOG_CAPACITY {
            let excess = self.log_lines.len() - LOG_CAPACITY;
            self.log_lines.drain(..excess);
        }
        // Keep the view anchored when scrolled back
        if self.log_scroll > 0 {
            self.log_scroll += added;
        }
    }

    pub fn scroll_log_up(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_add(n);
    }

    pub fn scroll_log_down(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(n);
    }

    pub fn move_up(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
            self.cmd_tx.send(Command::Select(self.selected)).ok();
        }
    }

    pub fn move_down(&mut self) {
        let len = self.lock_state().entries.len();
        if self.selected + 1 < len {
            self.selected += 1;
            self.cmd_tx.send(Command::Select(self.selected)).ok();
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().engine.is_active()
    }

    pub fn start_stop(&mut self) {
        self.cmd_tx.send(Command::StartStop).ok();
    }

    pub fn pause_resume(&mut self) {
        self.cmd_tx.send(Command::PauseResume).ok();
    }

    pub fn reload(&mut self) {
        self.cmd_tx.send(Command::Reload).ok();
    }

    pub fn toggle_log(&mut self) {
        self.log_visible = !self.log_visible;
    }

    /// Quit right away when idle, otherwise ask first.
    pub fn request_quit(&mut self) {
        if self.is_running() {
            self.confirm = Some(ConfirmDialog::new("A scenario is running. Quit?"));
        } else {
            self.quit();
        }
    }

    /// Close the dialog with `accepted` as the answer.
    pub fn answer_confirm(&mut self, accepted: bool) {
        if self.confirm.take().is_some() && accepted {
            self.quit();
        }
    }

    pub fn quit(&mut self) {
        self.cmd_tx.send(Command::Quit).ok();
        self.should_quit = true;
    }
}
