//! Logs window-title changes of the shared terminal.
//!
//! Attached to the session like any other viewer, it runs the output
//! through a [`TitleScanner`] and logs each new title. Best-effort: it
//! never fails delivery.

use super::multiplexer::{Viewer, ViewerError};
use kastty_core::{display_title, TitleScanner};
use std::sync::Mutex;
use tracing::info;

#[derive(Default)]
pub struct TitleWatcher {
    inner: Mutex<WatchState>,
}

#[derive(Default)]
struct WatchState {
    scanner: TitleScanner,
    current: Option<String>,
}

impl TitleWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Title most recently set by the terminal.
    pub fn current(&self) -> Option<String> {
        self.lock().current.clone()
    }

    /// Forget partial sequences and the last title; call on (re)attach.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.scanner.reset();
        state.current = None;
    }

    /// Feed replayed history without logging it as a change.
    pub fn prime(&self, replay: &[u8]) {
        let mut state = self.lock();
        if let Some(title) = state.scanner.feed(replay).pop() {
            state.current = Some(title);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WatchState> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Viewer for TitleWatcher {
    fn send(&self, data: &[u8]) -> Result<(), ViewerError> {
        let mut state = self.lock();
        for title in state.scanner.feed(data) {
            if state.current.as_deref() != Some(title.as_str()) {
                info!(title = display_title(Some(title.as_str())), "terminal title changed");
                state.current = Some(title);
            }
        }
        Ok(())
    }
}
