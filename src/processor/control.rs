//! Pause, resume and stop control for a running processor.
//!
//! A [`ProcessorControl`] is shared between the processing loop and whoever
//! drives it (signal handlers, a UI, tests). Requests are plain atomic flags;
//! the loop observes them between units, and a paused loop sleeps on a
//! [`Notify`] until it is resumed or stopped.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Shared handle to a processor control.
pub type SharedControl = Arc<ProcessorControl>;

/// State of the processing loop as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// Not running
    Idle = 0,
    /// Processing units
    Running = 1,
    /// Waiting at the pause gate
    Paused = 2,
    /// Finished every unit
    Completed = 3,
    /// Stopped by a fatal error
    Failed = 4,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopState::Running,
            2 => LoopState::Paused,
            3 => LoopState::Completed,
            4 => LoopState::Failed,
            _ => LoopState::Idle,
        }
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Running => "running",
            LoopState::Paused => "paused",
            LoopState::Completed => "completed",
            LoopState::Failed => "failed",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative control surface of a processing loop.
#[derive(Debug)]
pub struct ProcessorControl {
    pause_requested: AtomicBool,
    stop_requested: AtomicBool,
    state: AtomicU8,
    notify: Notify,
}

impl Default for ProcessorControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorControl {
    /// Create a new control.
    pub fn new() -> Self {
        Self {
            pause_requested: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            state: AtomicU8::new(LoopState::Idle as u8),
            notify: Notify::new(),
        }
    }

    /// Create a new shared control wrapped in [`Arc`].
    pub fn shared() -> SharedControl {
        Arc::new(Self::new())
    }

    /// Ask the loop to pause before its next unit. The unit in flight finishes.
    pub fn request_pause(&self) {
        if !self.pause_requested.swap(true, Ordering::SeqCst) {
            debug!("Pause requested");
        }
    }

    /// Release a paused loop.
    pub fn request_resume(&self) {
        if self.pause_requested.swap(false, Ordering::SeqCst) {
            debug!("Resume requested");
        }
        self.notify.notify_waiters();
    }

    /// Ask the loop to stop at the next unit boundary, even while paused.
    pub fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            debug!("Stop requested");
        }
        self.notify.notify_waiters();
    }

    /// Alias for [`request_pause`](Self::request_pause).
    pub fn pause(&self) {
        self.request_pause();
    }

    /// Alias for [`request_resume`](Self::request_resume).
    pub fn resume(&self) {
        self.request_resume();
    }

    /// Alias for [`request_stop`](Self::request_stop).
    pub fn stop(&self) {
        self.request_stop();
    }

    /// Whether a pause is requested.
    pub fn is_paused(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    /// Whether a stop is requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Current loop state.
    pub fn loop_state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_loop_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Clear pending requests and return to [`LoopState::Idle`].
    pub fn reset(&self) {
        self.clear_requests();
        self.set_loop_state(LoopState::Idle);
    }

    /// Drop pause and stop requests that arrived too late to affect a run.
    pub(crate) fn clear_requests(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
    }

    /// Wait while a pause is requested.
    ///
    /// Returns `true` once resumed, `false` if a stop was requested.
    pub async fn wait_while_paused(&self) -> bool {
        loop {
            // Registered before the flag checks so a concurrent resume is not lost.
            let notified = self.notify.notified();
            if self.is_stop_requested() {
                return false;
            }
            if !self.is_paused() {
                return true;
            }
            notified.await;
        }
    }
}
