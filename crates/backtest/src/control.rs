//! Run control shared between the driver thread and its callers.
//!
//! Three gates drive the run state: `running`, `abort_requested` and
//! `aborted`. The driver loop only polls `abort_requested`; `abort()` callers
//! block on `aborted`.

use barsim_core::{ErrorReporter, Gate};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationRunState {
    Idle,
    Running,
    AbortRequested,
    Aborted,
}

/// Result of an `abort()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortOutcome {
    /// Nothing was running.
    NotRunning,
    /// The driver confirmed the abort.
    Aborted { reason: String },
    /// No confirmation within the timeout; the request stays open.
    TimedOut { reason: String, timeout_ms: u64 },
    /// The bar loop had already ended on its own; the run completes normally.
    Completed { reason: String },
}

impl AbortOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, AbortOutcome::Aborted { .. })
    }
}

impl fmt::Display for AbortOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortOutcome::NotRunning => f.write_str("not running, nothing to abort"),
            AbortOutcome::Aborted { reason } => write!(f, "aborted by user: {reason}"),
            AbortOutcome::TimedOut { reason, timeout_ms } => write!(
                f,
                "abort requested ({reason}), \
                 timed out waiting for confirmation after {timeout_ms}ms"
            ),
            AbortOutcome::Completed { reason } => {
                write!(f, "abort ({reason}) came after the last bar, run completes normally")
            }
        }
    }
}

/// Gates, fault counter and abort bookkeeping of one driver.
pub struct RunControl {
    pub running: Gate,
    pub abort_requested: Gate,
    pub aborted: Gate,
    aborted_by_user: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    exceptions: AtomicUsize,
    exceptions_limit: usize,
    /// Nested livesim runs never abort themselves.
    auto_abort: bool,
    reporter: Arc<dyn ErrorReporter>,
}

impl RunControl {
    pub fn new(
        exceptions_limit: usize,
        auto_abort: bool,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            running: Gate::new(false),
            abort_requested: Gate::new(false),
            aborted: Gate::new(false),
            aborted_by_user: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            exceptions: AtomicUsize::new(0),
            exceptions_limit,
            auto_abort,
            reporter,
        }
    }

    pub fn state(&self) -> SimulationRunState {
        if self.aborted.is_open() {
            SimulationRunState::Aborted
        } else if !self.running.is_open() {
            SimulationRunState::Idle
        } else if self.abort_requested.is_open() {
            SimulationRunState::AbortRequested
        } else {
            SimulationRunState::Running
        }
    }

    /// Reset for a new run and open `running`.
    pub fn begin(&self) {
        self.exceptions.store(0, Ordering::SeqCst);
        self.aborted_by_user.store(false, Ordering::SeqCst);
        *self.abort_reason.lock() = None;
        self.abort_requested.close();
        self.aborted.close();
        self.running.open();
    }

    /// Non-blocking abort request. Safe to call from the driver thread.
    pub fn request_abort(&self, reason: &str) {
        {
            let mut stored = self.abort_reason.lock();
            if stored.is_none() {
                *stored = Some(reason.to_string());
            }
        }
        tracing::info!(reason, "abort requested");
        self.abort_requested.open();
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().clone()
    }

    /// The loop saw the request and stopped.
    pub fn mark_aborted_by_user(&self) {
        self.aborted_by_user.store(true, Ordering::SeqCst);
    }

    pub fn aborted_by_user(&self) -> bool {
        self.aborted_by_user.load(Ordering::SeqCst)
    }

    pub fn exceptions(&self) -> usize {
        self.exceptions.load(Ordering::SeqCst)
    }

    /// Count a recoverable fault. Reaching the limit requests an abort.
    pub fn record_fault(&self, context: &str, error: &anyhow::Error) {
        let count = self.exceptions.fetch_add(1, Ordering::SeqCst) + 1;
        let cause: &(dyn std::error::Error + 'static) = error.as_ref();
        let message = format!("{context} (exception {count}/{})", self.exceptions_limit);
        self.reporter.error(&message, Some(cause));

        if self.auto_abort && self.exceptions_limit > 0 && count == self.exceptions_limit {
            self.request_abort(&format!("exceptions limit [{}] reached", self.exceptions_limit));
        }
    }
}

impl fmt::Debug for RunControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunControl")
            .field("state", &self.state())
            .field("exceptions", &self.exceptions())
            .finish()
    }
}
