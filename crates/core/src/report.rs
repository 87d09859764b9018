//! Structured error reporting and invariant checks.
//!
//! Components receive an [`ErrorReporter`] at construction and send every
//! recoverable fault and diagnostic through it. [`Invariants`] wraps a
//! reporter and decides at runtime whether a failed check is fatal.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// How serious a report is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One collected report.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub severity: Severity,
    pub message: String,
    /// Rendered cause chain, if any.
    pub cause: Option<String>,
}

/// Sink for faults and diagnostics.
pub trait ErrorReporter: Send + Sync {
    fn report(
        &self,
        severity: Severity,
        message: &str,
        cause: Option<&(dyn std::error::Error + 'static)>,
    );

    fn info(&self, message: &str) {
        self.report(Severity::Info, message, None);
    }

    fn warning(&self, message: &str) {
        self.report(Severity::Warning, message, None);
    }

    fn error(&self, message: &str, cause: Option<&(dyn std::error::Error + 'static)>) {
        self.report(Severity::Error, message, cause);
    }
}

fn render_cause(cause: Option<&(dyn std::error::Error + 'static)>) -> Option<String> {
    let mut current = cause?;
    let mut rendered = current.to_string();
    while let Some(next) = current.source() {
        rendered.push_str(": ");
        rendered.push_str(&next.to_string());
        current = next;
    }
    Some(rendered)
}

fn log_report(severity: Severity, message: &str, cause: Option<&str>) {
    match severity {
        Severity::Info => tracing::info!(cause, "{message}"),
        Severity::Warning => tracing::warn!(cause, "{message}"),
        Severity::Error => tracing::error!(cause, "{message}"),
    }
}

/// Forwards every report to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(
        &self,
        severity: Severity,
        message: &str,
        cause: Option<&(dyn std::error::Error + 'static)>,
    ) {
        let cause = render_cause(cause);
        log_report(severity, message, cause.as_deref());
    }
}

/// Keeps every report for later inspection and also logs it.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    reports: Mutex<Vec<Report>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.reports.lock().iter().filter(|r| r.severity == severity).count()
    }

    /// True if any report message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.reports.lock().iter().any(|r| r.message.contains(needle))
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(
        &self,
        severity: Severity,
        message: &str,
        cause: Option<&(dyn std::error::Error + 'static)>,
    ) {
        let cause = render_cause(cause);
        log_report(severity, message, cause.as_deref());
        self.reports.lock().push(Report {
            severity,
            message: message.to_string(),
            cause,
        });
    }
}

/// Runtime-selected strict or lenient invariant checks.
#[derive(Clone)]
pub struct Invariants {
    strict: bool,
    reporter: Arc<dyn ErrorReporter>,
}

impl Invariants {
    pub fn new(strict: bool, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self { strict, reporter }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Strict mode: a failed check is an `Error::Invariant`.
    /// Lenient mode: it is reported as a warning and `Ok(())` is returned.
    pub fn check(&self, condition: bool, message: impl FnOnce() -> String) -> Result<()> {
        if condition {
            return Ok(());
        }
        let message = message();
        if self.strict {
            self.reporter.report(Severity::Error, &message, None);
            return Err(Error::invariant(message));
        }
        self.reporter.report(Severity::Warning, &message, None);
        Ok(())
    }
}

impl fmt::Debug for Invariants {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invariants").field("strict", &self.strict).finish()
    }
}
