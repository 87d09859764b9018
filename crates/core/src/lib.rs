//! Core types and configuration for the barsim simulation core.
//!
//! This crate provides shared types used across all other crates:
//! - Market data types (bars, series, synthetic quotes)
//! - Orders, fills and positions
//! - Configuration structures
//! - Common error types and structured error reporting
//! - Binary gates for cross-thread run control

pub mod config;
pub mod error;
pub mod gate;
pub mod report;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use gate::Gate;
pub use report::{CollectingReporter, ErrorReporter, Invariants, Report, Severity, TracingReporter};
pub use types::*;
