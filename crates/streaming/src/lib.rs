//! Quote and bar distribution for the barsim simulation core.
//!
//! This crate handles:
//! - Subscribing consumers to quotes and bars per symbol and scale
//! - Forming bars from a stream of quotes
//! - Streaming adapters that tie a bar factory to a distributor

pub mod adapter;
pub mod bar_factory;
pub mod distributor;

pub use adapter::StreamingAdapter;
pub use bar_factory::{AbsorbResult, StreamingBarFactory};
pub use distributor::{Distributor, QuoteBarConsumer};
