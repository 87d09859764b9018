//! Position tracking for simulated runs.
//!
//! Nets fills into one position per executor and records closed trades.

use barsim_core::{Fill, OrderSide, PositionSide, TimestampMs};

/// An open position.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    /// Entry timestamp.
    pub entry_ts: TimestampMs,
    /// Position side.
    pub side: PositionSide,
    /// Average entry price.
    pub entry_price: f64,
    /// Current size.
    pub size: f64,
}

impl Position {
    /// Calculate unrealized P&L at current price.
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) * self.side.sign() * self.size
    }

    /// Order side that reduces this position.
    pub fn exit_side(&self) -> OrderSide {
        self.side.entry_side().opposite()
    }
}

/// Closed trade record.
#[derive(Debug, Clone)]
pub struct ClosedTrade {
    /// Entry timestamp.
    pub entry_ts: TimestampMs,
    /// Exit timestamp.
    pub exit_ts: TimestampMs,
    /// Position side.
    pub side: PositionSide,
    /// Entry price.
    pub entry_price: f64,
    /// Exit price.
    pub exit_price: f64,
    /// Size.
    pub size: f64,
    /// Realized P&L.
    pub pnl: f64,
    /// Exit reason.
    pub exit_reason: ExitReason,
}

/// Reason for exiting a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Strategy asked to close.
    Signal,
    /// Closed as the first leg of a reversal.
    Flip,
    /// Flattened when the run finished.
    BacktestEnded,
}

/// Position tracker for one executor.
#[derive(Debug, Default)]
pub struct PositionTracker {
    /// Current open position.
    pub position: Option<Position>,
    /// Closed trades.
    pub trades: Vec<ClosedTrade>,
    /// Total realized P&L.
    pub total_pnl: f64,
    /// Win count.
    pub wins: u32,
    /// Loss count.
    pub losses: u32,
}

impl PositionTracker {
    /// Create a new position tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if there's an open position.
    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }

    /// Check if position is long.
    pub fn is_long(&self) -> bool {
        self.position.as_ref().is_some_and(|p| p.side == PositionSide::Long)
    }

    /// Check if position is short.
    pub fn is_short(&self) -> bool {
        self.position.as_ref().is_some_and(|p| p.side == PositionSide::Short)
    }

    /// Apply a fill: open, add to, reduce, close or flip the position.
    ///
    /// Returns the trade closed by this fill, if any.
    pub fn apply_fill(&mut self, fill: &Fill, reason: ExitReason) -> Option<ClosedTrade> {
        let fill_side = match fill.side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };

        let Some(position) = self.position.as_mut() else {
            self.open_position(fill.ts_ms, fill_side, fill.price, fill.size);
            return None;
        };

        if position.side == fill_side {
            let total = position.size + fill.size;
            position.entry_price =
                (position.entry_price * position.size + fill.price * fill.size) / total;
            position.size = total;
            return None;
        }

        let closing = fill.size.min(position.size);
        let remainder = fill.size - closing;
        let trade = self.close_position(fill.ts_ms, fill.price, closing, reason);
        if remainder > 1e-10 {
            self.open_position(fill.ts_ms, fill_side, fill.price, remainder);
        }
        trade
    }

    /// Open a new position.
    pub fn open_position(&mut self, ts_ms: TimestampMs, side: PositionSide, price: f64, size: f64) {
        self.position = Some(Position {
            entry_ts: ts_ms,
            side,
            entry_price: price,
            size,
        });
    }

    /// Close position (full or partial).
    pub fn close_position(
        &mut self,
        ts_ms: TimestampMs,
        exit_price: f64,
        size: f64,
        reason: ExitReason,
    ) -> Option<ClosedTrade> {
        let position = self.position.as_mut()?;

        let pnl = (exit_price - position.entry_price) * position.side.sign() * size;

        let trade = ClosedTrade {
            entry_ts: position.entry_ts,
            exit_ts: ts_ms,
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size,
            pnl,
            exit_reason: reason,
        };

        self.total_pnl += pnl;
        if pnl > 0.0 {
            self.wins += 1;
        } else {
            self.losses += 1;
        }

        self.trades.push(trade.clone());

        // Update position size
        position.size -= size;

        // If fully closed, remove position
        if position.size <= 1e-10 {
            self.position = None;
        }

        Some(trade)
    }

    /// Get win rate.
    pub fn win_rate(&self) -> f64 {
        let total = self.wins + self.losses;
        if total > 0 {
            f64::from(self.wins) / f64::from(total)
        } else {
            0.0
        }
    }
}
