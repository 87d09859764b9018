//! Trade statistics of a finished run.

use crate::position::ClosedTrade;
use serde::Serialize;

/// Statistics over the closed trades of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TradeStats {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Win rate (0-1).
    pub win_rate: f64,
    pub net_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// Gross wins / gross losses; infinite without losses.
    pub profit_factor: f64,
    /// Largest peak-to-trough drop of cumulative P&L.
    pub max_drawdown: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub max_consecutive_wins: u32,
    pub max_consecutive_losses: u32,
    pub avg_trade_duration_min: f64,
}

impl TradeStats {
    pub fn from_trades(trades: &[ClosedTrade]) -> Self {
        if trades.is_empty() {
            return Self::default();
        }

        let mut stats = Self {
            total_trades: trades.len() as u32,
            ..Self::default()
        };
        let mut gross_wins = 0.0;
        let mut gross_losses = 0.0;
        let mut total_duration = 0i64;
        let mut current_wins = 0u32;
        let mut current_losses = 0u32;
        let mut cumulative = 0.0f64;
        let mut peak = 0.0f64;

        for trade in trades {
            stats.net_pnl += trade.pnl;
            total_duration += trade.exit_ts - trade.entry_ts;

            if trade.pnl > 0.0 {
                stats.winning_trades += 1;
                gross_wins += trade.pnl;
                stats.largest_win = stats.largest_win.max(trade.pnl);
                current_wins += 1;
                current_losses = 0;
                stats.max_consecutive_wins = stats.max_consecutive_wins.max(current_wins);
            } else {
                stats.losing_trades += 1;
                gross_losses += trade.pnl.abs();
                stats.largest_loss = stats.largest_loss.min(trade.pnl);
                current_losses += 1;
                current_wins = 0;
                stats.max_consecutive_losses = stats.max_consecutive_losses.max(current_losses);
            }

            cumulative += trade.pnl;
            peak = peak.max(cumulative);
            stats.max_drawdown = stats.max_drawdown.max(peak - cumulative);
        }

        let n = stats.total_trades as f64;
        stats.win_rate = stats.winning_trades as f64 / n;
        if stats.winning_trades > 0 {
            stats.avg_win = gross_wins / stats.winning_trades as f64;
        }
        if stats.losing_trades > 0 {
            stats.avg_loss = -gross_losses / stats.losing_trades as f64;
        }
        stats.profit_factor = if gross_losses > 0.0 {
            gross_wins / gross_losses
        } else if gross_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        stats.avg_trade_duration_min = total_duration as f64 / n / 60_000.0;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::ExitReason;
    use barsim_core::PositionSide;

    fn make_trade(pnl: f64, duration_ms: i64) -> ClosedTrade {
        ClosedTrade {
            entry_ts: 0,
            exit_ts: duration_ms,
            side: PositionSide::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            size: 1.0,
            pnl,
            exit_reason: ExitReason::Signal,
        }
    }

    #[test]
    fn test_basic_stats() {
        let trades = vec![
            make_trade(100.0, 60_000),
            make_trade(-50.0, 120_000),
            make_trade(75.0, 180_000),
        ];
        let stats = TradeStats::from_trades(&trades);

        assert_eq!(stats.total_trades, 3);
        assert_eq!(stats.winning_trades, 2);
        assert_eq!(stats.losing_trades, 1);
        assert!((stats.win_rate - 2.0 / 3.0).abs() < 1e-10);
        assert!((stats.net_pnl - 125.0).abs() < 1e-10);
        assert!((stats.profit_factor - 3.5).abs() < 1e-10);
        assert!((stats.avg_loss + 50.0).abs() < 1e-10);
        assert!((stats.avg_trade_duration_min - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_empty_trades() {
        let stats = TradeStats::from_trades(&[]);
        assert_eq!(stats, TradeStats::default());
    }

    #[test]
    fn test_drawdown_and_streaks() {
        let trades = vec![
            make_trade(10.0, 1000),
            make_trade(10.0, 1000),
            make_trade(10.0, 1000),
            make_trade(-5.0, 1000),
            make_trade(-20.0, 1000),
            make_trade(8.0, 1000),
        ];
        let stats = TradeStats::from_trades(&trades);

        assert_eq!(stats.max_consecutive_wins, 3);
        assert_eq!(stats.max_consecutive_losses, 2);
        assert!((stats.max_drawdown - 25.0).abs() < 1e-10);
        assert!((stats.largest_loss + 20.0).abs() < 1e-10);
    }

    #[test]
    fn test_no_losses_gives_infinite_profit_factor() {
        let stats = TradeStats::from_trades(&[make_trade(5.0, 1000)]);
        assert!(stats.profit_factor.is_infinite());
    }
}
