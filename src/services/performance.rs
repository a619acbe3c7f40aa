//! Trading performance statistics.
//!
//! Everything here is derived from the trade log and stop-loss rules; no
//! counters are stored alongside the ledger.

use crate::types::{LedgerState, OrderKind, PerformanceReport, StopLossRule, Trade, TradeSide};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, BTreeSet};

/// Trades required before a grade is given.
const MIN_GRADED_TRADES: u64 = 10;

/// Report for a whole ledger.
pub fn analyze(state: &LedgerState) -> PerformanceReport {
    compute(&state.account.id, &state.trades, &state.stop_losses)
}

/// Report for an account from its trades and stop-loss rules.
pub fn compute(account_id: &str, trades: &[Trade], rules: &[StopLossRule]) -> PerformanceReport {
    let buys: Vec<&Trade> = trades.iter().filter(|t| t.side == TradeSide::Buy).collect();
    let sells: Vec<&Trade> = trades.iter().filter(|t| t.side == TradeSide::Sell).collect();

    let wins: Vec<Decimal> = sells
        .iter()
        .map(|t| t.realized_pnl)
        .filter(|pnl| *pnl > Decimal::ZERO)
        .collect();
    // A break-even sell counts as a loss.
    let losses: Vec<Decimal> = sells
        .iter()
        .map(|t| t.realized_pnl)
        .filter(|pnl| *pnl <= Decimal::ZERO)
        .collect();

    let gross_profit: Decimal = wins.iter().sum();
    let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();

    let win_rate = ratio_pct(wins.len(), sells.len());
    let profit_factor = if gross_loss > Decimal::ZERO {
        Some((gross_profit / gross_loss).round_dp(2))
    } else {
        None
    };

    let bought: BTreeSet<&str> = buys.iter().map(|t| t.symbol.as_str()).collect();
    let protected: BTreeSet<&str> = rules.iter().map(|r| r.symbol.as_str()).collect();
    let stop_loss_usage_rate = ratio_pct(bought.intersection(&protected).count(), bought.len());

    let total_trades = trades.len() as u64;
    let grade = if total_trades < MIN_GRADED_TRADES {
        "N/A".to_string()
    } else {
        grade_for(win_rate, profit_factor, gross_profit, stop_loss_usage_rate).to_string()
    };

    PerformanceReport {
        account_id: account_id.to_string(),
        total_trades,
        buy_trades: buys.len() as u64,
        sell_trades: sells.len() as u64,
        stop_loss_exits: sells.iter().filter(|t| t.kind == OrderKind::StopLoss).count() as u64,
        winning_trades: wins.len() as u64,
        losing_trades: losses.len() as u64,
        win_rate,
        gross_profit,
        gross_loss,
        average_win: average(gross_profit, wins.len()),
        average_loss: average(gross_loss, losses.len()),
        profit_factor,
        best_trade: sells.iter().map(|t| t.realized_pnl).max().unwrap_or(Decimal::ZERO),
        worst_trade: sells.iter().map(|t| t.realized_pnl).min().unwrap_or(Decimal::ZERO),
        total_realized_pnl: sells.iter().map(|t| t.realized_pnl).sum(),
        largest_position_cost: buys.iter().map(|t| t.notional()).max().unwrap_or(Decimal::ZERO),
        most_traded_symbol: most_traded(trades),
        stop_loss_usage_rate,
        last_trade_at: trades.iter().map(|t| t.executed_at).max(),
        grade,
    }
}

fn ratio_pct(part: usize, whole: usize) -> Decimal {
    if whole == 0 {
        return Decimal::ZERO;
    }
    (Decimal::from(part as u64) / Decimal::from(whole as u64) * dec!(100)).round_dp(2)
}

fn average(total: Decimal, count: usize) -> Decimal {
    if count == 0 {
        return Decimal::ZERO;
    }
    (total / Decimal::from(count as u64)).round_dp(2)
}

/// Symbol with the most trades; ties go to the alphabetically first.
fn most_traded(trades: &[Trade]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for trade in trades {
        *counts.entry(trade.symbol.as_str()).or_default() += 1;
    }

    let mut best: Option<(&str, usize)> = None;
    for (symbol, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((symbol, count));
        }
    }
    best.map(|(symbol, _)| symbol.to_string())
}

/// Score out of 100: win rate 40, profit factor 30, stop-loss usage 30.
fn grade_for(
    win_rate: Decimal,
    profit_factor: Option<Decimal>,
    gross_profit: Decimal,
    stop_loss_usage_rate: Decimal,
) -> &'static str {
    let win_points = if win_rate >= dec!(60) {
        40
    } else if win_rate >= dec!(50) {
        30
    } else if win_rate >= dec!(40) {
        20
    } else {
        10
    };

    let factor_points = match profit_factor {
        Some(pf) if pf >= dec!(2.0) => 30,
        Some(pf) if pf >= dec!(1.5) => 25,
        Some(pf) if pf >= dec!(1.0) => 15,
        Some(_) => 5,
        // Nothing lost: only profitable histories score.
        None if gross_profit > Decimal::ZERO => 30,
        None => 5,
    };

    let usage_points = if stop_loss_usage_rate >= dec!(80) {
        30
    } else if stop_loss_usage_rate >= dec!(60) {
        20
    } else if stop_loss_usage_rate >= dec!(40) {
        10
    } else {
        0
    };

    match win_points + factor_points + usage_points {
        s if s >= 90 => "A+",
        s if s >= 85 => "A",
        s if s >= 80 => "B+",
        s if s >= 75 => "B",
        s if s >= 70 => "C+",
        s if s >= 65 => "C",
        s if s >= 60 => "D",
        _ => "F",
    }
}
