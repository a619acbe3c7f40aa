//! Portfolio Types
//!
//! Derived views of a ledger: valuation at market prices, stop-loss trigger
//! distances, and trading performance statistics.

use super::ledger::StopLossRule;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One open position valued at a market price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub symbol: String,
    pub quantity: i64,
    pub average_cost: Decimal,
    pub cost_basis: Decimal,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
    /// Unrealized gain relative to cost basis, in percent
    pub unrealized_pnl_pct: Decimal,
}

/// Account valuation at market prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioValuation {
    pub account_id: String,
    pub cash_balance: Decimal,
    /// Cost basis of all open positions
    pub invested: Decimal,
    /// Market value of all open positions
    pub market_value: Decimal,
    /// Cash plus market value
    pub total_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    /// Change in total value against the starting balance, in percent
    pub total_return_pct: Decimal,
    pub holdings: Vec<Holding>,
}

/// An active stop-loss rule with its distance from the current price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopLossView {
    #[serde(flatten)]
    pub rule: StopLossRule,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_price: Option<Decimal>,
    /// Current price minus trigger price
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_distance: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_distance_pct: Option<Decimal>,
    /// Price is within 5% above the trigger
    pub near_trigger: bool,
}

/// Trading statistics derived from an account's trade history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub account_id: String,
    pub total_trades: u64,
    pub buy_trades: u64,
    pub sell_trades: u64,
    /// Sells generated by stop-loss rules
    pub stop_loss_exits: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    /// Winning sells as a percentage of all sells
    pub win_rate: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub average_win: Decimal,
    pub average_loss: Decimal,
    /// Gross profit divided by gross loss; absent when nothing was lost
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit_factor: Option<Decimal>,
    pub best_trade: Decimal,
    pub worst_trade: Decimal,
    pub total_realized_pnl: Decimal,
    /// Largest single buy by notional value
    pub largest_position_cost: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub most_traded_symbol: Option<String>,
    /// Percentage of bought symbols that ever carried a stop-loss rule
    pub stop_loss_usage_rate: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade_at: Option<i64>,
    /// Letter grade, or "N/A" with fewer than ten trades
    pub grade: String,
}
