//! Ledger Types
//!
//! Accounts, positions, trade records and stop-loss rules for the paper
//! trading ledger. All money is carried as `Decimal`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

/// Scale used when a partial sale removes cost from a position.
pub const COST_SCALE: u32 = 8;

/// Error returned when a stored enum value cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Normalize a ticker symbol (trimmed, upper-case).
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

// =============================================================================
// Enums
// =============================================================================

/// Trade side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "buy"),
            TradeSide::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for TradeSide {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            other => Err(ParseEnumError {
                kind: "trade side",
                value: other.to_string(),
            }),
        }
    }
}

/// What caused a trade to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// User-initiated order at the supplied price
    Market,
    /// Sell generated by a triggered stop-loss rule
    StopLoss,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::Market => write!(f, "market"),
            OrderKind::StopLoss => write!(f, "stop_loss"),
        }
    }
}

impl FromStr for OrderKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market" => Ok(OrderKind::Market),
            "stop_loss" => Ok(OrderKind::StopLoss),
            other => Err(ParseEnumError {
                kind: "order kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Stop-loss rule status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLossStatus {
    /// Waiting for the price to reach the trigger
    Active,
    /// Fired and converted into a sell trade
    Triggered,
    /// Cancelled by the account owner
    Cancelled,
    /// Reached its trigger with no shares left to sell
    Expired,
}

impl std::fmt::Display for StopLossStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopLossStatus::Active => write!(f, "active"),
            StopLossStatus::Triggered => write!(f, "triggered"),
            StopLossStatus::Cancelled => write!(f, "cancelled"),
            StopLossStatus::Expired => write!(f, "expired"),
        }
    }
}

impl FromStr for StopLossStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(StopLossStatus::Active),
            "triggered" => Ok(StopLossStatus::Triggered),
            "cancelled" => Ok(StopLossStatus::Cancelled),
            "expired" => Ok(StopLossStatus::Expired),
            other => Err(ParseEnumError {
                kind: "stop-loss status",
                value: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// Account & Position
// =============================================================================

/// A user's virtual trading account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Opaque account ID supplied by the identity layer
    pub id: String,
    /// Capital the account was opened with
    pub starting_balance: Decimal,
    /// Current uninvested cash
    pub cash_balance: Decimal,
    /// When the account was created (ms)
    pub created_at: i64,
}

impl Account {
    /// Open an account with the given starting cash.
    pub fn new(id: String, starting_balance: Decimal) -> Self {
        Self {
            id,
            starting_balance,
            cash_balance: starting_balance,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Shares of one symbol held by an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    /// Shares held, never negative
    pub quantity: i64,
    /// Total cost of the shares still held
    pub cost_basis: Decimal,
    /// First buy that opened this position (ms)
    pub opened_at: i64,
    /// Last trade that touched this position (ms)
    pub updated_at: i64,
}

impl Position {
    /// Weighted average purchase price of the shares held.
    pub fn average_cost(&self) -> Decimal {
        if self.quantity > 0 {
            (self.cost_basis / Decimal::from(self.quantity)).round_dp(COST_SCALE)
        } else {
            Decimal::ZERO
        }
    }

    /// Value of the position at the given price. `None` on overflow.
    pub fn market_value(&self, price: Decimal) -> Option<Decimal> {
        Decimal::from(self.quantity).checked_mul(price)
    }

    /// Gain or loss if the position were sold at the given price.
    pub fn unrealized_pnl(&self, price: Decimal) -> Option<Decimal> {
        self.market_value(price)?.checked_sub(self.cost_basis)
    }

    pub fn is_empty(&self) -> bool {
        self.quantity == 0
    }
}

// =============================================================================
// Trade & Stop-Loss
// =============================================================================

/// Immutable record of an executed buy or sell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    /// Unique trade ID
    pub id: String,
    /// Account this trade belongs to
    pub account_id: String,
    /// Per-account sequence number, starting at 1
    pub seq: u64,
    pub symbol: String,
    pub side: TradeSide,
    pub kind: OrderKind,
    pub quantity: i64,
    /// Execution price per share
    pub price: Decimal,
    /// Change in cash caused by this trade (negative for buys)
    pub cash_delta: Decimal,
    /// Realized gain/loss; zero for buys
    pub realized_pnl: Decimal,
    /// Stop-loss rule that produced this trade
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss_id: Option<String>,
    /// When the trade was executed (ms)
    pub executed_at: i64,
}

impl Trade {
    /// Gross value of the trade (quantity × price).
    pub fn notional(&self) -> Decimal {
        Decimal::from(self.quantity) * self.price
    }
}

/// Standing instruction to sell once the price falls to a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopLossRule {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    /// Sell when the price is at or below this level
    pub trigger_price: Decimal,
    /// Shares to sell, capped at the held quantity when fired
    pub quantity: i64,
    pub status: StopLossStatus,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_trade_id: Option<String>,
}

impl StopLossRule {
    /// Create an active rule.
    pub fn new(account_id: String, symbol: String, trigger_price: Decimal, quantity: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id,
            symbol,
            trigger_price,
            quantity,
            status: StopLossStatus::Active,
            created_at: chrono::Utc::now().timestamp_millis(),
            triggered_at: None,
            triggered_trade_id: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == StopLossStatus::Active
    }

    /// Whether this rule fires at the given price.
    pub fn should_trigger(&self, price: Decimal) -> bool {
        self.is_active() && price <= self.trigger_price
    }
}

// =============================================================================
// Ledger State
// =============================================================================

/// Everything the ledger knows about one account. This is the unit the
/// repository loads and saves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerState {
    pub account: Account,
    /// Open positions keyed by symbol
    pub positions: BTreeMap<String, Position>,
    /// Append-only trade log in execution order
    pub trades: Vec<Trade>,
    pub stop_losses: Vec<StopLossRule>,
}

impl LedgerState {
    /// Fresh state for a newly opened account.
    pub fn new(account: Account) -> Self {
        Self {
            account,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            stop_losses: Vec::new(),
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Shares held of a symbol (0 when no position).
    pub fn held_quantity(&self, symbol: &str) -> i64 {
        self.positions.get(symbol).map(|p| p.quantity).unwrap_or(0)
    }

    /// Sum of cost basis across all open positions.
    pub fn invested(&self) -> Decimal {
        self.positions.values().map(|p| p.cost_basis).sum()
    }

    /// Sum of realized gains and losses in the trade log.
    pub fn realized_pnl(&self) -> Decimal {
        self.trades.iter().map(|t| t.realized_pnl).sum()
    }

    pub fn last_trade(&self) -> Option<&Trade> {
        self.trades.last()
    }

    pub fn active_stop_losses(&self) -> impl Iterator<Item = &StopLossRule> {
        self.stop_losses.iter().filter(|r| r.is_active())
    }
}
