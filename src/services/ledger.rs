//! Ledger Service
//!
//! The only component allowed to change an account's cash and positions.
//! Every change is derived from, and recorded as, a [`Trade`]:
//! - Buys and sells against a virtual cash balance
//! - Weighted-average cost basis and realized gain/loss
//! - One-shot stop-loss rules evaluated against injected prices
//! - Portfolio valuation, trade history and performance reports
//!
//! Each account has a single writer. Mutations run on a copy of the cached
//! state, are committed through the [`LedgerRepository`], and only then
//! replace the cached state, so a failed commit changes nothing.

use crate::services::performance;
use crate::services::repository::{LedgerRepository, StoreError};
use crate::types::{
    normalize_symbol, Account, Holding, LedgerState, OrderKind, PerformanceReport,
    PortfolioValuation, Position, StopLossRule, StopLossStatus, StopLossView, Trade, TradeSide,
    COST_SCALE,
};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A price within 5% above a trigger counts as near it.
const NEAR_TRIGGER_BAND: Decimal = dec!(1.05);

/// Ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("Insufficient shares of {symbol}: requested {requested}, held {held}")]
    InsufficientShares {
        symbol: String,
        requested: i64,
        held: i64,
    },

    #[error("Quantity must be positive, got {0}")]
    InvalidQuantity(i64),

    #[error("Price must be positive, got {0}")]
    InvalidPrice(Decimal),

    #[error("Amount must not be negative, got {0}")]
    InvalidAmount(Decimal),

    #[error("Invalid symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("Stop price {trigger} must be below the execution price {price}")]
    InvalidTrigger { trigger: Decimal, price: Decimal },

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Account already exists: {0}")]
    AccountExists(String),

    #[error("Stop-loss rule not found: {0}")]
    StopLossNotFound(String),

    #[error("Stop-loss rule {id} is not active: status is {status}")]
    StopLossInactive { id: String, status: StopLossStatus },

    #[error("No price data available for {0}")]
    NoPriceData(String),

    #[error("Arithmetic overflow")]
    ArithmeticOverflow,

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        LedgerError::PersistenceFailure(e.to_string())
    }
}

// =============================================================================
// Ledger transitions
// =============================================================================

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn validate_symbol(symbol: &str) -> Result<String, LedgerError> {
    let normalized = normalize_symbol(symbol);
    if normalized.is_empty() {
        return Err(LedgerError::InvalidSymbol(symbol.to_string()));
    }
    Ok(normalized)
}

fn validate_quantity(quantity: i64) -> Result<(), LedgerError> {
    if quantity <= 0 {
        return Err(LedgerError::InvalidQuantity(quantity));
    }
    Ok(())
}

fn validate_price(price: Decimal) -> Result<(), LedgerError> {
    if price <= Decimal::ZERO {
        return Err(LedgerError::InvalidPrice(price));
    }
    Ok(())
}

fn notional(quantity: i64, price: Decimal) -> Result<Decimal, LedgerError> {
    Decimal::from(quantity)
        .checked_mul(price)
        .ok_or(LedgerError::ArithmeticOverflow)
}

/// Debit cash and add shares. Returns the cash delta.
fn book_buy(
    state: &mut LedgerState,
    symbol: &str,
    quantity: i64,
    price: Decimal,
    now: i64,
) -> Result<Decimal, LedgerError> {
    let cost = notional(quantity, price)?;
    let available = state.account.cash_balance;
    if cost > available {
        return Err(LedgerError::InsufficientFunds {
            needed: cost,
            available,
        });
    }

    let (new_quantity, new_cost_basis) = match state.positions.get(symbol) {
        Some(position) => (
            position
                .quantity
                .checked_add(quantity)
                .ok_or(LedgerError::ArithmeticOverflow)?,
            position
                .cost_basis
                .checked_add(cost)
                .ok_or(LedgerError::ArithmeticOverflow)?,
        ),
        None => (quantity, cost),
    };

    state.account.cash_balance = available - cost;
    let position = state
        .positions
        .entry(symbol.to_string())
        .or_insert_with(|| Position {
            symbol: symbol.to_string(),
            quantity: 0,
            cost_basis: Decimal::ZERO,
            opened_at: now,
            updated_at: now,
        });
    position.quantity = new_quantity;
    position.cost_basis = new_cost_basis;
    position.updated_at = now;

    Ok(-cost)
}

/// Credit cash and remove shares at average cost. Returns the cash delta and
/// the realized gain/loss.
fn book_sell(
    state: &mut LedgerState,
    symbol: &str,
    quantity: i64,
    price: Decimal,
    now: i64,
) -> Result<(Decimal, Decimal), LedgerError> {
    let held = state.held_quantity(symbol);
    if quantity > held {
        return Err(LedgerError::InsufficientShares {
            symbol: symbol.to_string(),
            requested: quantity,
            held,
        });
    }

    let proceeds = notional(quantity, price)?;
    let new_cash = state
        .account
        .cash_balance
        .checked_add(proceeds)
        .ok_or(LedgerError::ArithmeticOverflow)?;

    let position = state
        .positions
        .get_mut(symbol)
        .ok_or_else(|| LedgerError::InsufficientShares {
            symbol: symbol.to_string(),
            requested: quantity,
            held: 0,
        })?;

    // The removed cost is rounded once and the realized gain is defined
    // against it, keeping cash + cost basis - realized exact.
    let removed_cost = if quantity == position.quantity {
        position.cost_basis
    } else {
        position
            .cost_basis
            .checked_mul(Decimal::from(quantity))
            .and_then(|c| c.checked_div(Decimal::from(position.quantity)))
            .ok_or(LedgerError::ArithmeticOverflow)?
            .round_dp(COST_SCALE)
    };
    let realized = proceeds - removed_cost;

    state.account.cash_balance = new_cash;
    position.quantity -= quantity;
    position.cost_basis -= removed_cost;
    position.updated_at = now;
    if position.is_empty() {
        state.positions.remove(symbol);
    }

    Ok((proceeds, realized))
}

#[allow(clippy::too_many_arguments)]
fn record_trade(
    state: &mut LedgerState,
    symbol: &str,
    side: TradeSide,
    kind: OrderKind,
    quantity: i64,
    price: Decimal,
    cash_delta: Decimal,
    realized_pnl: Decimal,
    stop_loss_id: Option<String>,
    now: i64,
) -> Trade {
    let (seq, executed_at) = match state.last_trade() {
        Some(last) => (last.seq + 1, now.max(last.executed_at)),
        None => (1, now),
    };

    let trade = Trade {
        id: uuid::Uuid::new_v4().to_string(),
        account_id: state.account.id.clone(),
        seq,
        symbol: symbol.to_string(),
        side,
        kind,
        quantity,
        price,
        cash_delta,
        realized_pnl,
        stop_loss_id,
        executed_at,
    };
    state.trades.push(trade.clone());
    trade
}

/// Buy `quantity` shares at `price`, appending the trade to the state.
///
/// Leaves the state untouched on error.
pub fn apply_buy(
    state: &mut LedgerState,
    symbol: &str,
    quantity: i64,
    price: Decimal,
    now: i64,
) -> Result<Trade, LedgerError> {
    let symbol = validate_symbol(symbol)?;
    validate_quantity(quantity)?;
    validate_price(price)?;

    let cash_delta = book_buy(state, &symbol, quantity, price, now)?;
    Ok(record_trade(
        state,
        &symbol,
        TradeSide::Buy,
        OrderKind::Market,
        quantity,
        price,
        cash_delta,
        Decimal::ZERO,
        None,
        now,
    ))
}

/// Sell `quantity` shares at `price`, appending the trade to the state.
///
/// Leaves the state untouched on error.
pub fn apply_sell(
    state: &mut LedgerState,
    symbol: &str,
    quantity: i64,
    price: Decimal,
    kind: OrderKind,
    stop_loss_id: Option<String>,
    now: i64,
) -> Result<Trade, LedgerError> {
    let symbol = validate_symbol(symbol)?;
    validate_quantity(quantity)?;
    validate_price(price)?;

    let (cash_delta, realized) = book_sell(state, &symbol, quantity, price, now)?;
    Ok(record_trade(
        state,
        &symbol,
        TradeSide::Sell,
        kind,
        quantity,
        price,
        cash_delta,
        realized,
        stop_loss_id,
        now,
    ))
}

/// Fire every active rule on `symbol` whose trigger is at or above `price`.
///
/// Rules fire in creation order; each sells at most what is still held.
/// A rule with nothing left to sell expires without a trade.
pub fn fire_stop_losses(
    state: &mut LedgerState,
    symbol: &str,
    price: Decimal,
    now: i64,
) -> Result<Vec<Trade>, LedgerError> {
    let symbol = validate_symbol(symbol)?;
    validate_price(price)?;

    let triggered: Vec<usize> = state
        .stop_losses
        .iter()
        .enumerate()
        .filter(|(_, rule)| rule.symbol == symbol && rule.should_trigger(price))
        .map(|(idx, _)| idx)
        .collect();

    let mut trades = Vec::new();
    for idx in triggered {
        let held = state.held_quantity(&symbol);
        let quantity = state.stop_losses[idx].quantity.min(held);

        if quantity == 0 {
            let rule = &mut state.stop_losses[idx];
            rule.status = StopLossStatus::Expired;
            rule.triggered_at = Some(now);
            continue;
        }

        let rule_id = state.stop_losses[idx].id.clone();
        let trade = apply_sell(
            state,
            &symbol,
            quantity,
            price,
            OrderKind::StopLoss,
            Some(rule_id),
            now,
        )?;

        let rule = &mut state.stop_losses[idx];
        rule.status = StopLossStatus::Triggered;
        rule.triggered_at = Some(trade.executed_at);
        rule.triggered_trade_id = Some(trade.id.clone());
        trades.push(trade);
    }

    Ok(trades)
}

/// Rebuild an account's cash and positions from its trade log.
pub fn replay(account: &Account, trades: &[Trade]) -> Result<LedgerState, LedgerError> {
    let mut state = LedgerState::new(Account {
        cash_balance: account.starting_balance,
        ..account.clone()
    });

    let mut ordered: Vec<&Trade> = trades.iter().collect();
    ordered.sort_by_key(|t| (t.executed_at, t.seq));

    for trade in ordered {
        match trade.side {
            TradeSide::Buy => {
                book_buy(&mut state, &trade.symbol, trade.quantity, trade.price, trade.executed_at)?;
            }
            TradeSide::Sell => {
                book_sell(&mut state, &trade.symbol, trade.quantity, trade.price, trade.executed_at)?;
            }
        }
        state.trades.push(trade.clone());
    }

    Ok(state)
}

/// Check the ledger invariants: non-negative cash, no empty positions,
/// cash + cost basis = starting balance + realized gains, and agreement
/// with a replay of the trade log.
pub fn is_consistent(state: &LedgerState) -> bool {
    let account = &state.account;
    if account.cash_balance < Decimal::ZERO {
        return false;
    }
    if state.positions.values().any(|p| p.quantity <= 0) {
        return false;
    }
    if account.cash_balance + state.invested() != account.starting_balance + state.realized_pnl() {
        return false;
    }

    match replay(account, &state.trades) {
        Ok(replayed) => {
            replayed.account.cash_balance == account.cash_balance
                && replayed.positions.len() == state.positions.len()
                && replayed.positions.iter().all(|(symbol, p)| {
                    state
                        .positions
                        .get(symbol)
                        .map(|q| q.quantity == p.quantity && q.cost_basis == p.cost_basis)
                        .unwrap_or(false)
                })
        }
        Err(_) => false,
    }
}

// =============================================================================
// Trade History
// =============================================================================

/// Snapshot of an account's trades, oldest first.
///
/// Iterating does not copy the trades and can be restarted any number of
/// times.
#[derive(Debug, Clone)]
pub struct TradeHistory {
    trades: Arc<[Trade]>,
}

impl TradeHistory {
    fn new(mut trades: Vec<Trade>) -> Self {
        trades.sort_by_key(|t| (t.executed_at, t.seq));
        Self {
            trades: trades.into(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Trade> {
        self.trades.iter()
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// The most recent `limit` trades, still oldest first.
    pub fn latest(&self, limit: usize) -> &[Trade] {
        let start = self.trades.len().saturating_sub(limit);
        &self.trades[start..]
    }
}

impl<'a> IntoIterator for &'a TradeHistory {
    type Item = &'a Trade;
    type IntoIter = std::slice::Iter<'a, Trade>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// =============================================================================
// Ledger Engine
// =============================================================================

type AccountSlot = Arc<Mutex<Option<LedgerState>>>;

/// Paper trading ledger.
pub struct LedgerEngine {
    /// Durable storage for ledger states
    store: Arc<dyn LedgerRepository>,
    /// Per-account write slots (account_id -> cached state)
    slots: DashMap<String, AccountSlot>,
    /// Cash given to accounts opened without an explicit balance
    default_starting_balance: Decimal,
    /// Broadcast channel for executed trades
    trade_tx: broadcast::Sender<Trade>,
}

impl LedgerEngine {
    /// Create a new ledger engine.
    pub fn new(store: Arc<dyn LedgerRepository>, default_starting_balance: Decimal) -> Self {
        let (trade_tx, _) = broadcast::channel(1024);
        Self {
            store,
            slots: DashMap::new(),
            default_starting_balance,
            trade_tx,
        }
    }

    /// Subscribe to executed trades.
    pub fn subscribe_trades(&self) -> broadcast::Receiver<Trade> {
        self.trade_tx.subscribe()
    }

    fn slot(&self, account_id: &str) -> AccountSlot {
        if let Some(slot) = self.slots.get(account_id) {
            return slot.clone();
        }
        self.slots.entry(account_id.to_string()).or_default().clone()
    }

    /// Drop a slot that never loaded an account, unless another caller
    /// still holds it.
    fn release_if_empty(&self, account_id: &str, slot: AccountSlot) {
        self.slots.remove_if(account_id, |_, cached| {
            Arc::ptr_eq(cached, &slot)
                && Arc::strong_count(cached) == 2
                && matches!(cached.try_lock(), Ok(guard) if guard.is_none())
        });
    }

    /// Lock an account slot and make sure its state is loaded.
    fn lock_loaded<'a>(
        &self,
        account_id: &str,
        slot: &'a AccountSlot,
    ) -> Result<MutexGuard<'a, Option<LedgerState>>, LedgerError> {
        // States are only ever swapped in whole, so a poisoned slot is still
        // consistent.
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = self.store.load(account_id)?;
        }
        Ok(guard)
    }

    fn read<T>(
        &self,
        account_id: &str,
        f: impl FnOnce(&LedgerState) -> T,
    ) -> Result<T, LedgerError> {
        let slot = self.slot(account_id);
        let result = self.lock_loaded(account_id, &slot).and_then(|guard| {
            guard
                .as_ref()
                .map(f)
                .ok_or_else(|| LedgerError::UnknownAccount(account_id.to_string()))
        });
        if result.is_err() {
            self.release_if_empty(account_id, slot);
        }
        result
    }

    /// Apply a transition to an account atomically.
    fn mutate<T>(
        &self,
        account_id: &str,
        f: impl FnOnce(&mut LedgerState) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let slot = self.slot(account_id);
        let result = self.commit(account_id, &slot, f);
        if result.is_err() {
            self.release_if_empty(account_id, slot);
        }
        result
    }

    fn commit<T>(
        &self,
        account_id: &str,
        slot: &AccountSlot,
        f: impl FnOnce(&mut LedgerState) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut guard = self.lock_loaded(account_id, slot)?;
        let current = guard
            .as_ref()
            .ok_or_else(|| LedgerError::UnknownAccount(account_id.to_string()))?;

        let mut next = current.clone();
        let out = f(&mut next)?;

        self.store.save(&next)?;
        *guard = Some(next);
        Ok(out)
    }

    fn publish(&self, trade: &Trade) {
        // No subscribers is fine.
        let _ = self.trade_tx.send(trade.clone());
    }

    // ==========================================================================
    // Accounts
    // ==========================================================================

    /// Open a new account. A missing ID gets a generated one; a missing
    /// balance gets the default starting balance.
    pub fn create_account(
        &self,
        account_id: Option<String>,
        starting_balance: Option<Decimal>,
    ) -> Result<Account, LedgerError> {
        let account_id = account_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let starting_balance = starting_balance.unwrap_or(self.default_starting_balance);
        if starting_balance < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(starting_balance));
        }

        let slot = self.slot(&account_id);
        let result = self.open(&account_id, &slot, starting_balance);
        if result.is_err() {
            self.release_if_empty(&account_id, slot);
        }
        let account = result?;

        info!("Created account {} with {}", account_id, starting_balance);
        Ok(account)
    }

    fn open(
        &self,
        account_id: &str,
        slot: &AccountSlot,
        starting_balance: Decimal,
    ) -> Result<Account, LedgerError> {
        let mut guard = self.lock_loaded(account_id, slot)?;
        if guard.is_some() {
            return Err(LedgerError::AccountExists(account_id.to_string()));
        }

        let state = LedgerState::new(Account::new(account_id.to_string(), starting_balance));
        self.store.save(&state)?;
        let account = state.account.clone();
        *guard = Some(state);
        Ok(account)
    }

    pub fn account(&self, account_id: &str) -> Result<Account, LedgerError> {
        self.read(account_id, |s| s.account.clone())
    }

    /// Open positions, ordered by symbol.
    pub fn positions(&self, account_id: &str) -> Result<Vec<Position>, LedgerError> {
        self.read(account_id, |s| s.positions.values().cloned().collect())
    }

    /// Full copy of an account's ledger.
    pub fn snapshot(&self, account_id: &str) -> Result<LedgerState, LedgerError> {
        self.read(account_id, |s| s.clone())
    }

    // ==========================================================================
    // Trading
    // ==========================================================================

    /// Buy shares with the account's cash.
    pub fn execute_buy(
        &self,
        account_id: &str,
        symbol: &str,
        quantity: i64,
        price: Decimal,
    ) -> Result<Trade, LedgerError> {
        let trade = self.mutate(account_id, |state| {
            apply_buy(state, symbol, quantity, price, now_ms())
        })?;

        self.publish(&trade);
        info!(
            "Executed buy of {} {} at {} for account {}",
            trade.quantity, trade.symbol, trade.price, account_id
        );
        Ok(trade)
    }

    /// Buy shares and, when `stop_price` is given, protect them with a
    /// stop-loss rule. Both happen or neither does.
    pub fn execute_buy_with_stop_loss(
        &self,
        account_id: &str,
        symbol: &str,
        quantity: i64,
        price: Decimal,
        stop_price: Option<Decimal>,
    ) -> Result<(Trade, Option<StopLossRule>), LedgerError> {
        let (trade, rule) = self.mutate(account_id, |state| {
            let trade = apply_buy(state, symbol, quantity, price, now_ms())?;
            let rule = match stop_price {
                Some(trigger) => {
                    validate_price(trigger)?;
                    if trigger >= price {
                        return Err(LedgerError::InvalidTrigger { trigger, price });
                    }
                    let rule = StopLossRule::new(
                        state.account.id.clone(),
                        trade.symbol.clone(),
                        trigger,
                        trade.quantity,
                    );
                    state.stop_losses.push(rule.clone());
                    Some(rule)
                }
                None => None,
            };
            Ok((trade, rule))
        })?;

        self.publish(&trade);
        match &rule {
            Some(rule) => info!(
                "Executed buy of {} {} at {} for account {} with stop-loss at {}",
                trade.quantity, trade.symbol, trade.price, account_id, rule.trigger_price
            ),
            None => info!(
                "Executed buy of {} {} at {} for account {}",
                trade.quantity, trade.symbol, trade.price, account_id
            ),
        }
        Ok((trade, rule))
    }

    /// Sell held shares.
    pub fn execute_sell(
        &self,
        account_id: &str,
        symbol: &str,
        quantity: i64,
        price: Decimal,
    ) -> Result<Trade, LedgerError> {
        let trade = self.mutate(account_id, |state| {
            apply_sell(state, symbol, quantity, price, OrderKind::Market, None, now_ms())
        })?;

        self.publish(&trade);
        info!(
            "Executed sell of {} {} at {} for account {} (realized {})",
            trade.quantity, trade.symbol, trade.price, account_id, trade.realized_pnl
        );
        Ok(trade)
    }

    // ==========================================================================
    // Stop-Loss Rules
    // ==========================================================================

    /// Create a stop-loss rule.
    pub fn create_stop_loss(
        &self,
        account_id: &str,
        symbol: &str,
        trigger_price: Decimal,
        quantity: i64,
    ) -> Result<StopLossRule, LedgerError> {
        let symbol = validate_symbol(symbol)?;
        validate_quantity(quantity)?;
        validate_price(trigger_price)?;

        let rule = self.mutate(account_id, |state| {
            let rule = StopLossRule::new(state.account.id.clone(), symbol, trigger_price, quantity);
            state.stop_losses.push(rule.clone());
            Ok(rule)
        })?;

        info!(
            "Created stop-loss {} for {} {} at {} on account {}",
            rule.id, rule.quantity, rule.symbol, rule.trigger_price, account_id
        );
        Ok(rule)
    }

    /// Cancel an active stop-loss rule.
    pub fn cancel_stop_loss(
        &self,
        account_id: &str,
        rule_id: &str,
    ) -> Result<StopLossRule, LedgerError> {
        let rule = self.mutate(account_id, |state| {
            let rule = state
                .stop_losses
                .iter_mut()
                .find(|r| r.id == rule_id)
                .ok_or_else(|| LedgerError::StopLossNotFound(rule_id.to_string()))?;

            if !rule.is_active() {
                return Err(LedgerError::StopLossInactive {
                    id: rule.id.clone(),
                    status: rule.status,
                });
            }

            rule.status = StopLossStatus::Cancelled;
            Ok(rule.clone())
        })?;

        info!("Cancelled stop-loss {} on account {}", rule_id, account_id);
        Ok(rule)
    }

    /// Stop-loss rules, newest first.
    pub fn stop_losses(
        &self,
        account_id: &str,
        active_only: bool,
    ) -> Result<Vec<StopLossRule>, LedgerError> {
        self.read(account_id, |s| {
            s.stop_losses
                .iter()
                .rev()
                .filter(|r| !active_only || r.is_active())
                .cloned()
                .collect()
        })
    }

    /// Rules with their distance from the current price. Distances are only
    /// filled in for active rules.
    pub fn stop_loss_views(
        &self,
        account_id: &str,
        active_only: bool,
        price_lookup: impl Fn(&str) -> Option<Decimal>,
    ) -> Result<Vec<StopLossView>, LedgerError> {
        let rules = self.stop_losses(account_id, active_only)?;
        Ok(rules
            .into_iter()
            .map(|rule| {
                let current_price = if rule.is_active() {
                    price_lookup(&rule.symbol)
                } else {
                    None
                };
                let trigger_distance =
                    current_price.and_then(|p| p.checked_sub(rule.trigger_price));
                let trigger_distance_pct = match (current_price, trigger_distance) {
                    (Some(p), Some(d)) if p > Decimal::ZERO => checked_percent(d, p),
                    _ => None,
                };
                // A band too wide to represent covers every price.
                let near_trigger = current_price
                    .map(|p| match rule.trigger_price.checked_mul(NEAR_TRIGGER_BAND) {
                        Some(band) => p <= band,
                        None => true,
                    })
                    .unwrap_or(false);

                StopLossView {
                    rule,
                    current_price,
                    trigger_distance,
                    trigger_distance_pct,
                    near_trigger,
                }
            })
            .collect())
    }

    /// Evaluate an account's stop-loss rules on `symbol` at `current_price`.
    ///
    /// Returns the sell trades produced; a rule fires at most once.
    pub fn evaluate_stop_loss(
        &self,
        account_id: &str,
        symbol: &str,
        current_price: Decimal,
    ) -> Result<Vec<Trade>, LedgerError> {
        let symbol = validate_symbol(symbol)?;
        validate_price(current_price)?;

        let pending = self.read(account_id, |s| {
            s.stop_losses
                .iter()
                .any(|r| r.symbol == symbol && r.should_trigger(current_price))
        })?;
        if !pending {
            return Ok(Vec::new());
        }

        let trades = self.mutate(account_id, |state| {
            fire_stop_losses(state, &symbol, current_price, now_ms())
        })?;

        for trade in &trades {
            self.publish(trade);
            info!(
                "Stop-loss sold {} {} at {} for account {} (realized {})",
                trade.quantity, trade.symbol, trade.price, account_id, trade.realized_pnl
            );
        }
        Ok(trades)
    }

    /// Evaluate every account's rules on `symbol`. Returns the number of
    /// trades executed.
    pub fn sweep_symbol(&self, symbol: &str, current_price: Decimal) -> usize {
        let account_ids = match self.store.account_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Stop-loss sweep could not list accounts: {}", e);
                return 0;
            }
        };

        let mut executed = 0;
        for account_id in account_ids {
            match self.evaluate_stop_loss(&account_id, symbol, current_price) {
                Ok(trades) => executed += trades.len(),
                Err(e) => warn!("Stop-loss sweep failed for {}: {}", account_id, e),
            }
        }
        executed
    }

    /// Evaluate every active rule of every account at the looked-up prices.
    /// Symbols without a price are skipped. Returns the number of trades
    /// executed.
    pub fn sweep_stop_losses(&self, price_lookup: impl Fn(&str) -> Option<Decimal>) -> usize {
        let account_ids = match self.store.account_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Stop-loss sweep could not list accounts: {}", e);
                return 0;
            }
        };

        let mut executed = 0;
        for account_id in account_ids {
            let symbols = match self.read(&account_id, |s| {
                let mut symbols: Vec<String> =
                    s.active_stop_losses().map(|r| r.symbol.clone()).collect();
                symbols.sort();
                symbols.dedup();
                symbols
            }) {
                Ok(symbols) => symbols,
                Err(e) => {
                    warn!("Stop-loss sweep failed for {}: {}", account_id, e);
                    continue;
                }
            };

            for symbol in symbols {
                let Some(price) = price_lookup(&symbol) else {
                    debug!("No price for {} - skipping stop-loss check", symbol);
                    continue;
                };
                match self.evaluate_stop_loss(&account_id, &symbol, price) {
                    Ok(trades) => executed += trades.len(),
                    Err(e) => warn!("Stop-loss sweep failed for {}: {}", account_id, e),
                }
            }
        }
        executed
    }

    // ==========================================================================
    // Valuation & History
    // ==========================================================================

    /// Cash plus the market value of every position.
    pub fn portfolio_value(
        &self,
        account_id: &str,
        price_lookup: impl Fn(&str) -> Option<Decimal>,
    ) -> Result<Decimal, LedgerError> {
        let state = self.snapshot(account_id)?;
        let mut total = state.account.cash_balance;
        for position in state.positions.values() {
            let price = price_lookup(&position.symbol)
                .ok_or_else(|| LedgerError::NoPriceData(position.symbol.clone()))?;
            let value = position
                .market_value(price)
                .ok_or(LedgerError::ArithmeticOverflow)?;
            total = total
                .checked_add(value)
                .ok_or(LedgerError::ArithmeticOverflow)?;
        }
        Ok(total)
    }

    /// Detailed valuation with per-position gains.
    pub fn portfolio(
        &self,
        account_id: &str,
        price_lookup: impl Fn(&str) -> Option<Decimal>,
    ) -> Result<PortfolioValuation, LedgerError> {
        let state = self.snapshot(account_id)?;

        let mut holdings = Vec::with_capacity(state.positions.len());
        for position in state.positions.values() {
            let current_price = price_lookup(&position.symbol)
                .ok_or_else(|| LedgerError::NoPriceData(position.symbol.clone()))?;
            let market_value = position
                .market_value(current_price)
                .ok_or(LedgerError::ArithmeticOverflow)?;
            let unrealized_pnl = position
                .unrealized_pnl(current_price)
                .ok_or(LedgerError::ArithmeticOverflow)?;
            holdings.push(Holding {
                symbol: position.symbol.clone(),
                quantity: position.quantity,
                average_cost: position.average_cost(),
                cost_basis: position.cost_basis,
                current_price,
                market_value,
                unrealized_pnl,
                unrealized_pnl_pct: percent_of(unrealized_pnl, position.cost_basis)?,
            });
        }

        let account = &state.account;
        let market_value = checked_sum(holdings.iter().map(|h| h.market_value))?;
        let unrealized_pnl = checked_sum(holdings.iter().map(|h| h.unrealized_pnl))?;
        let total_value = account
            .cash_balance
            .checked_add(market_value)
            .ok_or(LedgerError::ArithmeticOverflow)?;
        let total_return = total_value
            .checked_sub(account.starting_balance)
            .ok_or(LedgerError::ArithmeticOverflow)?;

        Ok(PortfolioValuation {
            account_id: account.id.clone(),
            cash_balance: account.cash_balance,
            invested: state.invested(),
            market_value,
            total_value,
            unrealized_pnl,
            realized_pnl: state.realized_pnl(),
            total_return_pct: percent_of(total_return, account.starting_balance)?,
            holdings,
        })
    }

    /// The account's trades, oldest first.
    pub fn history(&self, account_id: &str) -> Result<TradeHistory, LedgerError> {
        self.read(account_id, |s| TradeHistory::new(s.trades.clone()))
    }

    /// Trading statistics for the account.
    pub fn performance(&self, account_id: &str) -> Result<PerformanceReport, LedgerError> {
        self.read(account_id, performance::analyze)
    }
}

/// `part` as a percentage of a positive `whole`, or `None` on overflow.
fn checked_percent(part: Decimal, whole: Decimal) -> Option<Decimal> {
    part.checked_div(whole)?
        .checked_mul(dec!(100))
        .map(|pct| pct.round_dp(2))
}

fn percent_of(part: Decimal, whole: Decimal) -> Result<Decimal, LedgerError> {
    if whole > Decimal::ZERO {
        checked_percent(part, whole).ok_or(LedgerError::ArithmeticOverflow)
    } else {
        Ok(Decimal::ZERO)
    }
}

fn checked_sum(mut values: impl Iterator<Item = Decimal>) -> Result<Decimal, LedgerError> {
    values.try_fold(Decimal::ZERO, |acc, v| {
        acc.checked_add(v).ok_or(LedgerError::ArithmeticOverflow)
    })
}
