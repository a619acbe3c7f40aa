//! SQLite persistence layer for ledger states.
//!
//! One table per ledger record type. A save runs inside a single
//! transaction, so an account's cash, positions, trades and stop-loss rules
//! are committed together or not at all. Trades are insert-only.
//!
//! Decimals are stored as TEXT to keep them exact.

use crate::services::repository::{LedgerRepository, StoreError};
use crate::types::{Account, LedgerState, ParseEnumError, Position, StopLossRule, Trade};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// SQLite-backed ledger repository.
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    /// Create a new SQLite store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("SQLite ledger store initialized");
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("In-memory SQLite ledger store initialized");
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                starting_balance TEXT NOT NULL,
                cash_balance TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                account_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                cost_basis TEXT NOT NULL,
                opened_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, symbol)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                kind TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price TEXT NOT NULL,
                cash_delta TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                stop_loss_id TEXT,
                executed_at INTEGER NOT NULL,
                UNIQUE (account_id, seq)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_account_time
             ON trades(account_id, executed_at, seq)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS stop_losses (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                trigger_price TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                triggered_at INTEGER,
                triggered_trade_id TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_stop_losses_account ON stop_losses(account_id, status)",
            [],
        )?;

        info!("SQLite ledger schema initialized");
        Ok(())
    }

    fn load_positions(
        conn: &Connection,
        account_id: &str,
    ) -> Result<BTreeMap<String, Position>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT symbol, quantity, cost_basis, opened_at, updated_at
             FROM positions WHERE account_id = ?1",
        )?;
        let rows = stmt.query_map(params![account_id], |row| {
            Ok(Position {
                symbol: row.get(0)?,
                quantity: row.get(1)?,
                cost_basis: decimal_col(row, 2)?,
                opened_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;

        let mut positions = BTreeMap::new();
        for position in rows {
            let position = position?;
            positions.insert(position.symbol.clone(), position);
        }
        Ok(positions)
    }

    fn load_trades(conn: &Connection, account_id: &str) -> Result<Vec<Trade>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, account_id, seq, symbol, side, kind, quantity, price, cash_delta,
                    realized_pnl, stop_loss_id, executed_at
             FROM trades WHERE account_id = ?1
             ORDER BY executed_at ASC, seq ASC",
        )?;
        let rows = stmt.query_map(params![account_id], |row| {
            let seq: i64 = row.get(2)?;
            Ok(Trade {
                id: row.get(0)?,
                account_id: row.get(1)?,
                seq: seq as u64,
                symbol: row.get(3)?,
                side: enum_col(row, 4)?,
                kind: enum_col(row, 5)?,
                quantity: row.get(6)?,
                price: decimal_col(row, 7)?,
                cash_delta: decimal_col(row, 8)?,
                realized_pnl: decimal_col(row, 9)?,
                stop_loss_id: row.get(10)?,
                executed_at: row.get(11)?,
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn load_stop_losses(
        conn: &Connection,
        account_id: &str,
    ) -> Result<Vec<StopLossRule>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, account_id, symbol, trigger_price, quantity, status, created_at,
                    triggered_at, triggered_trade_id
             FROM stop_losses WHERE account_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![account_id], |row| {
            Ok(StopLossRule {
                id: row.get(0)?,
                account_id: row.get(1)?,
                symbol: row.get(2)?,
                trigger_price: decimal_col(row, 3)?,
                quantity: row.get(4)?,
                status: enum_col(row, 5)?,
                created_at: row.get(6)?,
                triggered_at: row.get(7)?,
                triggered_trade_id: row.get(8)?,
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

impl LedgerRepository for SqliteLedgerStore {
    fn load(&self, account_id: &str) -> Result<Option<LedgerState>, StoreError> {
        let conn = self.lock()?;

        let account = conn
            .query_row(
                "SELECT id, starting_balance, cash_balance, created_at
                 FROM accounts WHERE id = ?1",
                params![account_id],
                |row| {
                    Ok(Account {
                        id: row.get(0)?,
                        starting_balance: decimal_col(row, 1)?,
                        cash_balance: decimal_col(row, 2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;

        let Some(account) = account else {
            return Ok(None);
        };

        let state = LedgerState {
            positions: Self::load_positions(&conn, account_id)?,
            trades: Self::load_trades(&conn, account_id)?,
            stop_losses: Self::load_stop_losses(&conn, account_id)?,
            account,
        };

        debug!(
            "Loaded ledger for {} ({} positions, {} trades)",
            account_id,
            state.positions.len(),
            state.trades.len()
        );
        Ok(Some(state))
    }

    fn save(&self, state: &LedgerState) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let account = &state.account;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO accounts (id, starting_balance, cash_balance, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                cash_balance = excluded.cash_balance",
            params![
                account.id,
                account.starting_balance.to_string(),
                account.cash_balance.to_string(),
                account.created_at,
            ],
        )?;

        tx.execute(
            "DELETE FROM positions WHERE account_id = ?1",
            params![account.id],
        )?;

        let stored_seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM trades WHERE account_id = ?1",
            params![account.id],
            |row| row.get(0),
        )?;

        if (state.trades.len() as i64) < stored_seq {
            return Err(StoreError::Corrupt(format!(
                "account {} would drop trades ({} stored, {} supplied)",
                account.id,
                stored_seq,
                state.trades.len()
            )));
        }

        {
            let mut insert_position = tx.prepare(
                "INSERT INTO positions (account_id, symbol, quantity, cost_basis, opened_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for position in state.positions.values() {
                insert_position.execute(params![
                    account.id,
                    position.symbol,
                    position.quantity,
                    position.cost_basis.to_string(),
                    position.opened_at,
                    position.updated_at,
                ])?;
            }

            let mut insert_trade = tx.prepare(
                "INSERT INTO trades
                 (id, account_id, seq, symbol, side, kind, quantity, price, cash_delta,
                  realized_pnl, stop_loss_id, executed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for trade in state.trades.iter().filter(|t| t.seq as i64 > stored_seq) {
                insert_trade.execute(params![
                    trade.id,
                    trade.account_id,
                    trade.seq as i64,
                    trade.symbol,
                    trade.side.to_string(),
                    trade.kind.to_string(),
                    trade.quantity,
                    trade.price.to_string(),
                    trade.cash_delta.to_string(),
                    trade.realized_pnl.to_string(),
                    trade.stop_loss_id,
                    trade.executed_at,
                ])?;
            }

            let mut upsert_rule = tx.prepare(
                "INSERT INTO stop_losses
                 (id, account_id, symbol, trigger_price, quantity, status, created_at,
                  triggered_at, triggered_trade_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    triggered_at = excluded.triggered_at,
                    triggered_trade_id = excluded.triggered_trade_id",
            )?;
            for rule in &state.stop_losses {
                upsert_rule.execute(params![
                    rule.id,
                    rule.account_id,
                    rule.symbol,
                    rule.trigger_price.to_string(),
                    rule.quantity,
                    rule.status.to_string(),
                    rule.created_at,
                    rule.triggered_at,
                    rule.triggered_trade_id,
                ])?;
            }
        }

        tx.commit()?;
        debug!("Saved ledger for account {}", account.id);
        Ok(())
    }

    fn account_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM accounts ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}

fn decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: ParseEnumError| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ledger::{apply_buy, apply_sell};
    use crate::types::{OrderKind, StopLossStatus};
    use rust_decimal_macros::dec;

    fn sample_state() -> LedgerState {
        let mut state = LedgerState::new(Account::new("acct-1".to_string(), dec!(10000.00)));
        apply_buy(&mut state, "AAPL", 10, dec!(150), 1_000).unwrap();
        apply_buy(&mut state, "MSFT", 3, dec!(301.25), 2_000).unwrap();
        apply_sell(&mut state, "AAPL", 4, dec!(160), OrderKind::Market, None, 3_000).unwrap();
        state.stop_losses.push(StopLossRule::new(
            "acct-1".to_string(),
            "MSFT".to_string(),
            dec!(280),
            3,
        ));
        state
    }

    #[test]
    fn test_load_unknown_account() {
        let store = SqliteLedgerStore::new_in_memory().unwrap();
        assert!(store.load("missing").unwrap().is_none());
    }

    #[test]
    fn test_full_ledger_round_trip() {
        let store = SqliteLedgerStore::new_in_memory().unwrap();
        let state = sample_state();

        store.save(&state).unwrap();
        let loaded = store.load("acct-1").unwrap().unwrap();

        assert_eq!(loaded, state);
        assert_eq!(loaded.account.cash_balance, dec!(8236.25));
        assert_eq!(loaded.trades.len(), 3);
        assert_eq!(loaded.trades[2].realized_pnl, dec!(40));
    }

    #[test]
    fn test_save_updates_positions_and_rules() {
        let store = SqliteLedgerStore::new_in_memory().unwrap();
        let mut state = sample_state();
        store.save(&state).unwrap();

        apply_sell(&mut state, "AAPL", 6, dec!(155), OrderKind::Market, None, 4_000).unwrap();
        state.stop_losses[0].status = StopLossStatus::Cancelled;
        store.save(&state).unwrap();

        let loaded = store.load("acct-1").unwrap().unwrap();
        assert!(loaded.position("AAPL").is_none());
        assert_eq!(loaded.trades.len(), 4);
        assert_eq!(loaded.stop_losses[0].status, StopLossStatus::Cancelled);
    }

    #[test]
    fn test_save_refuses_to_drop_trades() {
        let store = SqliteLedgerStore::new_in_memory().unwrap();
        let state = sample_state();
        store.save(&state).unwrap();

        let mut truncated = state.clone();
        truncated.trades.pop();
        assert!(matches!(store.save(&truncated), Err(StoreError::Corrupt(_))));

        // Nothing from the rejected save is visible.
        assert_eq!(store.load("acct-1").unwrap().unwrap(), state);
    }

    #[test]
    fn test_account_ids() {
        let store = SqliteLedgerStore::new_in_memory().unwrap();
        store
            .save(&LedgerState::new(Account::new("b".to_string(), dec!(1))))
            .unwrap();
        store
            .save(&LedgerState::new(Account::new("a".to_string(), dec!(1))))
            .unwrap();

        assert_eq!(store.account_ids().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
