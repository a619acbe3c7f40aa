use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::time::Duration;

const DEFAULT_SEED_PRICES: &str = "AAPL=150.00,MSFT=300.00,GOOGL=140.00,AMZN=130.00,TSLA=250.00";

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// SQLite database file. `None` keeps the ledger in memory.
    pub database_path: Option<String>,
    /// Cash given to new accounts that don't ask for a balance.
    pub starting_balance: Decimal,
    /// Period of the background stop-loss sweep.
    pub stop_loss_interval: Duration,
    /// Random-walk the simulated prices before each sweep.
    pub simulate_prices: bool,
    /// Largest simulated price move per step (basis points).
    pub price_step_bps: i64,
    /// Initial simulated prices.
    pub seed_prices: Vec<(String, Decimal)>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: var("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(3001),
            database_path: parse_database_path(
                var("DATABASE_PATH").as_deref().unwrap_or("tradesim.db"),
            ),
            starting_balance: var("STARTING_BALANCE")
                .and_then(|v| v.trim().parse().ok())
                .filter(|b: &Decimal| *b >= Decimal::ZERO)
                .unwrap_or(dec!(10000.00)),
            stop_loss_interval: Duration::from_secs(
                var("STOP_LOSS_INTERVAL_SECS")
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|s| *s > 0)
                    .unwrap_or(5),
            ),
            simulate_prices: var("SIMULATE_PRICES")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
            price_step_bps: var("PRICE_STEP_BPS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            seed_prices: parse_seed_prices(
                var("SEED_PRICES").as_deref().unwrap_or(DEFAULT_SEED_PRICES),
            ),
        }
    }

    /// Address to bind the HTTP server to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

/// `:memory:`, `memory` and empty select the in-memory store.
fn parse_database_path(raw: &str) -> Option<String> {
    match raw.trim() {
        "" | ":memory:" | "memory" => None,
        path => Some(path.to_string()),
    }
}

/// Parse `SYM=price` pairs separated by commas. Malformed or non-positive
/// entries are skipped.
pub fn parse_seed_prices(raw: &str) -> Vec<(String, Decimal)> {
    raw.split(',')
        .filter_map(|pair| {
            let (symbol, price) = pair.split_once('=')?;
            let symbol = symbol.trim().to_uppercase();
            let price: Decimal = price.trim().parse().ok()?;
            if symbol.is_empty() || price <= Decimal::ZERO {
                return None;
            }
            Some((symbol, price))
        })
        .collect()
}
