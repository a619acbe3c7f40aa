//! Simulated market prices.
//!
//! The ledger never looks prices up itself; callers pass prices in or hand
//! over a lookup built from a [`PriceFeed`].

use crate::types::normalize_symbol;
use dashmap::DashMap;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Lowest price the random walk can reach.
const PRICE_FLOOR: Decimal = dec!(0.01);

/// Source of current prices.
pub trait PriceFeed: Send + Sync {
    fn get_price(&self, symbol: &str) -> Option<Decimal>;
}

/// In-memory price table with an optional random walk.
pub struct SimulatedPriceFeed {
    prices: DashMap<String, Decimal>,
    /// Largest move per step, in basis points
    max_step_bps: i64,
}

impl SimulatedPriceFeed {
    pub fn new(max_step_bps: i64) -> Self {
        Self {
            prices: DashMap::new(),
            max_step_bps: max_step_bps.max(0),
        }
    }

    /// Feed seeded with initial prices.
    pub fn with_prices<I>(max_step_bps: i64, prices: I) -> Self
    where
        I: IntoIterator<Item = (String, Decimal)>,
    {
        let feed = Self::new(max_step_bps);
        for (symbol, price) in prices {
            feed.set_price(&symbol, price);
        }
        feed
    }

    /// Set a symbol's price. Returns the normalized symbol.
    pub fn set_price(&self, symbol: &str, price: Decimal) -> String {
        let symbol = normalize_symbol(symbol);
        self.prices.insert(symbol.clone(), price);
        symbol
    }

    pub fn get_price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(&normalize_symbol(symbol)).map(|p| *p.value())
    }

    /// All known prices, ordered by symbol.
    pub fn snapshot(&self) -> BTreeMap<String, Decimal> {
        self.prices
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Move every price by a uniform random amount within the step bound.
    /// Returns the number of prices updated.
    pub fn step<R: Rng>(&self, rng: &mut R) -> usize {
        if self.max_step_bps == 0 {
            return 0;
        }

        // Symbol order keeps a seeded walk reproducible.
        let mut symbols: Vec<String> = self.prices.iter().map(|e| e.key().clone()).collect();
        symbols.sort();

        let mut updated = 0;
        for symbol in symbols {
            let Some(mut price) = self.prices.get_mut(&symbol) else {
                continue;
            };
            let bps = rng.gen_range(-self.max_step_bps..=self.max_step_bps);
            let factor = Decimal::ONE + Decimal::new(bps, 4);
            match price.checked_mul(factor) {
                Some(next) => {
                    *price = next.round_dp(2).max(PRICE_FLOOR);
                    updated += 1;
                }
                None => warn!("Price of {} out of range - left at {}", symbol, *price),
            }
        }
        debug!("Stepped {} simulated prices", updated);
        updated
    }
}

impl PriceFeed for SimulatedPriceFeed {
    fn get_price(&self, symbol: &str) -> Option<Decimal> {
        SimulatedPriceFeed::get_price(self, symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn seeded() -> SimulatedPriceFeed {
        SimulatedPriceFeed::with_prices(
            50,
            [
                ("aapl".to_string(), dec!(150)),
                ("MSFT".to_string(), dec!(300)),
            ],
        )
    }

    #[test]
    fn test_symbols_are_normalized() {
        let feed = seeded();

        assert_eq!(feed.get_price("AAPL"), Some(dec!(150)));
        assert_eq!(feed.get_price(" msft "), Some(dec!(300)));
        assert_eq!(feed.get_price("TSLA"), None);
    }

    #[test]
    fn test_set_price_overwrites() {
        let feed = seeded();
        assert_eq!(feed.set_price("aapl", dec!(151.25)), "AAPL");

        assert_eq!(feed.get_price("AAPL"), Some(dec!(151.25)));
        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let feed = seeded();
        feed.set_price("AMZN", dec!(130));

        let symbols: Vec<String> = feed.snapshot().into_keys().collect();
        assert_eq!(symbols, vec!["AAPL", "AMZN", "MSFT"]);
    }

    #[test]
    fn test_step_stays_within_bounds() {
        let feed = seeded();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..100 {
            let before = feed.snapshot();
            assert_eq!(feed.step(&mut rng), 2);
            for (symbol, next) in feed.snapshot() {
                let prev = before[&symbol];
                let bound = (prev * dec!(0.005)).round_dp(2) + dec!(0.01);
                assert!((next - prev).abs() <= bound, "{symbol}: {prev} -> {next}");
                assert_eq!(next, next.round_dp(2));
            }
        }
    }

    #[test]
    fn test_step_is_deterministic_for_a_seed() {
        let a = seeded();
        let b = seeded();
        a.step(&mut StdRng::seed_from_u64(42));
        b.step(&mut StdRng::seed_from_u64(42));

        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_step_respects_floor() {
        let feed = SimulatedPriceFeed::with_prices(10_000, [("PENNY".to_string(), dec!(0.01))]);
        let mut rng = StdRng::seed_from_u64(1);

        for _ in 0..50 {
            feed.step(&mut rng);
            assert!(feed.get_price("PENNY").unwrap() >= dec!(0.01));
        }
    }

    #[test]
    fn test_step_keeps_price_that_would_overflow() {
        let feed = SimulatedPriceFeed::with_prices(
            10_000,
            [
                ("HUGE".to_string(), Decimal::MAX),
                ("SMALL".to_string(), dec!(10)),
            ],
        );
        let mut rng = StdRng::seed_from_u64(5);

        for _ in 0..20 {
            let updated = feed.step(&mut rng);
            assert!(updated >= 1);
            assert!(feed.get_price("HUGE").unwrap() > Decimal::ZERO);
        }
    }

    #[test]
    fn test_usable_as_trait_object() {
        let feed: Box<dyn PriceFeed> = Box::new(seeded());

        assert_eq!(feed.get_price("aapl"), Some(dec!(150)));
        assert_eq!(feed.get_price("NOPE"), None);
    }

    #[test]
    fn test_zero_step_is_frozen() {
        let feed = SimulatedPriceFeed::with_prices(0, [("AAPL".to_string(), dec!(150))]);

        assert_eq!(feed.step(&mut StdRng::seed_from_u64(3)), 0);
        assert_eq!(feed.get_price("AAPL"), Some(dec!(150)));
    }
}
