use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradesim::config::Config;
use tradesim::services::{
    LedgerEngine, LedgerRepository, MemoryLedgerStore, PriceFeed, SimulatedPriceFeed,
    SqliteLedgerStore,
};
use tradesim::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradesim=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env());
    info!("Starting tradesim server on {}", config.bind_address());

    let store: Arc<dyn LedgerRepository> = match &config.database_path {
        Some(path) => {
            info!("Using SQLite ledger at {}", path);
            Arc::new(SqliteLedgerStore::new(path)?)
        }
        None => {
            warn!("DATABASE_PATH not set to a file - ledger is kept in memory only");
            Arc::new(MemoryLedgerStore::new())
        }
    };

    let ledger = Arc::new(LedgerEngine::new(store, config.starting_balance));
    let price_feed = Arc::new(SimulatedPriceFeed::with_prices(
        config.price_step_bps,
        config.seed_prices.clone(),
    ));
    info!("Seeded {} simulated prices", price_feed.len());

    let state = AppState {
        config: config.clone(),
        ledger: ledger.clone(),
        price_feed: price_feed.clone(),
    };

    // Log executed trades
    {
        let mut trades = ledger.subscribe_trades();
        tokio::spawn(async move {
            loop {
                match trades.recv().await {
                    Ok(trade) => debug!(
                        "Trade #{} on {}: {} {} {} at {}",
                        trade.seq, trade.account_id, trade.side, trade.quantity, trade.symbol, trade.price
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Trade log skipped {} trades", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // Periodic price simulation and stop-loss sweep
    {
        let ledger = ledger.clone();
        let price_feed = price_feed.clone();
        let interval = config.stop_loss_interval;
        let simulate = config.simulate_prices;
        tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            loop {
                tokio::time::sleep(interval).await;

                if simulate {
                    price_feed.step(&mut rng);
                }

                let ledger = ledger.clone();
                let feed: Arc<dyn PriceFeed> = price_feed.clone();
                let sweep = tokio::task::spawn_blocking(move || {
                    ledger.sweep_stop_losses(|symbol| feed.get_price(symbol))
                })
                .await;

                match sweep {
                    Ok(0) => debug!("Stop-loss sweep - nothing triggered"),
                    Ok(executed) => info!("Stop-loss sweep executed {} sells", executed),
                    Err(e) => warn!("Stop-loss sweep task failed: {}", e),
                }
            }
        });
    }

    let app = tradesim::app(state);

    // Start the server
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("tradesim server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
