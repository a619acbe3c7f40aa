use crate::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    /// Symbols the simulated feed currently prices
    priced_symbols: usize,
    /// Whether prices random-walk between sweeps
    simulate_prices: bool,
    stop_loss_interval_secs: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        priced_symbols: state.price_feed.len(),
        simulate_prices: state.config.simulate_prices,
        stop_loss_interval_secs: state.config.stop_loss_interval.as_secs(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/health", get(health))
}
