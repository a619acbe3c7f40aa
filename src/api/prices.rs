//! Prices API
//!
//! - GET /api/prices - All simulated prices
//! - GET /api/prices/:symbol - One simulated price
//! - PUT /api/prices/:symbol - Set a price and sweep stop-losses on it

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::api::ApiResponse;
use crate::error::{AppError, Result};
use crate::types::normalize_symbol;
use crate::AppState;

/// Create prices router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_prices))
        .route("/:symbol", get(get_price).put(set_price))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceResponse {
    pub symbol: String,
    pub price: Decimal,
    /// Stop-loss sells executed because of this price
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss_trades: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SetPriceRequest {
    pub price: Decimal,
}

/// GET /api/prices
async fn list_prices(State(state): State<AppState>) -> Json<ApiResponse<BTreeMap<String, Decimal>>> {
    Json(ApiResponse {
        data: state.price_feed.snapshot(),
    })
}

/// GET /api/prices/:symbol
async fn get_price(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<ApiResponse<PriceResponse>>> {
    let symbol = normalize_symbol(&symbol);
    let price = state
        .price_feed
        .get_price(&symbol)
        .ok_or_else(|| AppError::NotFound(format!("No price for {}", symbol)))?;

    Ok(Json(ApiResponse {
        data: PriceResponse {
            symbol,
            price,
            stop_loss_trades: None,
        },
    }))
}

/// PUT /api/prices/:symbol
///
/// Setting a price evaluates every account's stop-losses on that symbol.
async fn set_price(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Json(request): Json<SetPriceRequest>,
) -> Result<Json<ApiResponse<PriceResponse>>> {
    if request.price <= Decimal::ZERO {
        return Err(AppError::BadRequest(format!(
            "Price must be positive, got {}",
            request.price
        )));
    }
    if normalize_symbol(&symbol).is_empty() {
        return Err(AppError::BadRequest("Symbol must not be empty".to_string()));
    }

    let symbol = state.price_feed.set_price(&symbol, request.price);
    let executed = {
        let ledger = state.ledger.clone();
        let symbol = symbol.clone();
        let price = request.price;
        tokio::task::spawn_blocking(move || ledger.sweep_symbol(&symbol, price))
            .await
            .map_err(|e| AppError::Internal(format!("Stop-loss sweep failed: {}", e)))?
    };
    info!("Price of {} set to {} ({} stop-loss sells)", symbol, request.price, executed);

    Ok(Json(ApiResponse {
        data: PriceResponse {
            symbol,
            price: request.price,
            stop_loss_trades: Some(executed),
        },
    }))
}
