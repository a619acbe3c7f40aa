//! Accounts API
//!
//! Endpoints for the paper trading ledger:
//!
//! Accounts:
//! - POST /api/accounts - Open an account
//! - GET /api/accounts/:id - Account with open positions
//! - GET /api/accounts/:id/positions - Open positions
//! - GET /api/accounts/:id/portfolio - Valuation at simulated prices
//! - GET /api/accounts/:id/performance - Trading statistics
//!
//! Trading:
//! - POST /api/accounts/:id/buy - Buy shares (optionally with a stop-loss)
//! - POST /api/accounts/:id/sell - Sell shares
//! - GET /api/accounts/:id/trades - Trade history, oldest first
//!
//! Stop-losses:
//! - GET /api/accounts/:id/stop-losses - Rules with trigger distances
//! - POST /api/accounts/:id/stop-losses - Create a rule
//! - POST /api/accounts/:id/stop-losses/evaluate - Evaluate rules for a symbol
//! - DELETE /api/accounts/:id/stop-losses/:rule_id - Cancel a rule

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::ApiResponse;
use crate::services::LedgerError;
use crate::types::{
    normalize_symbol, Account, PerformanceReport, PortfolioValuation, Position, StopLossRule,
    StopLossView, Trade,
};
use crate::AppState;

/// Create accounts router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_account))
        .route("/:id", get(get_account))
        .route("/:id/positions", get(list_positions))
        .route("/:id/portfolio", get(get_portfolio))
        .route("/:id/performance", get(get_performance))
        .route("/:id/buy", post(buy))
        .route("/:id/sell", post(sell))
        .route("/:id/trades", get(list_trades))
        .route("/:id/stop-losses", get(list_stop_losses))
        .route("/:id/stop-losses", post(create_stop_loss))
        .route("/:id/stop-losses/evaluate", post(evaluate_stop_losses))
        .route("/:id/stop-losses/:rule_id", delete(cancel_stop_loss))
}

// =============================================================================
// Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Convert LedgerError to HTTP response.
impl IntoResponse for LedgerError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = match &self {
            LedgerError::UnknownAccount(_) => (StatusCode::NOT_FOUND, "ACCOUNT_NOT_FOUND"),
            LedgerError::StopLossNotFound(_) => (StatusCode::NOT_FOUND, "STOP_LOSS_NOT_FOUND"),
            LedgerError::AccountExists(_) => (StatusCode::CONFLICT, "ACCOUNT_EXISTS"),
            LedgerError::InsufficientFunds { .. } => {
                (StatusCode::BAD_REQUEST, "INSUFFICIENT_FUNDS")
            }
            LedgerError::InsufficientShares { .. } => {
                (StatusCode::BAD_REQUEST, "INSUFFICIENT_SHARES")
            }
            LedgerError::InvalidQuantity(_) => (StatusCode::BAD_REQUEST, "INVALID_QUANTITY"),
            LedgerError::InvalidPrice(_) => (StatusCode::BAD_REQUEST, "INVALID_PRICE"),
            LedgerError::InvalidAmount(_) => (StatusCode::BAD_REQUEST, "INVALID_AMOUNT"),
            LedgerError::InvalidSymbol(_) => (StatusCode::BAD_REQUEST, "INVALID_SYMBOL"),
            LedgerError::InvalidTrigger { .. } => (StatusCode::BAD_REQUEST, "INVALID_TRIGGER"),
            LedgerError::StopLossInactive { .. } => {
                (StatusCode::BAD_REQUEST, "STOP_LOSS_INACTIVE")
            }
            LedgerError::ArithmeticOverflow => (StatusCode::BAD_REQUEST, "ARITHMETIC_OVERFLOW"),
            LedgerError::NoPriceData(_) => (StatusCode::SERVICE_UNAVAILABLE, "NO_PRICE_DATA"),
            LedgerError::PersistenceFailure(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_FAILURE")
            }
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetails {
    pub account: Account,
    pub positions: Vec<Position>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyResponse {
    pub trade: Trade,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<StopLossRule>,
}

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    pub account_id: Option<String>,
    pub starting_balance: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyRequest {
    pub symbol: String,
    pub quantity: i64,
    /// Execution price; the simulated price when omitted
    pub price: Option<Decimal>,
    pub stop_loss_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SellRequest {
    pub symbol: String,
    pub quantity: i64,
    pub price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStopLossRequest {
    pub symbol: String,
    pub trigger_price: Decimal,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    pub symbol: String,
    pub price: Option<Decimal>,
}

// =============================================================================
// Query Parameters
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListTradesQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ListStopLossesQuery {
    /// Include triggered, cancelled and expired rules
    pub all: Option<bool>,
}

/// Use the given price, or fall back to the simulated feed.
fn resolve_price(
    state: &AppState,
    symbol: &str,
    price: Option<Decimal>,
) -> Result<Decimal, LedgerError> {
    match price {
        Some(price) => Ok(price),
        None => state
            .price_feed
            .get_price(symbol)
            .ok_or_else(|| LedgerError::NoPriceData(normalize_symbol(symbol))),
    }
}

// =============================================================================
// Account Handlers
// =============================================================================

/// POST /api/accounts
async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Account>>), LedgerError> {
    let account = state
        .ledger
        .create_account(request.account_id, request.starting_balance)?;
    Ok((StatusCode::CREATED, Json(ApiResponse { data: account })))
}

/// GET /api/accounts/:id
async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AccountDetails>>, LedgerError> {
    let snapshot = state.ledger.snapshot(&id)?;
    Ok(Json(ApiResponse {
        data: AccountDetails {
            account: snapshot.account,
            positions: snapshot.positions.into_values().collect(),
        },
    }))
}

/// GET /api/accounts/:id/positions
async fn list_positions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<Position>>>, LedgerError> {
    let positions = state.ledger.positions(&id)?;
    Ok(Json(ApiResponse { data: positions }))
}

/// GET /api/accounts/:id/portfolio
///
/// Value every position at the current simulated price.
async fn get_portfolio(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<PortfolioValuation>>, LedgerError> {
    let feed = state.price_feed.clone();
    let valuation = state.ledger.portfolio(&id, |symbol| feed.get_price(symbol))?;
    Ok(Json(ApiResponse { data: valuation }))
}

/// GET /api/accounts/:id/performance
async fn get_performance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<PerformanceReport>>, LedgerError> {
    let report = state.ledger.performance(&id)?;
    Ok(Json(ApiResponse { data: report }))
}

// =============================================================================
// Trade Handlers
// =============================================================================

/// POST /api/accounts/:id/buy
async fn buy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<BuyRequest>,
) -> Result<Json<ApiResponse<BuyResponse>>, LedgerError> {
    let price = resolve_price(&state, &request.symbol, request.price)?;
    let (trade, stop_loss) = state.ledger.execute_buy_with_stop_loss(
        &id,
        &request.symbol,
        request.quantity,
        price,
        request.stop_loss_price,
    )?;

    Ok(Json(ApiResponse {
        data: BuyResponse { trade, stop_loss },
    }))
}

/// POST /api/accounts/:id/sell
async fn sell(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SellRequest>,
) -> Result<Json<ApiResponse<Trade>>, LedgerError> {
    let price = resolve_price(&state, &request.symbol, request.price)?;
    let trade = state
        .ledger
        .execute_sell(&id, &request.symbol, request.quantity, price)?;
    Ok(Json(ApiResponse { data: trade }))
}

/// GET /api/accounts/:id/trades
///
/// The most recent trades (default 100), oldest first.
async fn list_trades(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListTradesQuery>,
) -> Result<Json<ApiResponse<Vec<Trade>>>, LedgerError> {
    let limit = query.limit.unwrap_or(100);
    let history = state.ledger.history(&id)?;
    Ok(Json(ApiResponse {
        data: history.latest(limit).to_vec(),
    }))
}

// =============================================================================
// Stop-Loss Handlers
// =============================================================================

/// GET /api/accounts/:id/stop-losses
async fn list_stop_losses(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListStopLossesQuery>,
) -> Result<Json<ApiResponse<Vec<StopLossView>>>, LedgerError> {
    let active_only = !query.all.unwrap_or(false);
    let feed = state.price_feed.clone();
    let views = state
        .ledger
        .stop_loss_views(&id, active_only, |symbol| feed.get_price(symbol))?;
    Ok(Json(ApiResponse { data: views }))
}

/// POST /api/accounts/:id/stop-losses
async fn create_stop_loss(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CreateStopLossRequest>,
) -> Result<Json<ApiResponse<StopLossRule>>, LedgerError> {
    let rule = state.ledger.create_stop_loss(
        &id,
        &request.symbol,
        request.trigger_price,
        request.quantity,
    )?;
    Ok(Json(ApiResponse { data: rule }))
}

/// POST /api/accounts/:id/stop-losses/evaluate
///
/// Returns the sell trades the evaluation produced.
async fn evaluate_stop_losses(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EvaluateRequest>,
) -> Result<Json<ApiResponse<Vec<Trade>>>, LedgerError> {
    let price = resolve_price(&state, &request.symbol, request.price)?;
    let trades = state
        .ledger
        .evaluate_stop_loss(&id, &request.symbol, price)?;
    Ok(Json(ApiResponse { data: trades }))
}

/// DELETE /api/accounts/:id/stop-losses/:rule_id
async fn cancel_stop_loss(
    State(state): State<AppState>,
    Path((id, rule_id)): Path<(String, String)>,
) -> Result<Json<ApiResponse<StopLossRule>>, LedgerError> {
    let rule = state.ledger.cancel_stop_loss(&id, &rule_id)?;
    Ok(Json(ApiResponse { data: rule }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trades_query_allows_missing_limit() {
        let query: ListTradesQuery = serde_urlencoded::from_str("").unwrap();
        assert!(query.limit.is_none());
    }

    #[test]
    fn test_stop_losses_query_parses_all() {
        let query: ListStopLossesQuery = serde_urlencoded::from_str("all=true").unwrap();
        assert_eq!(query.all, Some(true));
    }

    #[test]
    fn test_buy_request_accepts_string_and_number_prices() {
        let request: BuyRequest = serde_json::from_str(
            r#"{"symbol":"aapl","quantity":10,"price":"150.25","stopLossPrice":140}"#,
        )
        .unwrap();

        assert_eq!(request.quantity, 10);
        assert_eq!(request.price, Some(dec!(150.25)));
        assert_eq!(request.stop_loss_price, Some(dec!(140)));
    }

    #[test]
    fn test_error_status_codes() {
        let cases = [
            (LedgerError::UnknownAccount("x".into()), StatusCode::NOT_FOUND),
            (LedgerError::AccountExists("x".into()), StatusCode::CONFLICT),
            (LedgerError::InvalidQuantity(0), StatusCode::BAD_REQUEST),
            (LedgerError::NoPriceData("X".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                LedgerError::PersistenceFailure("disk".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_error_response_serialization() {
        let error = ErrorResponse {
            error: "Unknown account: x".to_string(),
            code: "ACCOUNT_NOT_FOUND".to_string(),
        };

        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("ACCOUNT_NOT_FOUND"));
    }
}
