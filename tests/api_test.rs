//! Integration tests for API endpoints
//!
//! Each test builds the full application over an in-memory SQLite ledger and
//! drives it with single requests.

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use tradesim::config::Config;
use tradesim::services::{LedgerEngine, SimulatedPriceFeed, SqliteLedgerStore};
use tradesim::AppState;

fn test_app() -> (Router, AppState) {
    let config = Arc::new(Config::from_lookup(|_| None));
    let store = Arc::new(SqliteLedgerStore::new_in_memory().unwrap());
    let state = AppState {
        config: config.clone(),
        ledger: Arc::new(LedgerEngine::new(store, config.starting_balance)),
        price_feed: Arc::new(SimulatedPriceFeed::with_prices(0, config.seed_prices.clone())),
    };
    (tradesim::app(state.clone()), state)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn dec_of(value: &Value) -> Decimal {
    value.as_str().unwrap().parse().unwrap()
}

async fn open_account(app: &Router, id: &str) {
    let (status, _) = send(
        app,
        Method::POST,
        "/api/accounts",
        Some(json!({ "accountId": id })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn test_health() {
    let (app, _) = test_app();

    let (status, body) = send(&app, Method::GET, "/api/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["pricedSymbols"], 5);
    assert_eq!(body["simulatePrices"], true);
    assert_eq!(body["stopLossIntervalSecs"], 5);
}

#[tokio::test]
async fn test_create_account() {
    let (app, _) = test_app();

    let (status, body) = send(&app, Method::POST, "/api/accounts", Some(json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(dec_of(&body["data"]["cashBalance"]), dec!(10000.00));
    assert!(body["data"]["id"].is_string());

    open_account(&app, "alice").await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/accounts",
        Some(json!({ "accountId": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ACCOUNT_EXISTS");
}

#[tokio::test]
async fn test_buy_sell_flow() {
    let (app, _) = test_app();
    open_account(&app, "alice").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/accounts/alice/buy",
        Some(json!({ "symbol": "aapl", "quantity": 10, "price": "150" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["trade"]["symbol"], "AAPL");
    assert_eq!(body["data"]["trade"]["side"], "buy");
    assert!(body["data"].get("stopLoss").is_none());

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/accounts/alice/sell",
        Some(json!({ "symbol": "AAPL", "quantity": 4, "price": "160" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dec_of(&body["data"]["realizedPnl"]), dec!(40));

    let (status, body) = send(&app, Method::GET, "/api/accounts/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dec_of(&body["data"]["account"]["cashBalance"]), dec!(9140.00));
    assert_eq!(body["data"]["positions"][0]["quantity"], 6);

    let (_, body) = send(&app, Method::GET, "/api/accounts/alice/trades", None).await;
    let trades = body["data"].as_array().unwrap();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[0]["side"], "buy");
    assert_eq!(trades[1]["side"], "sell");

    let (_, body) = send(&app, Method::GET, "/api/accounts/alice/trades?limit=1", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["side"], "sell");
}

#[tokio::test]
async fn test_buy_uses_simulated_price() {
    let (app, _) = test_app();
    open_account(&app, "bob").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/accounts/bob/buy",
        Some(json!({ "symbol": "MSFT", "quantity": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dec_of(&body["data"]["trade"]["price"]), dec!(300.00));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/accounts/bob/buy",
        Some(json!({ "symbol": "NOPE", "quantity": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "NO_PRICE_DATA");
}

#[tokio::test]
async fn test_ledger_errors() {
    let (app, _) = test_app();
    open_account(&app, "carol").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/accounts/carol/buy",
        Some(json!({ "symbol": "AAPL", "quantity": 1000, "price": "150" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INSUFFICIENT_FUNDS");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/accounts/carol/sell",
        Some(json!({ "symbol": "AAPL", "quantity": 1, "price": "150" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INSUFFICIENT_SHARES");

    let (status, body) = send(&app, Method::GET, "/api/accounts/nobody/positions", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "ACCOUNT_NOT_FOUND");
}

#[tokio::test]
async fn test_stop_loss_flow() {
    let (app, _) = test_app();
    open_account(&app, "dave").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/accounts/dave/buy",
        Some(json!({ "symbol": "TSLA", "quantity": 4, "stopLossPrice": "240" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["stopLoss"]["status"], "active");

    let (_, body) = send(&app, Method::GET, "/api/accounts/dave/stop-losses", None).await;
    assert_eq!(dec_of(&body["data"][0]["triggerDistance"]), dec!(10.00));
    assert_eq!(body["data"][0]["nearTrigger"], true);

    // Dropping the price sweeps every account's rules.
    let (status, body) = send(
        &app,
        Method::PUT,
        "/api/prices/tsla",
        Some(json!({ "price": "235" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["stopLossTrades"], 1);

    let (_, body) = send(&app, Method::GET, "/api/accounts/dave/positions", None).await;
    assert!(body["data"].as_array().unwrap().is_empty());

    let (_, body) = send(&app, Method::GET, "/api/accounts/dave/stop-losses", None).await;
    assert!(body["data"].as_array().unwrap().is_empty());

    let (_, body) = send(&app, Method::GET, "/api/accounts/dave/stop-losses?all=true", None).await;
    assert_eq!(body["data"][0]["status"], "triggered");
}

#[tokio::test]
async fn test_create_evaluate_and_cancel_stop_loss() {
    let (app, _) = test_app();
    open_account(&app, "erin").await;
    send(
        &app,
        Method::POST,
        "/api/accounts/erin/buy",
        Some(json!({ "symbol": "AAPL", "quantity": 10, "price": "150" })),
    )
    .await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/accounts/erin/stop-losses",
        Some(json!({ "symbol": "AAPL", "triggerPrice": "140", "quantity": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rule_id = body["data"]["id"].as_str().unwrap().to_string();

    let (_, body) = send(
        &app,
        Method::POST,
        "/api/accounts/erin/stop-losses/evaluate",
        Some(json!({ "symbol": "AAPL", "price": "145" })),
    )
    .await;
    assert!(body["data"].as_array().unwrap().is_empty());

    let uri = format!("/api/accounts/erin/stop-losses/{}", rule_id);
    let (status, body) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");

    let (status, body) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "STOP_LOSS_INACTIVE");
}

#[tokio::test]
async fn test_portfolio_and_performance() {
    let (app, state) = test_app();
    open_account(&app, "frank").await;
    send(
        &app,
        Method::POST,
        "/api/accounts/frank/buy",
        Some(json!({ "symbol": "AAPL", "quantity": 10, "price": "150" })),
    )
    .await;
    state.price_feed.set_price("AAPL", dec!(165));

    let (status, body) = send(&app, Method::GET, "/api/accounts/frank/portfolio", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dec_of(&body["data"]["totalValue"]), dec!(10150.00));
    assert_eq!(dec_of(&body["data"]["holdings"][0]["unrealizedPnl"]), dec!(150));
    assert_eq!(dec_of(&body["data"]["holdings"][0]["unrealizedPnlPct"]), dec!(10.00));

    let (status, body) = send(&app, Method::GET, "/api/accounts/frank/performance", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["totalTrades"], 1);
    assert_eq!(body["data"]["grade"], "N/A");
}

#[tokio::test]
async fn test_prices() {
    let (app, _) = test_app();

    let (status, body) = send(&app, Method::GET, "/api/prices", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dec_of(&body["data"]["AAPL"]), dec!(150.00));

    let (status, body) = send(&app, Method::GET, "/api/prices/googl", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["symbol"], "GOOGL");
    assert!(body["data"].get("stopLossTrades").is_none());

    let (status, body) = send(&app, Method::GET, "/api/prices/XYZ", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);

    let (status, _) = send(
        &app,
        Method::PUT,
        "/api/prices/XYZ",
        Some(json!({ "price": "-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_out_of_range_price_is_rejected_on_valuation() {
    let (app, _) = test_app();
    open_account(&app, "gina").await;
    send(
        &app,
        Method::POST,
        "/api/accounts/gina/buy",
        Some(json!({ "symbol": "AAPL", "quantity": 2, "price": "150" })),
    )
    .await;

    let (status, _) = send(
        &app,
        Method::PUT,
        "/api/prices/AAPL",
        Some(json!({ "price": Decimal::MAX.to_string() })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, Method::GET, "/api/accounts/gina/portfolio", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "ARITHMETIC_OVERFLOW");

    let (status, _) = send(&app, Method::GET, "/api/accounts/gina/stop-losses", None).await;
    assert_eq!(status, StatusCode::OK);
}
