use crate::db;
use crate::errors::{PoolError, PoolResult};
use crate::math::Fixed64;
use crate::pool::engine::{
    ExerciseReceipt, LiquidityReceipt, PoolSnapshot, PositionView, PurchaseReceipt, QuoteResult,
    ReassignReceipt,
};
use crate::pool::{Pool, PositionId};
use crate::state::{AppState, DbCommand, PoolEvent};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use portable_atomic::Ordering::Relaxed;
use std::sync::Arc;

/// Pool error rendered as `{"error", "kind"}` with a status per class.
#[derive(Debug)]
pub struct ApiError(pub PoolError);

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PoolError::Validation(_) | PoolError::ExpiryState(_) => StatusCode::BAD_REQUEST,
            PoolError::InsufficientLiquidity(_) | PoolError::SlippageExceeded { .. } => StatusCode::CONFLICT,
            PoolError::Authorization(_) => StatusCode::FORBIDDEN,
            PoolError::ExternalDependency(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn strike_from(value: f64) -> PoolResult<Fixed64> {
    Fixed64::from_f64(value).map_err(|e| PoolError::Validation(format!("strike {value}: {e}")))
}

/// Runs one pool transaction; rejections are counted, logged and journaled.
async fn apply<T>(
    state: &AppState,
    operation: &'static str,
    op: impl FnOnce(&mut Pool) -> PoolResult<T>,
) -> Result<T, ApiError> {
    match state.pool.transact(op) {
        Ok(value) => {
            state.counters.operations_applied.fetch_add(1, Relaxed);
            Ok(value)
        }
        Err(e) => {
            state.counters.operations_rejected.fetch_add(1, Relaxed);
            tracing::warn!(operation, kind = e.kind(), "operation rejected: {e}");
            state
                .publish(PoolEvent::Rejected {
                    operation,
                    kind: e.kind(),
                    error: e.to_string(),
                })
                .await;
            Err(ApiError(e))
        }
    }
}

// ── Requests ──

#[derive(serde::Deserialize)]
pub struct QuoteRequest {
    pub account: String,
    pub maturity: u64,
    pub strike: f64,
    pub contracts: u128,
    pub is_call: bool,
}

#[derive(serde::Deserialize)]
pub struct PurchaseRequest {
    pub account: String,
    pub maturity: u64,
    pub strike: f64,
    pub contracts: u128,
    pub is_call: bool,
    pub max_cost: u128,
}

#[derive(serde::Deserialize)]
pub struct ExerciseRequest {
    /// The holder or one of its approved operators
    pub caller: String,
    pub holder: String,
    pub long_id: PositionId,
    pub contracts: u128,
}

#[derive(serde::Deserialize)]
pub struct ReassignRequest {
    pub account: String,
    pub short_id: PositionId,
    pub contracts: u128,
}

#[derive(serde::Deserialize)]
pub struct LiquidityRequest {
    pub account: String,
    pub amount: u128,
    pub is_call: bool,
}

#[derive(serde::Deserialize)]
pub struct DivestmentRequest {
    pub account: String,
    pub timestamp: u64,
    pub is_call: bool,
}

#[derive(serde::Deserialize)]
pub struct ApprovalRequest {
    pub owner: String,
    pub operator: String,
    pub approved: bool,
}

#[derive(serde::Deserialize)]
pub struct TransferRequest {
    pub caller: String,
    pub from: String,
    pub to: String,
    pub id: PositionId,
    pub amount: u128,
}

#[derive(serde::Deserialize)]
pub struct PriceRequest {
    pub price: f64,
}

#[derive(serde::Deserialize)]
pub struct ExpiredRequest {
    pub long_id: PositionId,
}

#[derive(serde::Deserialize)]
pub struct EventsQuery {
    pub account: Option<String>,
    pub limit: Option<usize>,
}

#[derive(serde::Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

// ── Reads ──

/// GET /api/pool -- liquidity, C-Levels, spot and variance for both sides
pub async fn get_pool(State(state): State<Arc<AppState>>) -> ApiResult<PoolSnapshot> {
    let snapshot = state.pool.read(|p| p.snapshot())??;
    Ok(Json(snapshot))
}

/// GET /api/positions/{account}
pub async fn get_positions(
    State(state): State<Arc<AppState>>,
    Path(account): Path<String>,
) -> ApiResult<Vec<PositionView>> {
    Ok(Json(state.pool.read(|p| p.positions(&account))?))
}

/// GET /api/events -- journal, newest first (cold path)
pub async fn get_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsQuery>,
) -> ApiResult<serde_json::Value> {
    let limit = params.limit.unwrap_or(50).min(500);
    let events = db::get_recent_events(&state.db, params.account.as_deref(), limit)?;
    Ok(Json(serde_json::json!({ "events": events })))
}

/// GET /api/prices -- operator price updates, oldest first
pub async fn get_prices(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitQuery>,
) -> ApiResult<serde_json::Value> {
    let limit = params.limit.unwrap_or(500).min(5000);
    let series = db::get_price_series(&state.db, limit)?;
    Ok(Json(serde_json::json!({
        "series": series.iter().map(|(t, p)| serde_json::json!({"t": t, "price": p})).collect::<Vec<_>>()
    })))
}

/// GET /api/counters -- performance counters (lock-free reads)
pub async fn get_counters(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let c = &state.counters;
    Json(serde_json::json!({
        "operations_applied": c.operations_applied.load(Relaxed),
        "operations_rejected": c.operations_rejected.load(Relaxed),
        "prices_received": c.prices_received.load(Relaxed),
        "expiries_processed": c.expiries_processed.load(Relaxed),
        "ws_messages_sent": c.ws_messages_sent.load(Relaxed),
    }))
}

/// POST /api/quote -- read-only purchase price
pub async fn post_quote(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QuoteRequest>,
) -> ApiResult<QuoteResult> {
    let strike = strike_from(req.strike)?;
    let now = unix_now();
    let quote = state
        .pool
        .read(|p| p.quote(&req.account, req.maturity, strike, req.contracts, req.is_call, now))??;
    Ok(Json(quote))
}

// ── Mutations ──

pub async fn post_purchase(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PurchaseRequest>,
) -> ApiResult<PurchaseReceipt> {
    let strike = strike_from(req.strike)?;
    let now = unix_now();
    let receipt = apply(&state, "purchase", |p| {
        p.purchase(&req.account, req.maturity, strike, req.contracts, req.is_call, req.max_cost, now)
    })
    .await?;
    state.publish(PoolEvent::Purchase(receipt.clone())).await;
    Ok(Json(receipt))
}

pub async fn post_exercise(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExerciseRequest>,
) -> ApiResult<ExerciseReceipt> {
    let now = unix_now();
    let receipt = apply(&state, "exercise", |p| {
        p.exercise_from(&req.caller, &req.holder, req.long_id, req.contracts, now)
    })
    .await?;
    state.publish(PoolEvent::Exercise(receipt.clone())).await;
    Ok(Json(receipt))
}

pub async fn post_reassign(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReassignRequest>,
) -> ApiResult<ReassignReceipt> {
    let now = unix_now();
    let receipt = apply(&state, "reassign", |p| {
        p.reassign(&req.account, req.short_id, req.contracts, now)
    })
    .await?;
    state.publish(PoolEvent::Reassign(receipt.clone())).await;
    Ok(Json(receipt))
}

pub async fn post_deposit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LiquidityRequest>,
) -> ApiResult<LiquidityReceipt> {
    let now = unix_now();
    let receipt = apply(&state, "deposit", |p| p.deposit(&req.account, req.amount, req.is_call, now)).await?;
    state.publish(PoolEvent::Deposit(receipt.clone())).await;
    Ok(Json(receipt))
}

pub async fn post_withdraw(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LiquidityRequest>,
) -> ApiResult<LiquidityReceipt> {
    let now = unix_now();
    let receipt = apply(&state, "withdraw", |p| p.withdraw(&req.account, req.amount, req.is_call, now)).await?;
    state.publish(PoolEvent::Withdraw(receipt.clone())).await;
    Ok(Json(receipt))
}

pub async fn post_divestment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DivestmentRequest>,
) -> ApiResult<serde_json::Value> {
    apply(&state, "divestment", |p| {
        p.set_divestment_timestamp(&req.account, req.timestamp, req.is_call)
    })
    .await?;
    state
        .publish(PoolEvent::Divestment {
            account: req.account,
            is_call: req.is_call,
            timestamp: req.timestamp,
        })
        .await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn post_approval(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApprovalRequest>,
) -> ApiResult<serde_json::Value> {
    apply(&state, "approval", |p| {
        p.set_approval_for_all(&req.owner, &req.operator, req.approved)
    })
    .await?;
    state
        .publish(PoolEvent::Approval {
            owner: req.owner,
            operator: req.operator,
            approved: req.approved,
        })
        .await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn post_transfer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<serde_json::Value> {
    let now = unix_now();
    apply(&state, "transfer", |p| {
        p.transfer(&req.caller, &req.from, &req.to, req.id, req.amount, now)
    })
    .await?;
    state
        .publish(PoolEvent::Transfer {
            from: req.from.clone(),
            to: req.to.clone(),
            id: req.id,
            amount: req.amount,
        })
        .await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// POST /api/price -- sets the spot price and records an observation.
/// At most one price per second; the feed is only left changed when the
/// pool recorded it.
pub async fn post_price(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PriceRequest>,
) -> ApiResult<serde_json::Value> {
    state.counters.prices_received.fetch_add(1, Relaxed);
    let now = unix_now();

    let mut replaced = None;
    let result = apply(&state, "price", |p| {
        if let Some(latest) = p.state.history.latest().filter(|o| o.timestamp >= now) {
            return Err(PoolError::Validation(format!(
                "spot already observed at {}",
                latest.timestamp
            )));
        }
        replaced = Some(state.feed.set_price(req.price)?);
        p.update(now)
    })
    .await;
    let spot = match result {
        Ok(spot) => spot,
        Err(e) => {
            if let Some(previous) = replaced {
                state.feed.restore(previous);
            }
            return Err(e);
        }
    };

    if state
        .db_tx
        .send(DbCommand::InsertPrice {
            timestamp: now as i64,
            price: req.price,
        })
        .await
        .is_err()
    {
        tracing::warn!(timestamp = now, "db writer gone, price not journaled");
    }
    state
        .publish(PoolEvent::PriceUpdate {
            price: req.price,
            timestamp: now,
        })
        .await;
    Ok(Json(serde_json::json!({ "price": req.price, "spot": spot, "timestamp": now })))
}

/// POST /api/process-expired -- settles every holder of an expired long
pub async fn post_process_expired(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExpiredRequest>,
) -> ApiResult<Vec<ExerciseReceipt>> {
    let now = unix_now();
    let settlements = apply(&state, "process_expired", |p| p.process_expired(req.long_id, now)).await?;
    state.counters.expiries_processed.fetch_add(1, Relaxed);
    state
        .publish(PoolEvent::Expired {
            long_id: req.long_id,
            settlements: settlements.clone(),
        })
        .await;
    Ok(Json(settlements))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pool::{ManualPriceFeed, PoolHandle};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    const ONE: u64 = 1_000_000_000_000_000_000;
    const DAY: u64 = 86_400;

    fn test_state() -> Arc<AppState> {
        let cfg = AppConfig {
            server_port: 0,
            data_dir: "data".into(),
            underlying_decimals: 18,
            base_decimals: 18,
            fee_rate: 0.03,
            steepness: 1.0,
            min_apy: 0.0,
            initial_variance_annualized: 0.16,
            initial_spot_price: Some(2_000.0),
            call_surface: None,
            put_surface: None,
            keeper_interval_secs: 60,
        };
        let feed = ManualPriceFeed::new();
        feed.set_price(2_000.0).unwrap();
        let pool = Pool::new(cfg.pool_config().unwrap(), Arc::new(feed.clone())).unwrap();
        let db = db::init_memory_db().unwrap();
        let (db_tx, db_rx) = mpsc::channel(64);
        tokio::spawn(db::run_db_writer(db.clone(), db_rx));
        AppState::new(db, Arc::new(PoolHandle::new(pool)), feed, db_tx)
    }

    async fn call(state: &Arc<AppState>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = body.map_or_else(Body::empty, |b| Body::from(b.to_string()));
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = crate::server::router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, json)
    }

    fn next_maturity(days: u64) -> u64 {
        (unix_now() / DAY + days) * DAY
    }

    #[tokio::test]
    async fn test_deposit_then_pool_snapshot() {
        let state = test_state();
        let (status, body) = call(
            &state,
            "POST",
            "/api/deposit",
            Some(json!({"account": "lp", "amount": 10 * ONE, "is_call": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["from_free"].as_u64(), Some(10 * ONE));

        let (status, body) = call(&state, "GET", "/api/pool", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["call"]["free_liquidity"].as_u64(), Some(10 * ONE));
        assert_eq!(body["call"]["underwriters"], json!(["lp"]));
    }

    #[tokio::test]
    async fn test_locked_withdrawal_is_bad_request() {
        let state = test_state();
        call(
            &state,
            "POST",
            "/api/deposit",
            Some(json!({"account": "lp", "amount": ONE, "is_call": false})),
        )
        .await;
        let (status, body) = call(
            &state,
            "POST",
            "/api/withdraw",
            Some(json!({"account": "lp", "amount": ONE, "is_call": false})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
        assert_eq!(state.counters.operations_rejected.load(Relaxed), 1);
    }

    #[tokio::test]
    async fn test_purchase_and_positions() {
        let state = test_state();
        call(
            &state,
            "POST",
            "/api/deposit",
            Some(json!({"account": "lp", "amount": 10 * ONE, "is_call": true})),
        )
        .await;

        let order = json!({
            "account": "buyer",
            "maturity": next_maturity(8),
            "strike": 2000.0,
            "contracts": ONE / 10,
            "is_call": true,
            "max_cost": ONE,
        });
        let (status, receipt) = call(&state, "POST", "/api/purchase", Some(order)).await;
        assert_eq!(status, StatusCode::OK, "{receipt}");
        assert_eq!(receipt["fills"][0]["underwriter"], "lp");

        let (status, positions) = call(&state, "GET", "/api/positions/buyer", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(positions.as_array().map(Vec::len), Some(1));
        assert_eq!(positions[0]["id"], receipt["long_id"]);
        assert_eq!(positions[0]["key"]["token_type"], "long_call");
    }

    #[tokio::test]
    async fn test_slippage_is_conflict() {
        let state = test_state();
        call(
            &state,
            "POST",
            "/api/deposit",
            Some(json!({"account": "lp", "amount": 10 * ONE, "is_call": true})),
        )
        .await;
        let order = json!({
            "account": "buyer",
            "maturity": next_maturity(8),
            "strike": 2000.0,
            "contracts": ONE,
            "is_call": true,
            "max_cost": 1,
        });
        let (status, body) = call(&state, "POST", "/api/purchase", Some(order)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "slippage_exceeded");

        let (_, positions) = call(&state, "GET", "/api/positions/buyer", None).await;
        assert_eq!(positions, json!([]));
    }

    #[tokio::test]
    async fn test_price_update() {
        let state = test_state();
        let (status, body) = call(&state, "POST", "/api/price", Some(json!({"price": -1.0}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");

        let (status, _) = call(&state, "POST", "/api/price", Some(json!({"price": 2_100.0}))).await;
        assert_eq!(status, StatusCode::OK);
        let (_, pool) = call(&state, "GET", "/api/pool", None).await;
        assert_eq!(pool["spot"]["price"].as_f64(), Some(2_100.0));
        // the first observation only seeds the estimator
        assert_eq!(pool["volatility_samples"].as_u64(), Some(0));
    }

    #[tokio::test]
    async fn test_price_rejected_when_already_observed() {
        let state = test_state();
        let later = unix_now() + 3_600;
        state.pool.transact(|p| p.update(later)).unwrap();

        let (status, body) = call(&state, "POST", "/api/price", Some(json!({"price": 2_200.0}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");

        // feed and history still agree on the old price
        assert_eq!(state.feed.current(), 2_000.0);
        let (_, pool) = call(&state, "GET", "/api/pool", None).await;
        assert_eq!(pool["spot"]["price"].as_f64(), Some(2_000.0));
        assert_eq!(pool["spot"]["timestamp"].as_u64(), Some(later));
    }

    #[tokio::test]
    async fn test_transfer_needs_explicit_caller() {
        let state = test_state();
        call(
            &state,
            "POST",
            "/api/deposit",
            Some(json!({"account": "lp", "amount": 10 * ONE, "is_call": true})),
        )
        .await;
        let order = json!({
            "account": "buyer",
            "maturity": next_maturity(8),
            "strike": 2000.0,
            "contracts": ONE / 10,
            "is_call": true,
            "max_cost": ONE,
        });
        let (_, receipt) = call(&state, "POST", "/api/purchase", Some(order)).await;
        let long_id = receipt["long_id"].clone();

        let (status, _) = call(
            &state,
            "POST",
            "/api/transfer",
            Some(json!({"from": "buyer", "to": "mallory", "id": long_id, "amount": ONE / 10})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = call(
            &state,
            "POST",
            "/api/transfer",
            Some(json!({"caller": "mallory", "from": "buyer", "to": "mallory", "id": long_id, "amount": ONE / 10})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "authorization");

        let (status, body) = call(
            &state,
            "POST",
            "/api/exercise",
            Some(json!({"holder": "buyer", "long_id": long_id, "contracts": ONE / 10})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "{body}");

        let (_, positions) = call(&state, "GET", "/api/positions/buyer", None).await;
        assert_eq!(positions[0]["balance"].as_u64(), Some(ONE / 10));
    }

    #[tokio::test]
    async fn test_unexpired_process_is_bad_request() {
        let state = test_state();
        let long_id = crate::pool::position::PositionKey::option(
            crate::pool::position::TokenType::LongPut,
            next_maturity(3),
            Fixed64::from_int(1_900),
        )
        .encode();
        let (status, body) = call(
            &state,
            "POST",
            "/api/process-expired",
            Some(json!({ "long_id": long_id })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "expiry_state");
    }

    #[tokio::test]
    async fn test_counters() {
        let state = test_state();
        let (status, body) = call(&state, "GET", "/api/counters", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["operations_applied"], 0);
    }
}
