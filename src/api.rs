// Control surface consumed by the operator dashboard. Every response carries
// a success flag and a human-readable message; operator mistakes map to 4xx,
// downstream dependency failures to 5xx.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::classifier::IncidentClassifier;
use crate::config::SettingsStore;
use crate::exchange::traits::MarginApi;
use crate::executor::{ShortOrderExecutor, ShortRequest};
use crate::feed::{CheckpointStore, SignalSource};
use crate::pipeline::AlertPipeline;
use crate::tracker::PositionTracker;

pub struct AppState {
    pub running: Arc<AtomicBool>,
    pub pipeline_handle: Mutex<Option<JoinHandle<()>>>,
    pub exchange: Arc<dyn MarginApi>,
    pub feed: Arc<dyn SignalSource>,
    pub classifier: Arc<dyn IncidentClassifier>,
    pub executor: Arc<ShortOrderExecutor>,
    pub settings: Arc<SettingsStore>,
    pub checkpoint: Arc<CheckpointStore>,
    pub tracker: PositionTracker,
}

pub async fn run_server(state: Arc<AppState>, bind_addr: &str) {
    let app = Router::new()
        .route("/api/start", post(start_bot))
        .route("/api/stop", post(stop_bot))
        .route("/api/status", get(get_status))
        .route("/api/settings", post(update_settings))
        .route("/api/manual_alert", post(manual_alert))
        .route("/api/place_short_direct", post(place_short_direct))
        .route("/api/cancel_short", post(cancel_short))
        .route("/api/probe_exchange", get(probe_exchange))
        .route("/api/probe_feed", get(probe_feed))
        .route("/api/probe_classifier", get(probe_classifier))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await.unwrap();
    info!("API server listening on {}", bind_addr);
    axum::serve(listener, app).await.unwrap();
}

async fn start_bot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut handle_lock = state.pipeline_handle.lock().unwrap();

    if state.running.load(Ordering::SeqCst) {
        return Json(json!({
            "success": true,
            "message": "bot already running",
            "running": true,
        }))
        .into_response();
    }

    state.running.store(true, Ordering::SeqCst);
    let pipeline = Arc::new(AlertPipeline::new(
        state.feed.clone(),
        state.classifier.clone(),
        state.executor.clone(),
        state.settings.clone(),
        state.checkpoint.clone(),
        state.running.clone(),
    ));
    *handle_lock = Some(pipeline.start());

    info!("Bot started");
    Json(json!({
        "success": true,
        "message": "bot started successfully",
        "running": true,
    }))
    .into_response()
}

async fn stop_bot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let was_running = state.running.swap(false, Ordering::SeqCst);

    // The loop observes the flag before its next iteration; an in-flight
    // executor sequence is never killed mid-run.
    if let Some(handle) = state.pipeline_handle.lock().unwrap().take() {
        drop(handle);
    }

    let message = if was_running {
        "bot stopped successfully"
    } else {
        "bot already stopped"
    };
    info!("{}", message);
    Json(json!({
        "success": true,
        "message": message,
        "running": false,
    }))
}

async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let settings = state.settings.get();

    // Surface any venue-side debt the tracker does not know about before
    // reporting; operators must never be silently exposed to a loan.
    if let Err(e) = state
        .tracker
        .reconcile(
            state.exchange.as_ref(),
            &settings.target_coin,
            &settings.symbol(),
        )
        .await
    {
        warn!("status reconciliation failed: {}", e);
    }

    Json(json!({
        "success": true,
        "running": state.running.load(Ordering::SeqCst),
        "latest_signal": state.checkpoint.last(),
        "active_shorts": state.tracker.open_positions(),
        "settings": settings,
    }))
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let Some(partial) = body.as_object() else {
        return client_error("settings payload must be a JSON object");
    };

    match state.settings.update(partial) {
        Ok(settings) => Json(json!({
            "success": true,
            "message": "settings updated",
            "settings": settings,
        }))
        .into_response(),
        Err(e) => client_error(&format!("invalid settings: {}", e)),
    }
}

async fn manual_alert(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let Some(alert) = body.get("alert").and_then(value_as_string) else {
        return client_error("missing alert data");
    };
    let text = body
        .get("text")
        .and_then(|t| t.as_str())
        .unwrap_or("manual test alert");

    info!("Manual alert {} received: {}", alert, text);

    if alert != "1" {
        return Json(json!({
            "success": true,
            "message": format!("alert {} processed, no action required", alert),
        }))
        .into_response();
    }

    if !state.running.load(Ordering::SeqCst) {
        return Json(json!({
            "success": true,
            "message": "bot is not running, no order placed",
        }))
        .into_response();
    }

    let settings = state.settings.get();
    if !settings.trading_enabled {
        return Json(json!({
            "success": true,
            "message": "automated trading disabled, no order placed",
        }))
        .into_response();
    }

    let report = state
        .executor
        .open_short(&ShortRequest::from_settings(&settings))
        .await;
    if report.success {
        Json(json!({
            "success": true,
            "message": report.message,
            "order_id": report.order_id,
        }))
        .into_response()
    } else {
        server_error(&report.message)
    }
}

async fn place_short_direct(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.running.load(Ordering::SeqCst) {
        return client_error("the bot must be running to place a short");
    }
    let settings = state.settings.get();
    if !settings.trading_enabled {
        return client_error("automated trading must be enabled to place a short");
    }

    let report = state
        .executor
        .open_short(&ShortRequest::from_settings(&settings))
        .await;
    if report.success {
        Json(json!({
            "success": true,
            "message": report.message,
            "order_id": report.order_id,
            "quantity": report.quantity,
            "entry_price": report.entry_price,
        }))
        .into_response()
    } else {
        server_error(&report.message)
    }
}

async fn cancel_short(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let Some(position_id) = body.get("position_id").and_then(value_as_string) else {
        return client_error("missing position id");
    };

    let Some(position) = state.tracker.find(&position_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "message": format!("short with id {} not found", position_id),
            })),
        )
            .into_response();
    };

    let report = state.executor.close_short(&position).await;
    if report.success {
        Json(json!({
            "success": true,
            "message": report.message,
        }))
        .into_response()
    } else {
        server_error(&report.message)
    }
}

async fn probe_exchange(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.exchange.ping().await {
        Ok(()) => probe_ok("exchange connection successful"),
        Err(e) => probe_failed(&format!("exchange connection failed: {}", e)),
    }
}

async fn probe_feed(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.feed.probe().await {
        Ok(()) => probe_ok("feed connection successful"),
        Err(e) => probe_failed(&format!("feed connection failed: {}", e)),
    }
}

async fn probe_classifier(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.classifier.probe().await {
        Ok(()) => probe_ok("classifier connection successful"),
        Err(e) => probe_failed(&format!("classifier connection failed: {}", e)),
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn client_error(message: &str) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "message": message})),
    )
        .into_response()
}

fn server_error(message: &str) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "message": message})),
    )
        .into_response()
}

fn probe_ok(message: &str) -> axum::response::Response {
    Json(json!({"success": true, "message": message})).into_response()
}

fn probe_failed(message: &str) -> axum::response::Response {
    Json(json!({"success": false, "message": message})).into_response()
}
