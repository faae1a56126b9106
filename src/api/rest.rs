// =============================================================================
// REST API — the surface the MT5 expert advisor talks to
// =============================================================================
//
// Routes:
//   POST /decision             snapshot in, {action, confidence, reason} out
//   POST /feedback             closed-trade outcome, idempotent
//   GET  /health               liveness + state version
//   GET  /decisions            last served decision envelopes (ring)
//   GET  /errors               last recorded errors (ring)
//   GET  /ml/feedback/status   per-key calibration aggregates
//   GET  /ml/retraining/stats  retraining readiness per key
//
// The decision route never surfaces an infrastructure error to the EA: on a
// blown budget or an unexpected failure it answers with a degraded hold so
// the EA's tick loop keeps its rhythm. Validation errors are still 422:
// a malformed snapshot is the EA's bug and must be visible.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use crate::app_state::AppState;
use crate::calibration::ready_for_retraining;
use crate::decision::Decision;
use crate::error::ServiceError;
use crate::feedback::TradeFeedback;
use crate::snapshot::MarketSnapshot;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/decision", post(post_decision))
        .route("/feedback", post(post_feedback))
        .route("/health", get(get_health))
        .route("/decisions", get(get_decisions))
        .route("/errors", get(get_errors))
        .route("/ml/feedback/status", get(get_feedback_status))
        .route("/ml/retraining/stats", get(get_retraining_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── POST /decision ──────────────────────────────────────────────────────────

async fn post_decision(
    State(state): State<Arc<AppState>>,
    Json(snapshot): Json<MarketSnapshot>,
) -> Response {
    let budget = Duration::from_millis(state.config.budgets.decision_ms);
    let symbol = snapshot.symbol.clone();
    let timeframe = snapshot.timeframe;

    match tokio::time::timeout(budget, state.engine.decide(&snapshot)).await {
        Ok(Ok(envelope)) => {
            let decision = envelope.decision.clone();
            state.push_decision(envelope);
            Json(decision).into_response()
        }
        Ok(Err(e @ ServiceError::InvalidSnapshot { .. })) => e.into_response(),
        Ok(Err(e)) => {
            error!(symbol = %symbol, error = %e, "decision pipeline failed, serving degraded hold");
            state.push_error("decision", e.to_string());
            Json(Decision::degraded(symbol, timeframe)).into_response()
        }
        Err(_) => {
            warn!(symbol = %symbol, budget_ms = state.config.budgets.decision_ms,
                "decision budget exceeded, serving degraded hold");
            state.push_error("decision", "budget exceeded");
            Json(Decision::degraded(symbol, timeframe)).into_response()
        }
    }
}

// ── POST /feedback ──────────────────────────────────────────────────────────

async fn post_feedback(
    State(state): State<Arc<AppState>>,
    Json(feedback): Json<TradeFeedback>,
) -> Response {
    let budget = Duration::from_millis(state.config.budgets.feedback_ms);

    match tokio::time::timeout(budget, state.ingestor.ingest(feedback)).await {
        Ok(Ok(result)) if result.duplicate => ServiceError::Conflict.into_response(),
        Ok(Ok(result)) => {
            state.bump_version();
            Json(json!({
                "accepted": result.accepted,
                "duplicate": result.duplicate,
            }))
            .into_response()
        }
        Ok(Err(e)) => {
            state.push_error("feedback", e.to_string());
            e.into_response()
        }
        Err(_) => {
            // Feedback must be durable; tell the EA to retry.
            warn!(budget_ms = state.config.budgets.feedback_ms, "feedback budget exceeded");
            state.push_error("feedback", "budget exceeded");
            ServiceError::PersistenceTimeout { stage: "feedback" }.into_response()
        }
    }
}

// ── GET /health ─────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "backend": state.config.backend.to_string(),
        "state_version": state.state_version(),
        "uptime_seconds": state.uptime_seconds(),
        "started_at": state.started_at_utc,
        "traces_written": state.traces.written_count(),
        "traces_dropped": state.traces.dropped_count(),
        "now": Utc::now(),
    }))
}

// ── GET /decisions, GET /errors ─────────────────────────────────────────────

async fn get_decisions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let decisions = state.recent_decisions();
    Json(json!({ "count": decisions.len(), "decisions": decisions }))
}

async fn get_errors(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let errors = state.recent_errors();
    Json(json!({ "count": errors.len(), "errors": errors }))
}

// ── GET /ml/feedback/status ─────────────────────────────────────────────────

async fn get_feedback_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let rows = state
        .store
        .read_all_calibrations()
        .await
        .map_err(|e| ServiceError::persistence("read_all_calibrations", e))?;

    let symbols: Vec<serde_json::Value> = rows
        .iter()
        .map(|(key, cal)| {
            json!({
                "symbol": key.symbol,
                "timeframe": key.timeframe.to_string(),
                "wins": cal.wins,
                "total": cal.total,
                "win_rate": cal.win_rate(),
                "drift_factor": cal.drift_factor,
                "last_updated": cal.last_updated,
            })
        })
        .collect();

    let total_feedback: u64 = rows.iter().map(|(_, cal)| u64::from(cal.total)).sum();
    Ok(Json(json!({
        "total_feedback": total_feedback,
        "tracked_keys": rows.len(),
        "symbols": symbols,
    })))
}

// ── GET /ml/retraining/stats ────────────────────────────────────────────────

async fn get_retraining_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let rows = state
        .store
        .read_all_calibrations()
        .await
        .map_err(|e| ServiceError::persistence("read_all_calibrations", e))?;

    let now = Utc::now();
    let mut keys = Vec::with_capacity(rows.len());
    let mut ready_count = 0usize;
    for (key, cal) in &rows {
        let last_trained = state
            .store
            .latest_training_date(key)
            .await
            .map_err(|e| ServiceError::persistence("latest_training_date", e))?;
        let ready = ready_for_retraining(
            cal,
            last_trained,
            state.config.min_samples,
            state.config.retrain_interval_days,
            now,
        );
        if ready {
            ready_count += 1;
        }
        keys.push(json!({
            "symbol": key.symbol,
            "timeframe": key.timeframe.to_string(),
            "samples": cal.total,
            "min_samples": state.config.min_samples,
            "last_trained": last_trained,
            "ready": ready,
        }));
    }

    Ok(Json(json!({
        "ready_count": ready_count,
        "tracked_keys": keys.len(),
        "keys": keys,
    })))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::store::{FeedbackStore, MemoryStore, ModelMetrics};
    use crate::types::{CalKey, Timeframe};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::TimeZone;
    use tower::ServiceExt;

    fn router() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let state = AppState::new(ServiceConfig::default(), store.clone());
        (build_router(state), store)
    }

    async fn post_json(router: &Router, path: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    async fn get_json(router: &Router, path: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn feedback_body(symbol: &str, profit: f64) -> serde_json::Value {
        serde_json::json!({
            "symbol": symbol,
            "timeframe": "M1",
            "side": "buy",
            "open_time": "2025-06-01T10:00:00Z",
            "close_time": "2025-06-01T10:30:00Z",
            "entry_price": 1.08,
            "exit_price": 1.09,
            "profit": profit,
        })
    }

    #[tokio::test]
    async fn decision_full_alignment_returns_strong_buy() {
        let (router, _) = router();
        let (status, body) = post_json(
            &router,
            "/decision",
            serde_json::json!({
                "symbol": "EURUSD", "bid": 1.08560, "ask": 1.08573,
                "ema_fast_m1": 1.0858, "ema_slow_m1": 1.0855,
                "ema_fast_m5": 1.0860, "ema_slow_m5": 1.0850,
                "ema_fast_h1": 1.0870, "ema_slow_h1": 1.0840,
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "buy");
        assert!(body["confidence"].as_f64().unwrap() >= 0.90);
        let reason = body["reason"].as_array().unwrap();
        assert!(reason.iter().any(|c| c == "CoreB:3/3"));
        assert!(reason.iter().any(|c| c == "M5↑"));
    }

    #[tokio::test]
    async fn decision_spike_mode_boom() {
        let (router, _) = router();
        let (status, body) = post_json(
            &router,
            "/decision",
            serde_json::json!({
                "symbol": "Boom 500 Index", "bid": 5297.889, "ask": 5298.282,
                "is_spike_mode": true, "rsi": 28.0,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "buy");
        assert!(body["confidence"].as_f64().unwrap() >= 0.65);
        assert!(body["reason"].as_array().unwrap().iter().any(|c| c == "Spike"));
    }

    #[tokio::test]
    async fn decision_bid_not_below_ask_is_422() {
        let (router, _) = router();
        let (status, body) = post_json(
            &router,
            "/decision",
            serde_json::json!({ "symbol": "EURUSD", "bid": 1.2, "ask": 1.1 }),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "invalid_snapshot");
        assert_eq!(body["field"], "ask");
    }

    #[tokio::test]
    async fn decision_unknown_timeframe_is_422() {
        let (router, _) = router();
        let (status, _) = post_json(
            &router,
            "/decision",
            serde_json::json!({
                "symbol": "EURUSD", "timeframe": "W1", "bid": 1.08, "ask": 1.0802
            }),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn decision_no_signals_holds() {
        let (router, _) = router();
        let (status, body) = post_json(
            &router,
            "/decision",
            serde_json::json!({ "symbol": "EURUSD", "bid": 1.08, "ask": 1.0802 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "hold");
        assert!((body["confidence"].as_f64().unwrap() - 0.40).abs() < 1e-9);
    }

    #[tokio::test]
    async fn feedback_roundtrip_updates_calibration_and_decisions() {
        let (router, store) = router();

        let (status, body) = post_json(&router, "/feedback", feedback_body("EURUSD", 0.01)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);
        assert_eq!(body["duplicate"], false);
        assert_eq!(store.feedback_count(), 1);

        let key = CalKey::new("EURUSD", Timeframe::M1);
        let cal = store.read_calibration(&key).await.unwrap().unwrap();
        assert_eq!(cal.total, 1);
        assert!(cal.drift_factor > 1.0);
    }

    #[tokio::test]
    async fn duplicate_feedback_is_acknowledged_not_recounted() {
        let (router, store) = router();
        post_json(&router, "/feedback", feedback_body("EURUSD", 0.01)).await;
        let (status, body) = post_json(&router, "/feedback", feedback_body("EURUSD", 0.01)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);
        assert_eq!(body["duplicate"], true);
        assert_eq!(store.feedback_count(), 1);

        let cal = store
            .read_calibration(&CalKey::new("EURUSD", Timeframe::M1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cal.total, 1);
    }

    #[tokio::test]
    async fn feedback_status_aggregates_per_key() {
        let (router, _) = router();
        post_json(&router, "/feedback", feedback_body("EURUSD", 0.01)).await;
        post_json(&router, "/feedback", feedback_body("GBPUSD", -0.02)).await;

        let (status, body) = get_json(&router, "/ml/feedback/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tracked_keys"], 2);
        assert_eq!(body["total_feedback"], 2);
        let symbols = body["symbols"].as_array().unwrap();
        assert!(symbols.iter().any(|s| s["symbol"] == "EURUSD" && s["wins"] == 1));
        assert!(symbols.iter().any(|s| s["symbol"] == "GBPUSD" && s["wins"] == 0));
    }

    #[tokio::test]
    async fn retraining_stats_reflect_sample_threshold() {
        let (router, store) = router();
        post_json(&router, "/feedback", feedback_body("EURUSD", 0.01)).await;

        // One sample out of fifty: not ready.
        let (status, body) = get_json(&router, "/ml/retraining/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready_count"], 0);
        let key = &body["keys"].as_array().unwrap()[0];
        assert_eq!(key["ready"], false);
        assert_eq!(key["samples"], 1);
        assert!(key["last_trained"].is_null());
        let _ = store;
    }

    #[tokio::test]
    async fn retraining_ready_after_enough_samples_and_stale_training() {
        let store = Arc::new(MemoryStore::default());
        let key = CalKey::new("EURUSD", Timeframe::M1);
        store.put_calibration(
            key.clone(),
            crate::calibration::SymbolCalibration {
                wins: 30,
                total: 60,
                drift_factor: 1.1,
                last_updated: Utc::now(),
            },
        );
        store
            .append_metrics(&ModelMetrics {
                symbol: "EURUSD".into(),
                timeframe: Timeframe::M1,
                model_type: "gbm".into(),
                accuracy: 0.6,
                f1_score: 0.55,
                training_samples: 50,
                training_date: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
                feature_importance: serde_json::json!({}),
                metadata: serde_json::json!({}),
            })
            .await
            .unwrap();

        let state = AppState::new(ServiceConfig::default(), store);
        let router = build_router(state);
        let (_, body) = get_json(&router, "/ml/retraining/stats").await;
        assert_eq!(body["ready_count"], 1);
        assert_eq!(body["keys"][0]["ready"], true);
    }

    #[tokio::test]
    async fn health_reports_backend_and_version() {
        let (router, _) = router();
        let (status, body) = get_json(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["backend"], "memory");
        assert!(body["state_version"].is_u64());
    }

    #[tokio::test]
    async fn decisions_ring_exposes_served_decisions() {
        let (router, _) = router();
        post_json(
            &router,
            "/decision",
            serde_json::json!({ "symbol": "EURUSD", "bid": 1.08, "ask": 1.0802 }),
        )
        .await;

        let (status, body) = get_json(&router, "/decisions").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["decisions"][0]["decision"]["symbol"], "EURUSD");
        assert_eq!(body["decisions"][0]["degraded"], false);
    }

    #[tokio::test]
    async fn malformed_feedback_is_rejected() {
        let (router, store) = router();
        let mut body = feedback_body("EURUSD", 0.01);
        // close_time before open_time.
        body["close_time"] = serde_json::json!("2025-06-01T09:00:00Z");
        let (status, response) = post_json(&router, "/feedback", body).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response["field"], "close_time");
        assert_eq!(store.feedback_count(), 0);
    }
}
