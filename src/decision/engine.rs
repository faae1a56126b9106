// =============================================================================
// Decision Engine — one snapshot in, one decision out
// =============================================================================
//
// Orchestrates the per-request pipeline: validate, score, apply policy
// rules, multiply in the drift factor, enqueue the audit trace. Scoring and
// rules never touch the store; the only store interaction on this path is
// the calibration read, behind the cache and a hard sub-budget. A slow or
// failing calibration read degrades to a neutral drift factor and the
// decision is still served.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::calibration::{self, DRIFT_NEUTRAL};
use crate::config::Budgets;
use crate::decision::{score_snapshot, PolicyOverrider};
use crate::error::ServiceError;
use crate::snapshot::MarketSnapshot;
use crate::store::{CalibrationCache, FeedbackStore};
use crate::trace::{PredictionTrace, TraceWriter};
use crate::types::{Action, CalKey, Timeframe};

/// Model identifier recorded on every trace and decision.
pub const MODEL_NAME: &str = "confluence-v1";

/// Wire response for POST /decision. Exactly what the EA parses.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub action: Action,
    pub confidence: f64,
    /// Ordered component tags, e.g. ["M5↑","H1↑","CoreB:2/3"].
    pub reason: Vec<String>,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    /// Served when the pipeline cannot complete within its budget. Holding
    /// is always safe; the EA treats it as "do nothing this tick".
    pub fn degraded(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            action: Action::Hold,
            confidence: 0.40,
            reason: vec!["degraded".to_string()],
            symbol: symbol.into(),
            timeframe,
            timestamp: Utc::now(),
        }
    }
}

/// Decision plus the context the ring buffer and status endpoints expose.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionEnvelope {
    pub id: String,
    pub decision: Decision,
    pub drift_factor: f64,
    /// True when the calibration read timed out or failed and the neutral
    /// drift factor was substituted.
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
}

pub struct DecisionEngine {
    store: Arc<dyn FeedbackStore>,
    cache: Arc<CalibrationCache>,
    overrider: PolicyOverrider,
    traces: TraceWriter,
    calibration_read_budget: Duration,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<dyn FeedbackStore>,
        cache: Arc<CalibrationCache>,
        traces: TraceWriter,
        budgets: &Budgets,
    ) -> Self {
        Self {
            store,
            cache,
            overrider: PolicyOverrider::default(),
            traces,
            calibration_read_budget: Duration::from_millis(budgets.calibration_read_ms),
        }
    }

    /// Run the full pipeline for one snapshot.
    pub async fn decide(&self, snapshot: &MarketSnapshot) -> Result<DecisionEnvelope, ServiceError> {
        snapshot.validate()?;

        let mut state = score_snapshot(snapshot);
        self.overrider.apply(snapshot, &mut state);

        let key = CalKey::new(snapshot.symbol.clone(), snapshot.timeframe);
        let (drift_factor, degraded) = self.read_drift(&key).await;
        let confidence = calibration::apply_drift(state.confidence, drift_factor);

        let trace = PredictionTrace::new(
            snapshot,
            state.action,
            confidence,
            state.components.clone(),
            MODEL_NAME,
        );
        let trace_id = trace.id.clone();
        self.traces.enqueue(trace).await;

        let decision = Decision {
            action: state.action,
            confidence,
            reason: state.components,
            symbol: snapshot.symbol.clone(),
            timeframe: snapshot.timeframe,
            timestamp: Utc::now(),
        };

        info!(
            symbol = %decision.symbol,
            timeframe = %decision.timeframe,
            action = %decision.action,
            confidence = decision.confidence,
            drift_factor,
            degraded,
            "decision served"
        );

        Ok(DecisionEnvelope {
            id: trace_id,
            decision,
            drift_factor,
            degraded,
            created_at: Utc::now(),
        })
    }

    /// Drift factor for the key: cache first, then the store under the
    /// sub-budget. Timeouts and store errors fall back to neutral and mark
    /// the decision degraded; a missing row is simply neutral.
    async fn read_drift(&self, key: &CalKey) -> (f64, bool) {
        if let Some(cal) = self.cache.get(key) {
            return (cal.drift_factor, false);
        }

        match tokio::time::timeout(self.calibration_read_budget, self.store.read_calibration(key))
            .await
        {
            Ok(Ok(Some(cal))) => {
                let drift = cal.drift_factor;
                self.cache.insert(key.clone(), cal);
                (drift, false)
            }
            Ok(Ok(None)) => (DRIFT_NEUTRAL, false),
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "calibration read failed, using neutral drift");
                (DRIFT_NEUTRAL, true)
            }
            Err(_) => {
                warn!(key = %key, "calibration read exceeded budget, using neutral drift");
                (DRIFT_NEUTRAL, true)
            }
        }
    }
}
