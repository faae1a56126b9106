// =============================================================================
// Feedback Store — durable state behind one capability trait
// =============================================================================
//
// The EA-side SQL fixes the table and column names; every backend speaks the
// same schema:
//
//   symbol_calibration(symbol, timeframe, wins, total, drift_factor,
//                      last_updated, UNIQUE(symbol, timeframe))
//   trade_feedback(symbol, timeframe, side, open_time, close_time,
//                  entry_price, exit_price, profit, ai_confidence,
//                  coherent_confidence, decision, is_win, created_at)
//   predictions(symbol, timeframe, prediction, confidence, reason,
//               model_used, metadata, created_at)
//   model_metrics(symbol, timeframe, model_type, accuracy, f1_score,
//                 training_samples, training_date, feature_importance,
//                 metadata)
//
// Backends: `sql` (Postgres), `rest` (PostgREST gateway), `memory`
// (in-process, local runs and tests). Selected once at startup.
// =============================================================================

pub mod cache;
pub mod memory;
pub mod rest;
pub mod sql;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calibration::SymbolCalibration;
use crate::config::{PersistBackend, ServiceConfig};
use crate::feedback::TradeFeedback;
use crate::trace::PredictionTrace;
use crate::types::{CalKey, Timeframe};

pub use cache::CalibrationCache;
pub use memory::MemoryStore;
pub use rest::RestStore;
pub use sql::SqlStore;

/// Append-only record of one model training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub model_type: String,
    pub accuracy: f64,
    pub f1_score: f64,
    pub training_samples: u32,
    pub training_date: DateTime<Utc>,
    #[serde(default)]
    pub feature_importance: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Capability set every persistence backend implements.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn read_calibration(&self, key: &CalKey) -> Result<Option<SymbolCalibration>>;

    async fn upsert_calibration(&self, key: &CalKey, cal: &SymbolCalibration) -> Result<()>;

    /// Append one trade feedback record. Returns `false` when the record was
    /// a duplicate of an already stored one (no state change).
    async fn append_feedback(&self, feedback: &TradeFeedback) -> Result<bool>;

    /// Number of stored feedback rows for the key. Lets the ingestor detect
    /// a calibration row lagging behind committed feedback.
    async fn count_feedback(&self, key: &CalKey) -> Result<u64>;

    async fn append_trace(&self, trace: &PredictionTrace) -> Result<()>;

    async fn append_metrics(&self, metrics: &ModelMetrics) -> Result<()>;

    /// All calibration rows, for the status endpoints.
    async fn read_all_calibrations(&self) -> Result<Vec<(CalKey, SymbolCalibration)>>;

    /// Newest recorded training for the key, if any. Drives retraining
    /// readiness.
    async fn latest_training_date(&self, key: &CalKey) -> Result<Option<DateTime<Utc>>>;
}

/// Construct the backend selected by the configuration.
pub async fn build_store(config: &ServiceConfig) -> Result<Arc<dyn FeedbackStore>> {
    match config.backend {
        PersistBackend::Sql => {
            let url = config
                .database_url
                .as_deref()
                .context("backend=sql requires DATABASE_URL")?;
            let store = SqlStore::connect(url, config.cache.max_concurrent).await?;
            Ok(Arc::new(store))
        }
        PersistBackend::Rest => {
            let url = config
                .rest_url
                .as_deref()
                .context("backend=rest requires SUPABASE_URL")?;
            let key = config
                .rest_key
                .as_deref()
                .context("backend=rest requires SUPABASE_KEY")?;
            Ok(Arc::new(RestStore::new(url, key)?))
        }
        PersistBackend::Memory => Ok(Arc::new(MemoryStore::default())),
    }
}
