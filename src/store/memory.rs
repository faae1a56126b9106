// =============================================================================
// In-Memory Store — local runs and tests
// =============================================================================
//
// Same contract as the durable backends, no persistence across restarts.
// Useful for running the service next to the MT5 terminal without a database
// and as the substrate for the router-level tests.
// =============================================================================

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::calibration::SymbolCalibration;
use crate::feedback::TradeFeedback;
use crate::store::{FeedbackStore, ModelMetrics};
use crate::trace::PredictionTrace;
use crate::types::CalKey;

#[derive(Default)]
pub struct MemoryStore {
    calibrations: RwLock<HashMap<CalKey, SymbolCalibration>>,
    feedback: RwLock<Vec<TradeFeedback>>,
    seen_feedback: RwLock<HashSet<(String, i64, i64, u64, u64)>>,
    traces: RwLock<Vec<PredictionTrace>>,
    metrics: RwLock<Vec<ModelMetrics>>,
}

impl MemoryStore {
    pub fn trace_count(&self) -> usize {
        self.traces.read().len()
    }

    pub fn feedback_count(&self) -> usize {
        self.feedback.read().len()
    }

    pub fn metrics_count(&self) -> usize {
        self.metrics.read().len()
    }

    /// Seed a calibration row (tests).
    pub fn put_calibration(&self, key: CalKey, cal: SymbolCalibration) {
        self.calibrations.write().insert(key, cal);
    }
}

#[async_trait]
impl FeedbackStore for MemoryStore {
    async fn read_calibration(&self, key: &CalKey) -> Result<Option<SymbolCalibration>> {
        Ok(self.calibrations.read().get(key).cloned())
    }

    async fn upsert_calibration(&self, key: &CalKey, cal: &SymbolCalibration) -> Result<()> {
        self.calibrations.write().insert(key.clone(), cal.clone());
        Ok(())
    }

    async fn append_feedback(&self, feedback: &TradeFeedback) -> Result<bool> {
        let dedup = feedback.dedup_key();
        {
            let mut seen = self.seen_feedback.write();
            if !seen.insert(dedup) {
                return Ok(false);
            }
        }
        self.feedback.write().push(feedback.clone());
        Ok(true)
    }

    async fn count_feedback(&self, key: &CalKey) -> Result<u64> {
        Ok(self
            .feedback
            .read()
            .iter()
            .filter(|f| f.symbol == key.symbol && f.timeframe == key.timeframe)
            .count() as u64)
    }

    async fn append_trace(&self, trace: &PredictionTrace) -> Result<()> {
        self.traces.write().push(trace.clone());
        Ok(())
    }

    async fn append_metrics(&self, metrics: &ModelMetrics) -> Result<()> {
        self.metrics.write().push(metrics.clone());
        Ok(())
    }

    async fn read_all_calibrations(&self) -> Result<Vec<(CalKey, SymbolCalibration)>> {
        Ok(self
            .calibrations
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn latest_training_date(&self, key: &CalKey) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .metrics
            .read()
            .iter()
            .filter(|m| m.symbol == key.symbol && m.timeframe == key.timeframe)
            .map(|m| m.training_date)
            .max())
    }
}
