// =============================================================================
// Feedback Ingestor — idempotent closed-trade ingestion + recalibration
// =============================================================================
//
// On each closed trade the EA reports the outcome. Ingestion is serialized
// per (symbol, timeframe) so the calibration read-modify-write never tears;
// across keys there is no ordering guarantee. Duplicates are detected on
// (symbol, open_time, close_time, entry_price, exit_price) and do not
// double-count.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::calibration::{self, SymbolCalibration};
use crate::error::ServiceError;
use crate::store::{CalibrationCache, FeedbackStore};
use crate::types::{CalKey, Side, Timeframe};

/// Closed-trade outcome reported by the EA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeFeedback {
    pub symbol: String,
    #[serde(default)]
    pub timeframe: Timeframe,
    pub side: Side,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub profit: f64,
    #[serde(default)]
    pub ai_confidence: Option<f64>,
    #[serde(default)]
    pub coherent_confidence: Option<f64>,
    #[serde(default)]
    pub decision: Option<String>,
}

impl TradeFeedback {
    pub fn is_win(&self) -> bool {
        self.profit > 0.0
    }

    pub fn key(&self) -> CalKey {
        CalKey::new(self.symbol.clone(), self.timeframe)
    }

    /// Identity under which duplicates are collapsed. Prices are compared
    /// bit-exact; the EA resends the same payload on retry.
    pub fn dedup_key(&self) -> (String, i64, i64, u64, u64) {
        (
            self.symbol.clone(),
            self.open_time.timestamp_millis(),
            self.close_time.timestamp_millis(),
            self.entry_price.to_bits(),
            self.exit_price.to_bits(),
        )
    }
}

/// Outcome of one ingestion.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IngestResult {
    pub accepted: bool,
    pub duplicate: bool,
}

/// Serializes feedback per key and keeps the calibration cache honest.
pub struct FeedbackIngestor {
    store: Arc<dyn FeedbackStore>,
    cache: Arc<CalibrationCache>,
    /// Per-key async mutexes. The outer lock only guards the map itself.
    key_locks: SyncMutex<HashMap<CalKey, Arc<Mutex<()>>>>,
}

impl FeedbackIngestor {
    pub fn new(store: Arc<dyn FeedbackStore>, cache: Arc<CalibrationCache>) -> Self {
        Self {
            store,
            cache,
            key_locks: SyncMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &CalKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock();
        locks.entry(key.clone()).or_default().clone()
    }

    /// Validate, append with dedup, recompute calibration.
    pub async fn ingest(&self, feedback: TradeFeedback) -> Result<IngestResult, ServiceError> {
        if feedback.symbol.trim().is_empty() {
            return Err(ServiceError::InvalidSnapshot {
                field: "symbol",
                message: "must not be empty".into(),
            });
        }
        if feedback.close_time < feedback.open_time {
            return Err(ServiceError::InvalidSnapshot {
                field: "close_time",
                message: "must not precede open_time".into(),
            });
        }

        let key = feedback.key();
        let per_key = self.lock_for(&key);
        let _guard = per_key.lock().await;

        let inserted = self
            .store
            .append_feedback(&feedback)
            .await
            .map_err(|e| ServiceError::persistence("append_feedback", e))?;

        if !inserted {
            // A duplicate can be the retry of an ingest whose calibration
            // write failed after the feedback row was committed. Fold the
            // resent outcome in when the calibration row lags the store.
            self.heal_if_lagging(&key, &feedback).await?;
            debug!(key = %key, "duplicate feedback ignored");
            return Ok(IngestResult {
                accepted: true,
                duplicate: true,
            });
        }

        // Read-modify-write of the calibration row, still under the key lock.
        let mut cal = self
            .store
            .read_calibration(&key)
            .await
            .map_err(|e| ServiceError::persistence("read_calibration", e))?
            .unwrap_or_default();

        calibration::apply_feedback(&mut cal, feedback.is_win(), Utc::now());

        if cal.wins > cal.total {
            return Err(ServiceError::Internal(anyhow!(
                "calibration invariant violated for {key}: wins {} > total {}",
                cal.wins,
                cal.total
            )));
        }

        self.store
            .upsert_calibration(&key, &cal)
            .await
            .map_err(|e| ServiceError::persistence("upsert_calibration", e))?;

        self.cache.invalidate(&key);

        info!(
            key = %key,
            is_win = feedback.is_win(),
            total = cal.total,
            wins = cal.wins,
            drift_factor = cal.drift_factor,
            "feedback ingested"
        );

        Ok(IngestResult {
            accepted: true,
            duplicate: false,
        })
    }

    /// Recover a calibration update that was lost between a committed
    /// feedback insert and a failed calibration write. Runs under the
    /// per-key lock held by `ingest`.
    async fn heal_if_lagging(
        &self,
        key: &CalKey,
        feedback: &TradeFeedback,
    ) -> Result<(), ServiceError> {
        let stored = self
            .store
            .count_feedback(key)
            .await
            .map_err(|e| ServiceError::persistence("count_feedback", e))?;
        let mut cal = self
            .store
            .read_calibration(key)
            .await
            .map_err(|e| ServiceError::persistence("read_calibration", e))?
            .unwrap_or_default();
        if u64::from(cal.total) >= stored {
            return Ok(());
        }

        calibration::apply_feedback(&mut cal, feedback.is_win(), Utc::now());
        self.store
            .upsert_calibration(key, &cal)
            .await
            .map_err(|e| ServiceError::persistence("upsert_calibration", e))?;
        self.cache.invalidate(key);

        info!(
            key = %key,
            total = cal.total,
            stored_feedback = stored,
            "calibration healed after earlier failed update"
        );
        Ok(())
    }

    /// Calibration row for one key, bypassing the cache (status endpoints).
    pub async fn calibration(&self, key: &CalKey) -> Result<Option<SymbolCalibration>, ServiceError> {
        self.store
            .read_calibration(key)
            .await
            .map_err(|e| ServiceError::persistence("read_calibration", e))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn ingestor() -> (FeedbackIngestor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let cache = Arc::new(CalibrationCache::new(&CacheConfig::default()));
        (
            FeedbackIngestor::new(store.clone(), cache),
            store,
        )
    }

    fn feedback(symbol: &str, profit: f64) -> TradeFeedback {
        TradeFeedback {
            symbol: symbol.to_string(),
            timeframe: Timeframe::M1,
            side: Side::Buy,
            open_time: Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(),
            close_time: Utc.with_ymd_and_hms(2025, 6, 1, 10, 30, 0).unwrap(),
            entry_price: 1.08,
            exit_price: 1.09,
            profit,
            ai_confidence: Some(0.8),
            coherent_confidence: Some(0.85),
            decision: Some("buy".to_string()),
        }
    }

    #[tokio::test]
    async fn ingest_updates_calibration() {
        let (ing, store) = ingestor();
        let result = ing.ingest(feedback("EURUSD", 0.01)).await.unwrap();
        assert!(result.accepted);
        assert!(!result.duplicate);

        let key = CalKey::new("EURUSD", Timeframe::M1);
        let cal = store.read_calibration(&key).await.unwrap().unwrap();
        assert_eq!(cal.total, 1);
        assert_eq!(cal.wins, 1);
        assert!(cal.drift_factor > 1.0);
    }

    #[tokio::test]
    async fn duplicate_feedback_does_not_double_count() {
        let (ing, store) = ingestor();
        let first = ing.ingest(feedback("EURUSD", 0.01)).await.unwrap();
        assert!(!first.duplicate);
        let second = ing.ingest(feedback("EURUSD", 0.01)).await.unwrap();
        assert!(second.accepted);
        assert!(second.duplicate);

        let key = CalKey::new("EURUSD", Timeframe::M1);
        let cal = store.read_calibration(&key).await.unwrap().unwrap();
        assert_eq!(cal.total, 1);
        assert_eq!(cal.wins, 1);
    }

    #[tokio::test]
    async fn loss_counts_total_but_not_wins() {
        let (ing, store) = ingestor();
        ing.ingest(feedback("EURUSD", -0.02)).await.unwrap();

        let key = CalKey::new("EURUSD", Timeframe::M1);
        let cal = store.read_calibration(&key).await.unwrap().unwrap();
        assert_eq!(cal.total, 1);
        assert_eq!(cal.wins, 0);
        assert!(cal.drift_factor < 1.0);
    }

    #[tokio::test]
    async fn zero_profit_is_not_a_win() {
        let (ing, store) = ingestor();
        ing.ingest(feedback("EURUSD", 0.0)).await.unwrap();
        let key = CalKey::new("EURUSD", Timeframe::M1);
        let cal = store.read_calibration(&key).await.unwrap().unwrap();
        assert_eq!(cal.wins, 0);
    }

    #[tokio::test]
    async fn empty_symbol_rejected() {
        let (ing, _) = ingestor();
        let result = ing.ingest(feedback("  ", 0.01)).await;
        assert!(matches!(
            result,
            Err(ServiceError::InvalidSnapshot { field: "symbol", .. })
        ));
    }

    #[tokio::test]
    async fn close_before_open_rejected() {
        let (ing, _) = ingestor();
        let mut fb = feedback("EURUSD", 0.01);
        std::mem::swap(&mut fb.open_time, &mut fb.close_time);
        assert!(ing.ingest(fb).await.is_err());
    }

    /// Fails the first calibration upsert, then behaves normally.
    struct FlakyUpsertStore {
        inner: MemoryStore,
        fail_next_upsert: SyncMutex<bool>,
    }

    impl FlakyUpsertStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::default(),
                fail_next_upsert: SyncMutex::new(true),
            }
        }
    }

    #[async_trait::async_trait]
    impl FeedbackStore for FlakyUpsertStore {
        async fn read_calibration(
            &self,
            key: &CalKey,
        ) -> anyhow::Result<Option<SymbolCalibration>> {
            self.inner.read_calibration(key).await
        }
        async fn upsert_calibration(
            &self,
            key: &CalKey,
            cal: &SymbolCalibration,
        ) -> anyhow::Result<()> {
            if std::mem::take(&mut *self.fail_next_upsert.lock()) {
                anyhow::bail!("connection reset");
            }
            self.inner.upsert_calibration(key, cal).await
        }
        async fn append_feedback(&self, feedback: &TradeFeedback) -> anyhow::Result<bool> {
            self.inner.append_feedback(feedback).await
        }
        async fn count_feedback(&self, key: &CalKey) -> anyhow::Result<u64> {
            self.inner.count_feedback(key).await
        }
        async fn append_trace(
            &self,
            trace: &crate::trace::PredictionTrace,
        ) -> anyhow::Result<()> {
            self.inner.append_trace(trace).await
        }
        async fn append_metrics(
            &self,
            metrics: &crate::store::ModelMetrics,
        ) -> anyhow::Result<()> {
            self.inner.append_metrics(metrics).await
        }
        async fn read_all_calibrations(
            &self,
        ) -> anyhow::Result<Vec<(CalKey, SymbolCalibration)>> {
            self.inner.read_all_calibrations().await
        }
        async fn latest_training_date(
            &self,
            key: &CalKey,
        ) -> anyhow::Result<Option<DateTime<Utc>>> {
            self.inner.latest_training_date(key).await
        }
    }

    #[tokio::test]
    async fn retry_after_failed_calibration_write_recovers_the_update() {
        let store = Arc::new(FlakyUpsertStore::new());
        let cache = Arc::new(CalibrationCache::new(&CacheConfig::default()));
        let ing = FeedbackIngestor::new(store.clone(), cache);

        // First attempt commits the feedback row, then the calibration
        // write fails and the EA sees a 5xx.
        let first = ing.ingest(feedback("EURUSD", 0.01)).await;
        assert!(matches!(first, Err(ServiceError::Persistence { .. })));

        // The EA retries the same payload: dedup fires, and the lost
        // calibration contribution is folded in before acknowledging.
        let retry = ing.ingest(feedback("EURUSD", 0.01)).await.unwrap();
        assert!(retry.accepted);
        assert!(retry.duplicate);

        let key = CalKey::new("EURUSD", Timeframe::M1);
        let cal = store.read_calibration(&key).await.unwrap().unwrap();
        assert_eq!(cal.total, 1);
        assert_eq!(cal.wins, 1);
        assert!(cal.drift_factor > 1.0);
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let (ing, store) = ingestor();
        ing.ingest(feedback("EURUSD", 0.01)).await.unwrap();
        let mut other = feedback("GBPUSD", -0.01);
        other.timeframe = Timeframe::M5;
        ing.ingest(other).await.unwrap();

        let eur = store
            .read_calibration(&CalKey::new("EURUSD", Timeframe::M1))
            .await
            .unwrap()
            .unwrap();
        let gbp = store
            .read_calibration(&CalKey::new("GBPUSD", Timeframe::M5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(eur.total, 1);
        assert_eq!(gbp.total, 1);
        assert!(eur.drift_factor > 1.0);
        assert!(gbp.drift_factor < 1.0);
    }
}
