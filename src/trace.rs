// =============================================================================
// Prediction Trace Writer — fire-and-forget audit persistence
// =============================================================================
//
// Every served decision leaves a trace for later retraining. The decision
// response never waits on the store: traces go through a bounded queue with
// a hard enqueue deadline (50 ms by default); a full or slow queue drops the
// trace with a warning and a counter bump. A background task drains the
// queue into the store.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::snapshot::MarketSnapshot;
use crate::store::FeedbackStore;
use crate::types::{Action, Timeframe};

/// Queue depth between request handlers and the writer task.
const TRACE_QUEUE_CAPACITY: usize = 256;

/// Append-only audit record of one served decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionTrace {
    pub id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub snapshot_hash: String,
    pub prediction: Action,
    pub confidence: f64,
    pub reason: Vec<String>,
    pub model_used: String,
    pub created_at: DateTime<Utc>,
}

impl PredictionTrace {
    pub fn new(
        snapshot: &MarketSnapshot,
        prediction: Action,
        confidence: f64,
        reason: Vec<String>,
        model_used: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: snapshot.symbol.clone(),
            timeframe: snapshot.timeframe,
            snapshot_hash: snapshot_hash(snapshot),
            prediction,
            confidence,
            reason,
            model_used: model_used.into(),
            created_at: Utc::now(),
        }
    }
}

/// Stable hash of the snapshot for trace correlation.
pub fn snapshot_hash(snapshot: &MarketSnapshot) -> String {
    let canonical = serde_json::to_vec(snapshot).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    hex::encode(&digest[..16])
}

/// Handle held by request handlers; cheap to clone.
#[derive(Clone)]
pub struct TraceWriter {
    tx: mpsc::Sender<PredictionTrace>,
    enqueue_deadline: Duration,
    dropped: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
}

impl TraceWriter {
    /// Spawn the writer task and return the enqueue handle.
    pub fn spawn(store: Arc<dyn FeedbackStore>, enqueue_deadline_ms: u64) -> Self {
        let (tx, mut rx) = mpsc::channel::<PredictionTrace>(TRACE_QUEUE_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        let written = Arc::new(AtomicU64::new(0));

        let written_task = written.clone();
        let dropped_task = dropped.clone();
        tokio::spawn(async move {
            while let Some(trace) = rx.recv().await {
                match store.append_trace(&trace).await {
                    Ok(()) => {
                        written_task.fetch_add(1, Ordering::Relaxed);
                        debug!(id = %trace.id, symbol = %trace.symbol, "trace persisted");
                    }
                    Err(e) => {
                        dropped_task.fetch_add(1, Ordering::Relaxed);
                        warn!(id = %trace.id, error = %e, "trace append failed, dropped");
                    }
                }
            }
        });

        Self {
            tx,
            enqueue_deadline: Duration::from_millis(enqueue_deadline_ms),
            dropped,
            written,
        }
    }

    /// Enqueue within the deadline; drop and count on timeout or full queue.
    pub async fn enqueue(&self, trace: PredictionTrace) {
        let id = trace.id.clone();
        match tokio::time::timeout(self.enqueue_deadline, self.tx.send(trace)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(id = %id, "trace writer gone, trace dropped");
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(id = %id, "trace enqueue deadline exceeded, trace dropped");
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn written_count(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}
