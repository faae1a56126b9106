// =============================================================================
// Application State — shared across all request handlers
// =============================================================================
//
// One Arc<AppState> is built at startup and cloned into the router. Rings
// are bounded so an always-on EA cannot grow memory: the last 100 decision
// envelopes and the last 50 error records are kept for the observability
// endpoints, everything older falls off the back.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::ServiceConfig;
use crate::decision::{DecisionEngine, DecisionEnvelope};
use crate::feedback::FeedbackIngestor;
use crate::store::{CalibrationCache, FeedbackStore};
use crate::trace::TraceWriter;

const DECISION_RING_CAPACITY: usize = 100;
const ERROR_RING_CAPACITY: usize = 50;

/// One entry in the recent-errors ring.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub context: String,
    pub detail: String,
}

pub struct AppState {
    pub config: ServiceConfig,
    pub store: Arc<dyn FeedbackStore>,
    pub cache: Arc<CalibrationCache>,
    pub engine: DecisionEngine,
    pub ingestor: FeedbackIngestor,
    pub traces: TraceWriter,

    recent_decisions: RwLock<VecDeque<DecisionEnvelope>>,
    recent_errors: RwLock<VecDeque<ErrorRecord>>,
    /// Bumped on every state-changing operation; cheap staleness check for
    /// the health endpoint.
    state_version: AtomicU64,
    started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: ServiceConfig, store: Arc<dyn FeedbackStore>) -> Arc<Self> {
        let cache = Arc::new(CalibrationCache::new(&config.cache));
        let traces = TraceWriter::spawn(store.clone(), config.budgets.trace_enqueue_ms);
        let engine = DecisionEngine::new(
            store.clone(),
            cache.clone(),
            traces.clone(),
            &config.budgets,
        );
        let ingestor = FeedbackIngestor::new(store.clone(), cache.clone());

        Arc::new(Self {
            config,
            store,
            cache,
            engine,
            ingestor,
            traces,
            recent_decisions: RwLock::new(VecDeque::with_capacity(DECISION_RING_CAPACITY)),
            recent_errors: RwLock::new(VecDeque::with_capacity(ERROR_RING_CAPACITY)),
            state_version: AtomicU64::new(0),
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
        })
    }

    pub fn push_decision(&self, envelope: DecisionEnvelope) {
        let mut ring = self.recent_decisions.write();
        if ring.len() == DECISION_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(envelope);
        self.bump_version();
    }

    pub fn push_error(&self, context: impl Into<String>, detail: impl Into<String>) {
        let mut ring = self.recent_errors.write();
        if ring.len() == ERROR_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(ErrorRecord {
            at: Utc::now(),
            context: context.into(),
            detail: detail.into(),
        });
        self.bump_version();
    }

    /// Newest first.
    pub fn recent_decisions(&self) -> Vec<DecisionEnvelope> {
        self.recent_decisions.read().iter().rev().cloned().collect()
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().iter().rev().cloned().collect()
    }

    pub fn bump_version(&self) {
        self.state_version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
