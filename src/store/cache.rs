// =============================================================================
// Calibration Cache — bounded LRU with TTL
// =============================================================================
//
// The EA may poll every second per symbol; this cache absorbs those read
// bursts so the store sees at most one calibration read per key per TTL.
// Entries are invalidated eagerly when feedback lands for the key.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::calibration::SymbolCalibration;
use crate::config::CacheConfig;
use crate::types::CalKey;

struct Entry {
    cal: SymbolCalibration,
    inserted: Instant,
    last_access: Instant,
}

pub struct CalibrationCache {
    capacity: usize,
    ttl: Duration,
    entries: RwLock<HashMap<CalKey, Entry>>,
}

impl CalibrationCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            ttl: Duration::from_secs(config.ttl_seconds),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh entry for the key, or None when absent/expired.
    pub fn get(&self, key: &CalKey) -> Option<SymbolCalibration> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.inserted) < self.ttl => {
                entry.last_access = now;
                Some(entry.cal.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: CalKey, cal: SymbolCalibration) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            // Evict the least recently used entry.
            if let Some(lru_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&lru_key);
            }
        }
        entries.insert(
            key,
            Entry {
                cal,
                inserted: now,
                last_access: now,
            },
        );
    }

    pub fn invalidate(&self, key: &CalKey) {
        self.entries.write().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
