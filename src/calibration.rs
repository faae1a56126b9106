// =============================================================================
// Calibration Engine — per (symbol, timeframe) drift factor from feedback
// =============================================================================
//
// Stateless over the persisted calibration row. Each closed trade nudges an
// EWMA of win outcomes (half-life 50 trades); the drift factor is that EWMA
// re-centered on the 0.5 baseline and clamped to [0.5, 1.5]. With no
// feedback the factor sits at 1.0 and decisions pass through unchanged.
//
// The EWMA itself is not a column in the fixed calibration table; it is
// recovered from the stored drift factor (`ewma = drift_factor - 0.5`),
// which loses a little history at the clamp boundaries.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::MAX_CONF;

/// EWMA half-life in trades.
const HALF_LIFE_TRADES: f64 = 50.0;

pub const DRIFT_MIN: f64 = 0.5;
pub const DRIFT_MAX: f64 = 1.5;
pub const DRIFT_NEUTRAL: f64 = 1.0;

/// Persisted calibration row for one `(symbol, timeframe)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolCalibration {
    pub wins: u32,
    pub total: u32,
    pub drift_factor: f64,
    pub last_updated: DateTime<Utc>,
}

impl Default for SymbolCalibration {
    fn default() -> Self {
        Self {
            wins: 0,
            total: 0,
            drift_factor: DRIFT_NEUTRAL,
            last_updated: Utc::now(),
        }
    }
}

impl SymbolCalibration {
    pub fn win_rate(&self) -> Option<f64> {
        if self.total > 0 {
            Some(f64::from(self.wins) / f64::from(self.total))
        } else {
            None
        }
    }
}

/// Per-trade EWMA smoothing factor for the configured half-life.
fn ewma_alpha() -> f64 {
    1.0 - 0.5_f64.powf(1.0 / HALF_LIFE_TRADES)
}

/// Fold one trade outcome into the calibration row.
pub fn apply_feedback(cal: &mut SymbolCalibration, is_win: bool, now: DateTime<Utc>) {
    cal.total = cal.total.saturating_add(1);
    if is_win {
        cal.wins = cal.wins.saturating_add(1);
    }

    // Recover the EWMA from the stored drift factor; baseline is 0.5.
    let prev = (cal.drift_factor - 0.5).clamp(0.0, 1.0);
    let outcome = if is_win { 1.0 } else { 0.0 };
    let alpha = ewma_alpha();
    let ewma = prev + alpha * (outcome - prev);

    cal.drift_factor = (DRIFT_NEUTRAL + (ewma - 0.5)).clamp(DRIFT_MIN, DRIFT_MAX);
    cal.last_updated = now;
}

/// Last multiplicative correction on the final confidence.
pub fn apply_drift(confidence: f64, drift_factor: f64) -> f64 {
    (confidence * drift_factor).clamp(0.0, MAX_CONF)
}

/// Retraining readiness for one key. `last_trained` is the newest recorded
/// model training for the key, if any.
pub fn ready_for_retraining(
    cal: &SymbolCalibration,
    last_trained: Option<DateTime<Utc>>,
    min_samples: u32,
    retrain_interval_days: i64,
    now: DateTime<Utc>,
) -> bool {
    if cal.total < min_samples {
        return false;
    }
    match last_trained {
        Some(trained) => now - trained >= Duration::days(retrain_interval_days),
        None => true,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_row_is_neutral() {
        let cal = SymbolCalibration::default();
        assert_eq!(cal.total, 0);
        assert_eq!(cal.wins, 0);
        assert!((cal.drift_factor - 1.0).abs() < f64::EPSILON);
        assert!(cal.win_rate().is_none());
    }

    #[test]
    fn wins_never_exceed_total() {
        let mut cal = SymbolCalibration::default();
        let now = Utc::now();
        for i in 0..200 {
            apply_feedback(&mut cal, i % 3 != 0, now);
            assert!(cal.wins <= cal.total);
        }
        assert_eq!(cal.total, 200);
    }

    #[test]
    fn drift_stays_bounded() {
        let mut cal = SymbolCalibration::default();
        let now = Utc::now();
        for _ in 0..500 {
            apply_feedback(&mut cal, true, now);
            assert!(cal.drift_factor >= DRIFT_MIN && cal.drift_factor <= DRIFT_MAX);
        }
        // All wins: EWMA converges toward 1.0, drift toward 1.5.
        assert!(cal.drift_factor > 1.4);

        let mut cal = SymbolCalibration::default();
        for _ in 0..500 {
            apply_feedback(&mut cal, false, now);
            assert!(cal.drift_factor >= DRIFT_MIN && cal.drift_factor <= DRIFT_MAX);
        }
        assert!(cal.drift_factor < 0.6);
    }

    #[test]
    fn single_trade_moves_drift_by_alpha() {
        let mut cal = SymbolCalibration::default();
        let now = Utc::now();
        apply_feedback(&mut cal, true, now);
        // prev ewma 0.5, outcome 1.0: ewma = 0.5 + alpha * 0.5.
        let alpha = 1.0 - 0.5_f64.powf(1.0 / 50.0);
        let expected = 1.0 + alpha * 0.5;
        assert!((cal.drift_factor - expected).abs() < 1e-12);
    }

    #[test]
    fn balanced_outcomes_hover_near_neutral() {
        let mut cal = SymbolCalibration::default();
        let now = Utc::now();
        for i in 0..200 {
            apply_feedback(&mut cal, i % 2 == 0, now);
        }
        assert!((cal.drift_factor - 1.0).abs() < 0.05);
    }

    #[test]
    fn apply_drift_clamps_to_max_conf() {
        assert!((apply_drift(0.90, 1.20) - 0.95).abs() < 1e-12);
        assert!((apply_drift(0.55, 1.0) - 0.55).abs() < 1e-12);
        assert!((apply_drift(0.40, 0.5) - 0.20).abs() < 1e-12);
        assert_eq!(apply_drift(0.0, 1.5), 0.0);
    }

    #[test]
    fn readiness_requires_samples_and_elapsed_interval() {
        let now = Utc::now();
        let mut cal = SymbolCalibration::default();
        assert!(!ready_for_retraining(&cal, None, 50, 1, now));

        cal.total = 50;
        cal.wins = 25;
        assert!(ready_for_retraining(&cal, None, 50, 1, now));

        let recent = now - Duration::hours(2);
        assert!(!ready_for_retraining(&cal, Some(recent), 50, 1, now));

        let stale = now - Duration::days(2);
        assert!(ready_for_retraining(&cal, Some(stale), 50, 1, now));
    }

    #[test]
    fn win_rate_matches_counts() {
        let mut cal = SymbolCalibration::default();
        let now = Utc::now();
        for i in 0..40 {
            apply_feedback(&mut cal, i < 30, now);
        }
        assert!((cal.win_rate().unwrap() - 0.75).abs() < 1e-12);
    }
}
