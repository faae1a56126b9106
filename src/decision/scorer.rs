// =============================================================================
// Confluence Scorer — multi-timeframe weighted confluence
// =============================================================================
//
// Pure function over a validated snapshot. Each component that fires adds a
// weight to the bull or bear side and pushes a short tag onto the reason
// trace, in a fixed order so identical snapshots always produce identical
// traces.
//
// Timeframe weights: M1=1, M5=2, H1=3, H4=2, D1=1. H4/D1 only contribute
// when the EA supplies their EMA pairs.
// =============================================================================

use serde::Serialize;

use crate::snapshot::MarketSnapshot;
use crate::types::Action;

/// Mutable scoring state threaded through the scorer and the policy rules.
#[derive(Debug, Clone, Serialize)]
pub struct ScoringState {
    pub action: Action,
    pub confidence: f64,
    /// Ordered component tags, preserved for auditability.
    pub components: Vec<String>,
    pub bull_score: f64,
    pub bear_score: f64,
    /// Number of M1/M5/H1 timeframes aligned with `action`, set by the
    /// core-alignment rule. None until that rule has run or while holding.
    pub core_count: Option<u8>,
}

impl ScoringState {
    pub fn tag(&mut self, tag: impl Into<String>) {
        self.components.push(tag.into());
    }
}

/// RSI thresholds. Fixed, not symbol-adaptive.
const RSI_OVERSOLD: f64 = 30.0;
const RSI_OVERBOUGHT: f64 = 70.0;

/// Map the absolute bull/bear score difference to a raw confidence.
fn confidence_for_diff(diff: f64) -> f64 {
    if diff >= 6.0 {
        0.75
    } else if diff >= 4.0 {
        0.65
    } else if diff >= 2.0 {
        0.55
    } else {
        0.40
    }
}

/// Produce the raw `(action, confidence, reason)` tuple from indicators alone.
pub fn score_snapshot(snap: &MarketSnapshot) -> ScoringState {
    let mut state = ScoringState {
        action: Action::Hold,
        confidence: 0.0,
        components: Vec::new(),
        bull_score: 0.0,
        bear_score: 0.0,
        core_count: None,
    };

    // ── Timeframe confluence ────────────────────────────────────────────
    let timeframes: [(&str, bool, bool, f64); 5] = [
        ("M1", snap.m1_bullish(), snap.m1_bearish(), 1.0),
        ("M5", snap.m5_bullish(), snap.m5_bearish(), 2.0),
        ("H1", snap.h1_bullish(), snap.h1_bearish(), 3.0),
        ("H4", snap.h4_bullish(), snap.h4_bearish(), 2.0),
        ("D1", snap.d1_bullish(), snap.d1_bearish(), 1.0),
    ];
    for (name, bullish, bearish, weight) in timeframes {
        if bullish {
            state.bull_score += weight;
            state.tag(format!("{name}↑"));
        } else if bearish {
            state.bear_score += weight;
            state.tag(format!("{name}↓"));
        }
    }

    // ── RSI extremes ────────────────────────────────────────────────────
    if snap.rsi < RSI_OVERSOLD {
        state.bull_score += 1.0;
        state.tag("RSI<30");
    } else if snap.rsi > RSI_OVERBOUGHT {
        state.bear_score += 1.0;
        state.tag("RSI>70");
    }

    // ── SuperTrend ──────────────────────────────────────────────────────
    if snap.supertrend_trend > 0 {
        state.bull_score += 1.0;
        state.tag("ST±");
    } else if snap.supertrend_trend < 0 {
        state.bear_score += 1.0;
        state.tag("ST±");
    }

    // ── Channel slope (sign only) ───────────────────────────────────────
    let ch = snap.channel_sign();
    if ch > 0.0 {
        state.bull_score += 1.0;
        state.tag("ChUp");
    } else if ch < 0.0 {
        state.bear_score += 1.0;
        state.tag("ChDown");
    }

    // ── EA directional rule hint ────────────────────────────────────────
    if snap.dir_rule > 0 {
        state.bull_score += 1.0;
        state.tag("Rule±");
    } else if snap.dir_rule < 0 {
        state.bear_score += 1.0;
        state.tag("Rule±");
    }

    // ── VWAP extra, consulted additively when present ───────────────────
    if let Some(above) = snap.above_vwap {
        if above {
            state.bull_score += 1.0;
            state.tag("VWAP↑");
        } else {
            state.bear_score += 1.0;
            state.tag("VWAP↓");
        }
    }

    // ── Raw action and confidence ───────────────────────────────────────
    let diff = (state.bull_score - state.bear_score).abs();
    state.action = if state.bull_score > state.bear_score {
        Action::Buy
    } else if state.bear_score > state.bull_score {
        Action::Sell
    } else {
        Action::Hold
    };
    state.confidence = confidence_for_diff(diff);

    state
}
