// =============================================================================
// Market Snapshot — the EA's per-tick request, validated
// =============================================================================
//
// The EA sends a permissive JSON object once per tick. Missing optional
// fields fall back to neutral defaults; unknown extra fields are ignored so
// newer EA builds can ship fields before the server understands them.
//
// A snapshot lives only for the duration of one request.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::types::{Action, Timeframe};

fn default_rsi() -> f64 {
    50.0
}

fn default_volatility_ratio() -> f64 {
    1.0
}

/// Per-tick market microstructure snapshot from the EA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,

    #[serde(default)]
    pub timeframe: Timeframe,

    pub bid: f64,
    pub ask: f64,

    #[serde(default = "default_rsi")]
    pub rsi: f64,
    #[serde(default)]
    pub atr: f64,

    // EMA pairs per timeframe. A missing pair disables that timeframe's
    // contribution to the confluence score.
    #[serde(default)]
    pub ema_fast_m1: Option<f64>,
    #[serde(default)]
    pub ema_slow_m1: Option<f64>,
    #[serde(default)]
    pub ema_fast_m5: Option<f64>,
    #[serde(default)]
    pub ema_slow_m5: Option<f64>,
    #[serde(default)]
    pub ema_fast_h1: Option<f64>,
    #[serde(default)]
    pub ema_slow_h1: Option<f64>,
    #[serde(default)]
    pub ema_fast_h4: Option<f64>,
    #[serde(default)]
    pub ema_slow_h4: Option<f64>,
    #[serde(default)]
    pub ema_fast_d1: Option<f64>,
    #[serde(default)]
    pub ema_slow_d1: Option<f64>,

    /// EA-side flag: the symbol is in a Boom/Crash spike regime.
    #[serde(default)]
    pub is_spike_mode: bool,

    /// EA-side directional hint: -1, 0, +1.
    #[serde(default)]
    pub dir_rule: i8,

    /// SuperTrend direction: -1, 0, +1.
    #[serde(default)]
    pub supertrend_trend: i8,

    /// 0 = normal, 1 = elevated, 2 = extreme.
    #[serde(default)]
    pub volatility_regime: u8,

    #[serde(default = "default_volatility_ratio")]
    pub volatility_ratio: f64,

    /// Normalized slope of a short regression over recent M5 closes,
    /// pre-computed by the EA. Only the sign participates in the core rules.
    #[serde(default)]
    pub channel_slope: Option<f64>,

    // Short-window real-time movement indicator, when the EA supplies it.
    #[serde(default)]
    pub rt_strength: Option<f64>,
    #[serde(default)]
    pub rt_trend_consistent: Option<bool>,

    // Optional extras, consulted additively when present.
    #[serde(default)]
    pub vwap: Option<f64>,
    #[serde(default)]
    pub vwap_distance: Option<f64>,
    #[serde(default)]
    pub above_vwap: Option<bool>,
    #[serde(default)]
    pub pattern: Option<String>,
}

impl MarketSnapshot {
    /// Fail fast on structural errors. Anything else is coerced or defaulted.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.symbol.trim().is_empty() {
            return Err(ServiceError::InvalidSnapshot {
                field: "symbol",
                message: "must not be empty".into(),
            });
        }
        if !self.bid.is_finite() || self.bid <= 0.0 {
            return Err(ServiceError::InvalidSnapshot {
                field: "bid",
                message: format!("must be strictly positive, got {}", self.bid),
            });
        }
        if !self.ask.is_finite() || self.ask <= 0.0 {
            return Err(ServiceError::InvalidSnapshot {
                field: "ask",
                message: format!("must be strictly positive, got {}", self.ask),
            });
        }
        if self.bid >= self.ask {
            return Err(ServiceError::InvalidSnapshot {
                field: "ask",
                message: format!("bid {} must be below ask {}", self.bid, self.ask),
            });
        }
        Ok(())
    }

    fn pair_bullish(fast: Option<f64>, slow: Option<f64>) -> bool {
        matches!((fast, slow), (Some(f), Some(s)) if f > s)
    }

    fn pair_bearish(fast: Option<f64>, slow: Option<f64>) -> bool {
        matches!((fast, slow), (Some(f), Some(s)) if f < s)
    }

    pub fn m1_bullish(&self) -> bool {
        Self::pair_bullish(self.ema_fast_m1, self.ema_slow_m1)
    }
    pub fn m1_bearish(&self) -> bool {
        Self::pair_bearish(self.ema_fast_m1, self.ema_slow_m1)
    }
    pub fn m5_bullish(&self) -> bool {
        Self::pair_bullish(self.ema_fast_m5, self.ema_slow_m5)
    }
    pub fn m5_bearish(&self) -> bool {
        Self::pair_bearish(self.ema_fast_m5, self.ema_slow_m5)
    }
    pub fn h1_bullish(&self) -> bool {
        Self::pair_bullish(self.ema_fast_h1, self.ema_slow_h1)
    }
    pub fn h1_bearish(&self) -> bool {
        Self::pair_bearish(self.ema_fast_h1, self.ema_slow_h1)
    }
    pub fn h4_bullish(&self) -> bool {
        Self::pair_bullish(self.ema_fast_h4, self.ema_slow_h4)
    }
    pub fn h4_bearish(&self) -> bool {
        Self::pair_bearish(self.ema_fast_h4, self.ema_slow_h4)
    }
    pub fn d1_bullish(&self) -> bool {
        Self::pair_bullish(self.ema_fast_d1, self.ema_slow_d1)
    }
    pub fn d1_bearish(&self) -> bool {
        Self::pair_bearish(self.ema_fast_d1, self.ema_slow_d1)
    }

    /// Channel slope sign, zero when absent.
    pub fn channel_sign(&self) -> f64 {
        match self.channel_slope {
            Some(s) if s > 0.0 => 1.0,
            Some(s) if s < 0.0 => -1.0,
            _ => 0.0,
        }
    }

    /// Natural spike direction for Boom/Crash synthetic indices: Boom spikes
    /// up, Crash spikes down. Other symbols have none.
    pub fn spike_direction(&self) -> Option<Action> {
        let lower = self.symbol.to_lowercase();
        if lower.contains("boom") {
            Some(Action::Buy)
        } else if lower.contains("crash") {
            Some(Action::Sell)
        } else {
            None
        }
    }
}
