// =============================================================================
// Policy Overrider — ordered domain rules on top of the confluence score
// =============================================================================
//
// Domain rules that cannot be expressed as linear score contributions. Each
// rule is a named pure function over the scoring state; the overrider runs
// them in a fixed sequence. New rules are added by appending to the list,
// never by patching an existing rule.
//
// A rule may raise confidence but never lowers it unless it also changes the
// action (the volatility damper is the one sanctioned exception, and it
// downgrades to hold when it cuts too deep).
// =============================================================================

use crate::decision::scorer::ScoringState;
use crate::decision::MAX_CONF;
use crate::snapshot::MarketSnapshot;
use crate::types::Action;

type RuleFn = fn(&MarketSnapshot, &mut ScoringState);

/// Runs the ordered rule list over a raw scoring state.
pub struct PolicyOverrider {
    rules: Vec<(&'static str, RuleFn)>,
}

impl Default for PolicyOverrider {
    fn default() -> Self {
        Self {
            rules: vec![
                ("core_alignment", core_alignment),
                ("channel_bonus", channel_bonus),
                ("realtime_confirmation", realtime_confirmation),
                ("ema_channel_override", ema_channel_override),
                ("spike_override", spike_override),
                ("volatility_damping", volatility_damping),
                ("confidence_clamp", confidence_clamp),
            ],
        }
    }
}

impl PolicyOverrider {
    /// Apply every rule in order.
    pub fn apply(&self, snap: &MarketSnapshot, state: &mut ScoringState) {
        for (_name, rule) in &self.rules {
            rule(snap, state);
        }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|(name, _)| *name).collect()
    }
}

/// Core count of M1/M5/H1 timeframes aligned with the given direction.
fn count_core(snap: &MarketSnapshot, action: Action) -> u8 {
    let flags = match action {
        Action::Buy => [snap.m1_bullish(), snap.m5_bullish(), snap.h1_bullish()],
        Action::Sell => [snap.m1_bearish(), snap.m5_bearish(), snap.h1_bearish()],
        Action::Hold => return 0,
    };
    flags.iter().filter(|&&b| b).count() as u8
}

/// Harmonize confidence with the M1/M5/H1 alignment count. 3/3 forces a
/// 0.90 floor, 2/3 a 0.75 floor, 1/3 a 0.60 floor.
fn core_alignment(snap: &MarketSnapshot, state: &mut ScoringState) {
    if state.action == Action::Hold {
        return;
    }
    let count = count_core(snap, state.action);
    let target = match count {
        3 => 0.90,
        2 => 0.75,
        1 => 0.60,
        _ => 0.0,
    };
    state.confidence = state.confidence.max(target);
    state.core_count = Some(count);
    let prefix = if state.action == Action::Buy { "CoreB" } else { "CoreS" };
    state.tag(format!("{prefix}:{count}/3"));
}

/// Channel agreement with the action is worth another +0.05.
fn channel_bonus(snap: &MarketSnapshot, state: &mut ScoringState) {
    let ch = snap.channel_sign();
    let aligned = (state.action == Action::Buy && ch > 0.0)
        || (state.action == Action::Sell && ch < 0.0);
    if aligned {
        state.confidence = (state.confidence + 0.05).min(MAX_CONF);
    }
}

/// Short-window price movement confirming a full 3/3 core alignment lifts
/// confidence to at least 0.90 + 0.03.
fn realtime_confirmation(snap: &MarketSnapshot, state: &mut ScoringState) {
    if state.action == Action::Hold || state.core_count != Some(3) {
        return;
    }
    let strength = match snap.rt_strength {
        Some(s) if s > 0.5 => s,
        _ => return,
    };
    if snap.rt_trend_consistent != Some(true) {
        return;
    }
    let _ = strength;
    state.confidence = (state.confidence.max(0.90) + 0.03).min(MAX_CONF);
    state.tag("RT+");
}

/// A hold that conflicts with a clear M5 trend plus channel direction is
/// overridden: the EA should not sit out an aligned move. The flipped
/// action is re-harmonized so the core-alignment floors still hold.
fn ema_channel_override(snap: &MarketSnapshot, state: &mut ScoringState) {
    if state.action != Action::Hold {
        return;
    }
    let ch = snap.channel_sign();
    if snap.m5_bullish() && (snap.h1_bullish() || !snap.h1_bearish()) && ch > 0.0 {
        state.action = Action::Buy;
        state.confidence = state.confidence.max(0.55);
        state.tag("EMA+Channel↑");
        core_alignment(snap, state);
    } else if snap.m5_bearish() && (snap.h1_bearish() || !snap.h1_bullish()) && ch < 0.0 {
        state.action = Action::Sell;
        state.confidence = state.confidence.max(0.55);
        state.tag("EMA+Channel↓");
        core_alignment(snap, state);
    }
}

/// Boom/Crash synthetics in spike mode get biased toward their natural
/// spike direction when RSI or the short EMAs agree.
fn spike_override(snap: &MarketSnapshot, state: &mut ScoringState) {
    if !snap.is_spike_mode {
        return;
    }
    let Some(direction) = snap.spike_direction() else {
        return;
    };
    let (rsi_agrees, ema_agrees) = match direction {
        Action::Buy => (
            snap.rsi < 30.0,
            snap.m5_bullish() || snap.m1_bullish(),
        ),
        Action::Sell => (
            snap.rsi > 70.0,
            snap.m5_bearish() || snap.m1_bearish(),
        ),
        Action::Hold => return,
    };
    if rsi_agrees || ema_agrees {
        let flipped = state.action != direction;
        state.action = direction;
        state.confidence = state.confidence.max(0.65);
        state.tag("Spike");
        if flipped {
            core_alignment(snap, state);
        }
    }
}

/// Extreme volatility regime shaves 0.10 off the confidence; if that leaves
/// less than 0.30 the trade is not worth taking and we downgrade to hold.
fn volatility_damping(snap: &MarketSnapshot, state: &mut ScoringState) {
    if snap.volatility_regime != 2 || state.action == Action::Hold {
        return;
    }
    state.confidence = (state.confidence - 0.10).max(0.0);
    state.tag("Vol!");
    if state.confidence < 0.30 {
        state.action = Action::Hold;
    }
}

fn confidence_clamp(_snap: &MarketSnapshot, state: &mut ScoringState) {
    state.confidence = state.confidence.clamp(0.0, MAX_CONF);
}
