// =============================================================================
// Strategy Description — the validated record every bot trades from
// =============================================================================
//
// A StrategySpec is produced once by the compiler and then treated as
// immutable for the lifetime of the match. Five groups:
//
//   universe  — which tokens the bot is allowed to look at
//   entry     — which signal it trades and how aggressively
//   risk      — take-profit / stop-loss / cooldown
//   exits     — time limit and trailing stop (0 = disabled)
//   blacklist — safety gates (tax, honeypot, renounce, LP lock)
//
// Every field has a serde default so stored JSON from older rows keeps
// deserialising when new fields are added.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::fnv1a32;

// =============================================================================
// Schema bounds
// =============================================================================

pub const MAX_AGE_MIN_BOUNDS: (f64, f64) = (1.0, 10_080.0);
pub const THRESHOLD_BOUNDS: (f64, f64) = (0.5, 10.0);
pub const MAX_POSITIONS_BOUNDS: (u32, u32) = (1, 5);
pub const ALLOCATION_BOUNDS: (f64, f64) = (0.01, 1.0);
pub const TAKE_PROFIT_BOUNDS: (f64, f64) = (5.0, 500.0);
pub const STOP_LOSS_BOUNDS: (f64, f64) = (5.0, 50.0);
pub const TIME_LIMIT_BOUNDS: (f64, f64) = (0.0, 1_440.0);
pub const TRAILING_STOP_BOUNDS: (f64, f64) = (0.0, 30.0);

// =============================================================================
// Entry signal
// =============================================================================

/// The market signal a strategy enters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySignal {
    Momentum,
    VolumeSpike,
    NewLaunch,
    SocialBuzz,
}

impl Default for EntrySignal {
    fn default() -> Self {
        Self::Momentum
    }
}

impl std::fmt::Display for EntrySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Momentum => write!(f, "momentum"),
            Self::VolumeSpike => write!(f, "volume_spike"),
            Self::NewLaunch => write!(f, "new_launch"),
            Self::SocialBuzz => write!(f, "social_buzz"),
        }
    }
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_max_age_minutes() -> f64 {
    1_440.0
}

fn default_min_liquidity() -> f64 {
    5.0
}

fn default_min_holders() -> u64 {
    50
}

fn default_threshold() -> f64 {
    2.0
}

fn default_max_positions() -> u32 {
    3
}

fn default_allocation() -> f64 {
    0.1
}

fn default_take_profit_pct() -> f64 {
    50.0
}

fn default_stop_loss_pct() -> f64 {
    20.0
}

fn default_max_tax_pct() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

// =============================================================================
// StrategySpec
// =============================================================================

/// Validated strategy description consumed by the rule engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    // --- Universe filter -----------------------------------------------------
    /// Maximum token age in minutes (1 minute to 1 week).
    #[serde(default = "default_max_age_minutes")]
    pub max_age_minutes: f64,

    /// Minimum pool liquidity in QUOTE units.
    #[serde(default = "default_min_liquidity")]
    pub min_liquidity: f64,

    /// Minimum estimated holder count.
    #[serde(default = "default_min_holders")]
    pub min_holders: u64,

    // --- Entry ---------------------------------------------------------------
    #[serde(default)]
    pub signal: EntrySignal,

    /// Signal score gate (NewLaunch inverts: requires `score >= 10 - threshold`).
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Maximum simultaneous positions.
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    /// QUOTE spent per entry before sizing adjustments.
    #[serde(default = "default_allocation")]
    pub allocation_per_position: f64,

    // --- Risk ----------------------------------------------------------------
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Parsed for DSL compatibility; the order-count cap is the binding
    /// throttle, so this field is not consulted by the rule engine.
    #[serde(default)]
    pub cooldown_secs: u64,

    // --- Exits ---------------------------------------------------------------
    /// Maximum holding time in minutes; 0 disables the time exit.
    #[serde(default)]
    pub time_limit_min: f64,

    /// Trailing stop distance from the position high-watermark; 0 disables.
    #[serde(default)]
    pub trailing_stop_pct: f64,

    // --- Blacklist -----------------------------------------------------------
    #[serde(default = "default_max_tax_pct")]
    pub max_tax_pct: f64,

    #[serde(default = "default_true")]
    pub reject_honeypots: bool,

    #[serde(default)]
    pub require_renounced: bool,

    #[serde(default)]
    pub require_liquidity_locked: bool,
}

impl Default for StrategySpec {
    fn default() -> Self {
        Self {
            max_age_minutes: default_max_age_minutes(),
            min_liquidity: default_min_liquidity(),
            min_holders: default_min_holders(),
            signal: EntrySignal::Momentum,
            threshold: default_threshold(),
            max_positions: default_max_positions(),
            allocation_per_position: default_allocation(),
            take_profit_pct: default_take_profit_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            cooldown_secs: 0,
            time_limit_min: 0.0,
            trailing_stop_pct: 0.0,
            max_tax_pct: default_max_tax_pct(),
            reject_honeypots: true,
            require_renounced: false,
            require_liquidity_locked: false,
        }
    }
}

impl StrategySpec {
    /// Check every field against the schema bounds.
    pub fn validate(&self) -> Result<(), String> {
        fn check(name: &str, v: f64, (lo, hi): (f64, f64)) -> Result<(), String> {
            if !v.is_finite() || v < lo || v > hi {
                return Err(format!("{name} = {v} outside [{lo}, {hi}]"));
            }
            Ok(())
        }

        check("max_age_minutes", self.max_age_minutes, MAX_AGE_MIN_BOUNDS)?;
        if self.min_liquidity < 0.0 || !self.min_liquidity.is_finite() {
            return Err(format!("min_liquidity = {} must be >= 0", self.min_liquidity));
        }
        check("threshold", self.threshold, THRESHOLD_BOUNDS)?;
        if self.max_positions < MAX_POSITIONS_BOUNDS.0 || self.max_positions > MAX_POSITIONS_BOUNDS.1 {
            return Err(format!(
                "max_positions = {} outside [{}, {}]",
                self.max_positions, MAX_POSITIONS_BOUNDS.0, MAX_POSITIONS_BOUNDS.1
            ));
        }
        check(
            "allocation_per_position",
            self.allocation_per_position,
            ALLOCATION_BOUNDS,
        )?;
        check("take_profit_pct", self.take_profit_pct, TAKE_PROFIT_BOUNDS)?;
        check("stop_loss_pct", self.stop_loss_pct, STOP_LOSS_BOUNDS)?;
        check("time_limit_min", self.time_limit_min, TIME_LIMIT_BOUNDS)?;
        check("trailing_stop_pct", self.trailing_stop_pct, TRAILING_STOP_BOUNDS)?;
        if self.max_tax_pct < 0.0 || !self.max_tax_pct.is_finite() {
            return Err(format!("max_tax_pct = {} must be >= 0", self.max_tax_pct));
        }
        Ok(())
    }

    /// Clamp every bounded field back into its schema range.
    pub fn clamp_to_bounds(&mut self) {
        self.max_age_minutes = self.max_age_minutes.clamp(MAX_AGE_MIN_BOUNDS.0, MAX_AGE_MIN_BOUNDS.1);
        self.min_liquidity = self.min_liquidity.max(0.0);
        self.threshold = self.threshold.clamp(THRESHOLD_BOUNDS.0, THRESHOLD_BOUNDS.1);
        self.max_positions = self
            .max_positions
            .clamp(MAX_POSITIONS_BOUNDS.0, MAX_POSITIONS_BOUNDS.1);
        self.allocation_per_position = self
            .allocation_per_position
            .clamp(ALLOCATION_BOUNDS.0, ALLOCATION_BOUNDS.1);
        self.take_profit_pct = self
            .take_profit_pct
            .clamp(TAKE_PROFIT_BOUNDS.0, TAKE_PROFIT_BOUNDS.1);
        self.stop_loss_pct = self.stop_loss_pct.clamp(STOP_LOSS_BOUNDS.0, STOP_LOSS_BOUNDS.1);
        self.time_limit_min = self.time_limit_min.clamp(TIME_LIMIT_BOUNDS.0, TIME_LIMIT_BOUNDS.1);
        self.trailing_stop_pct = self
            .trailing_stop_pct
            .clamp(TRAILING_STOP_BOUNDS.0, TRAILING_STOP_BOUNDS.1);
        self.max_tax_pct = self.max_tax_pct.max(0.0);
    }

    /// Uniqueness injection: perturb threshold, take-profit, stop-loss, and
    /// allocation by a deterministic ±5–10% derived from `seed`, then
    /// re-clamp. Two identical prompts compiled under different seeds diverge
    /// during play instead of mirroring each other trade for trade.
    pub fn apply_uniqueness(&mut self, seed: u64) {
        self.threshold = perturb(self.threshold, seed, 0, b"threshold");
        self.take_profit_pct = perturb(self.take_profit_pct, seed, 1, b"take_profit");
        self.stop_loss_pct = perturb(self.stop_loss_pct, seed, 2, b"stop_loss");
        self.allocation_per_position =
            perturb(self.allocation_per_position, seed, 3, b"allocation");
        self.clamp_to_bounds();
    }
}

/// Scale `value` by 1 ± 5–10%. The magnitude comes from a fold of the seed
/// and field tag; the direction comes from bit `field_bit` of the seed, so
/// adjacent seeds flip direction on at least one field.
fn perturb(value: f64, seed: u64, field_bit: u32, tag: &[u8]) -> f64 {
    let h = fnv1a32(&[&seed.to_le_bytes(), tag]);
    let magnitude_pct = 5.0 + f64::from(h % 500) / 100.0;
    let sign = if (seed >> field_bit) & 1 == 0 { 1.0 } else { -1.0 };
    value * (1.0 + sign * magnitude_pct / 100.0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spec_validates() {
        assert!(StrategySpec::default().validate().is_ok());
    }

    #[test]
    fn out_of_bounds_rejected() {
        let mut spec = StrategySpec::default();
        spec.threshold = 11.0;
        assert!(spec.validate().is_err());

        let mut spec = StrategySpec::default();
        spec.stop_loss_pct = 2.0;
        assert!(spec.validate().is_err());

        let mut spec = StrategySpec::default();
        spec.max_positions = 6;
        assert!(spec.validate().is_err());

        let mut spec = StrategySpec::default();
        spec.allocation_per_position = 0.0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn clamp_repairs_out_of_bounds() {
        let mut spec = StrategySpec::default();
        spec.threshold = 25.0;
        spec.take_profit_pct = 1_000.0;
        spec.stop_loss_pct = 1.0;
        spec.clamp_to_bounds();
        assert!(spec.validate().is_ok());
        assert_eq!(spec.threshold, 10.0);
        assert_eq!(spec.take_profit_pct, 500.0);
        assert_eq!(spec.stop_loss_pct, 5.0);
    }

    #[test]
    fn uniqueness_is_deterministic() {
        let mut a = StrategySpec::default();
        let mut b = StrategySpec::default();
        a.apply_uniqueness(7);
        b.apply_uniqueness(7);
        assert_eq!(a, b);
    }

    #[test]
    fn adjacent_seeds_diverge_on_threshold() {
        // Seeds 1 and 2 differ in bit 0, so the threshold perturbation flips
        // direction: the two results sit at least 10% of the base apart.
        let mut a = StrategySpec::default();
        let mut b = StrategySpec::default();
        a.apply_uniqueness(1);
        b.apply_uniqueness(2);
        let base = StrategySpec::default().threshold;
        assert!((a.threshold - b.threshold).abs() >= base * 0.05);
    }

    #[test]
    fn perturbed_spec_still_validates() {
        for seed in 0..50u64 {
            let mut spec = StrategySpec::default();
            spec.apply_uniqueness(seed);
            assert!(spec.validate().is_ok(), "seed {seed} produced invalid spec");
        }
    }

    #[test]
    fn perturbation_stays_within_ten_pct() {
        for seed in 0..50u64 {
            let base = StrategySpec::default();
            let mut spec = base.clone();
            spec.apply_uniqueness(seed);
            let rel = (spec.take_profit_pct - base.take_profit_pct).abs() / base.take_profit_pct;
            assert!(rel >= 0.05 - 1e-9 && rel <= 0.10 + 1e-9, "rel = {rel}");
        }
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let spec: StrategySpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec, StrategySpec::default());
    }

    #[test]
    fn signal_serialises_snake_case() {
        let json = serde_json::to_string(&EntrySignal::VolumeSpike).unwrap();
        assert_eq!(json, "\"volume_spike\"");
        let back: EntrySignal = serde_json::from_str("\"new_launch\"").unwrap();
        assert_eq!(back, EntrySignal::NewLaunch);
    }
}
