// =============================================================================
// Pattern-based prompt parser — regex extraction over a defaulted spec
// =============================================================================
//
// The default compiler path: scan the prompt for signal keywords and numeric
// phrases ("take profit 20%", "3 positions", "0.3 quote per position", ...)
// and fill a StrategySpec initialised to defaults. Anything the prompt does
// not mention keeps its default; extracted values are clamped to the schema
// bounds, so this parser cannot produce an invalid spec.
// =============================================================================

use std::sync::OnceLock;

use regex::Regex;

use crate::strategy::{EntrySignal, StrategySpec};

struct Patterns {
    threshold: Regex,
    take_profit: Regex,
    stop_loss: Regex,
    trailing: Regex,
    positions: Regex,
    allocation: Regex,
    liquidity: Regex,
    holders: Regex,
    time_limit_hours: Regex,
    time_limit_minutes: Regex,
    age: Regex,
    max_tax: Regex,
    cooldown: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        threshold: Regex::new(r"threshold\s*(?:of\s*)?(\d+(?:\.\d+)?)").expect("valid pattern"),
        take_profit: Regex::new(r"(?:take\s*profit|\btp\b)\s*(?:of\s*|at\s*)?(\d+(?:\.\d+)?)\s*%?")
            .expect("valid pattern"),
        stop_loss: Regex::new(r"(?:stop\s*loss|\bsl\b|\bstop\b)\s*(?:of\s*|at\s*)?(\d+(?:\.\d+)?)\s*%?")
            .expect("valid pattern"),
        trailing: Regex::new(r"trailing(?:\s*stop)?\s*(?:of\s*|at\s*)?(\d+(?:\.\d+)?)\s*%?")
            .expect("valid pattern"),
        positions: Regex::new(r"(?:max\s*)?(\d+)\s*(?:concurrent\s*)?positions?")
            .expect("valid pattern"),
        allocation: Regex::new(r"(\d+(?:\.\d+)?)\s*(?:quote|bnb)\s*(?:per|each)")
            .expect("valid pattern"),
        liquidity: Regex::new(r"liquidity\s*(?:of\s*|at\s*least\s*|above\s*|>\s*)?(\d+(?:\.\d+)?)")
            .expect("valid pattern"),
        holders: Regex::new(r"(\d+)\s*\+?\s*holders").expect("valid pattern"),
        time_limit_hours: Regex::new(
            r"(?:(\d+(?:\.\d+)?)\s*hours?\s*max|max\s*(?:hold\s*)?(\d+(?:\.\d+)?)\s*hours?)",
        )
        .expect("valid pattern"),
        time_limit_minutes: Regex::new(
            r"(?:(\d+(?:\.\d+)?)\s*min(?:ute)?s?\s*max|max\s*(?:hold\s*)?(\d+(?:\.\d+)?)\s*min(?:ute)?s?)",
        )
        .expect("valid pattern"),
        age: Regex::new(
            r"(?:age|younger|newer|launched)\D{0,12}?(\d+(?:\.\d+)?)\s*(minutes?|mins?|hours?|days?)",
        )
        .expect("valid pattern"),
        max_tax: Regex::new(r"tax\s*(?:under\s*|below\s*|max\s*|<\s*|of\s*)?(\d+(?:\.\d+)?)\s*%?")
            .expect("valid pattern"),
        cooldown: Regex::new(r"cooldown\s*(?:of\s*)?(\d+)\s*(?:s\b|secs?|seconds?)")
            .expect("valid pattern"),
    })
}

fn capture_f64(re: &Regex, text: &str) -> Option<f64> {
    let caps = re.captures(text)?;
    // Alternation patterns carry the number in whichever group matched.
    caps.iter()
        .skip(1)
        .flatten()
        .next()
        .and_then(|m| m.as_str().parse().ok())
}

fn detect_signal(text: &str) -> EntrySignal {
    if text.contains("momentum") || text.contains("trend") {
        EntrySignal::Momentum
    } else if text.contains("volume") {
        EntrySignal::VolumeSpike
    } else if text.contains("launch") || text.contains("snipe") || text.contains("new token") {
        EntrySignal::NewLaunch
    } else if text.contains("social") || text.contains("buzz") || text.contains("hype") {
        EntrySignal::SocialBuzz
    } else {
        EntrySignal::Momentum
    }
}

/// Parse a sanitised prompt into a StrategySpec. Infallible: unmatched
/// phrases keep their defaults, and the result is clamped to schema bounds.
pub fn parse_prompt(prompt: &str) -> StrategySpec {
    let mut text = prompt.to_lowercase();
    let p = patterns();

    let mut spec = StrategySpec {
        signal: detect_signal(&text),
        ..StrategySpec::default()
    };

    // Trailing stop first, and blank the match out of the text so the plain
    // "stop N" fallback cannot re-read "trailing stop 10" as a stop loss.
    if let Some(range) = p.trailing.find(&text).map(|m| m.range()) {
        if let Some(v) = capture_f64(&p.trailing, &text) {
            spec.trailing_stop_pct = v;
        }
        text.replace_range(range, "");
    }

    if let Some(v) = capture_f64(&p.threshold, &text) {
        spec.threshold = v;
    }
    if let Some(v) = capture_f64(&p.take_profit, &text) {
        spec.take_profit_pct = v;
    }
    if let Some(v) = capture_f64(&p.stop_loss, &text) {
        spec.stop_loss_pct = v;
    }
    if let Some(v) = capture_f64(&p.positions, &text) {
        spec.max_positions = v as u32;
    }
    if let Some(v) = capture_f64(&p.allocation, &text) {
        spec.allocation_per_position = v;
    }
    if let Some(v) = capture_f64(&p.liquidity, &text) {
        spec.min_liquidity = v;
    }
    if let Some(v) = capture_f64(&p.holders, &text) {
        spec.min_holders = v as u64;
    }
    if let Some(v) = capture_f64(&p.time_limit_hours, &text) {
        spec.time_limit_min = v * 60.0;
    } else if let Some(v) = capture_f64(&p.time_limit_minutes, &text) {
        spec.time_limit_min = v;
    }
    if let Some(v) = capture_f64(&p.age, &text) {
        let unit = p
            .age
            .captures(&text)
            .and_then(|c| c.get(2))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        spec.max_age_minutes = if unit.starts_with("hour") {
            v * 60.0
        } else if unit.starts_with("day") {
            v * 1_440.0
        } else {
            v
        };
    }
    if let Some(v) = capture_f64(&p.max_tax, &text) {
        spec.max_tax_pct = v;
    }
    if let Some(v) = capture_f64(&p.cooldown, &text) {
        spec.cooldown_secs = v as u64;
    }

    if text.contains("renounced") {
        spec.require_renounced = true;
    }
    if text.contains("locked") {
        spec.require_liquidity_locked = true;
    }

    spec.clamp_to_bounds();
    spec
}

// =============================================================================
// Tests
// =============================================================================
