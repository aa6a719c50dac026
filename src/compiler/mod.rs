// =============================================================================
// Strategy Compiler — free-text prompt to validated StrategySpec
// =============================================================================
//
// Pipeline: sanitize -> parse (pattern, or LLM when configured) -> validate
// -> uniqueness injection. The uniqueness seed makes two identical prompts
// produce slightly different strategies, so copy-paste participants diverge
// during play instead of shadowing each other.
// =============================================================================

pub mod llm;
pub mod pattern;
pub mod sanitize;

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::strategy::StrategySpec;
use llm::LlmParser;

/// Compiler failure, returned synchronously to the caller. Nothing is
/// persisted on failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("invalid prompt: {reason}")]
    InvalidPrompt { reason: String },
    #[error("parse failed: {underlying}")]
    ParseFailed { underlying: String },
}

/// Prompt compiler with an optional LLM backend.
#[derive(Debug, Clone, Default)]
pub struct StrategyCompiler {
    llm: Option<LlmParser>,
}

impl StrategyCompiler {
    pub fn new(llm: Option<LlmParser>) -> Self {
        Self { llm }
    }

    /// Compile a prompt into a validated, uniqueness-perturbed spec.
    pub async fn compile(&self, prompt: &str, seed: u64) -> Result<StrategySpec, CompileError> {
        let cleaned = sanitize::sanitize(prompt)?;

        let mut spec = match &self.llm {
            Some(parser) => parser.parse(&cleaned).await?,
            None => pattern::parse_prompt(&cleaned),
        };

        // Both parse paths clamp, so this only catches genuine corruption.
        spec.validate()
            .map_err(|e| CompileError::ParseFailed { underlying: e })?;

        spec.apply_uniqueness(seed);
        debug!(seed, signal = %spec.signal, "prompt compiled");
        Ok(spec)
    }

    /// Compile without persistence side effects, using a throwaway seed
    /// derived from the current time. Used by the bot-preview endpoint.
    pub async fn preview(&self, prompt: &str) -> Result<StrategySpec, CompileError> {
        let seed = Utc::now().timestamp_millis() as u64;
        self.compile(prompt, seed).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn compiler() -> StrategyCompiler {
        StrategyCompiler::new(None)
    }

    #[tokio::test]
    async fn compile_then_validate_is_ok() {
        let prompts = [
            "momentum, tp 20, sl 15",
            "snipe new launches, 0.5 quote per position, trailing 10%",
            "volume spikes, liquidity 100, 3 positions, tax under 5%",
        ];
        for prompt in prompts {
            for seed in 0..10u64 {
                let spec = compiler().compile(prompt, seed).await.unwrap();
                assert!(spec.validate().is_ok(), "prompt {prompt:?} seed {seed}");
            }
        }
    }

    #[tokio::test]
    async fn same_seed_same_spec() {
        let a = compiler().compile("momentum, tp 20, sl 15", 9).await.unwrap();
        let b = compiler().compile("momentum, tp 20, sl 15", 9).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn different_seeds_diverge() {
        // Identical prompt, seeds 1 and 2: at least one of the perturbed
        // fields must sit >= 5% apart.
        let a = compiler().compile("momentum, tp 20, sl 15", 1).await.unwrap();
        let b = compiler().compile("momentum, tp 20, sl 15", 2).await.unwrap();

        let rel = |x: f64, y: f64, base: f64| (x - y).abs() / base;
        let diverged = rel(a.threshold, b.threshold, StrategySpec::default().threshold) >= 0.05
            || rel(a.take_profit_pct, b.take_profit_pct, 20.0) >= 0.05
            || rel(a.stop_loss_pct, b.stop_loss_pct, 15.0) >= 0.05
            || rel(
                a.allocation_per_position,
                b.allocation_per_position,
                StrategySpec::default().allocation_per_position,
            ) >= 0.05;
        assert!(diverged, "seeds 1 and 2 produced near-identical specs");
    }

    #[tokio::test]
    async fn invalid_prompt_propagates() {
        let err = compiler()
            .compile("see https://example.com", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidPrompt { .. }));
    }

    #[tokio::test]
    async fn preview_compiles_without_error() {
        let spec = compiler().preview("momentum, tp 20, sl 15").await.unwrap();
        assert!(spec.validate().is_ok());
    }
}
