// =============================================================================
// LLM prompt parser — optional chat-completion backend for the compiler
// =============================================================================
//
// When an OpenRouter key is configured, prompts are parsed by a single
// chat-completion call instructed to emit nothing but a JSON object matching
// the StrategySpec schema. The output is parsed and schema-validated; any
// deviation is a ParseFailed — never a silent fall back to defaults.
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::CompileError;
use crate::strategy::StrategySpec;

const COMPLETIONS_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_TOKENS: u32 = 400;

const SYSTEM_PROMPT: &str = "You translate a trading-strategy description into JSON. \
Respond with a single JSON object and nothing else. Fields: max_age_minutes (1-10080), \
min_liquidity (>=0), min_holders (>=0), signal (one of \"momentum\", \"volume_spike\", \
\"new_launch\", \"social_buzz\"), threshold (0.5-10), max_positions (1-5), \
allocation_per_position (0.01-1.0), take_profit_pct (5-500), stop_loss_pct (5-50), \
cooldown_secs (>=0), time_limit_min (0-1440, 0 = none), trailing_stop_pct (0-30, 0 = none), \
max_tax_pct (>=0), reject_honeypots, require_renounced, require_liquidity_locked (booleans). \
Omit any field the description does not specify.";

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatResponseMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

/// Chat-completion client used by the compiler's LLM path.
#[derive(Clone)]
pub struct LlmParser {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl LlmParser {
    /// Build from `OPENROUTER_API_KEY`. Returns `None` when the key is
    /// absent or empty — the compiler then stays on the pattern path.
    pub fn from_env(model: impl Into<String>) -> Option<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY").ok()?;
        if api_key.trim().is_empty() {
            return None;
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Some(Self {
            http,
            api_key,
            model: model.into(),
        })
    }

    /// Parse a sanitised prompt into a StrategySpec via one completion call.
    pub async fn parse(&self, prompt: &str) -> Result<StrategySpec, CompileError> {
        let parse_failed = |underlying: String| CompileError::ParseFailed { underlying };

        let req = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: 0.0,
            max_tokens: MAX_TOKENS,
        };

        let resp = self
            .http
            .post(COMPLETIONS_URL)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&req)
            .send()
            .await
            .map_err(|e| parse_failed(format!("completion request failed: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            warn!(%status, "llm parse request rejected");
            return Err(parse_failed(format!("completion returned {status}: {snippet}")));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| parse_failed(format!("completion response malformed: {e}")))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.trim())
            .unwrap_or_default();

        debug!(len = content.len(), "llm completion received");
        spec_from_content(content)
    }
}

impl std::fmt::Debug for LlmParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmParser")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .finish()
    }
}

/// Decode the model output into a spec. The output must be a lone JSON
/// object; out-of-range or non-finite values fail after clamping.
fn spec_from_content(content: &str) -> Result<StrategySpec, CompileError> {
    let mut spec: StrategySpec = serde_json::from_str(content).map_err(|e| {
        CompileError::ParseFailed {
            underlying: format!("completion output is not valid strategy JSON: {e}"),
        }
    })?;
    spec.clamp_to_bounds();
    spec.validate().map_err(|e| CompileError::ParseFailed {
        underlying: format!("completion output failed validation: {e}"),
    })?;
    Ok(spec)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::EntrySignal;

    #[test]
    fn valid_json_parses() {
        let spec = spec_from_content(
            r#"{"signal": "volume_spike", "take_profit_pct": 30, "stop_loss_pct": 10}"#,
        )
        .unwrap();
        assert_eq!(spec.signal, EntrySignal::VolumeSpike);
        assert_eq!(spec.take_profit_pct, 30.0);
        assert_eq!(spec.stop_loss_pct, 10.0);
    }

    #[test]
    fn prose_output_is_parse_failed() {
        let err = spec_from_content("Sure! Here is your strategy: momentum").unwrap_err();
        assert!(matches!(err, CompileError::ParseFailed { .. }));
    }

    #[test]
    fn unknown_signal_is_parse_failed() {
        let err = spec_from_content(r#"{"signal": "astrology"}"#).unwrap_err();
        assert!(matches!(err, CompileError::ParseFailed { .. }));
    }

    #[test]
    fn out_of_range_values_are_clamped_not_rejected() {
        let spec = spec_from_content(r#"{"take_profit_pct": 9000}"#).unwrap();
        assert_eq!(spec.take_profit_pct, 500.0);
    }

    #[test]
    fn non_finite_value_is_parse_failed() {
        // serde_json rejects NaN literals outright, which is the point.
        assert!(spec_from_content(r#"{"threshold": NaN}"#).is_err());
    }
}
