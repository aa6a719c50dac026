// =============================================================================
// Prompt sanitisation — first stage of the strategy compiler
// =============================================================================
//
// Prompts come from untrusted users and end up stored and (optionally) fed
// to an LLM, so anything that smells like markup, code, or a link is
// rejected outright. Angle brackets are stripped rather than rejected so a
// stray "<" in prose does not bounce an honest prompt.
// =============================================================================

use super::CompileError;

/// Maximum prompt length in characters.
pub const PROMPT_MAX_CHARS: usize = 500;

/// Validate and normalise a raw prompt. Returns the cleaned prompt or
/// `InvalidPrompt` with the reason.
pub fn sanitize(prompt: &str) -> Result<String, CompileError> {
    let invalid = |reason: &str| CompileError::InvalidPrompt {
        reason: reason.to_string(),
    };

    if prompt.trim().is_empty() {
        return Err(invalid("prompt is empty"));
    }
    if prompt.chars().count() > PROMPT_MAX_CHARS {
        return Err(invalid("prompt exceeds 500 characters"));
    }

    let lower = prompt.to_lowercase();
    if lower.contains("http://") || lower.contains("https://") || lower.contains("www.") {
        return Err(invalid("prompt contains a URL"));
    }
    if prompt.contains("```") {
        return Err(invalid("prompt contains fenced code"));
    }
    if lower.contains("<script") || lower.contains("javascript:") {
        return Err(invalid("prompt contains a script marker"));
    }

    let cleaned: String = prompt
        .chars()
        .filter(|c| *c != '<' && *c != '>')
        .collect();

    Ok(cleaned.trim().to_string())
}

// =============================================================================
// Tests
// =============================================================================
