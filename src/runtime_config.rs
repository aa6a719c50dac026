// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file. Env overrides are applied in
// main at startup.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_db_path() -> String {
    "arena.db".to_string()
}

fn default_feed_base_url() -> String {
    "https://api.geckoterminal.com/api/v2/networks/bsc".to_string()
}

fn default_tick_base_secs() -> u64 {
    60
}

fn default_tick_jitter_secs() -> u64 {
    120
}

fn default_match_duration_hours() -> i64 {
    24
}

fn default_llm_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the arena engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Address the API server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Path of the sqlite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Base URL of the upstream pools price feed.
    #[serde(default = "default_feed_base_url")]
    pub feed_base_url: String,

    /// Base delay between coordinator ticks, in seconds.
    #[serde(default = "default_tick_base_secs")]
    pub tick_base_secs: u64,

    /// Upper bound of the random jitter added to each tick delay.
    #[serde(default = "default_tick_jitter_secs")]
    pub tick_jitter_secs: u64,

    /// Length of a match.
    #[serde(default = "default_match_duration_hours")]
    pub match_duration_hours: i64,

    /// Use the LLM compiler path when an API key is configured.
    #[serde(default)]
    pub enable_llm_compiler: bool,

    /// Model used by the LLM compiler path.
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            feed_base_url: default_feed_base_url(),
            tick_base_secs: default_tick_base_secs(),
            tick_jitter_secs: default_tick_jitter_secs(),
            match_duration_hours: default_match_duration_hours(),
            enable_llm_compiler: false,
            llm_model: default_llm_model(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            bind_addr = %config.bind_addr,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
