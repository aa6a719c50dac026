// =============================================================================
// Central Application State — arena engine
// =============================================================================
//
// The single source of truth for the process. Subsystems manage their own
// interior mutability; AppState ties them together for the API handlers and
// the coordinator spawner.
//
// Thread safety:
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystem engines.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::compiler::llm::LlmParser;
use crate::compiler::StrategyCompiler;
use crate::coordinator::{CoordinatorDeps, CoordinatorRegistry, MatchCoordinator};
use crate::feed::client::FeedClient;
use crate::feed::SnapshotFetcher;
use crate::runtime_config::RuntimeConfig;
use crate::store::{BlobStore, RelationalStore};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

// =============================================================================
// Error ring
// =============================================================================

/// A recorded error event for the admin error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Bounded ring of recent operational errors, shared with coordinators.
#[derive(Default)]
pub struct ErrorRing {
    inner: RwLock<Vec<ErrorRecord>>,
}

impl ErrorRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: String) {
        let mut errors = self.inner.write();
        errors.push(ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.inner.read().clone()
    }
}

impl std::fmt::Debug for ErrorRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRing")
            .field("errors", &self.inner.read().len())
            .finish()
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Process-wide state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub blob: Arc<BlobStore>,
    pub relational: RelationalStore,
    pub fetcher: SnapshotFetcher,
    pub compiler: StrategyCompiler,
    pub registry: Arc<CoordinatorRegistry>,
    pub errors: Arc<ErrorRing>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the process state from the given configuration and an
    /// already-opened relational store.
    pub fn new(config: RuntimeConfig, relational: RelationalStore) -> Self {
        let blob = Arc::new(BlobStore::new());
        let fetcher = SnapshotFetcher::new(
            FeedClient::new(config.feed_base_url.clone()),
            blob.clone(),
        );

        let llm = if config.enable_llm_compiler {
            LlmParser::from_env(config.llm_model.clone())
        } else {
            None
        };
        let compiler = StrategyCompiler::new(llm);

        Self {
            runtime_config: Arc::new(RwLock::new(config)),
            blob,
            relational,
            fetcher,
            compiler,
            registry: Arc::new(CoordinatorRegistry::new()),
            errors: Arc::new(ErrorRing::new()),
            start_time: std::time::Instant::now(),
        }
    }

    /// Bundle the dependencies a new coordinator (and its successors) needs.
    pub fn coordinator_deps(&self) -> CoordinatorDeps {
        let config = self.runtime_config.read();
        CoordinatorDeps {
            fetcher: self.fetcher.clone(),
            relational: self.relational.clone(),
            blob: self.blob.clone(),
            registry: self.registry.clone(),
            errors: self.errors.clone(),
            tick_base_secs: config.tick_base_secs,
            tick_jitter_secs: config.tick_jitter_secs,
            match_duration_hours: config.match_duration_hours,
        }
    }

    /// The coordinator of the running match, if one is resident.
    pub fn running_coordinator(&self) -> Option<Arc<MatchCoordinator>> {
        self.registry.running()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("registry", &self.registry)
            .field("blob", &self.blob)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
