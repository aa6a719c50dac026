// =============================================================================
// Match Coordinator — per-match supervisor owning all portfolios
// =============================================================================
//
// Lifecycle: Pending -> Running -> Settled. One coordinator per match id,
// single-threaded within itself: exactly one tick (or settlement) runs at a
// time, serialized by an operation lock. On a paced tick it fetches a market
// snapshot, evaluates every participant's strategy in a stable owner-sorted
// order, executes the resulting intents, refreshes unrealized P&L, appends a
// balance snapshot, and persists its state to the blob store. When wall time
// passes the match end it settles and rolls a successor match with an empty
// roster.
//
// A failed tick is logged and swallowed; the timer stays alive and the next
// tick retries. Settlement failures are fatal for the tick and surface to
// the admin caller for manual retry.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::ErrorRing;
use crate::execution;
use crate::feed::SnapshotFetcher;
use crate::portfolio::{
    calculate_prize, BalanceEntry, BalanceSnapshot, Portfolio, START_BALANCE,
};
use crate::rules;
use crate::store::relational::{MatchRow, WinnerRow};
use crate::store::{BlobStore, RelationalStore};
use crate::strategy::StrategySpec;
use crate::types::{participant_seed, MarketSnapshot, MatchStatus};

/// Balance-curve snapshots retained per match.
pub const BALANCE_HISTORY_CAP: usize = 5;
/// Serialized coordinator state must fit the blob-store platform bound.
pub const STATE_BYTE_BUDGET: usize = 128 * 1024;

// ---------------------------------------------------------------------------
// Roster and state types
// ---------------------------------------------------------------------------

/// One roster entry. The canonical participant record lives in the
/// relational store; the coordinator holds only what a tick needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub strategy: StrategySpec,
}

/// The complete per-match state, serialized to the blob store every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchState {
    pub match_id: String,
    pub start_ts: i64,
    pub end_ts: i64,
    /// Stable execution order: sorted by lowercase owner, then id.
    pub participants: Vec<Participant>,
    pub portfolios: HashMap<String, Portfolio>,
    pub is_running: bool,
    pub last_tick_ts: i64,
    pub balance_history: Vec<BalanceSnapshot>,
}

/// One row of the final standings; the settlement hash covers the ordered
/// list of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRow {
    pub id: String,
    pub owner: String,
    pub final_value: f64,
    pub gain_pct: f64,
}

/// Leaderboard row served live from the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardEntry {
    pub participant_id: String,
    pub owner: String,
    pub name: String,
    pub total_value: f64,
    pub gain_pct: f64,
    pub open_positions: usize,
    pub orders: u64,
    pub status: &'static str,
}

/// Everything a coordinator (and its successors) needs from the process.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub fetcher: SnapshotFetcher,
    pub relational: RelationalStore,
    pub blob: Arc<BlobStore>,
    pub registry: Arc<CoordinatorRegistry>,
    pub errors: Arc<ErrorRing>,
    pub tick_base_secs: u64,
    pub tick_jitter_secs: u64,
    pub match_duration_hours: i64,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct MatchCoordinator {
    match_id: String,
    deps: CoordinatorDeps,
    state: RwLock<MatchState>,
    /// Serialises ticks, settlement, and admin operations.
    op_lock: tokio::sync::Mutex<()>,
    /// True while the tick loop task is alive; reset respawns only when the
    /// old loop has exited.
    loop_active: AtomicBool,
    /// Set once settlement has fully completed (winners written, successor
    /// rolled). A failed settlement leaves this false so the admin can
    /// retry; a completed one must never settle twice.
    settle_complete: AtomicBool,
}

impl MatchCoordinator {
    /// Build the coordinator, register it, persist the initial state, and
    /// spawn the tick loop (first tick one base interval out).
    pub fn start(
        deps: CoordinatorDeps,
        row: &MatchRow,
        roster: Vec<Participant>,
    ) -> Arc<Self> {
        let mut participants = roster;
        sort_roster(&mut participants);

        let portfolios = participants
            .iter()
            .map(|p| (p.id.clone(), Portfolio::new(p.id.clone())))
            .collect();

        let state = MatchState {
            match_id: row.id.clone(),
            start_ts: row.start_ts,
            end_ts: row.end_ts,
            participants,
            portfolios,
            is_running: true,
            last_tick_ts: 0,
            balance_history: Vec::new(),
        };

        let coordinator = Arc::new(Self {
            match_id: row.id.clone(),
            deps,
            state: RwLock::new(state),
            op_lock: tokio::sync::Mutex::new(()),
            loop_active: AtomicBool::new(false),
            settle_complete: AtomicBool::new(false),
        });

        coordinator.persist_state();
        coordinator.deps.registry.insert(coordinator.clone());

        info!(
            match_id = %row.id,
            end_ts = row.end_ts,
            participants = coordinator.state.read().participants.len(),
            "match coordinator started"
        );

        coordinator.clone().spawn_loop();
        coordinator
    }

    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    pub fn is_running(&self) -> bool {
        self.state.read().is_running
    }

    fn spawn_loop(self: Arc<Self>) {
        if self.loop_active.swap(true, Ordering::SeqCst) {
            warn!(match_id = %self.match_id, "tick loop already active — not respawning");
            return;
        }
        tokio::spawn(self.run());
    }

    /// The tick loop: sleep one paced interval, tick, repeat until settled.
    /// The first tick fires one base interval out; subsequent ticks add the
    /// random jitter.
    async fn run(self: Arc<Self>) {
        let mut first = true;
        loop {
            let delay = {
                let base = self.deps.tick_base_secs;
                let jitter = if first || self.deps.tick_jitter_secs == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..self.deps.tick_jitter_secs)
                };
                std::time::Duration::from_secs(base + jitter)
            };
            first = false;
            tokio::time::sleep(delay).await;

            if !self.is_running() {
                break;
            }
            if let Err(e) = self.tick().await {
                error!(match_id = %self.match_id, error = %e, "tick failed — retrying next interval");
                self.deps
                    .errors
                    .push(format!("match {}: tick failed: {e}", self.match_id));
            }
            if !self.is_running() {
                break;
            }
        }
        self.loop_active.store(false, Ordering::SeqCst);
        info!(match_id = %self.match_id, "coordinator loop stopped");
    }

    // -------------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------------

    /// Run one tick: settle if the match is over, otherwise evaluate every
    /// participant against a fresh snapshot and persist the state.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let _guard = self.op_lock.lock().await;
        if !self.is_running() {
            return Ok(());
        }

        let now_ms = Utc::now().timestamp_millis();
        if now_ms >= self.state.read().end_ts {
            return self.settle_inner(now_ms).await;
        }

        let snapshot = self.deps.fetcher.get_snapshot(true).await;
        {
            let mut state = self.state.write();
            run_tick_cycle(&mut state, &snapshot, now_ms);
        }

        self.persist_state();
        self.deps.blob.sweep_expired();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Settlement
    // -------------------------------------------------------------------------

    /// Force settlement now. Admin surface; also called by the tick when the
    /// match end has passed.
    pub async fn settle(&self) -> anyhow::Result<()> {
        let _guard = self.op_lock.lock().await;
        if self.settle_complete.load(Ordering::SeqCst) {
            anyhow::bail!("match {} is already settled", self.match_id);
        }
        self.settle_inner(Utc::now().timestamp_millis()).await
    }

    async fn settle_inner(&self, now_ms: i64) -> anyhow::Result<()> {
        info!(match_id = %self.match_id, "settling match");

        // Stop the timer first; the loop exits after this tick returns.
        self.state.write().is_running = false;

        let snapshot = self.deps.fetcher.get_snapshot(true).await;
        let prices = snapshot.price_by_address();

        let results = {
            let mut state = self.state.write();
            for portfolio in state.portfolios.values_mut() {
                portfolio.update_unrealized(&prices);
            }
            let mut results: Vec<SettlementRow> = state
                .participants
                .iter()
                .filter_map(|p| {
                    state.portfolios.get(&p.id).map(|pf| SettlementRow {
                        id: p.id.clone(),
                        owner: p.owner.clone(),
                        final_value: pf.total_value(&prices),
                        gain_pct: pf.gain_pct(&prices),
                    })
                })
                .collect();
            results.sort_by(|a, b| {
                b.final_value
                    .partial_cmp(&a.final_value)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            results
        };

        let hash = settlement_hash(&results);

        for (rank, row) in results.iter().enumerate() {
            let prize = if rank == 0 {
                calculate_prize(row.gain_pct)
            } else {
                0.0
            };
            self.deps
                .relational
                .insert_winner(&WinnerRow {
                    match_id: self.match_id.clone(),
                    participant_id: row.id.clone(),
                    owner: row.owner.clone(),
                    start_balance: START_BALANCE,
                    end_balance: row.final_value,
                    gain_pct: row.gain_pct,
                    prize,
                    paid: false,
                    paid_tx: None,
                })
                .await?;
        }

        self.deps.relational.settle_match(&self.match_id, &hash).await?;
        self.deps
            .blob
            .put(&format!("results:match-{}", self.match_id), &results, None);
        self.persist_state();

        info!(match_id = %self.match_id, result_hash = %hash, entries = results.len(), "match settled");

        // Roll the successor: a fresh 24-hour match, empty roster,
        // participants join dynamically.
        let successor = MatchRow {
            id: Uuid::new_v4().to_string(),
            start_ts: now_ms,
            end_ts: now_ms + self.deps.match_duration_hours * 3_600_000,
            status: MatchStatus::Running,
            result_hash: None,
        };
        self.deps.relational.create_match(&successor).await?;
        MatchCoordinator::start(self.deps.clone(), &successor, Vec::new());
        self.settle_complete.store(true, Ordering::SeqCst);
        // Settled coordinators leave the registry; reads on old matches
        // project from the relational store instead.
        self.deps.registry.remove(&self.match_id);
        info!(successor = %successor.id, "successor match started");

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Dynamic join / reset
    // -------------------------------------------------------------------------

    /// Insert a participant into a running match. The new portfolio starts
    /// at the standard balance and is picked up on the next tick.
    pub fn add_participant(&self, participant: Participant) {
        {
            let mut state = self.state.write();
            if state.portfolios.contains_key(&participant.id) {
                warn!(participant = %participant.id, "participant already present — ignoring join");
                return;
            }
            state
                .portfolios
                .insert(participant.id.clone(), Portfolio::new(participant.id.clone()));
            info!(
                match_id = %self.match_id,
                participant = %participant.id,
                owner = %participant.owner,
                "participant joined running match"
            );
            state.participants.push(participant);
            sort_roster(&mut state.participants);
        }
        self.persist_state();
    }

    /// Wipe coordinator storage and restart from a supplied roster. Used to
    /// recover from corrupted state.
    pub fn reset(self: &Arc<Self>, roster: Vec<Participant>) {
        let mut participants = roster;
        sort_roster(&mut participants);
        let portfolios = participants
            .iter()
            .map(|p| (p.id.clone(), Portfolio::new(p.id.clone())))
            .collect();

        self.deps
            .blob
            .delete_prefix(&format!("match:{}:", self.match_id));

        {
            let mut state = self.state.write();
            state.participants = participants;
            state.portfolios = portfolios;
            state.balance_history.clear();
            state.last_tick_ts = 0;
            state.is_running = true;
        }
        self.settle_complete.store(false, Ordering::SeqCst);
        self.persist_state();
        warn!(match_id = %self.match_id, "coordinator state reset");

        self.clone().spawn_loop();
    }

    // -------------------------------------------------------------------------
    // Read surface (called concurrently with ticks)
    // -------------------------------------------------------------------------

    /// Consistent copy of the full match state.
    pub fn state_snapshot(&self) -> MatchState {
        self.state.read().clone()
    }

    /// Live standings at cached prices, best first.
    pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        let state = self.state.read();
        let mut entries: Vec<LeaderboardEntry> = state
            .participants
            .iter()
            .filter_map(|p| {
                state.portfolios.get(&p.id).map(|pf| {
                    let total = pf.cached_total_value();
                    LeaderboardEntry {
                        participant_id: p.id.clone(),
                        owner: p.owner.clone(),
                        name: p.name.clone(),
                        total_value: total,
                        gain_pct: (total - START_BALANCE) / START_BALANCE * 100.0,
                        open_positions: pf.positions.len(),
                        orders: pf.order_count,
                        status: "active",
                    }
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            b.total_value
                .partial_cmp(&a.total_value)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries
    }

    pub fn portfolio_of(&self, participant_id: &str) -> Option<Portfolio> {
        self.state.read().portfolios.get(participant_id).cloned()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    fn persist_state(&self) {
        let state = self.state.read();
        match serde_json::to_vec(&*state) {
            Ok(bytes) => {
                if bytes.len() > STATE_BYTE_BUDGET {
                    warn!(
                        match_id = %self.match_id,
                        bytes = bytes.len(),
                        budget = STATE_BYTE_BUDGET,
                        "serialized match state exceeds storage budget"
                    );
                }
                self.deps
                    .blob
                    .put(&format!("match:{}:state", self.match_id), &*state, None);
            }
            Err(e) => {
                error!(match_id = %self.match_id, error = %e, "failed to serialise match state");
            }
        }
    }
}

impl std::fmt::Debug for MatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchCoordinator")
            .field("match_id", &self.match_id)
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tick cycle (pure with respect to I/O; exercised directly by tests)
// ---------------------------------------------------------------------------

/// Evaluate every participant against `snapshot` in roster order, execute
/// their intents, refresh unrealized P&L, and append a balance snapshot.
pub fn run_tick_cycle(state: &mut MatchState, snapshot: &MarketSnapshot, now_ms: i64) {
    let prices = snapshot.price_by_address();
    let participants = state.participants.clone();

    for participant in &participants {
        let Some(portfolio) = state.portfolios.get_mut(&participant.id) else {
            warn!(participant = %participant.id, "roster entry without portfolio");
            continue;
        };
        portfolio.scan_count += 1;

        let seed = participant_seed(&participant.id);
        let intents = rules::evaluate(&participant.strategy, portfolio, snapshot, now_ms, seed);

        for intent in &intents {
            // Address-keyed lookup; symbols are not unique across pools.
            let Some(&price) = prices.get(&intent.token_address) else {
                warn!(token = %intent.token_address, "intent token missing from snapshot");
                continue;
            };
            match execution::execute(portfolio, intent, price, now_ms) {
                Ok(order) => info!(
                    participant = %participant.id,
                    side = %order.side,
                    token = %order.symbol,
                    qty = order.quantity,
                    fill = order.fill_price,
                    reason = %intent.reason,
                    "order filled"
                ),
                Err(e) => warn!(participant = %participant.id, error = %e, "intent rejected"),
            }
        }

        portfolio.update_unrealized(&prices);
    }

    let entries = state
        .participants
        .iter()
        .filter_map(|p| {
            state.portfolios.get(&p.id).map(|pf| BalanceEntry {
                participant_id: p.id.clone(),
                total_value: pf.total_value(&prices),
            })
        })
        .collect();
    state.balance_history.push(BalanceSnapshot { ts: now_ms, entries });
    while state.balance_history.len() > BALANCE_HISTORY_CAP {
        state.balance_history.remove(0);
    }

    state.last_tick_ts = now_ms;
}

/// Hex SHA-256 of the canonical JSON of the ordered results list. A
/// settlement receipt, not a full execution trace.
pub fn settlement_hash(results: &[SettlementRow]) -> String {
    let canonical = serde_json::to_string(results).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable execution order: lowercase owner, then id.
fn sort_roster(roster: &mut [Participant]) {
    roster.sort_by(|a, b| {
        a.owner
            .to_lowercase()
            .cmp(&b.owner.to_lowercase())
            .then_with(|| a.id.cmp(&b.id))
    });
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-wide map of live coordinators, keyed by match id.
#[derive(Default)]
pub struct CoordinatorRegistry {
    inner: RwLock<HashMap<String, Arc<MatchCoordinator>>>,
}

impl CoordinatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, coordinator: Arc<MatchCoordinator>) {
        self.inner
            .write()
            .insert(coordinator.match_id().to_string(), coordinator);
    }

    pub fn get(&self, match_id: &str) -> Option<Arc<MatchCoordinator>> {
        self.inner.read().get(match_id).cloned()
    }

    pub fn remove(&self, match_id: &str) {
        self.inner.write().remove(match_id);
    }

    /// The coordinator of the single running match, if any.
    pub fn running(&self) -> Option<Arc<MatchCoordinator>> {
        self.inner.read().values().find(|c| c.is_running()).cloned()
    }
}

impl std::fmt::Debug for CoordinatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorRegistry")
            .field("coordinators", &self.inner.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
