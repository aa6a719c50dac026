// =============================================================================
// Relational Store — sqlite-backed records of participants, matches, winners
// =============================================================================
//
// The live trading path is in-memory only; this store carries the durable
// facts: who entered, which matches ran, who won, and which entry burns were
// verified. The connection lives behind a tokio Mutex so async handlers and
// the coordinator's settlement path share it safely.
//
// Timestamps are epoch millis. Strategy specs are stored as JSON text.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::strategy::StrategySpec;
use crate::types::MatchStatus;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRow {
    pub id: String,
    pub owner: String,
    pub match_id: String,
    pub name: String,
    pub prompt_raw: String,
    pub strategy: StrategySpec,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRow {
    pub id: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub status: MatchStatus,
    pub result_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerRow {
    pub match_id: String,
    pub participant_id: String,
    pub owner: String,
    pub start_balance: f64,
    pub end_balance: f64,
    pub gain_pct: f64,
    pub prize: f64,
    pub paid: bool,
    pub paid_tx: Option<String>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RelationalStore {
    conn: Arc<Mutex<Connection>>,
}

impl RelationalStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open arena db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS participants (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                match_id TEXT NOT NULL,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                prompt_raw TEXT NOT NULL,
                strategy TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_participants_match ON participants(match_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS matches (
                id TEXT PRIMARY KEY,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER NOT NULL,
                status TEXT NOT NULL,
                result_hash TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS winners (
                match_id TEXT NOT NULL,
                participant_id TEXT NOT NULL,
                owner TEXT NOT NULL,
                start_balance REAL NOT NULL,
                end_balance REAL NOT NULL,
                gain_pct REAL NOT NULL,
                prize REAL NOT NULL,
                paid INTEGER NOT NULL DEFAULT 0,
                paid_tx TEXT,
                PRIMARY KEY (match_id, participant_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS burns (
                owner TEXT NOT NULL,
                tx_hash TEXT NOT NULL UNIQUE COLLATE NOCASE,
                amount REAL NOT NULL,
                verified INTEGER NOT NULL DEFAULT 0,
                ts INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_burns_owner_ts ON burns(owner, ts DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -------------------------------------------------------------------------
    // Matches
    // -------------------------------------------------------------------------

    pub async fn create_match(&self, row: &MatchRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO matches (id, start_ts, end_ts, status, result_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.id,
                row.start_ts,
                row.end_ts,
                row.status.to_string(),
                row.result_hash
            ],
        )
        .context("insert match")?;
        Ok(())
    }

    pub async fn get_match(&self, id: &str) -> Result<Option<MatchRow>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, start_ts, end_ts, status, result_hash FROM matches WHERE id = ?1",
            params![id],
            Self::map_match_row,
        )
        .optional()
        .context("select match")
    }

    /// The single `running` match, if one exists.
    pub async fn running_match(&self) -> Result<Option<MatchRow>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, start_ts, end_ts, status, result_hash FROM matches
             WHERE status = 'running' ORDER BY start_ts DESC LIMIT 1",
            [],
            Self::map_match_row,
        )
        .optional()
        .context("select running match")
    }

    /// True if any match is not yet settled (pending or running).
    pub async fn any_unsettled_match(&self) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM matches WHERE status != 'settled'",
                [],
                |r| r.get(0),
            )
            .context("count unsettled matches")?;
        Ok(count > 0)
    }

    /// Move a match into `running` with its definitive start and end times.
    pub async fn start_match(&self, id: &str, start_ts: i64, end_ts: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE matches SET status = 'running', start_ts = ?2, end_ts = ?3 WHERE id = ?1",
            params![id, start_ts, end_ts],
        )
        .context("start match")?;
        Ok(())
    }

    /// Mark a match settled and record its result hash in one update.
    pub async fn settle_match(&self, id: &str, result_hash: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE matches SET status = 'settled', result_hash = ?2 WHERE id = ?1",
            params![id, result_hash],
        )
        .context("settle match")?;
        Ok(())
    }

    pub async fn match_history(&self, limit: u32) -> Result<Vec<MatchRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, start_ts, end_ts, status, result_hash FROM matches
             ORDER BY start_ts DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], Self::map_match_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("select match history")?;
        Ok(rows)
    }

    fn map_match_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MatchRow> {
        let status: String = row.get(3)?;
        Ok(MatchRow {
            id: row.get(0)?,
            start_ts: row.get(1)?,
            end_ts: row.get(2)?,
            status: status.parse().unwrap_or(MatchStatus::Pending),
            result_hash: row.get(4)?,
        })
    }

    // -------------------------------------------------------------------------
    // Participants
    // -------------------------------------------------------------------------

    pub async fn insert_participant(&self, row: &ParticipantRow) -> Result<()> {
        let strategy_json =
            serde_json::to_string(&row.strategy).context("serialise strategy")?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO participants (id, owner, match_id, name, prompt_raw, strategy, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.id,
                row.owner,
                row.match_id,
                row.name,
                row.prompt_raw,
                strategy_json,
                row.created_at
            ],
        )
        .context("insert participant")?;
        Ok(())
    }

    pub async fn participant_name_taken(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM participants WHERE name = ?1 COLLATE NOCASE",
                params![name],
                |r| r.get(0),
            )
            .context("check participant name")?;
        Ok(count > 0)
    }

    pub async fn participant_by_id(&self, id: &str) -> Result<Option<ParticipantRow>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, owner, match_id, name, prompt_raw, strategy, created_at
             FROM participants WHERE id = ?1",
            params![id],
            Self::map_participant_row,
        )
        .optional()
        .context("select participant")
    }

    pub async fn participants_for_match(&self, match_id: &str) -> Result<Vec<ParticipantRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, owner, match_id, name, prompt_raw, strategy, created_at
             FROM participants WHERE match_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![match_id], Self::map_participant_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("select roster")?;
        Ok(rows)
    }

    fn map_participant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ParticipantRow> {
        let strategy_json: String = row.get(5)?;
        Ok(ParticipantRow {
            id: row.get(0)?,
            owner: row.get(1)?,
            match_id: row.get(2)?,
            name: row.get(3)?,
            prompt_raw: row.get(4)?,
            strategy: serde_json::from_str(&strategy_json).unwrap_or_default(),
            created_at: row.get(6)?,
        })
    }

    // -------------------------------------------------------------------------
    // Winners
    // -------------------------------------------------------------------------

    pub async fn insert_winner(&self, row: &WinnerRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO winners
             (match_id, participant_id, owner, start_balance, end_balance, gain_pct, prize, paid, paid_tx)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.match_id,
                row.participant_id,
                row.owner,
                row.start_balance,
                row.end_balance,
                row.gain_pct,
                row.prize,
                row.paid as i64,
                row.paid_tx
            ],
        )
        .context("insert winner")?;
        Ok(())
    }

    pub async fn winners_for_match(&self, match_id: &str) -> Result<Vec<WinnerRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT match_id, participant_id, owner, start_balance, end_balance, gain_pct, prize, paid, paid_tx
             FROM winners WHERE match_id = ?1 ORDER BY end_balance DESC",
        )?;
        let rows = stmt
            .query_map(params![match_id], |row| {
                let paid: i64 = row.get(7)?;
                Ok(WinnerRow {
                    match_id: row.get(0)?,
                    participant_id: row.get(1)?,
                    owner: row.get(2)?,
                    start_balance: row.get(3)?,
                    end_balance: row.get(4)?,
                    gain_pct: row.get(5)?,
                    prize: row.get(6)?,
                    paid: paid != 0,
                    paid_tx: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("select winners")?;
        Ok(rows)
    }

    /// Mark a winner row paid. Returns false when no row matches.
    pub async fn mark_winner_paid(&self, participant_id: &str, tx_hash: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE winners SET paid = 1, paid_tx = ?2 WHERE participant_id = ?1",
                params![participant_id, tx_hash],
            )
            .context("mark winner paid")?;
        Ok(changed > 0)
    }

    // -------------------------------------------------------------------------
    // Burns (written by the external fee subsystem; read here)
    // -------------------------------------------------------------------------

    pub async fn record_burn(
        &self,
        owner: &str,
        tx_hash: &str,
        amount: f64,
        verified: bool,
        ts: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO burns (owner, tx_hash, amount, verified, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![owner, tx_hash, amount, verified as i64, ts],
        )
        .context("record burn")?;
        Ok(())
    }

    /// Entry-fee gate: has `owner` a verified burn at or after `since_ts`?
    pub async fn has_verified_burn(&self, owner: &str, since_ts: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM burns WHERE owner = ?1 AND verified = 1 AND ts >= ?2",
                params![owner, since_ts],
                |r| r.get(0),
            )
            .context("check burn")?;
        Ok(count > 0)
    }
}

impl std::fmt::Debug for RelationalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalStore").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (RelationalStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.db");
        let store = RelationalStore::new(path.to_str().unwrap()).unwrap();
        (store, dir)
    }

    fn match_row(id: &str, status: MatchStatus) -> MatchRow {
        MatchRow {
            id: id.to_string(),
            start_ts: 1_000,
            end_ts: 1_000 + 86_400_000,
            status,
            result_hash: None,
        }
    }

    fn participant(id: &str, owner: &str, name: &str, match_id: &str) -> ParticipantRow {
        ParticipantRow {
            id: id.to_string(),
            owner: owner.to_string(),
            match_id: match_id.to_string(),
            name: name.to_string(),
            prompt_raw: "momentum, tp 20".to_string(),
            strategy: StrategySpec::default(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn match_lifecycle_roundtrip() {
        let (store, _dir) = temp_store();
        store
            .create_match(&match_row("m1", MatchStatus::Pending))
            .await
            .unwrap();
        assert!(store.any_unsettled_match().await.unwrap());

        store.start_match("m1", 2_000, 2_000 + 86_400_000).await.unwrap();
        let running = store.running_match().await.unwrap().unwrap();
        assert_eq!(running.id, "m1");
        assert_eq!(running.start_ts, 2_000);

        store.settle_match("m1", "abc123").await.unwrap();
        let settled = store.get_match("m1").await.unwrap().unwrap();
        assert_eq!(settled.status, MatchStatus::Settled);
        assert_eq!(settled.result_hash.as_deref(), Some("abc123"));
        assert!(!store.any_unsettled_match().await.unwrap());
        assert!(store.running_match().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn participant_names_unique_case_insensitive() {
        let (store, _dir) = temp_store();
        store
            .insert_participant(&participant("p1", "0xaa", "MoonBot", "m1"))
            .await
            .unwrap();
        assert!(store.participant_name_taken("moonbot").await.unwrap());
        assert!(store.participant_name_taken("MOONBOT").await.unwrap());
        assert!(!store.participant_name_taken("other").await.unwrap());

        let err = store
            .insert_participant(&participant("p2", "0xbb", "moonBOT", "m1"))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn roster_and_strategy_roundtrip() {
        let (store, _dir) = temp_store();
        let mut row = participant("p1", "0xaa", "bot-one", "m1");
        row.strategy.threshold = 3.5;
        store.insert_participant(&row).await.unwrap();
        store
            .insert_participant(&participant("p2", "0xbb", "bot-two", "m1"))
            .await
            .unwrap();
        store
            .insert_participant(&participant("p3", "0xcc", "bot-three", "m2"))
            .await
            .unwrap();

        let roster = store.participants_for_match("m1").await.unwrap();
        assert_eq!(roster.len(), 2);
        let p1 = roster.iter().find(|p| p.id == "p1").unwrap();
        assert_eq!(p1.strategy.threshold, 3.5);
    }

    #[tokio::test]
    async fn winners_and_mark_paid() {
        let (store, _dir) = temp_store();
        store
            .insert_winner(&WinnerRow {
                match_id: "m1".to_string(),
                participant_id: "p1".to_string(),
                owner: "0xaa".to_string(),
                start_balance: 1.0,
                end_balance: 2.5,
                gain_pct: 150.0,
                prize: 1.5,
                paid: false,
                paid_tx: None,
            })
            .await
            .unwrap();

        assert!(store.mark_winner_paid("p1", "0xtx").await.unwrap());
        assert!(!store.mark_winner_paid("p-unknown", "0xtx").await.unwrap());

        let winners = store.winners_for_match("m1").await.unwrap();
        assert_eq!(winners.len(), 1);
        assert!(winners[0].paid);
        assert_eq!(winners[0].paid_tx.as_deref(), Some("0xtx"));
    }

    #[tokio::test]
    async fn burn_gate_respects_verification_and_time() {
        let (store, _dir) = temp_store();
        store
            .record_burn("0xaa", "0xt1", 5.0, true, 1_000)
            .await
            .unwrap();
        store
            .record_burn("0xbb", "0xt2", 5.0, false, 1_000)
            .await
            .unwrap();

        assert!(store.has_verified_burn("0xaa", 500).await.unwrap());
        // Burn predates the match start.
        assert!(!store.has_verified_burn("0xaa", 2_000).await.unwrap());
        // Unverified burns never count.
        assert!(!store.has_verified_burn("0xbb", 0).await.unwrap());
    }
}
