//! SQLite-backed episodic memory: a durable typed event log with error
//! aggregation, derived principles, and age-based archival.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, info, warn};

use anima_types::{now_iso, Episode, Outcome, MAX_DESCRIPTION_LEN};

const VALID_CAUSES: [&str; 3] = ["my_assessment", "bad_plan", "external"];

/// An aggregated error row. Repeats of the same `error_type` bump
/// `repeat_count` instead of inserting new rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Row id.
    pub id: i64,
    /// Timestamp of the latest repeat.
    pub timestamp: String,
    /// Deduplication key.
    pub error_type: String,
    /// Description captured on first occurrence.
    pub description: String,
    /// Attributed cause.
    pub cause: String,
    /// Principle text back-annotated once one is derived from this error.
    pub principle_formed: Option<String>,
    /// How many times this error type has occurred.
    pub repeat_count: i64,
}

/// A behavioural rule derived from repeated errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principle {
    /// Row id.
    pub id: i64,
    /// Creation timestamp.
    pub timestamp: String,
    /// The rule text.
    pub text: String,
    /// The error row this principle was derived from, if any.
    pub source_error_id: Option<i64>,
    /// Whether the principle is still in force.
    pub active: bool,
}

/// Durable episodic log. One pooled connection, per-operation transactions,
/// WAL journaling. All writes validate before touching the database and all
/// failures return sentinels.
#[derive(Debug)]
pub struct EpisodicStore {
    pool: SqlitePool,
    db_path: Option<PathBuf>,
}

async fn single_connection_pool(options: SqliteConnectOptions) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

impl EpisodicStore {
    /// Open (or create) the store at the given path and run migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let store = Self {
            pool: single_connection_pool(options).await?,
            db_path: Some(path.to_path_buf()),
        };
        store.migrate().await?;
        info!(db = %path.display(), "episodic store initialised");
        Ok(store)
    }

    /// Open an in-memory store. Archival is disabled; used for testing.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        let store = Self { pool: single_connection_pool(options).await?, db_path: None };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp     TEXT    NOT NULL,
                event_type    TEXT    NOT NULL,
                description   TEXT    NOT NULL,
                outcome       TEXT    NOT NULL DEFAULT 'unknown',
                data          TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS errors (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp         TEXT NOT NULL,
                error_type        TEXT NOT NULL,
                description       TEXT NOT NULL,
                cause             TEXT NOT NULL DEFAULT 'my_assessment',
                principle_formed  TEXT,
                repeat_count      INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS principles (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp       TEXT    NOT NULL,
                text            TEXT    NOT NULL,
                source_error_id INTEGER REFERENCES errors(id),
                active          INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_episodes_event_type ON episodes(event_type)",
            "CREATE INDEX IF NOT EXISTS idx_episodes_timestamp ON episodes(timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_episodes_outcome ON episodes(outcome)",
            "CREATE INDEX IF NOT EXISTS idx_episodes_type_outcome ON episodes(event_type, outcome)",
            "CREATE INDEX IF NOT EXISTS idx_errors_error_type ON errors(error_type)",
            "CREATE INDEX IF NOT EXISTS idx_errors_timestamp ON errors(timestamp)",
        ] {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        debug!("episodic tables and indexes verified");
        Ok(())
    }

    fn validate_description(desc: &str, context: &str) -> bool {
        if desc.trim().is_empty() {
            warn!(context, "description is empty, skipping write");
            return false;
        }
        if desc.len() > MAX_DESCRIPTION_LEN {
            warn!(
                context,
                len = desc.len(),
                max = MAX_DESCRIPTION_LEN,
                "description too long, skipping write"
            );
            return false;
        }
        true
    }

    //─────────────────────────────
    //  Writes
    //─────────────────────────────

    /// Record an episode. Returns the new row id, or `None` when validation
    /// fails or the database errors (both are logged, neither raises).
    pub async fn add_episode(
        &self,
        event_type: &str,
        description: &str,
        outcome: Outcome,
        data: Option<serde_json::Value>,
    ) -> Option<i64> {
        if !Self::validate_description(description, "add_episode") {
            return None;
        }
        let data_json = data.map(|v| v.to_string());
        let result = sqlx::query(
            "INSERT INTO episodes (timestamp, event_type, description, outcome, data) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(now_iso())
        .bind(event_type)
        .bind(description.trim())
        .bind(outcome.as_str())
        .bind(data_json)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                let id = done.last_insert_rowid();
                debug!(id, event_type, "episode written");
                Some(id)
            }
            Err(e) => {
                error!(error = %e, "add_episode failed");
                None
            }
        }
    }

    /// Record an error, idempotent by `error_type`: a repeat bumps
    /// `repeat_count` and the timestamp instead of inserting a new row.
    /// Returns the affected row id.
    pub async fn add_error(
        &self,
        error_type: &str,
        description: &str,
        cause: &str,
    ) -> Option<i64> {
        if !Self::validate_description(description, "add_error") {
            return None;
        }
        let cause = if VALID_CAUSES.contains(&cause) {
            cause
        } else {
            warn!(cause, "invalid error cause, using 'my_assessment'");
            "my_assessment"
        };

        let existing = sqlx::query(
            "SELECT id FROM errors WHERE error_type = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(error_type)
        .fetch_optional(&self.pool)
        .await;

        match existing {
            Ok(Some(row)) => {
                let id: i64 = row.get("id");
                let updated = sqlx::query(
                    "UPDATE errors SET repeat_count = repeat_count + 1, timestamp = ? WHERE id = ?",
                )
                .bind(now_iso())
                .bind(id)
                .execute(&self.pool)
                .await;
                match updated {
                    Ok(_) => {
                        debug!(id, error_type, "error repeat_count incremented");
                        Some(id)
                    }
                    Err(e) => {
                        error!(error = %e, "add_error update failed");
                        None
                    }
                }
            }
            Ok(None) => {
                let inserted = sqlx::query(
                    "INSERT INTO errors (timestamp, error_type, description, cause) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(now_iso())
                .bind(error_type)
                .bind(description.trim())
                .bind(cause)
                .execute(&self.pool)
                .await;
                match inserted {
                    Ok(done) => Some(done.last_insert_rowid()),
                    Err(e) => {
                        error!(error = %e, "add_error insert failed");
                        None
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "add_error lookup failed");
                None
            }
        }
    }

    /// Add a principle, back-annotating the source error row when given.
    pub async fn add_principle(&self, text: &str, source_error_id: Option<i64>) -> Option<i64> {
        if !Self::validate_description(text, "add_principle") {
            return None;
        }
        let inserted = sqlx::query(
            "INSERT INTO principles (timestamp, text, source_error_id, active) VALUES (?, ?, ?, 1)",
        )
        .bind(now_iso())
        .bind(text.trim())
        .bind(source_error_id)
        .execute(&self.pool)
        .await;

        let id = match inserted {
            Ok(done) => done.last_insert_rowid(),
            Err(e) => {
                error!(error = %e, "add_principle failed");
                return None;
            }
        };

        if let Some(error_id) = source_error_id {
            if let Err(e) = sqlx::query("UPDATE errors SET principle_formed = ? WHERE id = ?")
                .bind(text.trim())
                .bind(error_id)
                .execute(&self.pool)
                .await
            {
                error!(error = %e, "principle back-annotation failed");
            }
        }
        info!(id, "principle formed: {}", text.chars().take(80).collect::<String>());
        Some(id)
    }

    //─────────────────────────────
    //  Reads
    //─────────────────────────────

    fn row_to_episode(row: &sqlx::sqlite::SqliteRow) -> Episode {
        let outcome: String = row.get("outcome");
        let data: Option<String> = row.get("data");
        Episode {
            id: row.get("id"),
            timestamp: row.get("timestamp"),
            event_type: row.get("event_type"),
            description: row.get("description"),
            outcome: Outcome::normalize(&outcome),
            data: data.and_then(|raw| serde_json::from_str(&raw).ok()),
        }
    }

    /// Total number of episodes. Zero on storage error.
    pub async fn count(&self) -> i64 {
        match sqlx::query("SELECT COUNT(*) AS cnt FROM episodes")
            .fetch_one(&self.pool)
            .await
        {
            Ok(row) => row.get("cnt"),
            Err(e) => {
                error!(error = %e, "count failed");
                0
            }
        }
    }

    /// The last `limit` episodes, newest first.
    pub async fn get_recent(&self, limit: i64) -> Vec<Episode> {
        match sqlx::query("SELECT * FROM episodes ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows.iter().map(Self::row_to_episode).collect(),
            Err(e) => {
                error!(error = %e, "get_recent failed");
                Vec::new()
            }
        }
    }

    /// Episodes filtered by event type (and optionally outcome), newest
    /// first.
    pub async fn get_by_type(
        &self,
        event_type: &str,
        limit: i64,
        outcome: Option<Outcome>,
    ) -> Vec<Episode> {
        let result = match outcome {
            Some(o) => {
                sqlx::query(
                    "SELECT * FROM episodes WHERE event_type = ? AND outcome = ? \
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(event_type)
                .bind(o.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM episodes WHERE event_type = ? ORDER BY id DESC LIMIT ?")
                    .bind(event_type)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        };
        match result {
            Ok(rows) => rows.iter().map(Self::row_to_episode).collect(),
            Err(e) => {
                error!(error = %e, "get_by_type failed");
                Vec::new()
            }
        }
    }

    /// How many episodes of this type occurred in the last `hours` hours.
    /// Used for novelty scoring.
    pub async fn count_recent_similar(&self, event_type: &str, hours: i64) -> i64 {
        let cutoff = (chrono::Local::now() - chrono::Duration::hours(hours))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        match sqlx::query(
            "SELECT COUNT(*) AS cnt FROM episodes WHERE event_type = ? AND timestamp >= ?",
        )
        .bind(event_type)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        {
            Ok(row) => row.get("cnt"),
            Err(e) => {
                error!(error = %e, "count_recent_similar failed");
                0
            }
        }
    }

    /// All active principles, oldest first.
    pub async fn get_active_principles(&self) -> Vec<Principle> {
        match sqlx::query("SELECT * FROM principles WHERE active = 1 ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows
                .iter()
                .map(|row| Principle {
                    id: row.get("id"),
                    timestamp: row.get("timestamp"),
                    text: row.get("text"),
                    source_error_id: row.get("source_error_id"),
                    active: row.get::<i64, _>("active") != 0,
                })
                .collect(),
            Err(e) => {
                error!(error = %e, "get_active_principles failed");
                Vec::new()
            }
        }
    }

    /// The most recent error rows, newest first.
    pub async fn recent_errors(&self, limit: i64) -> Vec<ErrorRecord> {
        match sqlx::query("SELECT * FROM errors ORDER BY timestamp DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows
                .iter()
                .map(|row| ErrorRecord {
                    id: row.get("id"),
                    timestamp: row.get("timestamp"),
                    error_type: row.get("error_type"),
                    description: row.get("description"),
                    cause: row.get("cause"),
                    principle_formed: row.get("principle_formed"),
                    repeat_count: row.get("repeat_count"),
                })
                .collect(),
            Err(e) => {
                error!(error = %e, "recent_errors failed");
                Vec::new()
            }
        }
    }

    //─────────────────────────────
    //  Maintenance
    //─────────────────────────────

    /// Move episodes older than `days` into a month-stamped sibling archive
    /// database, then delete them from the primary and reclaim space.
    /// Idempotent across partial failures: rows land in the archive with
    /// `INSERT OR IGNORE` *before* the delete, so a crash in between only
    /// means the next run re-copies nothing and finishes the delete.
    /// Returns the number of episodes archived.
    pub async fn archive_old(&self, days: i64) -> u64 {
        let Some(db_path) = &self.db_path else {
            return 0; // in-memory store, nothing to archive to
        };
        let cutoff = (chrono::Local::now() - chrono::Duration::days(days))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();

        match self.archive_older_than(db_path, &cutoff).await {
            Ok(0) => {
                debug!(days, "no episodes old enough to archive");
                0
            }
            Ok(n) => {
                info!(archived = n, days, "episodes archived");
                n
            }
            Err(e) => {
                error!(error = %e, "archive_old failed");
                0
            }
        }
    }

    async fn archive_older_than(&self, db_path: &Path, cutoff: &str) -> Result<u64> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS cnt FROM episodes WHERE timestamp < ?")
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await?
            .get("cnt");
        if count == 0 {
            return Ok(0);
        }

        let archive_dir = db_path.parent().unwrap_or(Path::new(".")).join("archives");
        std::fs::create_dir_all(&archive_dir)?;
        let month = chrono::Local::now().format("%Y_%m");
        let archive_path = archive_dir.join(format!("episodic_archive_{month}.db"));

        let archive_pool = single_connection_pool(
            SqliteConnectOptions::new()
                .filename(&archive_path)
                .create_if_missing(true),
        )
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                id            INTEGER PRIMARY KEY,
                timestamp     TEXT    NOT NULL,
                event_type    TEXT    NOT NULL,
                description   TEXT    NOT NULL,
                outcome       TEXT    NOT NULL DEFAULT 'unknown',
                data          TEXT
            )
            "#,
        )
        .execute(&archive_pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_episodes_timestamp ON episodes(timestamp)")
            .execute(&archive_pool)
            .await?;

        let rows = sqlx::query("SELECT * FROM episodes WHERE timestamp < ?")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        for row in &rows {
            sqlx::query("INSERT OR IGNORE INTO episodes VALUES (?, ?, ?, ?, ?, ?)")
                .bind(row.get::<i64, _>("id"))
                .bind(row.get::<String, _>("timestamp"))
                .bind(row.get::<String, _>("event_type"))
                .bind(row.get::<String, _>("description"))
                .bind(row.get::<String, _>("outcome"))
                .bind(row.get::<Option<String>, _>("data"))
                .execute(&archive_pool)
                .await?;
        }
        archive_pool.close().await;

        sqlx::query("DELETE FROM episodes WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        sqlx::query("VACUUM").execute(&self.pool).await?;

        Ok(rows.len() as u64)
    }

    /// Lightweight probe: all three tables exist and answer a trivial read.
    pub async fn health_check(&self) -> bool {
        for table in ["episodes", "errors", "principles"] {
            let probe = sqlx::query(&format!("SELECT 1 FROM {table} LIMIT 1"))
                .fetch_optional(&self.pool)
                .await;
            if let Err(e) = probe {
                error!(table, error = %e, "health probe failed");
                return false;
            }
        }
        true
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
