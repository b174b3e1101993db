//! SQLite-backed embedding store with in-process cosine top-k search.
//!
//! Embeddings are fixed-dimension `f32` vectors stored as little-endian
//! BLOBs. Dimension, NaN and infinity are validated on every write and
//! every query; invalid input returns the failure sentinel without touching
//! the database.

use std::path::Path;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, info};

use anima_types::{now_epoch, VectorHit};

/// Embedding store with cosine similarity search and age-based cleanup.
#[derive(Debug)]
pub struct VectorStore {
    pool: SqlitePool,
    expected_dim: usize,
}

impl VectorStore {
    /// Open (or create) the store at the given path.
    pub async fn open<P: AsRef<Path>>(path: P, expected_dim: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let store = Self { pool: Self::pool(options).await?, expected_dim };
        store.migrate().await?;
        info!(db = %path.display(), expected_dim, "vector store initialised");
        Ok(store)
    }

    /// Open an in-memory store, used for testing.
    pub async fn in_memory(expected_dim: usize) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(":memory:");
        let store = Self { pool: Self::pool(options).await?, expected_dim };
        store.migrate().await?;
        Ok(store)
    }

    async fn pool(options: SqliteConnectOptions) -> Result<SqlitePool> {
        Ok(SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id  INTEGER,
                event_type  TEXT,
                text        TEXT,
                embedding   BLOB      NOT NULL,
                created_at  REAL      NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_event_type ON vectors(event_type)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_created_at ON vectors(created_at)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The embedding dimension this store accepts.
    pub fn expected_dim(&self) -> usize {
        self.expected_dim
    }

    fn validate(&self, embedding: &[f32], context: &str) -> bool {
        if embedding.is_empty() {
            return false;
        }
        if embedding.len() != self.expected_dim {
            error!(
                context,
                expected = self.expected_dim,
                got = embedding.len(),
                "embedding dimension mismatch, rejecting"
            );
            return false;
        }
        if embedding.iter().any(|v| v.is_nan()) {
            error!(context, "embedding contains NaN, rejecting");
            return false;
        }
        if embedding.iter().any(|v| v.is_infinite()) {
            error!(context, "embedding contains infinity, rejecting");
            return false;
        }
        true
    }

    fn to_blob(embedding: &[f32]) -> Vec<u8> {
        let mut blob = Vec::with_capacity(embedding.len() * 4);
        for v in embedding {
            blob.extend_from_slice(&v.to_le_bytes());
        }
        blob
    }

    fn from_blob(blob: &[u8]) -> Vec<f32> {
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    //─────────────────────────────
    //  Write
    //─────────────────────────────

    /// Store an embedding. Returns the new row id, or `None` on validation
    /// failure or storage error (logged, never raised).
    pub async fn add(
        &self,
        episode_id: i64,
        event_type: &str,
        text: &str,
        embedding: &[f32],
    ) -> Option<i64> {
        if !self.validate(embedding, "add") {
            return None;
        }
        let result = sqlx::query(
            "INSERT INTO vectors (episode_id, event_type, text, embedding, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(episode_id)
        .bind(event_type)
        .bind(text)
        .bind(Self::to_blob(embedding))
        .bind(now_epoch())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                let id = done.last_insert_rowid();
                debug!(id, event_type, episode_id, "vector stored");
                Some(id)
            }
            Err(e) => {
                error!(error = %e, "vector add failed");
                None
            }
        }
    }

    //─────────────────────────────
    //  Search
    //─────────────────────────────

    /// Top-k most similar records by cosine similarity, ties broken by
    /// ascending id. Empty result on invalid query or storage error.
    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        event_type_filter: Option<&str>,
    ) -> Vec<VectorHit> {
        if !self.validate(query, "search") {
            return Vec::new();
        }

        let rows = match event_type_filter {
            Some(filter) => {
                sqlx::query(
                    "SELECT id, episode_id, event_type, text, embedding, created_at \
                     FROM vectors WHERE event_type = ?",
                )
                .bind(filter)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, episode_id, event_type, text, embedding, created_at FROM vectors",
                )
                .fetch_all(&self.pool)
                .await
            }
        };

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "vector search failed");
                return Vec::new();
            }
        };

        let mut scored: Vec<VectorHit> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = Self::from_blob(&blob);
                if stored.len() != self.expected_dim {
                    debug!(id = row.get::<i64, _>("id"), "skipping row with stale dimension");
                    return None;
                }
                Some(VectorHit {
                    id: row.get("id"),
                    episode_id: row.get::<Option<i64>, _>("episode_id").unwrap_or_default(),
                    event_type: row.get::<Option<String>, _>("event_type").unwrap_or_default(),
                    text: row.get::<Option<String>, _>("text").unwrap_or_default(),
                    score: cosine_similarity(query, &stored),
                    created_at: row.get("created_at"),
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        scored.truncate(top_k);
        scored
    }

    //─────────────────────────────
    //  Reads and maintenance
    //─────────────────────────────

    /// Total number of stored vectors. Zero on storage error.
    pub async fn count(&self) -> i64 {
        match sqlx::query("SELECT COUNT(*) AS cnt FROM vectors")
            .fetch_one(&self.pool)
            .await
        {
            Ok(row) => row.get("cnt"),
            Err(e) => {
                error!(error = %e, "vector count failed");
                0
            }
        }
    }

    /// The last `limit` records (no embedding payload), newest first.
    pub async fn get_recent(&self, limit: i64) -> Vec<VectorHit> {
        match sqlx::query(
            "SELECT id, episode_id, event_type, text, created_at \
             FROM vectors ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows
                .iter()
                .map(|row| VectorHit {
                    id: row.get("id"),
                    episode_id: row.get::<Option<i64>, _>("episode_id").unwrap_or_default(),
                    event_type: row.get::<Option<String>, _>("event_type").unwrap_or_default(),
                    text: row.get::<Option<String>, _>("text").unwrap_or_default(),
                    score: 0.0,
                    created_at: row.get("created_at"),
                })
                .collect(),
            Err(e) => {
                error!(error = %e, "vector get_recent failed");
                Vec::new()
            }
        }
    }

    /// Delete vectors older than `days` days. Returns the number removed.
    pub async fn delete_old(&self, days: i64) -> u64 {
        let cutoff = now_epoch() - (days as f64) * 86_400.0;
        match sqlx::query("DELETE FROM vectors WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
        {
            Ok(done) => {
                let deleted = done.rows_affected();
                if deleted > 0 {
                    info!(deleted, days, "old vectors removed");
                }
                deleted
            }
            Err(e) => {
                error!(error = %e, "vector delete_old failed");
                0
            }
        }
    }

    /// [`Self::delete_old`] followed by VACUUM to reclaim disk space. Called
    /// on the orchestrator's maintenance cadence.
    pub async fn cleanup(&self, days: i64) -> u64 {
        let deleted = self.delete_old(days).await;
        if deleted > 0 {
            if let Err(e) = sqlx::query("VACUUM").execute(&self.pool).await {
                error!(error = %e, "vector VACUUM failed");
            }
        }
        deleted
    }

    /// Probe: the table exists and answers a trivial aggregate.
    pub async fn health_check(&self) -> bool {
        match sqlx::query("SELECT COUNT(*) FROM vectors").fetch_one(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "vector health probe failed");
                false
            }
        }
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Cosine similarity in [-1, 1]; zero when either vector has zero norm.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm = norm_a * norm_b;
    if norm > 0.0 {
        dot / norm
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 8;

    fn unit(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[axis] = 1.0;
        v
    }

    #[tokio::test]
    async fn add_then_search_returns_inserted_first() {
        let store = VectorStore::in_memory(DIM).await.unwrap();
        store.add(1, "monologue", "about files", &unit(0)).await.unwrap();
        store.add(2, "monologue", "about errors", &unit(1)).await.unwrap();

        let hits = store.search(&unit(1), 1, None).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].episode_id, 2);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn ties_break_by_ascending_id() {
        let store = VectorStore::in_memory(DIM).await.unwrap();
        let a = store.add(1, "t", "first", &unit(0)).await.unwrap();
        let b = store.add(2, "t", "second", &unit(0)).await.unwrap();
        assert!(a < b);

        let hits = store.search(&unit(0), 2, None).await;
        assert_eq!(hits[0].id, a);
        assert_eq!(hits[1].id, b);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let store = VectorStore::in_memory(768).await.unwrap();
        let wrong = vec![0.0_f32; 100];
        assert!(store.add(1, "t", "x", &wrong).await.is_none());
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn nan_and_infinity_are_rejected() {
        let store = VectorStore::in_memory(DIM).await.unwrap();
        let mut with_nan = unit(0);
        with_nan[3] = f32::NAN;
        assert!(store.add(1, "t", "x", &with_nan).await.is_none());

        let mut with_inf = unit(0);
        with_inf[3] = f32::INFINITY;
        assert!(store.add(1, "t", "x", &with_inf).await.is_none());

        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn event_type_filter_restricts_candidates() {
        let store = VectorStore::in_memory(DIM).await.unwrap();
        store.add(1, "monologue", "a", &unit(0)).await.unwrap();
        store.add(2, "diary", "b", &unit(0)).await.unwrap();

        let hits = store.search(&unit(0), 10, Some("diary")).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].event_type, "diary");
    }

    #[tokio::test]
    async fn delete_old_removes_aged_rows_only() {
        let store = VectorStore::in_memory(DIM).await.unwrap();
        store.add(1, "t", "fresh", &unit(0)).await.unwrap();
        // A generous cutoff far in the past removes nothing.
        assert_eq!(store.delete_old(30).await, 0);
        assert_eq!(store.count().await, 1);
        // Cutoff in the future (negative age) removes the fresh row.
        assert_eq!(store.delete_old(-1).await, 1);
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn search_on_empty_store_is_empty() {
        let store = VectorStore::in_memory(DIM).await.unwrap();
        assert!(store.search(&unit(0), 5, None).await.is_empty());
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn blob_roundtrip_is_lossless() {
        let original = vec![0.25_f32, -1.5, 3.75, 0.0];
        let blob = VectorStore::to_blob(&original);
        assert_eq!(blob.len(), 16);
        assert_eq!(VectorStore::from_blob(&blob), original);
    }
}
