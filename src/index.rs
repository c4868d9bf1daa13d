//! Scope-partitioned chunk index over SQLite.
//!
//! The [`ScopeIndex`] trait is the seam between the retrieval pipeline and
//! the vector store; [`SqliteIndex`] implements it over the `chunks` table,
//! its `chunks_fts` FTS5 mirror, and the optional `chunk_vectors` embedding
//! rows. Every chunk belongs to exactly one scope (`"global"` or a
//! conversation id), and queries never cross scope boundaries.
//!
//! Ranking uses cosine similarity over stored embeddings when an embedding
//! provider is configured, and FTS5 bm25 otherwise.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::config::EmbeddingConfig;
use crate::embedding;
use crate::models::{ChunkRecord, ChunkRef, RetrievedChunk};

/// Scope label for the shared knowledge base.
pub const GLOBAL_SCOPE: &str = "global";

/// Write and query operations the retrieval pipeline needs from an index.
#[async_trait]
pub trait ScopeIndex: Send + Sync {
    /// Idempotent write keyed by chunk id; last write wins. Returns the
    /// number of chunks actually stored — a partial failure surfaces as a
    /// reduced count, not an error.
    async fn upsert(&self, records: &[ChunkRecord]) -> Result<usize>;

    /// Similarity search restricted to one scope, most similar first per
    /// the store's own metric.
    async fn query(&self, text: &str, scope: &str, limit: i64) -> Result<Vec<RetrievedChunk>>;

    /// All chunks in a scope, for listing distinct source documents.
    async fn get(&self, scope: &str) -> Result<Vec<ChunkRef>>;

    /// Deletes all chunks of one source within a scope. Returns the number
    /// of chunks removed.
    async fn remove(&self, scope: &str, source: &str) -> Result<usize>;
}

/// SQLite-backed [`ScopeIndex`].
pub struct SqliteIndex {
    pool: SqlitePool,
    embedding: EmbeddingConfig,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool, embedding: EmbeddingConfig) -> Self {
        Self { pool, embedding }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Stores one document's chunks in a single transaction, replacing any
    /// prior rows with the same ids.
    async fn upsert_group(&self, records: &[&ChunkRecord], vectors: &[Option<Vec<f32>>]) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for (record, vector) in records.iter().zip(vectors) {
            let mut hasher = Sha256::new();
            hasher.update(record.text.as_bytes());
            let text_sha256 = format!("{:x}", hasher.finalize());

            sqlx::query(
                r#"
                INSERT INTO chunks (id, scope, source, seq, text, text_sha256, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    text = excluded.text,
                    text_sha256 = excluded.text_sha256,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&record.id)
            .bind(&record.scope)
            .bind(&record.source)
            .bind(record.seq)
            .bind(&record.text)
            .bind(&text_sha256)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
                .bind(&record.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT INTO chunks_fts (chunk_id, scope, text) VALUES (?, ?, ?)")
                .bind(&record.id)
                .bind(&record.scope)
                .bind(&record.text)
                .execute(&mut *tx)
                .await?;

            if let Some(vec) = vector {
                sqlx::query(
                    r#"
                    INSERT INTO chunk_vectors (chunk_id, scope, model, dims, embedding, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(chunk_id) DO UPDATE SET
                        model = excluded.model,
                        dims = excluded.dims,
                        embedding = excluded.embedding,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&record.id)
                .bind(&record.scope)
                .bind(self.embedding.model.as_deref().unwrap_or_default())
                .bind(vec.len() as i64)
                .bind(embedding::vec_to_blob(vec))
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(records.len())
    }

    async fn query_fts(&self, text: &str, scope: &str, limit: i64) -> Result<Vec<RetrievedChunk>> {
        let match_expr = fts_match_expr(text);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT f.chunk_id, c.scope, c.source, c.text
            FROM chunks_fts f
            JOIN chunks c ON c.id = f.chunk_id
            WHERE chunks_fts MATCH ? AND f.scope = ?
            ORDER BY rank, f.chunk_id
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(scope)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .enumerate()
            .map(|(i, row)| RetrievedChunk {
                id: row.get("chunk_id"),
                scope: row.get("scope"),
                source: row.get("source"),
                text: row.get("text"),
                rank: i as i64 + 1,
            })
            .collect())
    }

    async fn query_vectors(&self, text: &str, scope: &str, limit: i64) -> Result<Vec<RetrievedChunk>> {
        let provider = embedding::create_provider(&self.embedding)?;
        let query_vec = embedding::embed_query(provider.as_ref(), &self.embedding, text).await?;

        // Fetch the scope's vectors and compute cosine similarity in Rust.
        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, c.scope, c.source, c.text, cv.embedding
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            WHERE cv.scope = ?
            "#,
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<(f32, RetrievedChunk)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = embedding::blob_to_vec(&blob);
                let similarity = embedding::cosine_similarity(&query_vec, &vec);
                (
                    similarity,
                    RetrievedChunk {
                        id: row.get("chunk_id"),
                        scope: row.get("scope"),
                        source: row.get("source"),
                        text: row.get("text"),
                        rank: 0,
                    },
                )
            })
            .collect();

        // Similarity desc, id asc as a deterministic tie-break.
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        scored.truncate(limit.max(0) as usize);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (_, mut chunk))| {
                chunk.rank = i as i64 + 1;
                chunk
            })
            .collect())
    }
}

#[async_trait]
impl ScopeIndex for SqliteIndex {
    async fn upsert(&self, records: &[ChunkRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        // Embed up front so a provider outage degrades to FTS-only rows
        // instead of failing the whole write.
        let vectors: Vec<Option<Vec<f32>>> = if self.embedding.is_enabled() {
            let provider = embedding::create_provider(&self.embedding)?;
            let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
            match embedding::embed_texts(provider.as_ref(), &self.embedding, &texts).await {
                Ok(vecs) => vecs.into_iter().map(Some).collect(),
                Err(e) => {
                    eprintln!("warning: embedding failed, indexing without vectors: {}", e);
                    vec![None; records.len()]
                }
            }
        } else {
            vec![None; records.len()]
        };

        // One transaction per (scope, source) group; a failed group reduces
        // the count instead of failing the batch.
        let mut stored = 0usize;
        let mut groups: Vec<(&str, &str)> = records
            .iter()
            .map(|r| (r.scope.as_str(), r.source.as_str()))
            .collect();
        groups.sort();
        groups.dedup();

        for (scope, source) in groups {
            let pairs: Vec<(&ChunkRecord, &Option<Vec<f32>>)> = records
                .iter()
                .zip(&vectors)
                .filter(|(r, _)| r.scope == scope && r.source == source)
                .collect();
            let group: Vec<&ChunkRecord> = pairs.iter().map(|(r, _)| *r).collect();
            let group_vecs: Vec<Option<Vec<f32>>> =
                pairs.iter().map(|(_, v)| (*v).clone()).collect();
            match self.upsert_group(&group, &group_vecs).await {
                Ok(n) => stored += n,
                Err(e) => {
                    eprintln!("warning: failed to index {}/{}: {}", scope, source, e);
                }
            }
        }

        Ok(stored)
    }

    async fn query(&self, text: &str, scope: &str, limit: i64) -> Result<Vec<RetrievedChunk>> {
        if text.trim().is_empty() || limit <= 0 {
            return Ok(Vec::new());
        }
        if self.embedding.is_enabled() {
            self.query_vectors(text, scope, limit).await
        } else {
            self.query_fts(text, scope, limit).await
        }
    }

    async fn get(&self, scope: &str) -> Result<Vec<ChunkRef>> {
        let rows = sqlx::query("SELECT id, source, seq FROM chunks WHERE scope = ? ORDER BY source, seq")
            .bind(scope)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| ChunkRef {
                id: row.get("id"),
                source: row.get("source"),
                seq: row.get("seq"),
            })
            .collect())
    }

    async fn remove(&self, scope: &str, source: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE scope = ? AND source = ?)",
        )
        .bind(scope)
        .bind(source)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE scope = ? AND source = ?)",
        )
        .bind(scope)
        .bind(source)
        .execute(&mut *tx)
        .await?;

        let removed = sqlx::query("DELETE FROM chunks WHERE scope = ? AND source = ?")
            .bind(scope)
            .bind(source)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(removed as usize)
    }
}

/// Rewrites free text into an FTS5 MATCH expression: an OR of double-quoted
/// terms. Raw user questions contain punctuation (`?`, `'`) that would
/// otherwise break MATCH syntax.
fn fts_match_expr(text: &str) -> String {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    terms.join(" OR ")
}
