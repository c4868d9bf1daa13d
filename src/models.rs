//! Core data models used throughout scope-rag.
//!
//! These types represent the users, conversations, chunks, and chat payloads
//! that flow through the ingestion and question-answering pipeline.

use serde::{Deserialize, Serialize};

/// Registered account. Passwords are stored as salted SHA-256 hashes.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
}

/// One stored message of a conversation. Ascending rowid defines turn order;
/// the user/assistant messages of an exchange share one timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub timestamp: String,
}

/// A role-tagged turn handed to the generation backend.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

/// A chunk as written to the index.
///
/// `id` is a pure function of `(scope, source, seq)`, so re-ingesting the
/// same file yields the same ids and upserts overwrite instead of duplicating.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub scope: String,
    pub source: String,
    pub seq: i64,
    pub text: String,
}

/// A chunk returned from a scoped similarity query, most similar first.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub id: String,
    pub scope: String,
    pub source: String,
    pub text: String,
    /// 1-based position in the store's ranking for this query.
    pub rank: i64,
}

/// Chunk listing entry (no text), used to enumerate a scope's documents.
#[derive(Debug, Clone)]
pub struct ChunkRef {
    pub id: String,
    pub source: String,
    pub seq: i64,
}

/// Incoming question payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub settings: Option<ChatSettings>,
}

/// Optional per-request generation overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatSettings {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Answer payload returned for every question, including failed ones.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// Display-oriented reference to a retrieved chunk. `doc` is truncated for
/// display; the generation prompt always receives the full chunk text.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub source: String,
    pub doc: String,
    pub chunk_id: String,
}

/// Result of one document upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub status: String,
    pub chunks_added: usize,
}
