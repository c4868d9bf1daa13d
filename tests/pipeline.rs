//! In-process pipeline tests over a temporary SQLite database: scoped
//! indexing, retrieval merge order, history windowing, and the question
//! orchestrator with a stub generation backend.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;

use scope_rag::ask;
use scope_rag::auth;
use scope_rag::chunk;
use scope_rag::config::{
    AuthConfig, ChunkingConfig, Config, DbConfig, EmbeddingConfig, LlmConfig, RetrievalConfig,
    ServerConfig,
};
use scope_rag::db;
use scope_rag::history;
use scope_rag::index::{ScopeIndex, SqliteIndex, GLOBAL_SCOPE};
use scope_rag::ingest;
use scope_rag::llm::GenerationClient;
use scope_rag::migrate;
use scope_rag::models::{ChatRequest, Turn};
use scope_rag::retrieve;

fn test_config(root: &std::path::Path) -> Config {
    Config {
        db: DbConfig {
            path: root.join("rag.sqlite"),
        },
        server: ServerConfig::default(),
        auth: AuthConfig {
            token_secret: Some("pipeline-test-secret".to_string()),
            token_ttl_hours: 24,
        },
        chunking: ChunkingConfig::default(),
        retrieval: RetrievalConfig::default(),
        llm: LlmConfig::default(),
        embedding: EmbeddingConfig::default(),
    }
}

async fn setup() -> (TempDir, Config, SqlitePool, SqliteIndex) {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    migrate::run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    let index = SqliteIndex::new(pool.clone(), config.embedding.clone());
    (tmp, config, pool, index)
}

async fn ingest_text(index: &SqliteIndex, scope: &str, filename: &str, text: &str) -> usize {
    let outcome = ingest::ingest_document(index, 1500, scope, filename, text.as_bytes())
        .await
        .unwrap();
    assert_eq!(outcome.status, "ok");
    outcome.chunks_added
}

async fn create_user_and_conversation(pool: &SqlitePool, email: &str) -> (i64, String) {
    auth::signup(pool, "pipeline-test-secret", 24, email, "pw")
        .await
        .unwrap();
    let user_id: i64 = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
        .bind(email)
        .fetch_one(pool)
        .await
        .unwrap();

    let convo_id = uuid::Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO conversations (id, user_id, created_at) VALUES (?, ?, ?)")
        .bind(&convo_id)
        .bind(user_id)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(pool)
        .await
        .unwrap();
    (user_id, convo_id)
}

// ============ Index ============

#[tokio::test]
async fn queries_never_cross_scope_boundaries() {
    let (_tmp, _config, _pool, index) = setup().await;

    ingest_text(&index, "convo-a", "a.txt", "The falcon code is kestrel.").await;
    ingest_text(&index, GLOBAL_SCOPE, "g.txt", "The falcon species is widespread.").await;

    let local = index.query("falcon", "convo-a", 10).await.unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].scope, "convo-a");

    let global = index.query("falcon", GLOBAL_SCOPE, 10).await.unwrap();
    assert_eq!(global.len(), 1);
    assert_eq!(global[0].scope, GLOBAL_SCOPE);

    // A scope with no chunks matches nothing, even with matching terms elsewhere.
    let other = index.query("falcon", "convo-b", 10).await.unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn reingest_converges_to_same_chunks() {
    let (_tmp, _config, pool, index) = setup().await;

    let first = ingest_text(&index, GLOBAL_SCOPE, "doc.txt", "Stable content here.").await;
    let second = ingest_text(&index, GLOBAL_SCOPE, "doc.txt", "Stable content here.").await;
    assert_eq!(first, second);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count as usize, first);

    let fts_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(fts_count, count);
}

#[tokio::test]
async fn shrunken_reupload_leaves_no_stale_tail() {
    let (_tmp, _config, pool, index) = setup().await;

    // Two paragraphs sized to force two chunks, then a one-chunk re-upload.
    let big = format!("{}\n\n{}", "alpha ".repeat(200), "beta ".repeat(200));
    let n_big = ingest_text(&index, "convo-a", "doc.txt", &big).await;
    assert!(n_big >= 2);

    let n_small = ingest_text(&index, "convo-a", "doc.txt", "just one paragraph").await;
    assert_eq!(n_small, 1);

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE scope = 'convo-a' AND source = 'doc.txt'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn remove_purges_chunks_and_fts_rows() {
    let (_tmp, _config, pool, index) = setup().await;

    ingest_text(&index, "convo-a", "doc.txt", "Removable content about quasar.").await;
    ingest_text(&index, "convo-a", "other.txt", "Unrelated content about pulsar.").await;

    let removed = index.remove("convo-a", "doc.txt").await.unwrap();
    assert_eq!(removed, 1);

    assert!(index.query("quasar", "convo-a", 10).await.unwrap().is_empty());
    // The sibling document survives.
    assert_eq!(index.query("pulsar", "convo-a", 10).await.unwrap().len(), 1);

    let orphans: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts WHERE chunk_id LIKE 'convo-a:doc.txt:%'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(orphans, 0);
}

#[tokio::test]
async fn unsupported_upload_reports_error_and_writes_nothing() {
    let (_tmp, _config, pool, index) = setup().await;

    let outcome = ingest::ingest_document(&index, 1500, GLOBAL_SCOPE, "binary.exe", b"\x00\x01")
        .await
        .unwrap();
    assert_eq!(outcome.status, "error");
    assert_eq!(outcome.chunks_added, 0);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn listing_a_scope_enumerates_its_sources() {
    let (_tmp, _config, _pool, index) = setup().await;

    ingest_text(&index, "convo-a", "one.txt", "first document").await;
    ingest_text(&index, "convo-a", "two.txt", "second document").await;
    ingest_text(&index, GLOBAL_SCOPE, "shared.txt", "global document").await;

    let refs = index.get("convo-a").await.unwrap();
    let sources: Vec<&str> = refs.iter().map(|r| r.source.as_str()).collect();
    assert_eq!(sources, vec!["one.txt", "two.txt"]);
}

// ============ Retrieval ============

#[tokio::test]
async fn retrieval_merges_local_before_global() {
    let (_tmp, _config, _pool, index) = setup().await;

    ingest_text(&index, "convo-a", "local.txt", "Private zephyr protocol details.").await;
    ingest_text(&index, GLOBAL_SCOPE, "shared.txt", "Public zephyr standard overview.").await;

    let outcome = retrieve::retrieve(&index, "zephyr", "convo-a", 5, 5, 200)
        .await
        .unwrap();

    assert_eq!(outcome.citations.len(), 2);
    assert_eq!(outcome.citations[0].source, "local.txt");
    assert_eq!(outcome.citations[1].source, "shared.txt");
    // Context blocks follow the same order.
    let local_pos = outcome.context_text.find("local.txt").unwrap();
    let global_pos = outcome.context_text.find("shared.txt").unwrap();
    assert!(local_pos < global_pos);
}

#[tokio::test]
async fn retrieval_with_no_matches_yields_sentinel() {
    let (_tmp, _config, _pool, index) = setup().await;

    ingest_text(&index, GLOBAL_SCOPE, "doc.txt", "Nothing relevant in here.").await;

    let outcome = retrieve::retrieve(&index, "xylophone", "convo-a", 5, 5, 200)
        .await
        .unwrap();
    assert_eq!(outcome.context_text, retrieve::NO_CONTEXT_SENTINEL);
    assert!(outcome.citations.is_empty());
}

// ============ History ============

#[tokio::test]
async fn history_window_keeps_most_recent_turns_in_order() {
    let (_tmp, _config, pool, _index) = setup().await;
    let (_user_id, convo_id) = create_user_and_conversation(&pool, "h@example.com").await;

    // Four exchanges, eight messages.
    for i in 1..=4 {
        for (role, content) in [("user", format!("q{}", i)), ("assistant", format!("a{}", i))] {
            sqlx::query(
                "INSERT INTO messages (conversation_id, role, content, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(&convo_id)
            .bind(role)
            .bind(&content)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&pool)
            .await
            .unwrap();
        }
    }

    let turns = history::assemble(&pool, &convo_id, 6).await.unwrap();
    let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["q2", "a2", "q3", "a3", "q4", "a4"]);
}

#[tokio::test]
async fn history_window_of_zero_is_empty() {
    let (_tmp, _config, pool, _index) = setup().await;
    let (_user_id, convo_id) = create_user_and_conversation(&pool, "z@example.com").await;

    sqlx::query(
        "INSERT INTO messages (conversation_id, role, content, timestamp) VALUES (?, 'user', 'q', ?)",
    )
    .bind(&convo_id)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(&pool)
    .await
    .unwrap();

    let turns = history::assemble(&pool, &convo_id, 0).await.unwrap();
    assert!(turns.is_empty());
}

// ============ Orchestrator ============

struct StubLlm {
    reply: Option<String>,
}

#[async_trait]
impl GenerationClient for StubLlm {
    async fn generate(
        &self,
        _system_prompt: &str,
        _history: &[Turn],
        _question: &str,
        _model: Option<&str>,
        _temperature: Option<f32>,
    ) -> anyhow::Result<String> {
        match &self.reply {
            Some(reply) => Ok(reply.clone()),
            None => anyhow::bail!("provider unavailable"),
        }
    }
}

fn request(message: &str) -> ChatRequest {
    ChatRequest {
        message: message.to_string(),
        settings: None,
    }
}

#[tokio::test]
async fn answered_question_persists_the_pair_with_one_timestamp() {
    let (_tmp, config, pool, index) = setup().await;
    let (user_id, convo_id) = create_user_and_conversation(&pool, "a@example.com").await;
    ingest_text(&index, &convo_id, "doc.txt", "The launch code is omega.").await;

    let llm = StubLlm {
        reply: Some("The code is omega.".to_string()),
    };
    let response = ask::answer_question(
        &pool,
        &index,
        &llm,
        &config.retrieval,
        user_id,
        &convo_id,
        &request("What is the launch code?"),
    )
    .await;

    assert_eq!(response.answer, "The code is omega.");
    assert_eq!(response.citations.len(), 1);
    assert_eq!(response.citations[0].source, "doc.txt");

    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT role, content, timestamp FROM messages WHERE conversation_id = ? ORDER BY id",
    )
    .bind(&convo_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, "user");
    assert_eq!(rows[0].1, "What is the launch code?");
    assert_eq!(rows[1].0, "assistant");
    // The user/assistant pair shares a single timestamp.
    assert_eq!(rows[0].2, rows[1].2);
}

#[tokio::test]
async fn foreign_conversation_gets_access_denied_answer() {
    let (_tmp, config, pool, index) = setup().await;
    let (_owner_id, convo_id) = create_user_and_conversation(&pool, "owner@example.com").await;
    let (intruder_id, _) = create_user_and_conversation(&pool, "intruder@example.com").await;

    let llm = StubLlm {
        reply: Some("should not be reached".to_string()),
    };
    let response = ask::answer_question(
        &pool,
        &index,
        &llm,
        &config.retrieval,
        intruder_id,
        &convo_id,
        &request("anything"),
    )
    .await;

    assert_eq!(response.answer, ask::ACCESS_DENIED);
    assert!(response.citations.is_empty());
}

#[tokio::test]
async fn generation_failure_folds_into_answer_and_persists_nothing() {
    let (_tmp, config, pool, index) = setup().await;
    let (user_id, convo_id) = create_user_and_conversation(&pool, "f@example.com").await;

    let llm = StubLlm { reply: None };
    let response = ask::answer_question(
        &pool,
        &index,
        &llm,
        &config.retrieval,
        user_id,
        &convo_id,
        &request("anything"),
    )
    .await;

    assert!(response.answer.starts_with("An error occurred while answering:"));
    assert!(response.answer.contains("provider unavailable"));
    assert!(response.citations.is_empty());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
        .bind(&convo_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn second_question_sees_prior_exchange_in_history() {
    let (_tmp, config, pool, index) = setup().await;
    let (user_id, convo_id) = create_user_and_conversation(&pool, "s@example.com").await;

    let llm = StubLlm {
        reply: Some("first answer".to_string()),
    };
    ask::answer_question(
        &pool,
        &index,
        &llm,
        &config.retrieval,
        user_id,
        &convo_id,
        &request("first question"),
    )
    .await;

    let turns = history::assemble(&pool, &convo_id, config.retrieval.history_turns)
        .await
        .unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, "user");
    assert_eq!(turns[0].content, "first question");
    assert_eq!(turns[1].role, "assistant");
    assert_eq!(turns[1].content, "first answer");
}

// ============ Chunk ids ============

#[tokio::test]
async fn chunk_ids_survive_round_trip_through_the_index() {
    let (_tmp, _config, _pool, index) = setup().await;

    let chunks = chunk::chunk_document(b"some text about nebula", "Notes V2.txt", 1500);
    let records = chunk::build_records("convo-a", "Notes V2.txt", chunks);
    index.upsert(&records).await.unwrap();

    let hits = index.query("nebula", "convo-a", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "convo-a:Notes_V2.txt:0");
    assert_eq!(hits[0].source, "Notes_V2.txt");
}
