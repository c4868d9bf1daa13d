//! Question orchestration: validate, retrieve, generate, persist.
//!
//! Every outcome — including ownership failures and provider faults — is
//! returned as a normal [`ChatResponse`]; an internal error never escapes
//! as a transport failure. A failed cycle persists nothing; a successful
//! one appends the user/assistant pair with one shared timestamp, and a
//! persistence failure is logged and swallowed since the answer has already
//! been produced.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::{Config, RetrievalConfig};
use crate::db;
use crate::history;
use crate::index::{ScopeIndex, SqliteIndex};
use crate::llm::{create_generation_client, GenerationClient};
use crate::models::{ChatRequest, ChatResponse};
use crate::retrieve;

/// Answer returned when the conversation is missing or owned by another user.
pub const ACCESS_DENIED: &str = "Access denied: conversation not found or not owned by you.";

const SYSTEM_PROMPT_TEMPLATE: &str = "You are a helpful assistant answering questions about the user's documents. \
Answer using ONLY the context provided below. \
If the context does not contain the answer, say that you could not find it in the available documents.\n\n\
Context:\n{context}";

/// Builds the generation system prompt by embedding the retrieval context
/// into the fixed instruction template.
pub fn build_system_prompt(context_text: &str) -> String {
    SYSTEM_PROMPT_TEMPLATE.replace("{context}", context_text)
}

/// Drives one question through the pipeline.
pub async fn answer_question(
    pool: &SqlitePool,
    index: &dyn ScopeIndex,
    llm: &dyn GenerationClient,
    retrieval: &RetrievalConfig,
    user_id: i64,
    conversation_id: &str,
    request: &ChatRequest,
) -> ChatResponse {
    // Validating: ownership failure is a normal outcome, not an error.
    match conversation_owner(pool, conversation_id).await {
        Ok(Some(owner)) if owner == user_id => {}
        Ok(_) => {
            return ChatResponse {
                answer: ACCESS_DENIED.to_string(),
                citations: Vec::new(),
            };
        }
        Err(e) => {
            return error_response(&e);
        }
    }

    // Retrieving: the two scoped queries and the history window are
    // independent of each other.
    let outcome = match retrieve::retrieve(
        index,
        &request.message,
        conversation_id,
        retrieval.k_local,
        retrieval.k_global,
        retrieval.citation_chars,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => return error_response(&e),
    };

    let turns = match history::assemble(pool, conversation_id, retrieval.history_turns).await {
        Ok(turns) => turns,
        Err(e) => return error_response(&e),
    };

    // Generating: no retry here; the provider call is bounded only by its
    // own timeout.
    let system_prompt = build_system_prompt(&outcome.context_text);
    let settings = request.settings.as_ref();
    let answer = match llm
        .generate(
            &system_prompt,
            &turns,
            &request.message,
            settings.and_then(|s| s.model.as_deref()),
            settings.and_then(|s| s.temperature),
        )
        .await
    {
        Ok(answer) => answer,
        Err(e) => return error_response(&e),
    };

    // Persisting: losing a history entry is recoverable; failing an
    // already-answered request is not.
    if let Err(e) = persist_exchange(pool, conversation_id, &request.message, &answer).await {
        eprintln!(
            "warning: failed to persist exchange for conversation {}: {}",
            conversation_id, e
        );
    }

    ChatResponse {
        answer,
        citations: outcome.citations,
    }
}

/// One-shot CLI question against the index, outside any conversation.
///
/// Retrieves from the global scope (plus a conversation scope when one is
/// given), generates with no history, and prints the answer with citations.
/// Nothing is persisted.
pub async fn run_ask(config: &Config, question: &str, conversation: Option<&str>) -> Result<()> {
    let pool = db::connect(config).await?;
    let index = SqliteIndex::new(pool.clone(), config.embedding.clone());
    let llm = create_generation_client(&config.llm)?;

    // An empty scope matches no chunks, so without --conversation only the
    // global query contributes.
    let outcome = retrieve::retrieve(
        &index,
        question,
        conversation.unwrap_or(""),
        config.retrieval.k_local,
        config.retrieval.k_global,
        config.retrieval.citation_chars,
    )
    .await?;

    let system_prompt = build_system_prompt(&outcome.context_text);
    let answer = llm.generate(&system_prompt, &[], question, None, None).await?;

    println!("{}", answer);
    if !outcome.citations.is_empty() {
        println!();
        println!("Citations:");
        for citation in &outcome.citations {
            println!("  [{}] {}", citation.source, citation.doc);
        }
    }

    pool.close().await;
    Ok(())
}

fn error_response(e: &anyhow::Error) -> ChatResponse {
    ChatResponse {
        answer: format!("An error occurred while answering: {}", e),
        citations: Vec::new(),
    }
}

async fn conversation_owner(pool: &SqlitePool, conversation_id: &str) -> Result<Option<i64>> {
    let owner: Option<i64> =
        sqlx::query_scalar("SELECT user_id FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(pool)
            .await?;
    Ok(owner)
}

/// Appends the user and assistant messages as one pair sharing a single
/// timestamp, in one transaction.
async fn persist_exchange(
    pool: &SqlitePool,
    conversation_id: &str,
    question: &str,
    answer: &str,
) -> Result<()> {
    let timestamp = chrono::Utc::now().to_rfc3339();
    let mut tx = pool.begin().await?;

    sqlx::query("INSERT INTO messages (conversation_id, role, content, timestamp) VALUES (?, 'user', ?, ?)")
        .bind(conversation_id)
        .bind(question)
        .bind(&timestamp)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO messages (conversation_id, role, content, timestamp) VALUES (?, 'assistant', ?, ?)")
        .bind(conversation_id)
        .bind(answer)
        .bind(&timestamp)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}
