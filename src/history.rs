//! Recency-bounded conversation history for the generation call.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::models::Turn;

/// Fetches the most recent `max_turns` messages of a conversation and
/// returns them oldest first. The in-flight question is never included;
/// the orchestrator appends it separately.
pub async fn assemble(pool: &SqlitePool, conversation_id: &str, max_turns: i64) -> Result<Vec<Turn>> {
    let rows = sqlx::query(
        r#"
        SELECT role, content
        FROM messages
        WHERE conversation_id = ?
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(conversation_id)
    .bind(max_turns)
    .fetch_all(pool)
    .await?;

    // Newest-first from the store, reversed to chronological order.
    let mut turns: Vec<Turn> = rows
        .iter()
        .map(|row| Turn {
            role: row.get("role"),
            content: row.get("content"),
        })
        .collect();
    turns.reverse();
    Ok(turns)
}
