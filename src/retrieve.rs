//! Two-scope retrieval and deterministic merge.
//!
//! A question is answered from two partitions at once: the conversation's
//! private chunks and the shared global knowledge base. The two scopes are
//! queried independently — one combined top-k would let a large global
//! corpus crowd out private material — and concatenated local-first.

use anyhow::Result;

use crate::index::{ScopeIndex, GLOBAL_SCOPE};
use crate::models::{Citation, RetrievedChunk};

/// Context handed to the generation prompt when neither scope matched.
pub const NO_CONTEXT_SENTINEL: &str = "No relevant documents found.";

/// Separator between chunk blocks in the prompt context.
const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Result of one retrieval pass.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    /// Full untruncated chunk text, source-prefixed, for the prompt.
    pub context_text: String,
    /// Display citations, one per merged chunk, in merge order.
    pub citations: Vec<Citation>,
}

/// Retrieves for one question: `k_local` chunks from the conversation's
/// scope, `k_global` from the global scope, merged local-first in each
/// store's returned rank order. No cross-scope re-ranking or deduplication;
/// scopes are disjoint so ids cannot collide.
pub async fn retrieve(
    index: &dyn ScopeIndex,
    question: &str,
    conversation_id: &str,
    k_local: i64,
    k_global: i64,
    citation_chars: usize,
) -> Result<RetrievalOutcome> {
    let local = index.query(question, conversation_id, k_local).await?;
    let global = index.query(question, GLOBAL_SCOPE, k_global).await?;

    let mut merged = Vec::with_capacity(local.len() + global.len());
    merged.extend(local);
    merged.extend(global);

    Ok(assemble(&merged, citation_chars))
}

/// Builds the context block and citation list from merged chunks.
fn assemble(merged: &[RetrievedChunk], citation_chars: usize) -> RetrievalOutcome {
    if merged.is_empty() {
        return RetrievalOutcome {
            context_text: NO_CONTEXT_SENTINEL.to_string(),
            citations: Vec::new(),
        };
    }

    let context_text = merged
        .iter()
        .map(|chunk| format!("Source: {}\n{}", chunk.source, chunk.text))
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR);

    let citations = merged
        .iter()
        .map(|chunk| Citation {
            source: chunk.source.clone(),
            doc: truncate_for_display(&chunk.text, citation_chars),
            chunk_id: chunk.id.clone(),
        })
        .collect();

    RetrievalOutcome {
        context_text,
        citations,
    }
}

/// Caps a citation's display text at `max_chars` characters, appending an
/// ellipsis marker when cut. Affects only what the user sees; the prompt
/// always carries the full text.
fn truncate_for_display(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
