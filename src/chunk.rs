//! Size-bounded, paragraph-aware document chunker.
//!
//! [`chunk_document`] turns uploaded bytes plus a filename into an ordered
//! sequence of chunk strings. Splitting occurs on paragraph boundaries
//! (`\n\n`) to preserve semantic coherence; a paragraph that alone exceeds
//! the size bound is split again at sentence boundaries.
//!
//! Chunk ids are pure functions of `(scope, source, seq)`, so re-ingesting
//! the same file yields the same ids and the index upserts in place.

use crate::extract;
use crate::models::ChunkRecord;

/// Splits document bytes into chunk strings of at most `max_chars` each.
///
/// Dispatch is by filename suffix. Unsupported suffixes and extraction
/// failures both yield an empty vec; one bad file must never abort a batch.
pub fn chunk_document(bytes: &[u8], filename: &str, max_chars: usize) -> Vec<String> {
    let suffix = extract::file_suffix(filename);
    let text = match extract::extract_text(bytes, &suffix) {
        Ok(text) => text,
        Err(_) => return Vec::new(),
    };
    split_text(&text, max_chars)
}

/// Builds index records for one document's chunks.
pub fn build_records(scope: &str, filename: &str, chunks: Vec<String>) -> Vec<ChunkRecord> {
    let source = sanitize_source(filename);
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, text)| ChunkRecord {
            id: chunk_id(scope, &source, i as i64),
            scope: scope.to_string(),
            source: source.clone(),
            seq: i as i64,
            text,
        })
        .collect()
}

/// Deterministic chunk id: `{scope}:{source}:{seq}`.
///
/// `source` must already be sanitized so the id stays within one character
/// class regardless of what the client named the file.
pub fn chunk_id(scope: &str, source: &str, seq: i64) -> String {
    format!("{}:{}:{}", scope, source, seq)
}

/// Strips path components and maps anything outside `[A-Za-z0-9._-]` to `_`.
pub fn sanitize_source(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);
    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Splits text into chunks of at most `max_chars`, accumulating whole
/// paragraphs until the next one would overflow. A single paragraph longer
/// than `max_chars` is split at sentence boundaries instead; a single
/// sentence longer than `max_chars` is emitted whole.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        if para.len() > max_chars {
            // Oversized paragraph: flush, then accumulate its sentences.
            flush(&mut chunks, &mut buf);
            for sentence in split_sentences(para) {
                push_unit(&mut chunks, &mut buf, &sentence, " ", max_chars);
            }
            flush(&mut chunks, &mut buf);
        } else {
            push_unit(&mut chunks, &mut buf, para, "\n\n", max_chars);
        }
    }

    flush(&mut chunks, &mut buf);
    chunks
}

/// Appends one unit to the accumulator, emitting the accumulated text first
/// when adding the unit would exceed `max_chars`. The boundary is inclusive:
/// a unit landing exactly on `max_chars` stays in the current chunk.
fn push_unit(chunks: &mut Vec<String>, buf: &mut String, unit: &str, sep: &str, max_chars: usize) {
    let would_be = if buf.is_empty() {
        unit.len()
    } else {
        buf.len() + sep.len() + unit.len()
    };
    if would_be > max_chars && !buf.is_empty() {
        chunks.push(std::mem::take(buf));
    }
    if !buf.is_empty() {
        buf.push_str(sep);
    }
    buf.push_str(unit);
}

fn flush(chunks: &mut Vec<String>, buf: &mut String) {
    if !buf.is_empty() {
        chunks.push(std::mem::take(buf));
    }
}

/// Splits a paragraph at sentence boundaries: `.`, `?`, or `!` followed by
/// whitespace. The terminator stays with its sentence.
fn split_sentences(para: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = para.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if matches!(bytes[i], b'.' | b'?' | b'!') {
            // Absorb a run of terminators ("?!", "...").
            let mut end = i + 1;
            while end < bytes.len() && matches!(bytes[end], b'.' | b'?' | b'!') {
                end += 1;
            }
            if end >= bytes.len() || bytes[end].is_ascii_whitespace() {
                let sentence = para[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                while end < bytes.len() && bytes[end].is_ascii_whitespace() {
                    end += 1;
                }
                start = end;
            }
            i = end;
        } else {
            i += 1;
        }
    }
    let tail = para[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}
