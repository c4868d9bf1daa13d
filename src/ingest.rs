//! Document ingestion: chunk, purge stale rows, upsert.
//!
//! [`ingest_document`] is the single write path for both HTTP uploads and
//! the bulk CLI loader. Re-ingesting a `(scope, source)` pair first purges
//! that pair's prior chunks, so a shrunken file leaves no stale tail and an
//! unchanged file converges to the same ids and text.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::chunk;
use crate::config::Config;
use crate::db;
use crate::index::{ScopeIndex, SqliteIndex};

/// Result of ingesting one document, mirrored by the upload response.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// `"ok"` when chunks were produced, `"error"` otherwise.
    pub status: String,
    pub chunks_added: usize,
}

/// Chunks one document and stores it under a scope.
///
/// An unsupported or corrupt file yields `{status: "error", chunks_added: 0}`
/// and leaves the index untouched; store failures propagate.
pub async fn ingest_document(
    index: &dyn ScopeIndex,
    chunk_chars: usize,
    scope: &str,
    filename: &str,
    bytes: &[u8],
) -> Result<IngestOutcome> {
    let chunks = chunk::chunk_document(bytes, filename, chunk_chars);
    if chunks.is_empty() {
        return Ok(IngestOutcome {
            status: "error".to_string(),
            chunks_added: 0,
        });
    }

    let records = chunk::build_records(scope, filename, chunks);
    let source = &records[0].source;

    // Purge the pair's prior chunks before inserting, so re-uploads replace
    // wholesale instead of leaving a stale tail.
    index.remove(scope, source).await?;
    let chunks_added = index.upsert(&records).await?;

    Ok(IngestOutcome {
        status: "ok".to_string(),
        chunks_added,
    })
}

/// Bulk-loads a file or directory into a scope from the CLI.
///
/// Directories are walked recursively, filtered by include globs; files
/// that yield no chunks are counted as skipped rather than failing the run.
pub async fn run_ingest(
    config: &Config,
    path: &Path,
    scope: &str,
    include_globs: &[String],
) -> Result<()> {
    if !path.exists() {
        bail!("Ingest path does not exist: {}", path.display());
    }

    let pool = db::connect(config).await?;
    let index = SqliteIndex::new(pool.clone(), config.embedding.clone());

    let files: Vec<std::path::PathBuf> = if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        collect_files(path, include_globs)?
    };

    let mut ingested = 0usize;
    let mut skipped = 0usize;
    let mut chunks_total = 0usize;

    println!("ingest {} (scope: {})", path.display(), scope);

    for file in &files {
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = match std::fs::read(file) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("warning: failed to read {}: {}", file.display(), e);
                skipped += 1;
                continue;
            }
        };

        let outcome =
            ingest_document(&index, config.chunking.chunk_chars, scope, &filename, &bytes).await?;
        if outcome.status == "ok" {
            println!("  {}: {} chunks", filename, outcome.chunks_added);
            ingested += 1;
            chunks_total += outcome.chunks_added;
        } else {
            eprintln!("warning: skipped {} (unsupported or unreadable)", filename);
            skipped += 1;
        }
    }

    println!("  files ingested: {}", ingested);
    println!("  files skipped: {}", skipped);
    println!("  chunks written: {}", chunks_total);
    println!("ok");

    pool.close().await;
    Ok(())
}

fn collect_files(root: &Path, include_globs: &[String]) -> Result<Vec<std::path::PathBuf>> {
    let include_set = build_globset(include_globs)?;
    let mut files = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if include_set.is_match(relative) {
            files.push(entry.path().to_path_buf());
        }
    }

    // Sort for deterministic ordering
    files.sort();
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    if patterns.is_empty() {
        builder.add(Glob::new("**/*")?);
    }
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
