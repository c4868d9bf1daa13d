//! Index statistics overview.
//!
//! Prints chunk counts per source and scope plus totals. Used by the
//! `inspect` command to give confidence that uploads landed where expected.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

struct SourceStats {
    source: String,
    scope: String,
    chunk_count: i64,
}

/// Run the inspect command: query the index and print a summary.
pub async fn run_inspect(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await?;
    let total_embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(&pool)
        .await?;
    let total_scopes: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT scope) FROM chunks")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("scope-rag — Index Stats");
    println!("=======================");
    println!();
    println!("  Database:  {}", config.db.path.display());
    println!("  Size:      {}", format_bytes(db_size));
    println!();
    println!("  Chunks:    {}", total_chunks);
    println!("  Scopes:    {}", total_scopes);
    println!(
        "  Embedded:  {} / {} ({}%)",
        total_embedded,
        total_chunks,
        if total_chunks > 0 {
            (total_embedded * 100) / total_chunks
        } else {
            0
        }
    );

    let rows = sqlx::query(
        r#"
        SELECT source, scope, COUNT(*) AS chunk_count
        FROM chunks
        GROUP BY source, scope
        ORDER BY scope, source
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let stats: Vec<SourceStats> = rows
        .iter()
        .map(|row| SourceStats {
            source: row.get("source"),
            scope: row.get("scope"),
            chunk_count: row.get("chunk_count"),
        })
        .collect();

    if !stats.is_empty() {
        println!();
        println!("  By document:");
        println!("  {:<40} {:<28} {:>6}", "SOURCE", "SCOPE", "CHUNKS");
        println!("  {}", "-".repeat(76));
        for s in &stats {
            println!("  {:<40} {:<28} {:>6}", s.source, s.scope, s.chunk_count);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
