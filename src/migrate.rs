use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database file and schema. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Append-only canonical event log; `id` preserves arrival order.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL UNIQUE,
            channel_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            logical_timestamp INTEGER NOT NULL,
            sequence INTEGER,
            event_json TEXT NOT NULL,
            received_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            user_id TEXT PRIMARY KEY,
            profile_json TEXT NOT NULL,
            message_count INTEGER NOT NULL DEFAULT 0,
            last_active INTEGER,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profile_events (
            user_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            PRIMARY KEY (user_id, event_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profile_ledger (
            user_id TEXT NOT NULL,
            entry_kind TEXT NOT NULL,
            entry_key TEXT NOT NULL,
            entry_json TEXT NOT NULL,
            PRIMARY KEY (user_id, entry_kind, entry_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            source_event_id TEXT NOT NULL,
            lineage_id TEXT NOT NULL,
            user_id TEXT,
            channel_id TEXT,
            chunk_offset INTEGER NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            revision_ts INTEGER NOT NULL,
            valid INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One head per lineage; `deleted` closes it for good.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lineages (
            lineage_id TEXT PRIMARY KEY,
            source_event_id TEXT NOT NULL,
            revision_ts INTEGER NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_key ON events(channel_id, user_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_lineage ON chunks(lineage_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_valid_user ON chunks(valid, user_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_profiles_last_active ON profiles(last_active DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
