//! SQLite implementation of the storage contracts.
//!
//! One [`SqliteStore`] serves as event log, profile store, and vector
//! index. Profiles are stored as a JSON column. Ledgers are stored one row
//! per applied event id and one row per ledger entry, so applying an event
//! writes only what it touched. Embeddings are little-endian f32 BLOBs. Vector search is brute-force cosine similarity
//! over the valid chunks in scope.
//!
//! Revisions are serialized through an async mutex so the lineage head
//! read and the chunk writes of one revision never interleave with
//! another.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;

use rapport_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use rapport_core::lineage::{decide, Decision, LineageHead, Revision, RevisionKind, RevisionOutcome};
use rapport_core::models::{CanonicalEvent, IndexedChunk, ScoredChunk, UserProfile};
use rapport_core::profile::{LedgerEntry, ProfileDelta, ProfileLedger, ProfileState};
use rapport_core::store::{EventLog, IndexStats, ProfileStore, QueryScope, VectorIndex};

use crate::config::Config;
use crate::{db, migrate};

pub struct SqliteStore {
    pool: SqlitePool,
    revisions: Mutex<()>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            revisions: Mutex::new(()),
        }
    }

    /// Connect and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn write_profile_row(conn: &mut SqliteConnection, profile: &UserProfile) -> Result<()> {
    let profile_json = serde_json::to_string(profile)?;
    sqlx::query(
        r#"
        INSERT INTO profiles (user_id, profile_json, message_count, last_active, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            profile_json = excluded.profile_json,
            message_count = excluded.message_count,
            last_active = excluded.last_active,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&profile.user_id)
    .bind(&profile_json)
    .bind(profile.message_count as i64)
    .bind(profile.last_active_logical_timestamp)
    .bind(now_secs())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_applied(conn: &mut SqliteConnection, user_id: &str, event_id: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO profile_events (user_id, event_id) VALUES (?, ?)")
        .bind(user_id)
        .bind(event_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn write_entry(conn: &mut SqliteConnection, user_id: &str, entry: &LedgerEntry) -> Result<()> {
    let json = serde_json::to_string(entry)?;
    sqlx::query(
        r#"
        INSERT INTO profile_ledger (user_id, entry_kind, entry_key, entry_json)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(user_id, entry_kind, entry_key) DO UPDATE SET
            entry_json = excluded.entry_json
        "#,
    )
    .bind(user_id)
    .bind(entry.kind())
    .bind(entry.key())
    .bind(&json)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<IndexedChunk> {
    let blob: Vec<u8> = row.try_get("embedding")?;
    let offset: i64 = row.try_get("chunk_offset")?;
    let valid: i64 = row.try_get("valid")?;
    Ok(IndexedChunk {
        chunk_id: row.try_get("chunk_id")?,
        source_event_id: row.try_get("source_event_id")?,
        lineage_id: row.try_get("lineage_id")?,
        user_id: row.try_get("user_id")?,
        channel_id: row.try_get("channel_id")?,
        offset: offset as usize,
        text: row.try_get("text")?,
        embedding: blob_to_vec(&blob),
        revision_ts: row.try_get("revision_ts")?,
        valid: valid != 0,
    })
}

const CHUNK_COLUMNS: &str = "chunk_id, source_event_id, lineage_id, user_id, channel_id, \
                             chunk_offset, text, embedding, revision_ts, valid";

#[async_trait]
impl EventLog for SqliteStore {
    async fn append(&self, event: &CanonicalEvent) -> Result<bool> {
        let json = serde_json::to_string(event)?;
        let result = sqlx::query(
            r#"
            INSERT INTO events (event_id, channel_id, user_id, kind, logical_timestamp,
                                sequence, event_json, received_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.channel_id)
        .bind(&event.user_id)
        .bind(event.kind.as_str())
        .bind(event.logical_timestamp)
        .bind(event.sequence.map(|s| s as i64))
        .bind(&json)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn replay(&self) -> Result<Vec<CanonicalEvent>> {
        let rows = sqlx::query("SELECT event_id, event_json FROM events ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("event_id");
            let json: String = row.get("event_json");
            let event: CanonicalEvent = serde_json::from_str(&json)
                .with_context(|| format!("Corrupt event row {}", id))?;
            events.push(event);
        }
        Ok(events)
    }

    async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn load_profile(&self, user_id: &str) -> Result<Option<ProfileState>> {
        let Some(profile_json) =
            sqlx::query_scalar::<_, String>("SELECT profile_json FROM profiles WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
        else {
            return Ok(None);
        };
        let profile: UserProfile = serde_json::from_str(&profile_json)
            .with_context(|| format!("Corrupt profile for {}", user_id))?;

        let mut ledger = ProfileLedger::default();
        let applied: Vec<String> =
            sqlx::query_scalar("SELECT event_id FROM profile_events WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        ledger.applied.extend(applied);

        let entries: Vec<String> =
            sqlx::query_scalar("SELECT entry_json FROM profile_ledger WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        for json in entries {
            let entry: LedgerEntry = serde_json::from_str(&json)
                .with_context(|| format!("Corrupt ledger entry for {}", user_id))?;
            ledger.restore(entry);
        }
        Ok(Some(ProfileState { profile, ledger }))
    }

    async fn save_profile(&self, state: &ProfileState) -> Result<()> {
        let user_id = &state.profile.user_id;
        let mut tx = self.pool.begin().await?;
        write_profile_row(&mut tx, &state.profile).await?;
        sqlx::query("DELETE FROM profile_events WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM profile_ledger WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        for event_id in &state.ledger.applied {
            write_applied(&mut tx, user_id, event_id).await?;
        }
        for entry in state.ledger.entries() {
            write_entry(&mut tx, user_id, &entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn save_delta(&self, profile: &UserProfile, delta: &ProfileDelta) -> Result<()> {
        let user_id = &profile.user_id;
        let mut tx = self.pool.begin().await?;
        write_profile_row(&mut tx, profile).await?;
        write_applied(&mut tx, user_id, &delta.event_id).await?;
        for entry in &delta.entries {
            write_entry(&mut tx, user_id, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_profiles(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT user_id FROM profiles ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn apply_revision(&self, revision: Revision) -> Result<RevisionOutcome> {
        let _guard = self.revisions.lock().await;
        let mut tx = self.pool.begin().await?;

        let head = sqlx::query(
            "SELECT source_event_id, revision_ts, deleted FROM lineages WHERE lineage_id = ?",
        )
        .bind(&revision.lineage_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| {
            let deleted: i64 = row.get("deleted");
            LineageHead {
                source_event_id: row.get("source_event_id"),
                revision_ts: row.get("revision_ts"),
                deleted: deleted != 0,
            }
        });

        let decision = decide(head.as_ref(), &revision);
        if decision == Decision::Stale {
            tx.rollback().await?;
            return Ok(RevisionOutcome::Stale);
        }

        let invalidated = sqlx::query("UPDATE chunks SET valid = 0 WHERE lineage_id = ? AND valid = 1")
            .bind(&revision.lineage_id)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;

        let new_head = revision.head();
        let outcome = match revision.kind {
            RevisionKind::Replace(chunks) => {
                let created = now_secs();
                for c in &chunks {
                    sqlx::query(
                        r#"
                        INSERT INTO chunks (chunk_id, source_event_id, lineage_id, user_id,
                                            channel_id, chunk_offset, text, embedding, dims,
                                            revision_ts, valid, created_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
                        ON CONFLICT(chunk_id) DO UPDATE SET
                            text = excluded.text,
                            embedding = excluded.embedding,
                            dims = excluded.dims,
                            revision_ts = excluded.revision_ts,
                            valid = 1
                        "#,
                    )
                    .bind(&c.chunk_id)
                    .bind(&c.source_event_id)
                    .bind(&c.lineage_id)
                    .bind(&c.user_id)
                    .bind(&c.channel_id)
                    .bind(c.offset as i64)
                    .bind(&c.text)
                    .bind(vec_to_blob(&c.embedding))
                    .bind(c.embedding.len() as i64)
                    .bind(c.revision_ts)
                    .bind(created)
                    .execute(&mut *tx)
                    .await?;
                }
                RevisionOutcome::Applied {
                    invalidated,
                    inserted: chunks.len(),
                }
            }
            RevisionKind::Tombstone => RevisionOutcome::Deleted { invalidated },
        };

        sqlx::query(
            r#"
            INSERT INTO lineages (lineage_id, source_event_id, revision_ts, deleted)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(lineage_id) DO UPDATE SET
                source_event_id = excluded.source_event_id,
                revision_ts = excluded.revision_ts,
                deleted = excluded.deleted
            "#,
        )
        .bind(&revision.lineage_id)
        .bind(&new_head.source_event_id)
        .bind(new_head.revision_ts)
        .bind(new_head.deleted as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        scope: &QueryScope,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = match &scope.user_id {
            None => {
                sqlx::query(&format!("SELECT {} FROM chunks WHERE valid = 1", CHUNK_COLUMNS))
                    .fetch_all(&self.pool)
                    .await?
            }
            Some(user) => {
                let sql = if scope.include_documents {
                    format!(
                        "SELECT {} FROM chunks WHERE valid = 1 AND (user_id = ? OR user_id IS NULL)",
                        CHUNK_COLUMNS
                    )
                } else {
                    format!(
                        "SELECT {} FROM chunks WHERE valid = 1 AND user_id = ?",
                        CHUNK_COLUMNS
                    )
                };
                sqlx::query(&sql).bind(user).fetch_all(&self.pool).await?
            }
        };

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = row_to_chunk(row)?;
            scored.push(ScoredChunk {
                similarity: cosine_similarity(vector, &chunk.embedding),
                chunk,
            });
        }

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn chunks_for_lineage(&self, lineage_id: &str) -> Result<Vec<IndexedChunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE lineage_id = ? ORDER BY revision_ts, chunk_offset",
            CHUNK_COLUMNS
        ))
        .bind(lineage_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_chunk).collect()
    }

    async fn stats(&self) -> Result<IndexStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM chunks) AS total_chunks,
                (SELECT COUNT(*) FROM chunks WHERE valid = 1) AS valid_chunks,
                (SELECT COUNT(*) FROM lineages) AS lineages,
                (SELECT COUNT(*) FROM lineages WHERE deleted = 1) AS tombstoned
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total_chunks");
        let valid: i64 = row.get("valid_chunks");
        let lineages: i64 = row.get("lineages");
        let tombstoned: i64 = row.get("tombstoned");
        Ok(IndexStats {
            total_chunks: total as u64,
            valid_chunks: valid as u64,
            lineages: lineages as u64,
            tombstoned_lineages: tombstoned as u64,
        })
    }
}
