//! SQLite backend: storage contracts and restart behavior.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use rapport::config::Config;
use rapport::embedding::HashProvider;
use rapport::generation::DisabledGenerator;
use rapport::pipeline::{Pipeline, Stores};
use rapport::sqlite_store::SqliteStore;
use rapport_core::chunk::chunk_text;
use rapport_core::embedding::HashingEmbedder;
use rapport_core::lineage::{Revision, RevisionOutcome};
use rapport_core::models::{CanonicalEvent, EventKind, EventPayload};
use rapport_core::profile::{ProfileSettings, ProfileState};
use rapport_core::store::{EventLog, ProfileStore, QueryScope, VectorIndex};
use rapport_core::topics::KeywordTopicExtractor;

fn sqlite_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.db.path = dir.path().join("data").join("rapport.sqlite");
    config.indexer.max_retries = 0;
    config
}

fn event(id: &str, user: &str, text: &str) -> CanonicalEvent {
    CanonicalEvent {
        event_id: id.to_string(),
        channel_id: "C1".into(),
        user_id: user.into(),
        kind: EventKind::Post,
        logical_timestamp: 1_700_000_000_000_000,
        sequence: Some(4),
        payload: EventPayload::Text { text: text.into() },
        supersedes: None,
    }
}

fn revision(lineage: &str, src: &str, ts: i64, user: Option<&str>, text: &str) -> Revision {
    let e = HashingEmbedder::new(32);
    let chunks = chunk_text(src, text, 128);
    let vectors = chunks.iter().map(|c| e.embed(&c.text)).collect();
    Revision::replace(lineage, src, ts, user, Some("C1"), chunks, vectors)
}

#[tokio::test]
async fn event_log_keeps_arrival_order_and_rejects_duplicates() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&sqlite_config(&dir)).await.unwrap();

    let a = event("msg:C1:2", "U1", "second by ts, first to arrive");
    let b = event("msg:C1:1", "U2", "first by ts");
    assert!(store.append(&a).await.unwrap());
    assert!(store.append(&b).await.unwrap());
    assert!(!store.append(&a).await.unwrap());

    assert_eq!(store.count().await.unwrap(), 2);
    assert_eq!(store.replay().await.unwrap(), vec![a, b]);
    store.close().await;
}

#[tokio::test]
async fn profile_state_roundtrips_with_ledger() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&sqlite_config(&dir)).await.unwrap();

    let mut state = ProfileState::new("U1");
    state.apply(
        &event("msg:C1:1", "U1", "postgres replication question?"),
        &KeywordTopicExtractor::new(3, 8),
        &ProfileSettings::default(),
    );
    store.save_profile(&state).await.unwrap();
    store.save_profile(&ProfileState::new("U0")).await.unwrap();

    let loaded = store.load_profile("U1").await.unwrap().unwrap();
    assert_eq!(loaded, state);
    assert_eq!(loaded.profile.message_count, 1);
    assert!(store.load_profile("U404").await.unwrap().is_none());
    assert_eq!(store.list_profiles().await.unwrap(), vec!["U0", "U1"]);
    store.close().await;
}

#[tokio::test]
async fn deltas_write_only_touched_rows() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&sqlite_config(&dir)).await.unwrap();
    let ex = KeywordTopicExtractor::new(3, 8);
    let settings = ProfileSettings::default();

    let mut state = ProfileState::new("U1");
    for i in 1..=5 {
        let mut post = event(&format!("msg:C1:{}", i), "U1", "billing rollout status");
        post.logical_timestamp += i;
        post.sequence = Some(i as u64);
        let (_, delta) = state.apply_tracked(&post, &ex, &settings);
        let delta = delta.unwrap();
        assert_eq!(delta.entries.len(), 1);
        store.save_delta(&state.profile, &delta).await.unwrap();
    }

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM profile_ledger WHERE user_id = 'U1'")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(rows, 5);
    let applied: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM profile_events WHERE user_id = 'U1'")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(applied, 5);

    let loaded = store.load_profile("U1").await.unwrap().unwrap();
    assert_eq!(loaded, state);
    assert_eq!(loaded.profile.message_count, 5);

    // A full save replaces rows rather than adding to them.
    store.save_profile(&ProfileState::new("U1")).await.unwrap();
    let reset = store.load_profile("U1").await.unwrap().unwrap();
    assert_eq!(reset, ProfileState::new("U1"));
    store.close().await;
}

#[tokio::test]
async fn revisions_supersede_by_timestamp() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&sqlite_config(&dir)).await.unwrap();
    let lineage = "msg:C1:1";

    let edit = revision(lineage, "edit:C1:1:2", 2, Some("U1"), "billing fix shipped today");
    let post = revision(lineage, lineage, 1, Some("U1"), "billing fix shipped");
    assert!(matches!(
        store.apply_revision(edit).await.unwrap(),
        RevisionOutcome::Applied { inserted: 1, .. }
    ));
    assert_eq!(
        store.apply_revision(post).await.unwrap(),
        RevisionOutcome::Stale
    );

    let chunks = store.chunks_for_lineage(lineage).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].text, "billing fix shipped today");
    assert_eq!(chunks[0].embedding.len(), 32);

    let outcome = store
        .apply_revision(Revision::tombstone(lineage, "del:C1:1", 3))
        .await
        .unwrap();
    assert_eq!(outcome, RevisionOutcome::Deleted { invalidated: 1 });

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.valid_chunks, 0);
    assert_eq!(stats.lineages, 1);
    assert_eq!(stats.tombstoned_lineages, 1);
    store.close().await;
}

#[tokio::test]
async fn query_ranks_by_similarity_within_scope() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&sqlite_config(&dir)).await.unwrap();
    for (i, (user, text)) in [
        (Some("U1"), "kubernetes cluster upgrade"),
        (Some("U2"), "lunch menu for friday"),
        (None, "kubernetes upgrade runbook"),
    ]
    .into_iter()
    .enumerate()
    {
        let id = format!("src:{}", i);
        store
            .apply_revision(revision(&id, &id, 1, user, text))
            .await
            .unwrap();
    }

    let q = HashingEmbedder::new(32).embed("kubernetes cluster upgrade");
    let all = store.query(&q, 10, &QueryScope::workspace()).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].chunk.text, "kubernetes cluster upgrade");
    assert!(all.windows(2).all(|w| w[0].similarity >= w[1].similarity));

    let mine = store.query(&q, 10, &QueryScope::user("U1", false)).await.unwrap();
    assert_eq!(mine.len(), 1);
    let with_docs = store.query(&q, 10, &QueryScope::user("U1", true)).await.unwrap();
    assert_eq!(with_docs.len(), 2);
    assert_eq!(store.query(&q, 1, &QueryScope::workspace()).await.unwrap().len(), 1);
    store.close().await;
}

async fn open_pipeline(config: &Config) -> Pipeline {
    let store = SqliteStore::open(config).await.unwrap();
    Pipeline::with_components(
        config.clone(),
        Stores::sqlite(store),
        Arc::new(HashProvider::new(64)),
        Arc::new(DisabledGenerator),
    )
}

#[tokio::test]
async fn restart_resumes_sequence_and_known_posts() {
    let dir = TempDir::new().unwrap();
    let config = sqlite_config(&dir);

    let first = open_pipeline(&config).await;
    for seq in 1..=2u64 {
        first
            .ingest(&json!({
                "type": "message",
                "channel": "C1",
                "user": "U1",
                "text": format!("release note {}", seq),
                "ts": format!("1700000000.00000{}", seq),
                "seq": seq,
            }))
            .await
            .unwrap();
    }
    first.drain().await;
    first.shutdown().await;

    let second = open_pipeline(&config).await;
    second
        .ingest(&json!({
            "type": "message",
            "channel": "C1",
            "user": "U1",
            "text": "release note 3",
            "ts": "1700000000.000003",
            "seq": 3,
        }))
        .await
        .unwrap();
    second
        .ingest(&json!({
            "type": "message",
            "subtype": "message_changed",
            "channel": "C1",
            "ts": "1700000100.000000",
            "message": {
                "user": "U1",
                "ts": "1700000000.000001",
                "text": "release note 1, revised",
                "edited": { "ts": "1700000100.000000" },
            },
        }))
        .await
        .unwrap();
    second.flush().await;

    let profile = second.profile("U1").await.unwrap().unwrap();
    assert_eq!(profile.message_count, 3);
    assert_eq!(profile.highest_applied_sequence.get("C1"), Some(&3));
    let stats = second.stats();
    assert_eq!(stats.gaps_detected, 0);
    assert_eq!(stats.orphan_supersessions, 0);

    let chunks = second
        .stores()
        .index
        .chunks_for_lineage("msg:C1:1700000000.000001")
        .await
        .unwrap();
    let valid: Vec<&str> = chunks
        .iter()
        .filter(|c| c.valid)
        .map(|c| c.text.as_str())
        .collect();
    assert_eq!(valid, vec!["release note 1, revised"]);

    let report = second.store_report(5).await.unwrap();
    assert_eq!(report.events, 4);
    assert_eq!(report.profiles, 1);
    second.shutdown().await;
}
