//! Pipeline counters and the `rapport stats` report.
//!
//! [`PipelineStats`] is shared by every runtime stage and only ever
//! incremented. [`StoreReport`] summarizes what is persisted.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde::Serialize;

use rapport_core::error::PipelineWarning;
use rapport_core::persona;
use rapport_core::store::{EventLog, IndexStats, ProfileStore, VectorIndex};

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub events_received: AtomicU64,
    pub events_malformed: AtomicU64,
    pub events_duplicate: AtomicU64,
    pub events_released: AtomicU64,
    pub profile_updates: AtomicU64,
    pub index_jobs_enqueued: AtomicU64,
    pub index_jobs_completed: AtomicU64,
    pub chunks_inserted: AtomicU64,
    pub chunks_invalidated: AtomicU64,
    pub contexts_built: AtomicU64,
    pub contexts_degraded: AtomicU64,
    pub drafts_generated: AtomicU64,
    pub gaps_detected: AtomicU64,
    pub orphan_supersessions: AtomicU64,
    pub late_arrivals: AtomicU64,
    pub index_failures: AtomicU64,
    pub index_backlog_drops: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub events_malformed: u64,
    pub events_duplicate: u64,
    pub events_released: u64,
    pub profile_updates: u64,
    pub index_jobs_enqueued: u64,
    pub index_jobs_completed: u64,
    pub chunks_inserted: u64,
    pub chunks_invalidated: u64,
    pub contexts_built: u64,
    pub contexts_degraded: u64,
    pub drafts_generated: u64,
    pub gaps_detected: u64,
    pub orphan_supersessions: u64,
    pub late_arrivals: u64,
    pub index_failures: u64,
    pub index_backlog_drops: u64,
}

pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl PipelineStats {
    /// Count and log a warning.
    pub fn warn(&self, warning: &PipelineWarning) {
        let counter = match warning {
            PipelineWarning::GapDetected { .. } => &self.gaps_detected,
            PipelineWarning::OrphanSupersession { .. } => &self.orphan_supersessions,
            PipelineWarning::LateArrival { .. } => &self.late_arrivals,
            PipelineWarning::IndexFailed { .. } => &self.index_failures,
            PipelineWarning::IndexBacklogFull { .. } => &self.index_backlog_drops,
        };
        bump(counter);
        tracing::warn!(code = warning.code(), "{}", warning);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            events_received: get(&self.events_received),
            events_malformed: get(&self.events_malformed),
            events_duplicate: get(&self.events_duplicate),
            events_released: get(&self.events_released),
            profile_updates: get(&self.profile_updates),
            index_jobs_enqueued: get(&self.index_jobs_enqueued),
            index_jobs_completed: get(&self.index_jobs_completed),
            chunks_inserted: get(&self.chunks_inserted),
            chunks_invalidated: get(&self.chunks_invalidated),
            contexts_built: get(&self.contexts_built),
            contexts_degraded: get(&self.contexts_degraded),
            drafts_generated: get(&self.drafts_generated),
            gaps_detected: get(&self.gaps_detected),
            orphan_supersessions: get(&self.orphan_supersessions),
            late_arrivals: get(&self.late_arrivals),
            index_failures: get(&self.index_failures),
            index_backlog_drops: get(&self.index_backlog_drops),
        }
    }
}

/// One row of the most active users table.
#[derive(Debug, Clone, Serialize)]
pub struct UserRow {
    pub user_id: String,
    pub message_count: u64,
    pub channels: usize,
    pub top_topic: Option<String>,
    pub persona: String,
    pub last_active_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreReport {
    pub events: u64,
    pub profiles: u64,
    pub index: IndexStats,
    pub top_users: Vec<UserRow>,
}

pub async fn collect_store_report(
    events: &dyn EventLog,
    profiles: &dyn ProfileStore,
    index: &dyn VectorIndex,
    top_n: usize,
) -> Result<StoreReport> {
    let ids = profiles.list_profiles().await?;
    let mut rows = Vec::with_capacity(ids.len());
    for id in &ids {
        if let Some(state) = profiles.load_profile(id).await? {
            let p = &state.profile;
            rows.push(UserRow {
                user_id: p.user_id.clone(),
                message_count: p.message_count,
                channels: p.channel_membership.len(),
                top_topic: p.top_topics(1).into_iter().next().map(|(t, _)| t),
                persona: persona::classify(p).persona.label().to_string(),
                last_active_secs: p.last_active_logical_timestamp.map(|us| us / 1_000_000),
            });
        }
    }
    rows.sort_by(|a, b| {
        b.message_count
            .cmp(&a.message_count)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    rows.truncate(top_n);

    Ok(StoreReport {
        events: events.count().await?,
        profiles: ids.len() as u64,
        index: index.stats().await?,
        top_users: rows,
    })
}

pub fn print_store_report(db_label: &str, db_size: Option<u64>, report: &StoreReport) {
    println!("Rapport — Store Stats");
    println!("=====================");
    println!();
    println!("  Database:    {}", db_label);
    if let Some(size) = db_size {
        println!("  Size:        {}", format_bytes(size));
    }
    println!();
    println!("  Events:      {}", report.events);
    println!("  Profiles:    {}", report.profiles);
    println!(
        "  Chunks:      {} valid / {} total",
        report.index.valid_chunks, report.index.total_chunks
    );
    println!(
        "  Lineages:    {} ({} deleted)",
        report.index.lineages, report.index.tombstoned_lineages
    );

    if !report.top_users.is_empty() {
        println!();
        println!("  Most active:");
        println!(
            "  {:<14} {:>8} {:>8}  {:<16} {:<20} {}",
            "USER", "MSGS", "CHANNELS", "TOP TOPIC", "PERSONA", "LAST ACTIVE"
        );
        println!("  {}", "-".repeat(84));
        for u in &report.top_users {
            println!(
                "  {:<14} {:>8} {:>8}  {:<16} {:<20} {}",
                u.user_id,
                u.message_count,
                u.channels,
                u.top_topic.as_deref().unwrap_or("-"),
                u.persona,
                u.last_active_secs
                    .map(format_ts_relative)
                    .unwrap_or_else(|| "never".to_string())
            );
        }
    }
    println!();
}

pub fn print_pipeline_stats(stats: &StatsSnapshot) {
    println!("  Pipeline:");
    let rows = [
        ("received", stats.events_received),
        ("malformed", stats.events_malformed),
        ("duplicates", stats.events_duplicate),
        ("released", stats.events_released),
        ("profile updates", stats.profile_updates),
        ("index jobs", stats.index_jobs_completed),
        ("chunks inserted", stats.chunks_inserted),
        ("chunks invalidated", stats.chunks_invalidated),
        ("gaps", stats.gaps_detected),
        ("orphans", stats.orphan_supersessions),
        ("late arrivals", stats.late_arrivals),
        ("index failures", stats.index_failures),
        ("backlog drops", stats.index_backlog_drops),
    ];
    for (label, value) in rows {
        println!("    {:<20} {}", label, value);
    }
    println!();
}

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

fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{} min{} ago", delta / 60, plural(delta / 60))
    } else if delta < 86400 {
        format!("{} hour{} ago", delta / 3600, plural(delta / 3600))
    } else if delta < 86400 * 30 {
        format!("{} day{} ago", delta / 86400, plural(delta / 86400))
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
