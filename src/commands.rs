//! Implementations of the `rapport` subcommands.
//!
//! Each `run_*` function owns one pipeline for the duration of the
//! command: it starts it, does its work, drains the reorder windows, and
//! shuts it down so everything held is applied before the process exits.
//! Results go to stdout; progress and logs go to stderr.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use rapport_core::error::PipelineError;
use rapport_core::persona;

use crate::config::Config;
use crate::documents::scan_documents;
use crate::import::{load_history, synthesize_events};
use crate::pipeline::{IngestOutcome, Pipeline};
use crate::progress::{ProgressEvent, ProgressMode, Throttled};
use crate::server;
use crate::stats::{print_pipeline_stats, print_store_report};

const PROGRESS_EVERY: u64 = 500;

#[derive(Debug, Default, Serialize)]
pub struct IngestSummary {
    pub accepted: u64,
    pub duplicates: u64,
    pub malformed: u64,
}

impl IngestSummary {
    fn record(&mut self, result: Result<IngestOutcome, PipelineError>) -> Result<()> {
        match result {
            Ok(IngestOutcome::Accepted { .. }) => self.accepted += 1,
            Ok(IngestOutcome::Duplicate { .. }) => self.duplicates += 1,
            Err(PipelineError::MalformedEvent(_)) => self.malformed += 1,
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn print(&self, label: &str) {
        println!(
            "{}: {} accepted, {} duplicates, {} malformed",
            label, self.accepted, self.duplicates, self.malformed
        );
    }
}

pub async fn run_serve(config: Config) -> Result<()> {
    let bind = config.server.bind.clone();
    let pipeline = Arc::new(Pipeline::start(config).await?);
    let result = server::run_server(pipeline.clone(), &bind).await;
    pipeline.shutdown().await;
    result
}

/// Ingest a JSON Lines file of raw events.
pub async fn run_ingest(config: Config, path: &Path, progress: ProgressMode) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let reporter = progress.reporter();
    let label = path.display().to_string();
    let throttle = Throttled::new(reporter.as_ref(), &label, lines.len() as u64, PROGRESS_EVERY);

    let pipeline = Pipeline::start(config).await?;
    let mut summary = IngestSummary::default();
    for (i, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(raw) => summary.record(pipeline.ingest(&raw).await)?,
            Err(e) => {
                tracing::warn!(line = i + 1, "invalid JSON: {}", e);
                summary.malformed += 1;
            }
        }
        throttle.tick(i as u64 + 1);
    }
    pipeline.drain().await;
    pipeline.shutdown().await;

    summary.print("ingest");
    print_pipeline_stats(&pipeline.stats());
    Ok(())
}

/// Import Slack channel histories.
pub async fn run_import(config: Config, dir: &Path, progress: ProgressMode) -> Result<()> {
    let reporter = progress.reporter();
    reporter.report(ProgressEvent::Scanning {
        source: dir.display().to_string(),
    });
    let histories = load_history(dir)?;
    if histories.is_empty() {
        bail!("No channel histories found in {}", dir.display());
    }

    let pipeline = Pipeline::start(config).await?;
    let mut summary = IngestSummary::default();
    for history in &histories {
        let events = synthesize_events(history);
        let label = format!("import {}", history.channel_id);
        let throttle = Throttled::new(reporter.as_ref(), &label, events.len() as u64, PROGRESS_EVERY);
        for (i, raw) in events.iter().enumerate() {
            summary.record(pipeline.ingest(raw).await)?;
            throttle.tick(i as u64 + 1);
        }
    }
    pipeline.drain().await;
    pipeline.shutdown().await;

    println!("Imported {} channels.", histories.len());
    summary.print("import");
    print_pipeline_stats(&pipeline.stats());
    Ok(())
}

pub async fn run_index_docs(config: Config, dir: &Path, progress: ProgressMode) -> Result<()> {
    let docs = scan_documents(dir, &config.documents)?;
    let reporter = progress.reporter();
    let label = format!("index-docs {}", dir.display());
    let throttle = Throttled::new(reporter.as_ref(), &label, docs.len() as u64, 50);

    let pipeline = Pipeline::start(config).await?;
    let mut changed = 0u64;
    let mut failed = 0u64;
    for (i, doc) in docs.iter().enumerate() {
        match pipeline
            .index_document(&doc.path, &doc.text, doc.modified_ts)
            .await
        {
            Ok(rapport_core::lineage::RevisionOutcome::Stale) => {}
            Ok(_) => changed += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(path = %doc.path, "indexing failed: {:#}", e);
            }
        }
        throttle.tick(i as u64 + 1);
    }
    pipeline.shutdown().await;

    println!(
        "index-docs: {} documents, {} updated, {} unchanged, {} failed",
        docs.len(),
        changed,
        docs.len() as u64 - changed - failed,
        failed
    );
    Ok(())
}

pub async fn run_replay(config: Config) -> Result<()> {
    let pipeline = Pipeline::start(config).await?;
    let report = pipeline.replay().await;
    pipeline.shutdown().await;
    let report = report?;
    println!(
        "replay: {} events, {} profile updates, {} index revisions, {} index failures",
        report.events, report.profile_updates, report.index_revisions, report.index_failures
    );
    Ok(())
}

pub async fn run_profile(config: Config, user_id: &str, json: bool) -> Result<()> {
    let pipeline = Pipeline::start(config).await?;
    let profile = pipeline.profile(user_id).await;
    pipeline.shutdown().await;
    let Some(profile) = profile? else {
        bail!("No profile for {}", user_id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(profile.as_ref())?);
        return Ok(());
    }

    let assessment = persona::classify(&profile);
    println!("Profile: {}", profile.user_id);
    println!("  Messages:     {}", profile.message_count);
    println!(
        "  Channels:     {}",
        profile
            .channel_membership
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "  Reactions:    {} given, {} received",
        profile.reaction_given_count, profile.reaction_received_count
    );
    if let Some(avg) = profile.sentiment.average() {
        println!("  Sentiment:    {:.1} / 5", avg);
    }
    println!("  Questions:    {:.0}%", profile.question_ratio() * 100.0);
    println!(
        "  Persona:      {} ({:.2})",
        assessment.persona.label(),
        assessment.confidence
    );
    let topics: Vec<String> = profile
        .top_topics(10)
        .into_iter()
        .map(|(t, n)| format!("{} ({})", t, n))
        .collect();
    if !topics.is_empty() {
        println!("  Topics:       {}", topics.join(", "));
    }
    let open = profile.open_questions_by_age();
    if !open.is_empty() {
        println!("  Unanswered:");
        for (_, q) in open {
            println!("    [{}] {}", q.channel_id, q.excerpt);
        }
    }
    if !profile.recent_activity.is_empty() {
        println!("  Recent:");
        for a in &profile.recent_activity {
            println!("    [{}] {}", a.channel_id, a.excerpt);
        }
    }
    Ok(())
}

pub async fn run_context(
    config: Config,
    user_id: &str,
    intent: &str,
    budget: Option<usize>,
) -> Result<()> {
    let pipeline = Pipeline::start(config).await?;
    let bundle = pipeline.request_context(user_id, intent, budget).await;
    pipeline.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&bundle?)?);
    Ok(())
}

pub async fn run_draft(
    config: Config,
    user_id: &str,
    intent: &str,
    budget: Option<usize>,
) -> Result<()> {
    let pipeline = Pipeline::start(config).await?;
    let result = pipeline.draft(user_id, intent, budget).await;
    pipeline.shutdown().await;
    let (bundle, draft) = result?;

    if let Some(reason) = &draft.degraded {
        eprintln!("warning: context degraded ({})", reason);
    }
    println!("Draft for {} ({}):", draft.target_user_id, draft.model);
    println!();
    println!("{}", draft.text);
    println!();
    println!(
        "Context: {} facts, {} items, ~{} tokens (request {})",
        bundle.profile_facts.len(),
        bundle.ranked_items.len(),
        bundle.total_token_estimate,
        bundle.request_id
    );
    Ok(())
}

pub async fn run_stats(config: Config) -> Result<()> {
    let (label, size) = if config.db.backend == "memory" {
        ("(memory)".to_string(), None)
    } else {
        (
            config.db.path.display().to_string(),
            std::fs::metadata(&config.db.path).ok().map(|m| m.len()),
        )
    };
    let pipeline = Pipeline::start(config).await?;
    let report = pipeline.store_report(10).await;
    pipeline.shutdown().await;

    print_store_report(&label, size, &report?);
    Ok(())
}
