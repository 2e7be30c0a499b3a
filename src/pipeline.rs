//! The assembled pipeline.
//!
//! [`Pipeline`] wires the stages together and is the only type the CLI
//! and the HTTP server talk to.
//!
//! ```text
//! ingest(raw)
//!   │ normalize
//!   │ EventLog::append          (duplicate ids stop here)
//!   ▼
//! OrderingDispatcher ─▶ worker(channel, user) ─▶ gate
//!                                                 │ released, in order
//!                                                 ▼
//!                          ProfileAggregator::apply ─▶ ContentIndexer::enqueue
//!
//! request_context(user, intent) ─▶ ContextAssembler ─▶ ContextBundle
//! draft(user, intent)           ─▶ ContextAssembler ─▶ DraftGenerator
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use rapport_core::error::{PipelineError, PipelineWarning};
use rapport_core::lineage::RevisionOutcome;
use rapport_core::models::{CanonicalEvent, ContextBundle, OrderingKey, UserProfile};
use rapport_core::normalize::normalize;
use rapport_core::store::memory::{InMemoryEventLog, InMemoryProfileStore, InMemoryVectorIndex};
use rapport_core::store::{EventLog, ProfileStore, VectorIndex};
use rapport_core::topics::TopicExtractor;

use crate::aggregator::ProfileAggregator;
use crate::assembler::ContextAssembler;
use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::generation::{create_generator, Draft, DraftGenerator};
use crate::indexer::{is_indexable, ContentIndexer, IndexJob, IndexerSettings};
use crate::ordering::{OrderingDispatcher, ReleaseSink};
use crate::sqlite_store::SqliteStore;
use crate::stats::{add, bump, collect_store_report, PipelineStats, StatsSnapshot, StoreReport};

/// The three storage backends the pipeline writes to.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventLog>,
    pub profiles: Arc<dyn ProfileStore>,
    pub index: Arc<dyn VectorIndex>,
    sqlite: Option<Arc<SqliteStore>>,
}

impl Stores {
    pub fn new(
        events: Arc<dyn EventLog>,
        profiles: Arc<dyn ProfileStore>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            events,
            profiles,
            index,
            sqlite: None,
        }
    }

    pub fn memory() -> Self {
        Self {
            events: Arc::new(InMemoryEventLog::new()),
            profiles: Arc::new(InMemoryProfileStore::new()),
            index: Arc::new(InMemoryVectorIndex::new()),
            sqlite: None,
        }
    }

    pub fn sqlite(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        Self {
            events: store.clone(),
            profiles: store.clone(),
            index: store.clone(),
            sqlite: Some(store),
        }
    }

    /// Open the backend named by `[db] backend`.
    pub async fn open(config: &Config) -> Result<Self> {
        match config.db.backend.as_str() {
            "memory" => Ok(Self::memory()),
            _ => Ok(Self::sqlite(SqliteStore::open(config).await?)),
        }
    }

    pub async fn close(&self) {
        if let Some(store) = &self.sqlite {
            store.close().await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted { event_id: String },
    /// Already in the event log.
    Duplicate { event_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub events: u64,
    pub profile_updates: u64,
    pub index_revisions: u64,
    pub index_failures: u64,
}

struct Release {
    profiles: Arc<ProfileAggregator>,
    indexer: Arc<ContentIndexer>,
    stats: Arc<PipelineStats>,
}

#[async_trait]
impl ReleaseSink for Release {
    async fn deliver(&self, event: CanonicalEvent) {
        bump(&self.stats.events_released);
        match self.profiles.apply(&event).await {
            Ok(n) => add(&self.stats.profile_updates, n as u64),
            Err(e) => tracing::error!(
                event_id = %event.event_id,
                "profile update failed: {:#}",
                e
            ),
        }
        self.indexer.enqueue(IndexJob::Event(event));
    }

    fn warn(&self, warning: PipelineWarning) {
        self.stats.warn(&warning);
    }

    fn duplicates(&self, count: usize) {
        add(&self.stats.events_duplicate, count as u64);
    }

    async fn resume_point(&self, key: &OrderingKey) -> (Option<u64>, Vec<String>) {
        match self.profiles.resume_point(key).await {
            Ok(point) => point,
            Err(e) => {
                tracing::error!(key = %key, "cannot load resume point: {:#}", e);
                (None, Vec::new())
            }
        }
    }
}

pub struct Pipeline {
    config: Config,
    stores: Stores,
    stats: Arc<PipelineStats>,
    profiles: Arc<ProfileAggregator>,
    indexer: Arc<ContentIndexer>,
    dispatcher: OrderingDispatcher,
    assembler: ContextAssembler,
    generator: Arc<dyn DraftGenerator>,
}

impl Pipeline {
    /// Open the configured stores and providers and start the workers.
    pub async fn start(config: Config) -> Result<Self> {
        let stores = Stores::open(&config).await?;
        let provider = create_provider(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        tracing::info!(
            backend = %config.db.backend,
            embedding = provider.model_name(),
            generation = generator.model_name(),
            "pipeline started"
        );
        Ok(Self::with_components(config, stores, provider, generator))
    }

    /// Start the workers over explicit stores and providers.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_components(
        config: Config,
        stores: Stores,
        provider: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn DraftGenerator>,
    ) -> Self {
        let stats = Arc::new(PipelineStats::default());
        let extractor: Arc<dyn TopicExtractor> = Arc::new(config.topics.extractor());

        let profiles = Arc::new(ProfileAggregator::new(
            stores.profiles.clone(),
            extractor.clone(),
            config.profile.settings(),
        ));
        let indexer = Arc::new(ContentIndexer::start(
            stores.index.clone(),
            provider.clone(),
            IndexerSettings::from_config(
                &config.indexer,
                config.chunking.max_tokens,
                config.embedding.batch_size,
            ),
            stats.clone(),
        ));
        let dispatcher = OrderingDispatcher::new(
            config.ordering.gate_settings(),
            Duration::from_millis(config.ordering.tick_ms),
            config.ordering.worker_capacity,
            Arc::new(Release {
                profiles: profiles.clone(),
                indexer: indexer.clone(),
                stats: stats.clone(),
            }),
        )
        .with_idle_timeout(Duration::from_millis(config.ordering.idle_ms));
        let assembler = ContextAssembler::new(
            profiles.clone(),
            stores.index.clone(),
            provider,
            extractor,
            config.retrieval.clone(),
            stats.clone(),
        );

        Self {
            config,
            stores,
            stats,
            profiles,
            indexer,
            dispatcher,
            assembler,
            generator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Normalize, log, and route one raw provider event.
    pub async fn ingest(&self, raw: &serde_json::Value) -> Result<IngestOutcome, PipelineError> {
        bump(&self.stats.events_received);
        let event = match normalize(raw) {
            Ok(event) => event,
            Err(e) => {
                bump(&self.stats.events_malformed);
                tracing::warn!("rejected event: {}", e);
                return Err(e);
            }
        };
        self.route(event).await
    }

    /// Log and route an already canonical event.
    pub async fn ingest_event(&self, event: CanonicalEvent) -> Result<IngestOutcome, PipelineError> {
        bump(&self.stats.events_received);
        self.route(event).await
    }

    async fn route(&self, event: CanonicalEvent) -> Result<IngestOutcome, PipelineError> {
        let event_id = event.event_id.clone();
        if !self.stores.events.append(&event).await? {
            bump(&self.stats.events_duplicate);
            tracing::debug!(event_id = %event_id, "duplicate delivery");
            return Ok(IngestOutcome::Duplicate { event_id });
        }
        tracing::debug!(
            event_id = %event_id,
            channel = %event.channel_id,
            user = %event.user_id,
            kind = event.kind.as_str(),
            "accepted"
        );
        self.dispatcher.dispatch(event).await?;
        Ok(IngestOutcome::Accepted { event_id })
    }

    /// Wait until everything ingested so far has passed the gates (or is
    /// waiting in a window) and the indexer queue is empty.
    pub async fn flush(&self) {
        self.dispatcher.flush().await;
        self.indexer.flush().await;
    }

    /// Like [`flush`](Self::flush), but also releases events still held
    /// in reorder windows.
    pub async fn drain(&self) {
        self.dispatcher.drain().await;
        self.indexer.flush().await;
    }

    pub fn get_profile(&self, user_id: &str) -> Option<Arc<UserProfile>> {
        self.profiles.get_profile(user_id)
    }

    /// Profile snapshot, loading it from the store if needed.
    pub async fn profile(&self, user_id: &str) -> Result<Option<Arc<UserProfile>>> {
        self.profiles.profile(user_id).await
    }

    pub async fn request_context(
        &self,
        user_id: &str,
        intent: &str,
        budget: Option<usize>,
    ) -> Result<ContextBundle, PipelineError> {
        self.assembler.assemble(user_id, intent, budget).await
    }

    /// Assemble context and generate a reply draft for review.
    pub async fn draft(
        &self,
        user_id: &str,
        intent: &str,
        budget: Option<usize>,
    ) -> Result<(ContextBundle, Draft), PipelineError> {
        let bundle = self.request_context(user_id, intent, budget).await?;
        let text = self
            .generator
            .generate(&self.config.generation.instructions, &bundle)
            .await?;
        bump(&self.stats.drafts_generated);
        let draft = Draft {
            request_id: bundle.request_id.clone(),
            target_user_id: bundle.target_user_id.clone(),
            model: self.generator.model_name().to_string(),
            text,
            degraded: bundle.degraded.as_ref().map(|d| d.to_string()),
        };
        Ok((bundle, draft))
    }

    /// Index an external document under lineage `doc:{path}`.
    pub async fn index_document(
        &self,
        path: &str,
        text: &str,
        modified_ts: i64,
    ) -> Result<RevisionOutcome> {
        self.indexer
            .index_now(IndexJob::Document {
                path: path.to_string(),
                text: text.to_string(),
                modified_ts,
            })
            .await
    }

    /// Re-apply every logged event to the profiles and the index.
    ///
    /// Bypasses the ordering gates; both projections converge regardless
    /// of order and ignore what they have already seen.
    pub async fn replay(&self) -> Result<ReplayReport> {
        let events = self.stores.events.replay().await?;
        let mut report = ReplayReport::default();
        for event in events {
            report.events += 1;
            report.profile_updates += self.profiles.apply(&event).await? as u64;
            if is_indexable(&event) {
                let event_id = event.event_id.clone();
                match self.indexer.index_now(IndexJob::Event(event)).await {
                    Ok(RevisionOutcome::Stale) => {}
                    Ok(_) => report.index_revisions += 1,
                    Err(e) => {
                        report.index_failures += 1;
                        tracing::warn!(event_id = %event_id, "replay index failed: {:#}", e);
                    }
                }
            }
        }
        tracing::info!(
            events = report.events,
            profile_updates = report.profile_updates,
            index_revisions = report.index_revisions,
            "replay finished"
        );
        Ok(report)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn store_report(&self, top_n: usize) -> Result<StoreReport> {
        collect_store_report(
            self.stores.events.as_ref(),
            self.stores.profiles.as_ref(),
            self.stores.index.as_ref(),
            top_n,
        )
        .await
    }

    /// Release everything held, finish indexing, and close the stores.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        self.indexer.shutdown().await;
        self.stores.close().await;
        tracing::info!("pipeline stopped");
    }
}
