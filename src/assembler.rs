//! Context assembly for one request.
//!
//! 1. Take the user's profile snapshot.
//! 2. Embed `intent + profile summary` and query the vector index.
//! 3. Score, dedup, and pack with [`rapport_core::context`].
//!
//! Steps 1 and 2 share one `assembly_timeout_ms` deadline. A failed or
//! slow profile read leaves the bundle without facts; a failed or slow
//! retrieval leaves it with facts only. The request fails only when there
//! is neither a profile nor a chunk.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use rapport_core::context::{
    dedup, pack_bundle, profile_facts, profile_summary, score_candidates, PackRequest,
    RankingSettings,
};
use rapport_core::error::{DegradedContext, PipelineError};
use rapport_core::models::{ContextBundle, ScoredChunk};
use rapport_core::store::{QueryScope, VectorIndex};
use rapport_core::topics::TopicExtractor;

use crate::aggregator::ProfileAggregator;
use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::stats::{bump, PipelineStats};

pub struct ContextAssembler {
    profiles: Arc<ProfileAggregator>,
    index: Arc<dyn VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    extractor: Arc<dyn TopicExtractor>,
    retrieval: RetrievalConfig,
    ranking: RankingSettings,
    stats: Arc<PipelineStats>,
}

impl ContextAssembler {
    pub fn new(
        profiles: Arc<ProfileAggregator>,
        index: Arc<dyn VectorIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn TopicExtractor>,
        retrieval: RetrievalConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let ranking = retrieval.ranking_settings();
        Self {
            profiles,
            index,
            provider,
            extractor,
            retrieval,
            ranking,
            stats,
        }
    }

    /// Build a context bundle for drafting a reply to `user_id`.
    ///
    /// `budget` defaults to `retrieval.default_budget` tokens.
    pub async fn assemble(
        &self,
        user_id: &str,
        intent: &str,
        budget: Option<usize>,
    ) -> Result<ContextBundle, PipelineError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let budget = budget.unwrap_or(self.retrieval.default_budget);

        let limit = Duration::from_millis(self.retrieval.assembly_timeout_ms);
        let deadline = Instant::now() + limit;
        let timed_out = || DegradedContext::Timeout {
            after_ms: self.retrieval.assembly_timeout_ms,
        };

        let (profile, mut degraded) =
            match tokio::time::timeout_at(deadline, self.profiles.profile(user_id)).await {
                Ok(Ok(profile)) => (profile, None),
                Ok(Err(e)) => (
                    None,
                    Some(DegradedContext::ProfileUnavailable {
                        message: format!("{:#}", e),
                    }),
                ),
                Err(_) => (None, Some(timed_out())),
            };

        let summary = profile
            .as_deref()
            .map(|p| profile_summary(p, self.ranking.profile_topics))
            .unwrap_or_default();
        let query = format!("{} {}", intent, summary).trim().to_string();
        let scope = self.retrieval.scope_for(user_id);

        let candidates =
            match tokio::time::timeout_at(deadline, self.retrieve(&query, &scope)).await {
                Ok(Ok(found)) => found,
                Ok(Err(reason)) => {
                    degraded.get_or_insert(reason);
                    Vec::new()
                }
                Err(_) => {
                    degraded.get_or_insert_with(timed_out);
                    Vec::new()
                }
            };

        if profile.is_none() && candidates.is_empty() {
            return Err(PipelineError::InsufficientContext {
                user_id: user_id.to_string(),
            });
        }

        let now = chrono::Utc::now().timestamp_micros();
        let ranked = score_candidates(
            candidates,
            profile.as_deref(),
            self.extractor.as_ref(),
            now,
            &self.ranking,
        );
        let ranked = dedup(ranked, self.ranking.dedup_threshold);
        let facts = profile
            .as_deref()
            .map(|p| profile_facts(p, self.ranking.profile_topics))
            .unwrap_or_default();

        let bundle = pack_bundle(
            PackRequest {
                request_id,
                target_user_id: user_id.to_string(),
                intent: intent.to_string(),
                budget,
                profile: profile.as_deref().cloned(),
                facts,
                ranked,
                degraded,
            },
            &self.ranking,
        );

        bump(&self.stats.contexts_built);
        if let Some(reason) = &bundle.degraded {
            bump(&self.stats.contexts_degraded);
            tracing::warn!(
                request_id = %bundle.request_id,
                user = user_id,
                "context degraded: {}",
                reason
            );
        }
        tracing::info!(
            request_id = %bundle.request_id,
            user = user_id,
            items = bundle.ranked_items.len(),
            facts = bundle.profile_facts.len(),
            tokens = bundle.total_token_estimate,
            "context assembled"
        );
        Ok(bundle)
    }

    async fn retrieve(
        &self,
        query: &str,
        scope: &QueryScope,
    ) -> Result<Vec<ScoredChunk>, DegradedContext> {
        let vector = embed_query(self.provider.as_ref(), query)
            .await
            .map_err(|e| DegradedContext::ProviderUnavailable {
                message: format!("{:#}", e),
            })?;
        self.index
            .query(&vector, self.retrieval.candidate_k, scope)
            .await
            .map_err(|e| DegradedContext::IndexUnavailable {
                message: format!("{:#}", e),
            })
    }
}
