//! TOML configuration.
//!
//! Every section is optional and every tunable has a default, so an empty
//! file is a valid configuration (SQLite at `./data/rapport.sqlite`,
//! hashing embedder, generation disabled). See
//! `config/rapport.example.toml` for an annotated example.
//!
//! | Section | Controls |
//! |---------|----------|
//! | `[db]` | storage backend and SQLite path |
//! | `[ordering]` | reorder window, orphan timeout, worker tick |
//! | `[profile]` | recent activity retention |
//! | `[topics]` | topic extractor settings |
//! | `[chunking]` | chunk size |
//! | `[indexer]` | queue sizes and retry backoff |
//! | `[embedding]` | embedding provider |
//! | `[retrieval]` | candidate count, ranking weights, budget, timeout |
//! | `[generation]` | draft generation provider |
//! | `[documents]` | globs for `index-docs` |
//! | `[server]` | HTTP bind address |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use rapport_core::context::RankingSettings;
use rapport_core::gate::GateSettings;
use rapport_core::profile::ProfileSettings;
use rapport_core::store::QueryScope;
use rapport_core::topics::KeywordTopicExtractor;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub ordering: OrderingConfig,
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// `sqlite` or `memory`.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_db_path(),
        }
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./data/rapport.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrderingConfig {
    #[serde(default = "default_window_slots")]
    pub window_slots: usize,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_orphan_timeout_ms")]
    pub orphan_timeout_ms: u64,
    /// How often each key worker expires its window.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Inbox size of each key worker.
    #[serde(default = "default_worker_capacity")]
    pub worker_capacity: usize,
    /// A key worker with nothing buffered retires after this long without
    /// input. 0 keeps workers forever.
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    /// Non-post event ids each gate remembers for dedup.
    #[serde(default = "default_recent_ids")]
    pub recent_ids: usize,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            window_slots: default_window_slots(),
            window_ms: default_window_ms(),
            orphan_timeout_ms: default_orphan_timeout_ms(),
            tick_ms: default_tick_ms(),
            worker_capacity: default_worker_capacity(),
            idle_ms: default_idle_ms(),
            recent_ids: default_recent_ids(),
        }
    }
}

impl OrderingConfig {
    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            window_slots: self.window_slots,
            window_ms: self.window_ms,
            orphan_timeout_ms: self.orphan_timeout_ms,
            recent_ids: self.recent_ids,
            ..GateSettings::default()
        }
    }
}

fn default_window_slots() -> usize {
    32
}
fn default_window_ms() -> u64 {
    2_000
}
fn default_orphan_timeout_ms() -> u64 {
    30_000
}
fn default_tick_ms() -> u64 {
    250
}
fn default_worker_capacity() -> usize {
    256
}
fn default_idle_ms() -> u64 {
    60_000
}
fn default_recent_ids() -> usize {
    1_024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProfileConfig {
    #[serde(default = "default_recent_activity_limit")]
    pub recent_activity_limit: usize,
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
    /// A later mention of the asker in the same channel within this many
    /// hours answers a question.
    #[serde(default = "default_answer_window_hours")]
    pub answer_window_hours: u64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            recent_activity_limit: default_recent_activity_limit(),
            excerpt_chars: default_excerpt_chars(),
            answer_window_hours: default_answer_window_hours(),
        }
    }
}

impl ProfileConfig {
    pub fn settings(&self) -> ProfileSettings {
        ProfileSettings {
            recent_activity_limit: self.recent_activity_limit,
            excerpt_chars: self.excerpt_chars,
            answer_window_micros: i64::try_from(self.answer_window_hours)
                .unwrap_or(i64::MAX)
                .saturating_mul(3_600_000_000),
        }
    }
}

fn default_recent_activity_limit() -> usize {
    20
}
fn default_excerpt_chars() -> usize {
    280
}
fn default_answer_window_hours() -> u64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct TopicsConfig {
    #[serde(default = "default_min_token_len")]
    pub min_token_len: usize,
    #[serde(default = "default_max_topics")]
    pub max_topics_per_message: usize,
    #[serde(default)]
    pub extra_stopwords: Vec<String>,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            min_token_len: default_min_token_len(),
            max_topics_per_message: default_max_topics(),
            extra_stopwords: Vec::new(),
        }
    }
}

impl TopicsConfig {
    pub fn extractor(&self) -> KeywordTopicExtractor {
        KeywordTopicExtractor::new(self.min_token_len, self.max_topics_per_message)
            .with_extra_stopwords(&self.extra_stopwords)
    }
}

fn default_min_token_len() -> usize {
    3
}
fn default_max_topics() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Jobs held beyond the queue before new ones are dropped.
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,
    #[serde(default = "default_index_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            backlog_capacity: default_backlog_capacity(),
            max_retries: default_index_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1_024
}
fn default_backlog_capacity() -> usize {
    10_000
}
fn default_index_retries() -> u32 {
    5
}
fn default_base_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash`, `openai`, `ollama`, `local`, or `disabled`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama (default `http://localhost:11434`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Token budget used when a request does not name one.
    #[serde(default = "default_budget")]
    pub default_budget: usize,
    #[serde(default = "default_assembly_timeout_ms")]
    pub assembly_timeout_ms: u64,
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_half_life_hours")]
    pub half_life_hours: f64,
    #[serde(default = "default_redundancy_penalty")]
    pub redundancy_penalty: f64,
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f32,
    #[serde(default = "default_profile_share")]
    pub profile_share: f64,
    #[serde(default = "default_profile_topics")]
    pub profile_topics: usize,
    /// `workspace` searches everyone's messages, `user` only the target's.
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_true")]
    pub include_documents: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_k: default_candidate_k(),
            default_budget: default_budget(),
            assembly_timeout_ms: default_assembly_timeout_ms(),
            similarity_weight: default_similarity_weight(),
            recency_weight: default_recency_weight(),
            half_life_hours: default_half_life_hours(),
            redundancy_penalty: default_redundancy_penalty(),
            dedup_threshold: default_dedup_threshold(),
            profile_share: default_profile_share(),
            profile_topics: default_profile_topics(),
            scope: default_scope(),
            include_documents: true,
        }
    }
}

impl RetrievalConfig {
    pub fn ranking_settings(&self) -> RankingSettings {
        RankingSettings {
            similarity_weight: self.similarity_weight,
            recency_weight: self.recency_weight,
            half_life_hours: self.half_life_hours,
            redundancy_penalty: self.redundancy_penalty,
            dedup_threshold: self.dedup_threshold,
            profile_share: self.profile_share,
            profile_topics: self.profile_topics,
        }
    }

    pub fn scope_for(&self, user_id: &str) -> QueryScope {
        match self.scope.as_str() {
            "user" => QueryScope::user(user_id, self.include_documents),
            _ => QueryScope::workspace(),
        }
    }
}

fn default_candidate_k() -> usize {
    40
}
fn default_budget() -> usize {
    1_024
}
fn default_assembly_timeout_ms() -> u64 {
    5_000
}
fn default_similarity_weight() -> f64 {
    0.75
}
fn default_recency_weight() -> f64 {
    0.2
}
fn default_half_life_hours() -> f64 {
    72.0
}
fn default_redundancy_penalty() -> f64 {
    0.1
}
fn default_dedup_threshold() -> f32 {
    0.92
}
fn default_profile_share() -> f64 {
    0.3
}
fn default_profile_topics() -> usize {
    5
}
fn default_scope() -> String {
    "workspace".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `disabled` or `openai` (any OpenAI-compatible chat endpoint).
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_generation_url")]
    pub url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    /// System instructions prepended to every draft request.
    #[serde(default = "default_instructions")]
    pub instructions: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            url: default_generation_url(),
            temperature: default_temperature(),
            max_tokens: default_generation_max_tokens(),
            max_retries: default_generation_retries(),
            timeout_secs: default_generation_timeout_secs(),
            instructions: default_instructions(),
        }
    }
}

fn default_generation_provider() -> String {
    "disabled".to_string()
}
fn default_generation_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_generation_max_tokens() -> u32 {
    512
}
fn default_generation_retries() -> u32 {
    3
}
fn default_generation_timeout_secs() -> u64 {
    60
}
fn default_instructions() -> String {
    "You draft replies for a workspace administrator. Use only the context provided. \
     Keep the tone friendly and specific. The administrator reviews every draft before \
     anything is sent."
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// In-process configuration: memory stores, hashing embedder, no
    /// generation provider.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                backend: "memory".to_string(),
                ..DbConfig::default()
            },
            ..Config::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.db.backend.as_str() {
            "sqlite" | "memory" => {}
            other => bail!("Unknown db.backend: '{}'. Must be sqlite or memory.", other),
        }

        if self.ordering.window_slots == 0 {
            bail!("ordering.window_slots must be > 0");
        }
        if self.ordering.tick_ms == 0 {
            bail!("ordering.tick_ms must be > 0");
        }
        if self.ordering.worker_capacity == 0 {
            bail!("ordering.worker_capacity must be > 0");
        }

        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }

        if self.indexer.queue_capacity == 0 {
            bail!("indexer.queue_capacity must be > 0");
        }
        if self.indexer.base_backoff_ms > self.indexer.max_backoff_ms {
            bail!("indexer.base_backoff_ms must not exceed indexer.max_backoff_ms");
        }

        match self.embedding.provider.as_str() {
            "hash" | "local" | "disabled" => {}
            "openai" | "ollama" => {
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if self.embedding.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, ollama, local, or disabled.",
                other
            ),
        }
        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }

        let r = &self.retrieval;
        if r.candidate_k == 0 {
            bail!("retrieval.candidate_k must be >= 1");
        }
        for (name, w) in [
            ("similarity_weight", r.similarity_weight),
            ("recency_weight", r.recency_weight),
            ("redundancy_penalty", r.redundancy_penalty),
            ("profile_share", r.profile_share),
        ] {
            if !(0.0..=1.0).contains(&w) {
                bail!("retrieval.{} must be in [0.0, 1.0]", name);
            }
        }
        if !(r.dedup_threshold > 0.0 && r.dedup_threshold <= 1.0) {
            bail!("retrieval.dedup_threshold must be in (0.0, 1.0]");
        }
        if r.half_life_hours <= 0.0 {
            bail!("retrieval.half_life_hours must be > 0");
        }
        match r.scope.as_str() {
            "workspace" | "user" => {}
            other => bail!("Unknown retrieval.scope: '{}'. Must be workspace or user.", other),
        }

        match self.generation.provider.as_str() {
            "disabled" => {}
            "openai" => {
                if self.generation.model.is_none() {
                    bail!("generation.model must be specified when provider is 'openai'");
                }
            }
            other => bail!(
                "Unknown generation provider: '{}'. Must be disabled or openai.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
