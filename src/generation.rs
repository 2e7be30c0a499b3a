//! Draft generation.
//!
//! A [`DraftGenerator`] turns a [`ContextBundle`] into a suggested reply.
//! Drafts are returned to the administrator for review; nothing here
//! posts to the workspace.
//!
//! | `[generation] provider` | Implementation |
//! |-------------------------|----------------|
//! | `disabled` | [`DisabledGenerator`] |
//! | `openai` | [`OpenAIChatGenerator`], any `/chat/completions` endpoint |

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use rapport_core::error::PipelineError;
use rapport_core::models::ContextBundle;

use crate::config::GenerationConfig;
use crate::retry::post_json_with_retry;

#[derive(Debug, Clone, Serialize)]
pub struct Draft {
    pub request_id: String,
    pub target_user_id: String,
    pub model: String,
    pub text: String,
    /// Set when the bundle was built from partial data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

#[async_trait]
pub trait DraftGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(
        &self,
        instructions: &str,
        bundle: &ContextBundle,
    ) -> Result<String, PipelineError>;
}

/// Render a bundle as the user message of a chat request.
pub fn render_prompt(bundle: &ContextBundle) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Reply to: {}", bundle.target_user_id);
    let _ = writeln!(out, "Intent: {}", bundle.intent);

    if !bundle.profile_facts.is_empty() {
        let _ = writeln!(out, "\nAbout {}:", bundle.target_user_id);
        for fact in &bundle.profile_facts {
            let _ = writeln!(out, "- {}", fact);
        }
    }

    if !bundle.ranked_items.is_empty() {
        let _ = writeln!(out, "\nRelated workspace messages:");
        for (i, item) in bundle.ranked_items.iter().enumerate() {
            let author = item.user_id.as_deref().unwrap_or("document");
            let _ = writeln!(out, "[{}] ({}) {}", i + 1, author, item.text);
        }
    }

    if let Some(reason) = &bundle.degraded {
        let _ = writeln!(out, "\nNote: workspace search was unavailable ({}).", reason);
    }

    let _ = write!(out, "\nWrite a short reply draft.");
    out
}

pub struct DisabledGenerator;

#[async_trait]
impl DraftGenerator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(
        &self,
        _instructions: &str,
        _bundle: &ContextBundle,
    ) -> Result<String, PipelineError> {
        Err(PipelineError::provider(
            "generation",
            "no generation provider configured (set [generation] provider)",
        ))
    }
}

/// OpenAI-compatible chat completions.
pub struct OpenAIChatGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    max_retries: u32,
}

impl OpenAIChatGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set")?;
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.url.trim_end_matches('/')),
            model,
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl DraftGenerator for OpenAIChatGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        instructions: &str,
        bundle: &ContextBundle,
    ) -> Result<String, PipelineError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "system", "content": instructions },
                { "role": "user", "content": render_prompt(bundle) },
            ],
        });

        let response = post_json_with_retry(
            &self.client,
            &self.url,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "Chat",
        )
        .await
        .map_err(|e| PipelineError::provider("generation", format!("{:#}", e)))?;

        response["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PipelineError::provider("generation", "response has no message content"))
    }
}

/// Build the generator named by `[generation] provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn DraftGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAIChatGenerator::new(config)?)),
        other => anyhow::bail!("Unknown generation provider: {}", other),
    }
}
