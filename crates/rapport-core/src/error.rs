//! Error, warning, and degradation taxonomy.
//!
//! Errors end processing of one event or one request. Warnings and
//! degradations never do: the stream keeps flowing and requests return
//! whatever partial result is available.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Required fields are missing. The event is logged and dropped.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("{provider} provider unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    /// No profile and no retrievable chunks. Not retried.
    #[error("insufficient context for user {user_id}")]
    InsufficientContext { user_id: String },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn malformed(message: impl Into<String>) -> Self {
        PipelineError::MalformedEvent(message.into())
    }

    pub fn provider(provider: impl Into<String>, message: impl fmt::Display) -> Self {
        PipelineError::ProviderUnavailable {
            provider: provider.into(),
            message: message.to_string(),
        }
    }
}

/// Non-fatal conditions raised while processing the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineWarning {
    /// Buffered events were released without their missing predecessors.
    GapDetected {
        key: String,
        missing_from: u64,
        missing_to: u64,
    },
    /// An edit or delete whose original never arrived.
    OrphanSupersession { event_id: String, supersedes: String },
    /// Released after later events on the same key.
    LateArrival { event_id: String, key: String },
    IndexFailed {
        source_event_id: String,
        attempts: u32,
        message: String,
    },
    IndexBacklogFull { source_event_id: String },
}

impl PipelineWarning {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineWarning::GapDetected { .. } => "gap_detected",
            PipelineWarning::OrphanSupersession { .. } => "orphan_supersession",
            PipelineWarning::LateArrival { .. } => "late_arrival",
            PipelineWarning::IndexFailed { .. } => "index_failed",
            PipelineWarning::IndexBacklogFull { .. } => "index_backlog_full",
        }
    }
}

impl fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineWarning::GapDetected {
                key,
                missing_from,
                missing_to,
            } => write!(
                f,
                "gap on {}: positions {}..={} never arrived",
                key, missing_from, missing_to
            ),
            PipelineWarning::OrphanSupersession {
                event_id,
                supersedes,
            } => write!(f, "{} supersedes unseen event {}", event_id, supersedes),
            PipelineWarning::LateArrival { event_id, key } => {
                write!(f, "{} arrived late on {}", event_id, key)
            }
            PipelineWarning::IndexFailed {
                source_event_id,
                attempts,
                message,
            } => write!(
                f,
                "indexing {} failed after {} attempts: {}",
                source_event_id, attempts, message
            ),
            PipelineWarning::IndexBacklogFull { source_event_id } => {
                write!(f, "index backlog full, dropped {}", source_event_id)
            }
        }
    }
}

/// Why a context bundle was built from partial data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DegradedContext {
    /// The profile could not be read in time; the bundle has no facts.
    ProfileUnavailable { message: String },
    ProviderUnavailable { message: String },
    IndexUnavailable { message: String },
    Timeout { after_ms: u64 },
}

impl fmt::Display for DegradedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradedContext::ProfileUnavailable { message } => {
                write!(f, "profile store unavailable: {}", message)
            }
            DegradedContext::ProviderUnavailable { message } => {
                write!(f, "embedding provider unavailable: {}", message)
            }
            DegradedContext::IndexUnavailable { message } => {
                write!(f, "vector index unavailable: {}", message)
            }
            DegradedContext::Timeout { after_ms } => {
                write!(f, "retrieval timed out after {} ms", after_ms)
            }
        }
    }
}
