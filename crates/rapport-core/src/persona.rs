//! Persona classification from profile tallies.
//!
//! Scores four active personas from the running aggregates and picks the
//! best one. Users with fewer than five live messages are classified as
//! passive readers outright.

use serde::{Deserialize, Serialize};

use crate::models::UserProfile;

/// Minimum live messages before active personas are scored.
const MIN_MESSAGES: u64 = 5;
const MAX_CONFIDENCE: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    PassiveReader,
    ExpertContributor,
    ActiveLearner,
    FeatureAdvocate,
    SocialConnector,
}

impl Persona {
    pub fn label(&self) -> &'static str {
        match self {
            Persona::PassiveReader => "Passive Reader/Lurker",
            Persona::ExpertContributor => "Expert Contributor",
            Persona::ActiveLearner => "Active Learner",
            Persona::FeatureAdvocate => "Feature Advocate",
            Persona::SocialConnector => "Social Connector",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Persona::PassiveReader => "Low participation.",
            Persona::ExpertContributor => "Initiates complex discussions, detailed solutions.",
            Persona::ActiveLearner => "Frequently asks questions, uses community as resource.",
            Persona::FeatureAdvocate => "Discusses roadmap, suggests features, critical of updates.",
            Persona::SocialConnector => "Socializes, welcomes members, uses emojis.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaAssessment {
    pub persona: Persona,
    pub confidence: f64,
}

/// Classify a profile.
///
/// | Persona | Score |
/// |---------|-------|
/// | Feature Advocate | `advocate_hits / n × 20` |
/// | Active Learner | `question_ratio × 10 + learner_hits / n × 10` |
/// | Expert Contributor | `(avg_len / 50 × 5) × (1 − question_ratio)` |
/// | Social Connector | `low_engagement_ratio × 15` |
///
/// Confidence is the winning score's share of the total, capped at 0.95.
pub fn classify(profile: &UserProfile) -> PersonaAssessment {
    let n = profile.message_count;
    if n < MIN_MESSAGES {
        return PersonaAssessment {
            persona: Persona::PassiveReader,
            confidence: 1.0,
        };
    }

    let n = n as f64;
    let question_ratio = profile.question_ratio();
    let low_ratio = profile.engagement.low as f64 / n;

    let scores = [
        (
            Persona::FeatureAdvocate,
            profile.advocate_hits as f64 / n * 20.0,
        ),
        (
            Persona::ActiveLearner,
            question_ratio * 10.0 + profile.learner_hits as f64 / n * 10.0,
        ),
        (
            Persona::ExpertContributor,
            (profile.average_length() / 50.0 * 5.0) * (1.0 - question_ratio),
        ),
        (Persona::SocialConnector, low_ratio * 15.0),
    ];

    let (persona, best) = scores
        .iter()
        .copied()
        .fold((Persona::FeatureAdvocate, f64::MIN), |acc, (p, s)| {
            if s > acc.1 {
                (p, s)
            } else {
                acc
            }
        });
    let total: f64 = scores.iter().map(|(_, s)| s).sum();
    let confidence = if total > 0.0 { best / total } else { 0.0 };

    PersonaAssessment {
        persona,
        confidence: confidence.min(MAX_CONFIDENCE),
    }
}
