//! Ranking, near-duplicate removal, and token-budget packing.
//!
//! The runtime assembler gathers a profile snapshot and candidate chunks,
//! then hands them to this module:
//!
//! ```text
//! candidates ──score_candidates──▶ ranked ──dedup──▶ unique ──pack_bundle──▶ ContextBundle
//! ```
//!
//! # Scoring
//!
//! ```text
//! score = similarity_weight × cosine
//!       + recency_weight    × 0.5^(age_hours / half_life_hours)
//!       − redundancy_penalty × overlap(chunk topics, profile top topics)
//! ```
//!
//! Overlap is the fraction of the chunk's topics already among the
//! profile's top topics. Those are rendered as profile facts, so a chunk
//! that only restates them earns less room.
//!
//! # Packing
//!
//! Tokens are estimated as `ceil(chars / 4)`. Profile facts are packed
//! first up to `profile_share` of the budget, then ranked items, then any
//! facts that did not fit the share. An element that would overflow the
//! budget is skipped whole and never truncated, so
//! `total_token_estimate <= budget` always holds.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::chunk::CHARS_PER_TOKEN;
use crate::embedding::cosine_similarity;
use crate::error::DegradedContext;
use crate::models::{ContextBundle, IndexedChunk, RankedItem, ScoredChunk, UserProfile};
use crate::persona;
use crate::topics::TopicExtractor;

const MICROS_PER_HOUR: f64 = 3_600_000_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingSettings {
    pub similarity_weight: f64,
    pub recency_weight: f64,
    pub half_life_hours: f64,
    pub redundancy_penalty: f64,
    /// Cosine at or above which a candidate counts as a near-duplicate.
    pub dedup_threshold: f32,
    /// Fraction of the budget reserved for profile facts before items.
    pub profile_share: f64,
    /// Topics of the profile compared against chunk topics.
    pub profile_topics: usize,
}

impl Default for RankingSettings {
    fn default() -> Self {
        Self {
            similarity_weight: 0.75,
            recency_weight: 0.2,
            half_life_hours: 72.0,
            redundancy_penalty: 0.1,
            dedup_threshold: 0.92,
            profile_share: 0.3,
            profile_topics: 5,
        }
    }
}

/// A candidate chunk with its final score.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranked {
    pub chunk: IndexedChunk,
    pub similarity: f32,
    pub score: f64,
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Score and sort candidates, best first. Ties go to the lower chunk id.
///
/// `now_ts` is in microseconds, like `revision_ts`.
pub fn score_candidates(
    candidates: Vec<ScoredChunk>,
    profile: Option<&UserProfile>,
    extractor: &dyn TopicExtractor,
    now_ts: i64,
    settings: &RankingSettings,
) -> Vec<Ranked> {
    let top: Vec<String> = profile
        .map(|p| {
            p.top_topics(settings.profile_topics)
                .into_iter()
                .map(|(t, _)| t)
                .collect()
        })
        .unwrap_or_default();

    let mut ranked: Vec<Ranked> = candidates
        .into_iter()
        .map(|c| {
            let age_hours = (now_ts - c.chunk.revision_ts).max(0) as f64 / MICROS_PER_HOUR;
            let recency = if settings.half_life_hours > 0.0 {
                0.5f64.powf(age_hours / settings.half_life_hours)
            } else {
                0.0
            };
            let overlap = topic_overlap(&extractor.extract(&c.chunk.text), &top);
            let score = settings.similarity_weight * c.similarity as f64
                + settings.recency_weight * recency
                - settings.redundancy_penalty * overlap;
            Ranked {
                chunk: c.chunk,
                similarity: c.similarity,
                score,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
    });
    ranked
}

fn topic_overlap(chunk_topics: &[String], profile_topics: &[String]) -> f64 {
    if chunk_topics.is_empty() || profile_topics.is_empty() {
        return 0.0;
    }
    let shared = chunk_topics
        .iter()
        .filter(|t| profile_topics.contains(t))
        .count();
    shared as f64 / chunk_topics.len() as f64
}

/// Greedy near-duplicate removal in rank order.
pub fn dedup(ranked: Vec<Ranked>, threshold: f32) -> Vec<Ranked> {
    let mut kept: Vec<Ranked> = Vec::with_capacity(ranked.len());
    let mut seen_text: Vec<String> = Vec::new();

    for candidate in ranked {
        let norm = normalize_text(&candidate.chunk.text);
        if seen_text.contains(&norm) {
            continue;
        }
        let near = kept.iter().any(|k| {
            cosine_similarity(&k.chunk.embedding, &candidate.chunk.embedding) >= threshold
        });
        if near {
            continue;
        }
        seen_text.push(norm);
        kept.push(candidate);
    }
    kept
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render the profile as short standalone facts, most important first.
pub fn profile_facts(profile: &UserProfile, topic_count: usize) -> Vec<String> {
    let mut facts = Vec::new();

    let channels: Vec<&str> = profile
        .channel_membership
        .iter()
        .map(String::as_str)
        .collect();
    facts.push(format!(
        "{} has posted {} messages across {} channels{}.",
        profile.user_id,
        profile.message_count,
        channels.len(),
        if channels.is_empty() {
            String::new()
        } else {
            format!(" ({})", channels.join(", "))
        }
    ));

    let top = profile.top_topics(topic_count);
    if !top.is_empty() {
        let list: Vec<String> = top.iter().map(|(t, c)| format!("{} ({})", t, c)).collect();
        facts.push(format!("Frequent topics: {}.", list.join(", ")));
    }

    let assessment = persona::classify(profile);
    facts.push(format!(
        "Persona: {} (confidence {:.2}). {}",
        assessment.persona.label(),
        assessment.confidence,
        assessment.persona.description()
    ));

    if let Some(avg) = profile.sentiment.average() {
        facts.push(format!(
            "Average sentiment {:.1}/5; {:.0}% of messages are questions.",
            avg,
            profile.question_ratio() * 100.0
        ));
    }

    if profile.reaction_given_count > 0 || profile.reaction_received_count > 0 {
        facts.push(format!(
            "Reactions given: {}, received: {}.",
            profile.reaction_given_count, profile.reaction_received_count
        ));
    }

    for (_, question) in profile.open_questions_by_age() {
        facts.push(format!(
            "Unanswered question in {}: {}",
            question.channel_id, question.excerpt
        ));
    }

    for entry in &profile.recent_activity {
        facts.push(format!("Recent in {}: {}", entry.channel_id, entry.excerpt));
    }

    facts
}

/// Short text describing the user's interests, appended to the intent
/// to form the retrieval query.
pub fn profile_summary(profile: &UserProfile, topic_count: usize) -> String {
    let mut parts: Vec<String> = profile
        .top_topics(topic_count)
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    if let Some(latest) = profile.recent_activity.first() {
        parts.push(latest.excerpt.clone());
    }
    parts.join(" ")
}

/// Inputs to [`pack_bundle`].
#[derive(Debug, Clone)]
pub struct PackRequest {
    pub request_id: String,
    pub target_user_id: String,
    pub intent: String,
    pub budget: usize,
    pub profile: Option<UserProfile>,
    pub facts: Vec<String>,
    pub ranked: Vec<Ranked>,
    pub degraded: Option<DegradedContext>,
}

pub fn pack_bundle(req: PackRequest, settings: &RankingSettings) -> ContextBundle {
    let budget = req.budget;
    let fact_share = ((budget as f64) * settings.profile_share.clamp(0.0, 1.0)).floor() as usize;
    let mut used = 0usize;

    let mut taken = vec![false; req.facts.len()];
    for (i, fact) in req.facts.iter().enumerate() {
        let cost = estimate_tokens(fact);
        if used + cost <= fact_share {
            used += cost;
            taken[i] = true;
        }
    }

    let mut items = Vec::new();
    for r in req.ranked {
        let cost = estimate_tokens(&r.chunk.text);
        if used + cost > budget {
            continue;
        }
        used += cost;
        items.push(RankedItem {
            text: r.chunk.text,
            relevance_score: r.score,
            source_event_id: r.chunk.source_event_id,
            user_id: r.chunk.user_id,
        });
    }

    for (i, fact) in req.facts.iter().enumerate() {
        if taken[i] {
            continue;
        }
        let cost = estimate_tokens(fact);
        if used + cost <= budget {
            used += cost;
            taken[i] = true;
        }
    }

    let profile_facts = req
        .facts
        .into_iter()
        .zip(taken)
        .filter_map(|(f, t)| t.then_some(f))
        .collect();

    ContextBundle {
        request_id: req.request_id,
        target_user_id: req.target_user_id,
        intent: req.intent,
        budget,
        profile_snapshot: req.profile,
        profile_facts,
        ranked_items: items,
        total_token_estimate: used,
        degraded: req.degraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::KeywordTopicExtractor;

    fn chunk(id: &str, text: &str, embedding: Vec<f32>, ts: i64) -> IndexedChunk {
        IndexedChunk {
            chunk_id: id.into(),
            source_event_id: format!("msg:C1:{}", id),
            lineage_id: format!("msg:C1:{}", id),
            user_id: Some("U1".into()),
            channel_id: Some("C1".into()),
            offset: 0,
            text: text.into(),
            embedding,
            revision_ts: ts,
            valid: true,
        }
    }

    fn ranked(id: &str, text: &str, embedding: Vec<f32>, score: f64) -> Ranked {
        Ranked {
            chunk: chunk(id, text, embedding, 0),
            similarity: score as f32,
            score,
        }
    }

    fn request(budget: usize, facts: Vec<String>, items: Vec<Ranked>) -> PackRequest {
        PackRequest {
            request_id: "r1".into(),
            target_user_id: "U1".into(),
            intent: "follow up".into(),
            budget,
            profile: None,
            facts,
            ranked: items,
            degraded: None,
        }
    }

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn similarity_dominates_and_recency_breaks_ties() {
        let hour = MICROS_PER_HOUR as i64;
        let now = 1_000 * hour;
        let candidates = vec![
            ScoredChunk {
                chunk: chunk("a", "deploy pipeline notes", vec![1.0, 0.0], now - 500 * hour),
                similarity: 0.9,
            },
            ScoredChunk {
                chunk: chunk("b", "deploy pipeline notes again", vec![0.0, 1.0], now),
                similarity: 0.2,
            },
            ScoredChunk {
                chunk: chunk("c", "older deploy pipeline remark", vec![0.5, 0.5], now - 200 * hour),
                similarity: 0.2,
            },
        ];
        let out = score_candidates(
            candidates,
            None,
            &KeywordTopicExtractor::default(),
            now,
            &RankingSettings::default(),
        );
        let ids: Vec<&str> = out.iter().map(|r| r.chunk.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn restating_profile_topics_is_penalized() {
        let mut profile = UserProfile::new("U1");
        profile.topic_frequency.insert("billing".into(), 5);
        let candidates = vec![
            ScoredChunk {
                chunk: chunk("a", "billing", vec![1.0], 0),
                similarity: 0.5,
            },
            ScoredChunk {
                chunk: chunk("b", "roadmap", vec![1.0], 0),
                similarity: 0.5,
            },
        ];
        let out = score_candidates(
            candidates,
            Some(&profile),
            &KeywordTopicExtractor::default(),
            0,
            &RankingSettings::default(),
        );
        assert_eq!(out[0].chunk.chunk_id, "b");
        assert!(out[0].score > out[1].score);
    }

    #[test]
    fn dedup_drops_near_identical_vectors_and_text() {
        let items = vec![
            ranked("a", "Billing fix shipped", vec![1.0, 0.0], 0.9),
            ranked("b", "billing fix shipped!", vec![0.0, 1.0], 0.8),
            ranked("c", "Something else", vec![0.99, 0.05], 0.7),
            ranked("d", "Unrelated", vec![0.0, -1.0], 0.6),
        ];
        let kept = dedup(items, 0.92);
        let ids: Vec<&str> = kept.iter().map(|r| r.chunk.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);
    }

    #[test]
    fn packing_never_exceeds_budget() {
        let facts = vec!["x".repeat(40), "y".repeat(40)];
        let items = vec![
            ranked("a", &"a".repeat(80), vec![1.0], 0.9),
            ranked("b", &"b".repeat(20), vec![1.0], 0.8),
        ];
        for budget in [0usize, 5, 10, 15, 20, 25, 30, 45, 100] {
            let bundle = pack_bundle(
                request(budget, facts.clone(), items.clone()),
                &RankingSettings::default(),
            );
            assert!(bundle.total_token_estimate <= budget, "budget {}", budget);
            let counted: usize = bundle
                .profile_facts
                .iter()
                .map(|f| estimate_tokens(f))
                .chain(bundle.ranked_items.iter().map(|i| estimate_tokens(&i.text)))
                .sum();
            assert_eq!(counted, bundle.total_token_estimate);
        }
    }

    #[test]
    fn facts_limited_to_share_before_items() {
        // 100 tokens: 30 for facts first, items next, leftovers after.
        let facts = vec!["f".repeat(80), "g".repeat(80)];
        let items = vec![ranked("a", &"a".repeat(240), vec![1.0], 0.9)];
        let bundle = pack_bundle(request(100, facts, items), &RankingSettings::default());
        assert_eq!(bundle.ranked_items.len(), 1);
        assert_eq!(bundle.profile_facts.len(), 2);
        assert_eq!(bundle.total_token_estimate, 100);
    }

    #[test]
    fn oversized_item_skipped_but_smaller_later_item_packed() {
        let items = vec![
            ranked("a", &"a".repeat(400), vec![1.0], 0.9),
            ranked("b", &"b".repeat(40), vec![1.0], 0.5),
        ];
        let bundle = pack_bundle(request(20, vec![], items), &RankingSettings::default());
        assert_eq!(bundle.ranked_items.len(), 1);
        assert_eq!(bundle.ranked_items[0].source_event_id, "msg:C1:b");
        assert_eq!(bundle.total_token_estimate, 10);
    }

    #[test]
    fn facts_mention_counts_topics_and_activity() {
        let mut profile = UserProfile::new("U1");
        profile.message_count = 3;
        profile.channel_membership.insert("C1".into());
        profile.topic_frequency.insert("billing".into(), 2);
        profile.recent_activity.push(crate::models::ActivityEntry {
            event_id: "msg:C1:1".into(),
            channel_id: "C1".into(),
            logical_timestamp: 1,
            excerpt: "We shipped the billing fix".into(),
            is_question: false,
        });
        let facts = profile_facts(&profile, 5);
        assert!(facts[0].contains("3 messages"));
        assert!(facts.iter().any(|f| f.contains("billing (2)")));
        assert!(facts.iter().any(|f| f.starts_with("Persona:")));
        assert!(facts.iter().any(|f| f.contains("We shipped the billing fix")));
        assert_eq!(profile_summary(&profile, 5), "billing We shipped the billing fix");
        assert!(!facts.iter().any(|f| f.starts_with("Unanswered")));
    }

    #[test]
    fn open_questions_come_before_recent_activity() {
        let mut profile = UserProfile::new("U1");
        profile.open_questions.insert(
            "msg:C2:5".into(),
            crate::models::OpenQuestion {
                channel_id: "C2".into(),
                asked_ts: 5,
                excerpt: "Who owns the invoice export?".into(),
            },
        );
        profile.recent_activity.push(crate::models::ActivityEntry {
            event_id: "msg:C2:5".into(),
            channel_id: "C2".into(),
            logical_timestamp: 5,
            excerpt: "Who owns the invoice export?".into(),
            is_question: true,
        });
        let facts = profile_facts(&profile, 5);
        let question = facts
            .iter()
            .position(|f| f == "Unanswered question in C2: Who owns the invoice export?")
            .unwrap();
        let recent = facts.iter().position(|f| f.starts_with("Recent in C2")).unwrap();
        assert!(question < recent);
    }
}
