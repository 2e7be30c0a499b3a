//! Per-message behavioral signals.
//!
//! Each message contributes a sentiment score (1–5), an engagement bucket,
//! a question flag, and persona keyword hits to its author's profile.
//! [`MessageContent`] bundles these with the extracted topics so that an
//! edit can withdraw exactly what the previous revision contributed.

use serde::{Deserialize, Serialize};

use crate::models::Engagement;
use crate::topics::TopicExtractor;

/// Product-feedback vocabulary for the Feature Advocate persona.
pub const ADVOCATE_KEYWORDS: &[&str] = &[
    "feature",
    "roadmap",
    "bug",
    "release",
    "update",
    "suggestion",
    "plz",
    "please",
    "add",
];

/// Help-seeking vocabulary for the Active Learner persona.
pub const LEARNER_KEYWORDS: &[&str] = &[
    "how", "why", "help", "error", "question", "fail", "issue", "problem",
];

const POSITIVE: &[(&str, f64)] = &[
    ("amazing", 3.0),
    ("awesome", 3.0),
    ("excellent", 3.0),
    ("fantastic", 3.0),
    ("love", 3.0),
    ("perfect", 3.0),
    ("brilliant", 3.0),
    ("great", 2.5),
    ("glad", 2.0),
    ("happy", 2.0),
    ("nice", 2.0),
    ("good", 1.5),
    ("thanks", 1.5),
    ("thank", 1.5),
    ("helpful", 2.0),
    ("works", 1.0),
    ("fixed", 1.5),
    ("shipped", 1.0),
    ("congrats", 2.5),
    ("welcome", 1.5),
    ("cool", 1.5),
    ("smooth", 1.5),
    ("fast", 1.0),
    ("easy", 1.5),
    ("resolved", 1.5),
];

const NEGATIVE: &[(&str, f64)] = &[
    ("terrible", 3.0),
    ("awful", 3.0),
    ("horrible", 3.0),
    ("hate", 3.0),
    ("worst", 3.0),
    ("useless", 2.5),
    ("broken", 2.5),
    ("angry", 2.5),
    ("frustrated", 2.5),
    ("frustrating", 2.5),
    ("annoying", 2.0),
    ("bad", 2.0),
    ("crash", 2.0),
    ("crashes", 2.0),
    ("down", 1.0),
    ("slow", 1.5),
    ("fail", 1.5),
    ("fails", 1.5),
    ("failed", 1.5),
    ("failing", 1.5),
    ("error", 1.0),
    ("bug", 1.0),
    ("stuck", 1.5),
    ("confusing", 1.5),
    ("sad", 2.0),
    ("wrong", 1.5),
    ("outage", 2.0),
];

const NEGATORS: &[&str] = &["not", "no", "never", "dont", "cant", "isnt", "wasnt", "wont", "doesnt", "didnt"];

/// Normalization constant for squashing a raw lexicon sum into `[-1, 1]`.
const ALPHA: f64 = 15.0;

/// Signals derived from one message revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSignals {
    /// 1 (very negative) to 5 (very positive).
    pub sentiment: u8,
    pub engagement: Engagement,
    pub is_question: bool,
    pub advocate_hits: u32,
    pub learner_hits: u32,
    pub chars: usize,
}

/// Everything one message revision contributes to its author's profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: String,
    pub topics: Vec<String>,
    pub signals: MessageSignals,
}

impl MessageContent {
    pub fn analyze(text: &str, extractor: &dyn TopicExtractor) -> Self {
        Self {
            text: text.to_string(),
            topics: extractor.extract(text),
            signals: analyze(text),
        }
    }
}

pub fn analyze(text: &str) -> MessageSignals {
    let lower = text.to_lowercase();
    MessageSignals {
        sentiment: sentiment_score(polarity(text)),
        engagement: engagement(text),
        is_question: text.contains('?'),
        advocate_hits: keyword_hits(&lower, ADVOCATE_KEYWORDS),
        learner_hits: keyword_hits(&lower, LEARNER_KEYWORDS),
        chars: text.chars().count(),
    }
}

/// Lexicon polarity in `[-1, 1]`. A negator within the three preceding
/// tokens flips a term's sign.
pub fn polarity(text: &str) -> f64 {
    let tokens: Vec<String> = text
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
        .map(|t| t.replace('\'', "").to_lowercase())
        .collect();

    let mut sum = 0.0;
    for (i, token) in tokens.iter().enumerate() {
        let weight = POSITIVE
            .iter()
            .find(|(w, _)| w == token)
            .map(|(_, v)| *v)
            .or_else(|| NEGATIVE.iter().find(|(w, _)| w == token).map(|(_, v)| -*v));
        let Some(mut weight) = weight else {
            continue;
        };
        let window_start = i.saturating_sub(3);
        if tokens[window_start..i]
            .iter()
            .any(|t| NEGATORS.contains(&t.as_str()))
        {
            weight = -weight * 0.75;
        }
        sum += weight;
    }

    if text.contains('!') && sum != 0.0 {
        sum += 0.3 * sum.signum();
    }

    sum / (sum * sum + ALPHA).sqrt()
}

/// Buckets polarity into a 1–5 score.
pub fn sentiment_score(polarity: f64) -> u8 {
    if polarity <= -0.6 {
        1
    } else if polarity <= -0.2 {
        2
    } else if polarity <= 0.2 {
        3
    } else if polarity <= 0.6 {
        4
    } else {
        5
    }
}

/// Short messages are low engagement; questions and long messages are high.
pub fn engagement(text: &str) -> Engagement {
    if text.split_whitespace().count() <= 3 {
        Engagement::Low
    } else if text.chars().count() > 100 || text.contains('?') {
        Engagement::High
    } else {
        Engagement::Medium
    }
}

/// Substring occurrences of each keyword in already-lowercased text.
pub fn keyword_hits(lower: &str, keywords: &[&str]) -> u32 {
    keywords
        .iter()
        .map(|k| lower.matches(k).count() as u32)
        .sum()
}

/// User ids mentioned as `<@U123>` or `<@U123|name>`, deduplicated in
/// order of first appearance.
pub fn mentioned_users(text: &str) -> Vec<String> {
    let mut users: Vec<String> = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("<@") {
        rest = &rest[start + 2..];
        let Some(end) = rest.find('>') else {
            break;
        };
        let id = rest[..end].split('|').next().unwrap_or_default().trim();
        if !id.is_empty()
            && id.chars().all(|c| c.is_ascii_alphanumeric())
            && !users.iter().any(|u| u == id)
        {
            users.push(id.to_string());
        }
        rest = &rest[end + 1..];
    }
    users
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::KeywordTopicExtractor;

    #[test]
    fn sentiment_buckets() {
        assert_eq!(sentiment_score(-0.9), 1);
        assert_eq!(sentiment_score(-0.6), 1);
        assert_eq!(sentiment_score(-0.3), 2);
        assert_eq!(sentiment_score(0.0), 3);
        assert_eq!(sentiment_score(0.2), 3);
        assert_eq!(sentiment_score(0.5), 4);
        assert_eq!(sentiment_score(0.61), 5);
    }

    #[test]
    fn polarity_direction() {
        assert!(polarity("this is awesome, love it, great work") > 0.6);
        assert!(polarity("terrible, the build is broken and I hate it") < -0.6);
        assert_eq!(polarity("the meeting is at noon"), 0.0);
    }

    #[test]
    fn negation_flips_sign() {
        assert!(polarity("this is good") > 0.0);
        assert!(polarity("this is not good") < 0.0);
    }

    #[test]
    fn engagement_rules() {
        assert_eq!(engagement(":tada: nice"), Engagement::Low);
        assert_eq!(engagement("why is it down?"), Engagement::High);
        assert_eq!(engagement("we deployed the new build"), Engagement::Medium);
        let long = "word ".repeat(30);
        assert_eq!(engagement(&long), Engagement::High);
    }

    #[test]
    fn keyword_counts_substrings() {
        let lower = "please add a feature, please";
        assert_eq!(keyword_hits(lower, ADVOCATE_KEYWORDS), 4);
        assert_eq!(keyword_hits("how do i fix this error", LEARNER_KEYWORDS), 2);
    }

    #[test]
    fn mentions_are_parsed_once() {
        assert_eq!(
            mentioned_users("<@U1> see <@U2|sam> and <@U1> again"),
            vec!["U1", "U2"]
        );
        assert!(mentioned_users("email me @ noon <@ > <#C1>").is_empty());
        assert!(mentioned_users("<@U1").is_empty());
    }

    #[test]
    fn analyze_message() {
        let content = MessageContent::analyze(
            "How do I fix the billing error?",
            &KeywordTopicExtractor::default(),
        );
        assert!(content.signals.is_question);
        assert_eq!(content.signals.engagement, Engagement::High);
        assert_eq!(content.signals.learner_hits, 2);
        assert!(content.topics.contains(&"billing".to_string()));
    }
}
