//! Topic extraction.
//!
//! The profile aggregator only depends on the [`TopicExtractor`] trait, so a
//! model-backed classifier can replace the default keyword extractor
//! without touching aggregation.

use std::collections::BTreeSet;

/// Extracts a set of topic labels from one message.
///
/// Implementations must be deterministic: edits subtract the topics that
/// were extracted from the previous revision, so the same text has to
/// yield the same topics every time.
pub trait TopicExtractor: Send + Sync {
    fn name(&self) -> &str;
    /// Distinct topics, in first-seen order.
    fn extract(&self, text: &str) -> Vec<String>;
}

const STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "also", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "both", "but", "by", "can",
    "could", "did", "do", "does", "doing", "done", "dont", "down", "each", "even", "every",
    "few", "for", "from", "get", "got", "had", "has", "have", "having", "he", "her", "here",
    "hers", "him", "his", "how", "i", "if", "im", "in", "into", "is", "it", "its", "ive",
    "just", "know", "like", "made", "make", "many", "me", "more", "most", "much", "my", "no",
    "nor", "not", "now", "of", "off", "ok", "okay", "on", "once", "one", "only", "or",
    "other", "our", "ours", "out", "over", "own", "please", "really", "same", "see", "she",
    "should", "so", "some", "still", "such", "than", "thanks", "that", "the", "their",
    "them", "then", "there", "these", "they", "thing", "things", "think", "this", "those",
    "through", "to", "today", "too", "under", "until", "up", "us", "very", "was", "way",
    "we", "well", "were", "what", "when", "where", "which", "while", "who", "whom", "why",
    "will", "with", "would", "yes", "yet", "you", "your", "yours",
];

/// Keyword-based extractor: lowercased content words minus stopwords.
#[derive(Debug, Clone)]
pub struct KeywordTopicExtractor {
    min_token_len: usize,
    max_topics: usize,
    stopwords: BTreeSet<String>,
}

impl KeywordTopicExtractor {
    pub fn new(min_token_len: usize, max_topics: usize) -> Self {
        Self {
            min_token_len,
            max_topics,
            stopwords: STOPWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Adds workspace-specific noise words (bot names, greetings).
    pub fn with_extra_stopwords<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for w in words {
            self.stopwords.insert(w.as_ref().to_lowercase());
        }
        self
    }
}

impl Default for KeywordTopicExtractor {
    fn default() -> Self {
        Self::new(3, 8)
    }
}

impl TopicExtractor for KeywordTopicExtractor {
    fn name(&self) -> &str {
        "keyword"
    }

    fn extract(&self, text: &str) -> Vec<String> {
        let cleaned = strip_markup(text);
        let mut seen = BTreeSet::new();
        let mut topics = Vec::new();

        for raw in cleaned.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '\'')) {
            let token: String = raw
                .trim_matches(|c: char| c == '-' || c == '\'')
                .replace('\'', "")
                .to_lowercase();
            if token.chars().count() < self.min_token_len {
                continue;
            }
            if token.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            if self.stopwords.contains(&token) {
                continue;
            }
            if seen.insert(token.clone()) {
                topics.push(token);
                if topics.len() >= self.max_topics {
                    break;
                }
            }
        }

        topics
    }
}

/// Removes Slack mentions (`<@U123>`), links (`<https://..|label>`), and
/// emoji shortcodes (`:tada:`) before tokenizing.
fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '<' => {
                let mut inner = String::new();
                for n in chars.by_ref() {
                    if n == '>' {
                        break;
                    }
                    inner.push(n);
                }
                // Keep a link's display label, drop everything else.
                if let Some((_, label)) = inner.split_once('|') {
                    if !inner.starts_with('@') && !inner.starts_with('#') {
                        out.push(' ');
                        out.push_str(label);
                    }
                }
                out.push(' ');
            }
            ':' => {
                let mut code = String::new();
                let mut closed = false;
                while let Some(&n) = chars.peek() {
                    if n == ':' {
                        chars.next();
                        closed = true;
                        break;
                    }
                    if !(n.is_alphanumeric() || n == '_' || n == '-' || n == '+') {
                        break;
                    }
                    code.push(n);
                    chars.next();
                }
                if !closed {
                    out.push(' ');
                    out.push_str(&code);
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}
