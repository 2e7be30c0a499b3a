//! Paragraph-boundary text chunker.
//!
//! Splits message or document text into [`TextChunk`]s that respect a
//! `max_tokens` limit, splitting on paragraph boundaries (`\n\n`) where
//! possible. Chunk ids are derived from the source event id and offset,
//! so re-chunking the same revision always yields the same ids.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` to `max_chars` at 4 chars/token.
//! 2. Accumulate paragraphs into a buffer until the next one would
//!    exceed `max_chars`, then flush.
//! 3. Hard-split a single oversized paragraph at the last newline or
//!    space before the limit.
//!
//! Empty or whitespace-only text yields no chunks: a message with nothing
//! to say has nothing to retrieve.

use sha2::{Digest, Sha256};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub chunk_id: String,
    /// Position of the chunk within its source, starting at 0.
    pub offset: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Deterministic chunk id for `(source_event_id, offset)`.
pub fn chunk_id(source_event_id: &str, offset: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", source_event_id, offset).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split `text` into chunks with contiguous offsets `0..N`.
pub fn chunk_text(source_event_id: &str, text: &str, max_tokens: usize) -> Vec<TextChunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if trimmed.len() > max_chars {
            hard_split(trimmed, max_chars, &mut pieces);
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(offset, text)| make_chunk(source_event_id, offset, text))
        .collect()
}

fn hard_split(paragraph: &str, max_chars: usize, pieces: &mut Vec<String>) {
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        let limit = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        // Always make progress, even when the first char is wider than the limit.
        let split_at = if split_at == 0 {
            remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len())
        } else {
            split_at
        };
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn make_chunk(source_event_id: &str, offset: usize, text: String) -> TextChunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    TextChunk {
        chunk_id: chunk_id(source_event_id, offset),
        offset,
        hash: format!("{:x}", hasher.finalize()),
        text,
    }
}
