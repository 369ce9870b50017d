//! Paragraph-boundary text chunker.
//!
//! Splits document text into [`Chunk`]s that respect a configurable
//! `max_tokens` limit, with a trailing-overlap window carried between
//! adjacent chunks so context spanning a boundary survives retrieval.
//! Splitting occurs on paragraph boundaries (`\n\n`) to preserve semantic
//! coherence; oversized paragraphs fall back to space/newline splits.
//!
//! Each chunk carries a SHA-256 hash of its text, used for deduplication
//! across the fused result lists.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Approximate chars-per-token ratio used across the platform.
pub const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting max_tokens
/// and carrying `overlap_tokens` of trailing context into the next chunk.
/// Returns chunks with contiguous ordinals starting at 0.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;

    if text.trim().is_empty() {
        return Vec::new();
    }

    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current_buf = String::new();
    // Whether the buffer holds only overlap carried from the last flush.
    let mut buf_is_tail = false;
    let mut ordinal: i64 = 0;

    let mut flush = |buf: &mut String, ordinal: &mut i64, chunks: &mut Vec<Chunk>| {
        if buf.is_empty() {
            return;
        }
        chunks.push(make_chunk(document_id, *ordinal, buf));
        *ordinal += 1;
        let tail = overlap_tail(buf, overlap_chars);
        buf.clear();
        buf.push_str(&tail);
    };

    for para in paragraphs {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = |buf: &String| {
            if buf.is_empty() {
                trimmed.len()
            } else {
                buf.len() + 2 + trimmed.len()
            }
        };

        if would_be(&current_buf) > max_chars && !current_buf.is_empty() {
            if !buf_is_tail {
                flush(&mut current_buf, &mut ordinal, &mut chunks);
                buf_is_tail = true;
            }
            // A tail that cannot share a chunk with the paragraph is
            // dropped; an overlap-only chunk would be junk.
            if would_be(&current_buf) > max_chars {
                current_buf.clear();
                buf_is_tail = false;
            }
        }

        if trimmed.len() > max_chars {
            // A single paragraph exceeding the limit is hard-split at
            // space/newline boundaries.
            if !current_buf.is_empty() && !buf_is_tail {
                flush(&mut current_buf, &mut ordinal, &mut chunks);
            }
            current_buf.clear();
            buf_is_tail = false;
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, remaining.len().min(max_chars));
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    chunks.push(make_chunk(document_id, ordinal, piece));
                    ordinal += 1;
                }
                remaining = &remaining[actual_split..];
            }
            current_buf.clear();
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
            buf_is_tail = false;
        }
    }

    if !current_buf.trim().is_empty() {
        let text = current_buf.trim().to_string();
        // Skip a trailing buffer that is nothing but carried overlap.
        let is_pure_overlap = chunks
            .last()
            .map(|last| last.text.ends_with(&text))
            .unwrap_or(false);
        if !is_pure_overlap {
            chunks.push(make_chunk(document_id, ordinal, &text));
        }
    }

    if chunks.is_empty() {
        chunks.push(make_chunk(document_id, 0, text.trim()));
    }

    chunks
}

/// Trailing window of `max_chars`, cut at a word boundary when possible.
fn overlap_tail(text: &str, max_chars: usize) -> String {
    if max_chars == 0 || text.len() <= max_chars {
        return if max_chars == 0 {
            String::new()
        } else {
            text.to_string()
        };
    }
    let start = ceil_char_boundary(text, text.len() - max_chars);
    match text[start..].find(' ') {
        Some(pos) => text[start + pos..].trim().to_string(),
        None => text[start..].trim().to_string(),
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(document_id: &str, ordinal: i64, text: &str) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        ordinal,
        text: text.to_string(),
        text_hash: hash_text(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, max_tokens: usize, overlap: usize) -> Vec<Chunk> {
        chunk_text("doc1", text, max_tokens, overlap)
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk("Hello, world!", 700, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(chunk("", 700, 0).is_empty());
        assert!(chunk("   \n\n  ", 700, 0).is_empty());
    }

    #[test]
    fn test_multiple_paragraphs_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk(text, 700, 0);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph."));
        assert!(chunks[0].text.contains("Third paragraph."));
    }

    #[test]
    fn test_ordinals_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk(&text, 10, 0);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i as i64, "ordinal mismatch at {}", i);
        }
    }

    #[test]
    fn test_overlap_carries_context() {
        let text = "Alpha beta gamma delta.\n\nEpsilon zeta eta theta.\n\nIota kappa lambda mu.";
        let chunks = chunk(text, 10, 3);
        assert!(chunks.len() > 1);
        // Each chunk after the first starts with a tail of the previous one.
        for pair in chunks.windows(2) {
            let first_words: Vec<&str> = pair[1].text.split_whitespace().collect();
            assert!(
                pair[0].text.contains(first_words[0]),
                "chunk {} does not overlap with its predecessor",
                pair[1].ordinal
            );
        }
    }

    #[test]
    fn test_oversized_paragraph_hard_split() {
        let text = "word ".repeat(400);
        let chunks = chunk(&text, 10, 0);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.len() <= 10 * CHARS_PER_TOKEN + 8);
        }
    }

    #[test]
    fn test_deterministic_hashes() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk(text, 5, 2);
        let c2 = chunk(text, 5, 2);
        assert_eq!(c1.len(), c2.len());
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.text_hash, b.text_hash);
        }
    }

    #[test]
    fn test_unicode_boundary_safety() {
        let text = "Ω".repeat(5000);
        let chunks = chunk(&text, 100, 10);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.text.chars().all(|ch| ch == 'Ω'));
        }
    }
}
