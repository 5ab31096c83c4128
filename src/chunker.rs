//! Deterministic document chunking
//!
//! Splits extracted text into retrieval-sized passages with token overlap.
//! Splits prefer natural boundaries: paragraph break, then sentence end,
//! then plain whitespace; a hard character boundary can only arise inside a
//! single oversized token and is never needed for whitespace-delimited text.
//! Identical input always yields byte-identical output.

use crate::config::ChunkingConfig;
use crate::error::{IndexError, Result};
use crate::query;
use serde::{Deserialize, Serialize};

/// A chunk of document text with provenance offsets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of the chunk within its document
    pub ordinal: u32,
    /// Chunk text, exactly as it appears in the source
    pub text: String,
    /// Char offset of the first character in the source text
    pub char_start: usize,
    /// Char offset one past the last character in the source text
    pub char_end: usize,
    /// Number of whitespace-delimited tokens
    pub token_count: usize,
    /// Stable hash of the chunk text, for dedup
    pub content_hash: String,
}

/// Deterministic text chunker
pub struct Chunker {
    config: ChunkingConfig,
}

/// A token's span in the source text, plus whether a paragraph break follows
#[derive(Debug, Clone, Copy)]
struct TokenSpan {
    start: usize,
    end: usize,
    sentence_end: bool,
    paragraph_break_after: bool,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// Split text into overlapping passages
    ///
    /// Empty or whitespace-only input yields no chunks. Text longer than the
    /// configured hard cap fails with `InputTooLarge`. After merging, the
    /// final passage may exceed the target size by up to the minimum chunk
    /// size; every other passage is at most `chunk_size` tokens.
    pub fn chunk(&self, text: &str) -> Result<Vec<Chunk>> {
        let char_count = text.chars().count();
        if char_count > self.config.hard_cap_chars {
            return Err(IndexError::InputTooLarge {
                actual: char_count,
                cap: self.config.hard_cap_chars,
            }
            .into());
        }
        if char_count > self.config.soft_cap_chars {
            tracing::warn!(
                chars = char_count,
                soft_cap = self.config.soft_cap_chars,
                "document exceeds the soft length cap"
            );
        }

        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let size = self.config.chunk_size.max(1);
        let overlap = self.config.overlap.min(size.saturating_sub(1));

        let mut spans: Vec<(usize, usize)> = Vec::new(); // token index ranges
        let mut start = 0usize;

        while start < tokens.len() {
            let hard_end = (start + size).min(tokens.len());
            let end = if hard_end == tokens.len() {
                hard_end
            } else {
                self.find_boundary(&tokens, start, hard_end)
            };

            spans.push((start, end));

            if end == tokens.len() {
                break;
            }
            // Overlap with the previous chunk while always making progress
            start = end.saturating_sub(overlap).max(start + 1);
        }

        // Merge an undersized final passage into its predecessor
        if spans.len() > 1 {
            let (last_start, last_end) = spans[spans.len() - 1];
            if last_end - last_start < self.config.min_chunk_size {
                spans.pop();
                let last = spans.len() - 1;
                spans[last].1 = last_end;
            }
        }

        let chunks = spans
            .iter()
            .enumerate()
            .map(|(i, &(s, e))| {
                let char_start = tokens[s].start;
                let char_end = tokens[e - 1].end;
                let chunk_text = slice_chars(text, char_start, char_end);
                let content_hash = query::fingerprint(&chunk_text);
                Chunk {
                    ordinal: i as u32,
                    text: chunk_text,
                    char_start,
                    char_end,
                    token_count: e - s,
                    content_hash,
                }
            })
            .collect();

        Ok(chunks)
    }

    /// Pick a cut point in (start, hard_end]: prefer the last paragraph
    /// break in the lookback window, then the last sentence end, then the
    /// plain whitespace boundary at hard_end
    fn find_boundary(&self, tokens: &[TokenSpan], start: usize, hard_end: usize) -> usize {
        let window = (self.config.chunk_size / 4).max(1);
        let lookback_floor = hard_end.saturating_sub(window).max(start + 1);

        for i in (lookback_floor..hard_end).rev() {
            if tokens[i - 1].paragraph_break_after {
                return i;
            }
        }

        for i in (lookback_floor..hard_end).rev() {
            if tokens[i - 1].sentence_end {
                return i;
            }
        }

        hard_end
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkingConfig::default())
    }
}

/// Tokenize text into whitespace-delimited spans with boundary metadata
fn tokenize(text: &str) -> Vec<TokenSpan> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() {
            i += 1;
        }
        let end = i;

        // Trailing closers do not hide a sentence terminator
        let mut j = end;
        while j > start && matches!(chars[j - 1], ')' | ']' | '"' | '\'' | '”' | '’') {
            j -= 1;
        }
        let sentence_end = j > start && matches!(chars[j - 1], '.' | '!' | '?');

        // Two newlines in the following gap mark a paragraph break
        let mut newlines = 0;
        let mut k = end;
        while k < chars.len() && chars[k].is_whitespace() {
            if chars[k] == '\n' {
                newlines += 1;
            }
            k += 1;
        }

        tokens.push(TokenSpan {
            start,
            end,
            sentence_end,
            paragraph_break_after: newlines >= 2,
        });
    }

    tokens
}

/// Slice text by char offsets (not byte offsets)
fn slice_chars(text: &str, start: usize, end: usize) -> String {
    text.chars().skip(start).take(end - start).collect()
}
