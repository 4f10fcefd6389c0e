//! Line-bounded chunking with greedy merge of small neighbours.

use crate::hash::content_hash;

/// One chunk of file text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// 1-based, inclusive.
    pub line_range: (usize, usize),
    pub hash: String,
}

/// Chunker configuration.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Lines per primary chunk (default: 32).
    pub max_lines: usize,
    /// Merging stops before a chunk would reach this many characters (default: 2000).
    pub max_chars: usize,
    /// Files producing more chunks than this are skipped (default: 50).
    pub max_chunks: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_lines: 32,
            max_chars: 2000,
            max_chunks: 50,
        }
    }
}

struct Draft {
    text: String,
    chars: usize,
    first: usize,
    last: usize,
}

/// Split text into chunks of at most `max_lines` lines, then merge runs of
/// consecutive chunks while the merged length stays below `max_chars`.
///
/// Every line is terminated with `\n`; a `\r` before the newline is dropped.
/// A trailing newline does not produce an extra empty line.
#[must_use]
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }
    let body = text.strip_suffix('\n').unwrap_or(text);
    let lines: Vec<&str> = body
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .collect();

    let max_lines = config.max_lines.max(1);
    let primary = lines.chunks(max_lines).enumerate().map(|(i, group)| {
        let mut text = String::new();
        for line in group {
            text.push_str(line);
            text.push('\n');
        }
        let first = i * max_lines + 1;
        Draft {
            chars: text.chars().count(),
            text,
            first,
            last: first + group.len() - 1,
        }
    });

    let mut merged: Vec<Draft> = Vec::new();
    for draft in primary {
        match merged.last_mut() {
            Some(cur) if cur.chars + draft.chars < config.max_chars => {
                cur.text.push_str(&draft.text);
                cur.chars += draft.chars;
                cur.last = draft.last;
            }
            _ => merged.push(draft),
        }
    }

    merged
        .into_iter()
        .map(|d| Chunk {
            hash: content_hash(d.text.as_bytes()),
            text: d.text,
            line_range: (d.first, d.last),
        })
        .collect()
}
