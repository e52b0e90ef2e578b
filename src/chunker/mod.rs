//! Heading-aware recursive chunker for Markdown and plain text.
//!
//! Produces length-bounded chunks carrying their heading-path metadata and
//! source line range. Length is measured by an injected oracle: bytes for
//! plain text, the embedding model's token count for Markdown.
//!
//! The splitter walks an ordered table of separator families, from
//! paragraph breaks down to inside-word separators, recursing one family
//! deeper whenever a piece is still too long. Pieces below the minimum
//! length are greedily concatenated with following pieces under the same
//! heading; when the table is exhausted the fallback slices fixed byte
//! windows on UTF-8 boundaries.

mod markdown;

use std::sync::Arc;

/// Document flavor; decides whether the heading pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocType {
    Markdown,
    PlainText,
}

/// A bounded piece of a document.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub content: String,
    /// `>`-joined heading path, later prefixed with caller metadata.
    pub metadata: String,
    /// Depth in the heading/split tree; only equal-level neighbors merge.
    pub nested_level: usize,
    /// 0-based first source line.
    pub begin_line: i64,
    /// 0-based last source line.
    pub end_line: i64,
}

/// Length oracle: maps a candidate chunk to its cost against `max_length`.
pub type LengthFn = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// `(token, split_before)`: `split_before` keeps the separator at the start
/// of the next piece, otherwise it stays at the end of the previous one.
/// Families are ordered by priority.
const SPLIT_TABLE: &[&[(&str, bool)]] = &[
    // paragraph
    &[("\n\n", false)],
    // code fence
    &[("```", false)],
    // thematic break
    &[("---", true), ("___", true), ("****", true)],
    // list bullet
    &[("\n+", true), ("\n-", true), ("\n*", true)],
    // quote delimiter
    &[
        ("\n\"", true),
        ("\"\n", false),
        ("\n\u{201c}", true),
        ("    \u{201c}", true),
        ("\u{201d}\n", false),
    ],
    // line break
    &[("\n", false)],
    // sentence terminators, ASCII and CJK
    &[
        (". ", false),
        ("! ", false),
        ("? ", false),
        ("... ", false),
        ("\u{3002}", false),
        ("\u{ff01}", false),
        ("\u{ff1f}", false),
        ("\u{2026}\u{2026}", false),
    ],
    // semicolons
    &[(";", false), ("\u{ff1b}", false)],
    // commas
    &[(",", false), ("\u{ff0c}", false)],
    // other in-sentence separators
    &[
        ("\u{3001}", false),
        ("\u{ff1a}", false),
        (": ", false),
        ("\u{201c}", true),
        ("\u{201d}", false),
        ("\u{300a}", true),
        ("\u{300b}", false),
        ("\u{2014}\u{2014}", true),
        ("(", true),
        (")", false),
        ("\u{ff08}", true),
        ("\u{ff09}", false),
    ],
    // space
    &[(" ", false)],
    // inside-word separators
    &[(":", false), ("-", true), ("/", true), ("\\", true), (".", false)],
];

/// Minimum chunk length as a fraction of the maximum.
const MIN_CHUNK_LENGTH_RATIO: f64 = 0.85;

/// Absolute floor: merged leftovers below this length are dropped.
/// One unit, so a single-token heading title still survives; the real
/// filter is the whitespace check next to it.
const MIN_EMIT_LENGTH: usize = 1;

pub struct Chunker {
    doc_type: DocType,
    max_length: usize,
    min_length: usize,
    get_length: LengthFn,
}

impl Chunker {
    pub fn new(doc_type: DocType, max_length: usize, get_length: LengthFn) -> Self {
        let min_length = (max_length as f64 * MIN_CHUNK_LENGTH_RATIO) as usize;
        Self {
            doc_type,
            max_length,
            min_length,
            get_length,
        }
    }

    /// Split `text` into chunks. `extra_metadata` key/value pairs are
    /// prepended to every chunk's metadata as ` <key> value` lines before
    /// the ` <Path> …` heading path.
    pub fn chunk(&self, text: &str, extra_metadata: &[(String, String)]) -> Vec<Chunk> {
        let text = crate::util::normalize_line_endings(text);

        let heading_chunks = match self.doc_type {
            DocType::Markdown => markdown::heading_chunks(&text),
            DocType::PlainText => {
                let (end_line, _) = piece_lines(&text, 0);
                vec![Chunk {
                    content: text.clone(),
                    metadata: "plainText".to_string(),
                    nested_level: 0,
                    begin_line: 0,
                    end_line,
                }]
            }
        };

        let root = Chunk {
            content: String::new(),
            metadata: String::new(),
            nested_level: 0,
            begin_line: 0,
            end_line: 0,
        };
        let mut chunks = Vec::new();
        self.recursive_chunk(&root, -1, &heading_chunks, &mut chunks);

        let mut prefix = String::new();
        for (key, value) in extra_metadata {
            prefix.push_str(&format!(" <{}> {}\n", key, value));
        }
        for chunk in &mut chunks {
            chunk.metadata = format!("{} <Path> {}", prefix, chunk.metadata);
        }
        chunks
    }

    fn len_of(&self, s: &str) -> usize {
        (self.get_length)(s)
    }

    fn recursive_chunk(
        &self,
        chunk: &Chunk,
        table_index: isize,
        heading_chunks: &[Chunk],
        out: &mut Vec<Chunk>,
    ) {
        if table_index >= 0 && table_index as usize >= SPLIT_TABLE.len() {
            self.byte_window_fallback(chunk, out);
            return;
        }

        let sub_chunks: Vec<Chunk> = if table_index == -1 {
            heading_chunks.to_vec()
        } else {
            self.split_by_family(chunk, table_index as usize)
        };

        let mut i = 0;
        while i < sub_chunks.len() {
            let sub = &sub_chunks[i];
            let len = self.len_of(&sub.content);

            if len >= self.min_length && len < self.max_length {
                out.push(sub.clone());
                i += 1;
                continue;
            }
            if len >= self.max_length {
                self.recursive_chunk(sub, table_index + 1, heading_chunks, out);
                i += 1;
                continue;
            }

            // Too short: greedily absorb following pieces under the same
            // heading until the next one would overflow.
            let mut merged = sub.clone();
            let mut j = i + 1;
            while j < sub_chunks.len() && sub_chunks[j].nested_level == merged.nested_level {
                let next = &sub_chunks[j];
                if self.len_of(&merged.content) + self.len_of(&next.content) >= self.max_length {
                    break;
                }
                merged.content.push_str(&next.content);
                merged.metadata = common_heading_prefix(&merged.metadata, &next.metadata);
                merged.end_line = next.end_line;
                j += 1;
            }
            if self.len_of(&merged.content) >= MIN_EMIT_LENGTH
                && !merged.content.trim().is_empty()
            {
                out.push(merged);
            }
            i = j.max(i + 1);
        }
    }

    fn split_by_family(&self, chunk: &Chunk, family: usize) -> Vec<Chunk> {
        let content = &chunk.content;
        let mut positions: Vec<usize> = vec![0, content.len()];
        for &(token, split_before) in SPLIT_TABLE[family] {
            let mut from = 0;
            while let Some(found) = content[from..].find(token) {
                let pos = from + found;
                let split_at = if split_before { pos } else { pos + token.len() };
                positions.push(split_at);
                from = pos + token.len();
            }
        }
        positions.sort_unstable();
        positions.dedup();

        let mut sub_chunks = Vec::new();
        let mut line = chunk.begin_line;
        for window in positions.windows(2) {
            let (start, end) = (window[0], window[1]);
            if start == end {
                continue;
            }
            let piece = &content[start..end];
            let (last_line, next_line) = piece_lines(piece, line);
            sub_chunks.push(Chunk {
                content: piece.to_string(),
                metadata: chunk.metadata.clone(),
                nested_level: chunk.nested_level + 1,
                begin_line: line,
                end_line: last_line,
            });
            line = next_line;
        }
        if sub_chunks.is_empty() {
            sub_chunks.push(chunk.clone());
        }
        sub_chunks
    }

    /// Last resort: fixed byte windows aligned to code-point boundaries.
    fn byte_window_fallback(&self, chunk: &Chunk, out: &mut Vec<Chunk>) {
        let content = &chunk.content;
        let total = self.len_of(content);
        let split_number = (total / self.max_length).max(1);
        let window = (content.len() / split_number).max(1);

        let mut start = 0;
        let mut line = chunk.begin_line;
        while start < content.len() {
            let mut end = (start + window).min(content.len());
            while end < content.len() && !content.is_char_boundary(end) {
                end += 1;
            }
            let piece = &content[start..end];
            let (last_line, next_line) = piece_lines(piece, line);
            out.push(Chunk {
                content: piece.to_string(),
                metadata: chunk.metadata.clone(),
                nested_level: chunk.nested_level + 1,
                begin_line: line,
                end_line: last_line,
            });
            line = next_line;
            start = end;
        }
    }
}

/// `(last_line, next_line)` for a piece starting at `begin`: the last
/// source line the piece touches, and the line its successor starts on.
/// A trailing newline ends the piece's own range but advances the cursor.
fn piece_lines(piece: &str, begin: i64) -> (i64, i64) {
    let newlines = piece.matches('\n').count() as i64;
    let next = begin + newlines;
    let last = if piece.ends_with('\n') {
        (next - 1).max(begin)
    } else {
        next
    };
    (last, next)
}

/// Longest common `>`-separated prefix of two heading paths, so merged
/// chunks generalize upward to their shared heading.
fn common_heading_prefix(a: &str, b: &str) -> String {
    if a == b {
        return a.to_string();
    }
    a.split('>')
        .zip(b.split('>'))
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect::<Vec<_>>()
        .join(">")
}
