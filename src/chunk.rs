//! Paragraph-boundary text chunker.
//!
//! Splits document text into [`Chunk`]s that respect a configurable
//! character budget. Splitting occurs on blank-line paragraph boundaries
//! to preserve semantic coherence within each chunk; when a buffer is
//! closed, the next one is seeded with a fixed-length suffix of the
//! closed text so context survives the boundary.
//!
//! Chunk ids are deterministic (`"{source_id}:{index}"`), so re-chunking
//! an unchanged document upserts over the same vector ids.

use crate::config::ChunkingConfig;
use crate::models::{Chunk, ChunkMetadata, SourceDocument};

/// Split a document's text into chunks. Binary documents, empty
/// documents, and whitespace-only documents produce no chunks.
///
/// Indices are contiguous starting at 0. A document whose trimmed
/// content fits the budget yields exactly one chunk equal to it.
pub fn chunk_document(doc: &SourceDocument, cfg: &ChunkingConfig) -> Vec<Chunk> {
    let Some(text) = doc.text() else {
        return Vec::new();
    };
    chunk_text(&doc.id, &doc.name, &doc.folder_tag, text, cfg)
}

pub fn chunk_text(
    source_id: &str,
    file_name: &str,
    folder_tag: &str,
    text: &str,
    cfg: &ChunkingConfig,
) -> Vec<Chunk> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut builder = ChunkBuilder {
        source_id,
        file_name,
        folder_tag,
        max_chars: cfg.max_chars,
        overlap_chars: cfg.overlap_chars,
        buf: String::new(),
        buf_chars: 0,
        fresh_chars: 0,
        index: 0,
        out: Vec::new(),
    };

    if char_count(trimmed) <= cfg.max_chars {
        builder.append(trimmed);
        return builder.finish();
    }

    for para in trimmed.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        let para_chars = char_count(para);

        if builder.would_exceed(para_chars) {
            builder.close();
        }

        if para_chars > cfg.max_chars {
            builder.append_oversized(para);
        } else {
            builder.append(para);
        }
    }

    builder.finish()
}

struct ChunkBuilder<'a> {
    source_id: &'a str,
    file_name: &'a str,
    folder_tag: &'a str,
    max_chars: usize,
    overlap_chars: usize,
    buf: String,
    buf_chars: usize,
    /// Characters added since the last close. The overlap seed does not
    /// count, so an unmodified seed is never emitted as its own chunk.
    fresh_chars: usize,
    index: i64,
    out: Vec<Chunk>,
}

impl ChunkBuilder<'_> {
    /// The budget check is skipped for a buffer holding only the seed;
    /// a chunk may therefore run over by the overlap length at most.
    fn would_exceed(&self, incoming_chars: usize) -> bool {
        if self.fresh_chars == 0 {
            return false;
        }
        self.buf_chars + 2 + incoming_chars > self.max_chars
    }

    fn append(&mut self, para: &str) {
        if !self.buf.is_empty() {
            self.buf.push_str("\n\n");
            self.buf_chars += 2;
        }
        self.buf.push_str(para);
        let n = char_count(para);
        self.buf_chars += n;
        self.fresh_chars += n;
    }

    /// Fill to the budget, close, and repeat; the overlap seed carries
    /// context across the mid-paragraph cuts.
    fn append_oversized(&mut self, para: &str) {
        if !self.buf.is_empty() && self.fresh_chars > 0 {
            self.buf.push_str("\n\n");
            self.buf_chars += 2;
        }
        let mut remaining = para;
        while !remaining.is_empty() {
            let room = self.max_chars.saturating_sub(self.buf_chars).max(1);
            let (piece, rest) = char_split(remaining, room);
            self.buf.push_str(piece);
            let n = char_count(piece);
            self.buf_chars += n;
            self.fresh_chars += n;
            remaining = rest;
            if !remaining.is_empty() {
                self.close();
            }
        }
    }

    fn close(&mut self) {
        self.out.push(make_chunk(
            self.source_id,
            self.file_name,
            self.folder_tag,
            self.index,
            &self.buf,
        ));
        self.index += 1;
        let seed = char_suffix(&self.buf, self.overlap_chars).to_string();
        self.buf_chars = char_count(&seed);
        self.buf = seed;
        self.fresh_chars = 0;
    }

    fn finish(mut self) -> Vec<Chunk> {
        if self.fresh_chars > 0 {
            self.out.push(make_chunk(
                self.source_id,
                self.file_name,
                self.folder_tag,
                self.index,
                &self.buf,
            ));
        }
        self.out
    }
}

fn make_chunk(source_id: &str, file_name: &str, folder_tag: &str, index: i64, text: &str) -> Chunk {
    Chunk {
        id: format!("{}:{}", source_id, index),
        text: text.to_string(),
        metadata: ChunkMetadata {
            folder_tag: folder_tag.to_string(),
            file_name: file_name.to_string(),
            source_id: source_id.to_string(),
            chunk_index: index,
        },
    }
}

fn char_count(s: &str) -> usize {
    s.chars().count()
}

/// Last `n` characters of `s`, on a char boundary.
fn char_suffix(s: &str, n: usize) -> &str {
    let total = char_count(s);
    if total <= n {
        return s;
    }
    let start = s
        .char_indices()
        .nth(total - n)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &s[start..]
}

/// Split `s` after at most `n` characters, on a char boundary.
fn char_split(s: &str, n: usize) -> (&str, &str) {
    match s.char_indices().nth(n) {
        Some((i, _)) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}
