//! Sliding-window text chunker.
//!
//! Splits extracted text into fixed-size, overlapping windows measured in
//! characters. Windows advance by `size - overlap` (at least 1), and the
//! last window always ends at the end of the text.
//!
//! Each chunk gets a fresh UUID, a SHA-256 hash of its text, and the label
//! of the page or sheet segment it starts in, when the extractor produced
//! segments.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::extract::Segment;
use crate::models::Chunk;

/// Split `text` into windows of `size` chars overlapping by `overlap`.
/// Returns chunks with contiguous indices starting at 0; empty text yields
/// no chunks.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    size: usize,
    overlap: usize,
    segments: &[Segment],
) -> Vec<Chunk> {
    window_bounds(text.chars().count(), size, overlap)
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| {
            let content = slice_chars(text, start, end);
            make_chunk(document_id, index as i64, content, label_at(segments, start))
        })
        .collect()
}

/// Char-offset `[start, end)` pairs for every window.
pub fn window_bounds(len: usize, size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let size = size.max(1);
    let stride = size.saturating_sub(overlap).max(1);
    let mut bounds = Vec::new();
    let mut start = 0;
    while start < len {
        let end = len.min(start + size);
        bounds.push((start, end));
        if end == len {
            break;
        }
        start += stride;
    }
    bounds
}

fn slice_chars(text: &str, start: usize, end: usize) -> &str {
    let mut indices = text.char_indices().map(|(i, _)| i).chain(std::iter::once(text.len()));
    let from = indices.nth(start).unwrap_or(text.len());
    let to = if end > start {
        indices.nth(end - start - 1).unwrap_or(text.len())
    } else {
        from
    };
    &text[from..to]
}

fn label_at(segments: &[Segment], start_char: usize) -> Option<String> {
    segments
        .iter()
        .take_while(|s| s.start_char <= start_char)
        .last()
        .map(|s| s.label.clone())
}

fn make_chunk(document_id: &str, index: i64, text: &str, page_or_sheet: Option<String>) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        content: text.to_string(),
        hash,
        page_or_sheet,
    }
}
