//! Sliding-window text chunker.
//!
//! Splits extracted document text into fixed-size windows that overlap by
//! a fixed number of characters. Sizes count Unicode scalar values, so a
//! multi-byte character is never cut in half.
//!
//! With `size = 500` and `overlap = 50` the windows start at 0, 450, 900,
//! ... and the last window may be shorter than `size`. Dropping the first
//! `overlap` characters of every window after the first and concatenating
//! gives back the original text.

use crate::error::{Error, Result};

/// Validated chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    size: usize,
    overlap: usize,
}

impl ChunkParams {
    /// `size` must be positive and `overlap` strictly smaller than it.
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("chunk size must be > 0".to_string()));
        }
        if overlap >= size {
            return Err(Error::Config(format!(
                "chunk overlap ({overlap}) must be smaller than chunk size ({size})"
            )));
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    fn step(&self) -> usize {
        self.size - self.overlap
    }
}

/// Split `text` into overlapping windows. Empty text yields no chunks.
pub fn chunk_text(text: &str, params: ChunkParams) -> Vec<String> {
    // Byte offset of every char boundary, including the end of the text.
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_count = boundaries.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < char_count {
        let end = (start + params.size).min(char_count);
        chunks.push(text[boundaries[start]..boundaries[end]].to_string());
        if end == char_count {
            break;
        }
        start += params.step();
    }
    chunks
}

/// Rebuild the original text from chunks produced with `overlap`.
pub fn reassemble(chunks: &[String], overlap: usize) -> String {
    let mut out = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            out.push_str(chunk);
        } else {
            out.extend(chunk.chars().skip(overlap));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(size: usize, overlap: usize) -> ChunkParams {
        ChunkParams::new(size, overlap).unwrap()
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk_text("", params(500, 50)).is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("Hello, world!", params(500, 50));
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn three_page_document_yields_four_chunks() {
        let text: String = (0..1500)
            .map(|i| char::from(b'a' + (i % 26) as u8))
            .collect();
        let chunks = chunk_text(&text, params(500, 50));

        assert_eq!(chunks.len(), 4);
        for c in &chunks {
            assert!(c.chars().count() <= 500);
        }
        for pair in chunks.windows(2) {
            let prev_tail: String = pair[0].chars().skip(pair[0].chars().count() - 50).collect();
            let next_head: String = pair[1].chars().take(50).collect();
            assert_eq!(prev_tail, next_head);
        }
        assert_eq!(chunks[3].chars().count(), 150);
    }

    #[test]
    fn exact_fit_does_not_emit_a_trailing_overlap_chunk() {
        let text = "x".repeat(950);
        let chunks = chunk_text(&text, params(500, 50));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 500);
    }

    #[test]
    fn reassembly_recovers_the_original() {
        let samples = [
            "a".repeat(1),
            "The quick brown fox jumps over the lazy dog. ".repeat(40),
            "lorem ipsum\n\ndolor sit amet\n".repeat(17),
            "x".repeat(499),
            "y".repeat(500),
            "z".repeat(501),
        ];
        for (size, overlap) in [(500, 50), (10, 9), (7, 0), (1, 0)] {
            for text in &samples {
                let chunks = chunk_text(text, params(size, overlap));
                assert_eq!(&reassemble(&chunks, overlap), text);
            }
        }
    }

    #[test]
    fn multibyte_characters_are_not_split() {
        let text = "héllo wörld ✓ ".repeat(20);
        let chunks = chunk_text(&text, params(16, 4));
        for c in &chunks {
            assert!(c.chars().count() <= 16);
        }
        assert_eq!(reassemble(&chunks, 4), text);
    }

    #[test]
    fn deterministic() {
        let text = "Alpha beta gamma delta. ".repeat(30);
        assert_eq!(chunk_text(&text, params(64, 8)), chunk_text(&text, params(64, 8)));
    }

    #[test]
    fn invalid_params_are_rejected() {
        assert!(ChunkParams::new(0, 0).is_err());
        assert!(ChunkParams::new(10, 10).is_err());
        assert!(ChunkParams::new(10, 11).is_err());
    }
}
