//! Text decoding and the core document metrics.

use crate::models::truncate_chars;

/// Line, word and character counts of a decoded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextCounts {
    pub lines: usize,
    pub words: usize,
    pub characters: usize,
}

/// Decodes UTF-8, dropping invalid byte sequences instead of failing.
pub fn decode_text(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
    }
    text
}

/// Lines are newline-delimited segments, a trailing partial segment
/// included; words are maximal non-whitespace runs; characters are
/// decoded chars.
pub fn count_text(text: &str) -> TextCounts {
    TextCounts {
        lines: text.lines().count(),
        words: text.split_whitespace().count(),
        characters: text.chars().count(),
    }
}

/// Prefix handed to the embedder.
pub fn embedding_input(text: &str, max_chars: usize) -> &str {
    truncate_chars(text, max_chars)
}

/// Display preview, `None` for blank documents.
pub fn content_preview(text: &str, max_chars: usize) -> Option<String> {
    let preview = truncate_chars(text, max_chars).trim();
    if preview.is_empty() {
        None
    } else {
        Some(preview.to_string())
    }
}
