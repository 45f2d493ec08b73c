// src/utils/mod.rs

//! Utility functions and helpers.

pub mod http;
pub mod url;

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn remove_extra_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cut `text` at the last space that keeps it within `limit` characters.
///
/// Text without a usable space is cut hard at `limit`.
pub fn shorten_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    // One extra char so a space right after the limit still counts
    let window: String = text.chars().take(limit + 1).collect();
    match window.rfind(' ') {
        Some(idx) if idx > 0 => window[..idx].to_string(),
        _ => text.chars().take(limit).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_extra_spaces() {
        assert_eq!(remove_extra_spaces("  a \t b\n\nc  "), "a b c");
        assert_eq!(remove_extra_spaces(""), "");
    }

    #[test]
    fn test_shorten_text() {
        assert_eq!(shorten_text("short", 10), "short");
        assert_eq!(shorten_text("hello world again", 11), "hello world");
        assert_eq!(shorten_text("hello world again", 9), "hello");
        assert_eq!(shorten_text("abcdefghij", 4), "abcd");
    }
}
