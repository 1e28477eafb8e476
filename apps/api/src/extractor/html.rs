//! Small HTML helpers for notification e-mails.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use select::document::Document;
use select::predicate::Text;

/// `<style>`, `<script>` and `<head>` blocks, contents included.
static NON_CONTENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>|<script\b[^>]*>.*?</script\s*>|<head\b[^>]*>.*?</head\s*>")
        .expect("valid regex")
});

const BOX_DRAWING: &[char] = &['─', '│', '┼', '┬', '┴', '├', '┤', '┌', '┐', '└', '┘', '═', '║'];

/// Footer and nag text that is never the comment itself.
pub const BOILERPLATE: &[&str] = &[
    "unsubscribe",
    "privacy policy",
    "terms of service",
    "notification settings",
    "manage notifications",
    "email preferences",
    "download the app",
    "get the app",
    "mobile app",
    "app store",
    "google play",
    "view in browser",
    "you're receiving this",
    "you are receiving this",
    "all rights reserved",
];

pub fn remove_non_content(html: &str) -> Cow<'_, str> {
    NON_CONTENT_RE.replace_all(html, " ")
}

/// Parses markup with non-content blocks removed.
pub fn parse(html: &str) -> Document {
    Document::from(remove_non_content(html).as_ref())
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// All visible text as one whitespace-normalized string.
pub fn visible_text(doc: &Document) -> String {
    let pieces: Vec<&str> = doc.find(Text).filter_map(|n| n.as_text()).collect();
    collapse_whitespace(&pieces.join(" "))
}

/// Visible text split into rendered lines, table cells on their own line.
pub fn visible_lines(html: &str) -> Vec<String> {
    let cleaned = remove_non_content(html);
    let rendered = html2text::config::plain()
        .string_from_read(cleaned.as_bytes(), 1000)
        .unwrap_or_default();
    text_lines(&rendered)
}

/// Non-empty, whitespace-normalized lines of plain text.
pub fn text_lines(text: &str) -> Vec<String> {
    text.lines()
        .flat_map(|line| line.split('│'))
        .map(|cell| collapse_whitespace(&cell.replace(BOX_DRAWING, " ")))
        .filter(|cell| !cell.is_empty())
        .collect()
}

pub fn is_boilerplate(text: &str) -> bool {
    let lower = text.to_lowercase();
    BOILERPLATE.iter().any(|phrase| lower.contains(phrase))
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_style_blocks_are_not_visible() {
        let doc = parse(
            "<html><head><title>Mail</title></head><body><style>@media screen { p { color: red } }</style><p>Hello   there</p></body></html>",
        );
        assert_eq!(visible_text(&doc), "Hello there");
    }

    #[test]
    fn test_table_cells_split_into_lines() {
        let lines = text_lines("│ first cell │ second cell │\n────────\n  third  ");
        assert_eq!(lines, vec!["first cell", "second cell", "third"]);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo");
        assert_eq!(truncate_chars("short", 50), "short");
    }

    #[test]
    fn test_boilerplate_detection() {
        assert!(is_boilerplate("Click here to Unsubscribe"));
        assert!(is_boilerplate("Get the app for iOS"));
        assert!(!is_boilerplate("Can we tighten the spacing here?"));
    }
}
