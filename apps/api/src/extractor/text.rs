//! Comment text cascade.
//!
//! Each level is a pure function over [`TextInput`]. Levels run in order and
//! the first one that yields text wins; later levels are never consulted.

use std::sync::LazyLock;

use regex::Regex;
use select::document::Document;
use select::predicate::{Attr, Name};
use serde::Serialize;

use super::html::{
    collapse_whitespace, is_boilerplate, parse, text_lines, truncate_chars, visible_lines,
    visible_text,
};

pub const MAX_COMMENT_CHARS: usize = 500;
const MENTION_CONTEXT_CHARS: usize = 100;
const MIN_LINE_CHARS: usize = 10;

/// At-rules that look like mentions once a stylesheet leaks into text.
pub const CSS_AT_RULES: &[&str] = &[
    "font-face",
    "media",
    "import",
    "keyframes",
    "charset",
    "supports",
];

/// `@name` not preceded by a word char, so e-mail addresses are skipped.
static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w.@])@([A-Za-z][\w.-]{0,63})").expect("valid regex")
});

static URL_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:<)?(?:https?://|www\.)\S+(?:>)?$").expect("valid regex"));

const CLASS_HINTS: &[&str] = &["comment", "message", "content", "body-text"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextStrategy {
    BotMention,
    TableCell,
    MentionContext,
    StructuralSelector,
    LineScan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedText {
    pub text: String,
    pub strategy: TextStrategy,
}

/// Pre-rendered views of one e-mail body.
pub struct TextInput {
    doc: Option<Document>,
    stripped: String,
    lines: Vec<String>,
}

impl TextInput {
    pub fn new(html: Option<&str>, plain: Option<&str>) -> Self {
        match html.filter(|h| !h.trim().is_empty()) {
            Some(html) => {
                let doc = parse(html);
                Self {
                    stripped: visible_text(&doc),
                    lines: visible_lines(html),
                    doc: Some(doc),
                }
            }
            None => {
                let plain = plain.unwrap_or_default();
                Self {
                    doc: None,
                    stripped: collapse_whitespace(plain),
                    lines: text_lines(plain),
                }
            }
        }
    }
}

type TextStep = fn(&TextInput, &str) -> Option<String>;

const TEXT_CASCADE: [(TextStrategy, TextStep); 5] = [
    (TextStrategy::BotMention, bot_mention),
    (TextStrategy::TableCell, table_cell),
    (TextStrategy::MentionContext, mention_context),
    (TextStrategy::StructuralSelector, structural_selector),
    (TextStrategy::LineScan, line_scan),
];

/// Runs the cascade; `None` means no comment could be found.
pub fn extract_comment_text(input: &TextInput, bot_handle: &str) -> Option<ExtractedText> {
    TEXT_CASCADE.iter().find_map(|(strategy, step)| {
        step(input, bot_handle).map(|text| ExtractedText {
            text,
            strategy: *strategy,
        })
    })
}

/// Byte ranges of `@mentions` that are not CSS at-rules.
pub fn find_mentions(text: &str) -> Vec<(usize, usize)> {
    MENTION_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let name = caps.get(1)?;
            if is_css_at_rule(name.as_str()) {
                return None;
            }
            // The '@' sits right before the captured name.
            Some((name.start() - 1, name.end()))
        })
        .collect()
}

fn is_css_at_rule(name: &str) -> bool {
    let lower = name.to_lowercase();
    CSS_AT_RULES
        .iter()
        .any(|rule| lower == *rule || lower.starts_with(&format!("{rule}-")))
}

fn looks_like_css(text: &str) -> bool {
    text.contains('{') || text.contains('}') || {
        let lower = text.trim_start().to_lowercase();
        CSS_AT_RULES
            .iter()
            .any(|rule| lower.starts_with(&format!("@{rule}")))
    }
}

/// Level 1: `@<bot>` plus the rest of its line; the longest match wins.
pub fn bot_mention(input: &TextInput, bot_handle: &str) -> Option<String> {
    let handle = bot_handle.trim().trim_start_matches('@');
    if handle.is_empty() {
        return None;
    }
    let re = Regex::new(&format!(r"(?i)@{}\b[^\n]*", regex::escape(handle))).ok()?;

    let mut matches: Vec<String> = input
        .lines
        .iter()
        .flat_map(|line| re.find_iter(line).map(|m| m.as_str().trim().to_string()))
        .collect();
    matches.sort_by_key(|m| std::cmp::Reverse(m.chars().count()));
    matches
        .into_iter()
        .next()
        .map(|m| truncate_chars(&m, MAX_COMMENT_CHARS))
}

/// Level 2: innermost table cell holding a mention, without footer text.
pub fn table_cell(input: &TextInput, _bot_handle: &str) -> Option<String> {
    let doc = input.doc.as_ref()?;
    doc.find(Name("td"))
        .filter(|td| td.find(Name("td")).next().is_none())
        .map(|td| collapse_whitespace(&td.text()))
        .find(|text| {
            !text.is_empty()
                && text.chars().count() <= MAX_COMMENT_CHARS
                && !find_mentions(text).is_empty()
                && !is_boilerplate(text)
                && !looks_like_css(text)
        })
}

/// Level 3: first genuine mention with surrounding context.
pub fn mention_context(input: &TextInput, _bot_handle: &str) -> Option<String> {
    let text = &input.stripped;
    find_mentions(text).into_iter().find_map(|(start, end)| {
        let from = text[..start]
            .char_indices()
            .rev()
            .nth(MENTION_CONTEXT_CHARS - 1)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let to = text[end..]
            .char_indices()
            .nth(MENTION_CONTEXT_CHARS)
            .map(|(i, _)| end + i)
            .unwrap_or(text.len());
        let window = collapse_whitespace(&text[from..to]);
        (!is_boilerplate(&window) && !looks_like_css(&window)).then_some(window)
    })
}

/// Level 4: containers whose class or style marks them as message bodies.
pub fn structural_selector(input: &TextInput, _bot_handle: &str) -> Option<String> {
    let doc = input.doc.as_ref()?;

    let by_class = doc.find(Attr("class", ())).filter(|n| {
        n.attr("class")
            .map(|c| {
                let c = c.to_lowercase();
                CLASS_HINTS.iter().any(|hint| c.contains(hint))
            })
            .unwrap_or(false)
    });
    let quoted = doc.find(Name("blockquote"));
    let styled = doc.find(Attr("style", ())).filter(|n| {
        matches!(n.name(), Some("p") | Some("div") | Some("span"))
            && n.attr("style")
                .map(|s| s.contains("font-size"))
                .unwrap_or(false)
    });

    by_class
        .chain(quoted)
        .chain(styled)
        .map(|n| collapse_whitespace(&n.text()))
        .find(|text| is_substantive(text))
        .map(|text| truncate_chars(&text, MAX_COMMENT_CHARS))
}

/// Level 5: first plain line that is not a link, mention, footer or stylesheet.
pub fn line_scan(input: &TextInput, _bot_handle: &str) -> Option<String> {
    input
        .lines
        .iter()
        .find(|line| {
            is_substantive(line)
                && !URL_LINE_RE.is_match(line)
                && !line.starts_with('@')
                && find_mentions(line).is_empty()
        })
        .map(|line| truncate_chars(line, MAX_COMMENT_CHARS))
}

fn is_substantive(text: &str) -> bool {
    text.chars().count() > MIN_LINE_CHARS && !is_boilerplate(text) && !looks_like_css(text)
}
