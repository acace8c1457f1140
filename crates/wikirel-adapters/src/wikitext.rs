//! Wikitext to plain text.
//!
//! Good enough for bag-of-words features: templates, tables, references and media
//! links are dropped, links collapse to their display text, headings are kept.

use std::sync::OnceLock;

use regex_lite::Regex;

static RE_SEE_ALSO: OnceLock<Regex> = OnceLock::new();
static RE_COMMENT: OnceLock<Regex> = OnceLock::new();
static RE_REF_SELF_CLOSING: OnceLock<Regex> = OnceLock::new();
static RE_REF_BLOCK: OnceLock<Regex> = OnceLock::new();
static RE_EXTERNAL_LINK: OnceLock<Regex> = OnceLock::new();
static RE_HTML_TAG: OnceLock<Regex> = OnceLock::new();
static RE_MAGIC_WORD: OnceLock<Regex> = OnceLock::new();
static RE_BLANK_RUN: OnceLock<Regex> = OnceLock::new();

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static wikitext pattern"))
}

const DROPPED_LINK_NAMESPACES: [&str; 4] = ["file:", "image:", "category:", "media:"];

/// Cut the markup at the "See also" heading, whatever its level or spacing.
pub fn strip_see_also(markup: &str) -> &str {
    let re = regex(
        &RE_SEE_ALSO,
        r"(?im)^[ \t]*={2,6}[ \t]*see also[ \t]*={2,6}[ \t]*$",
    );
    match re.find(markup) {
        Some(m) => &markup[..m.start()],
        None => markup,
    }
}

/// Article body as lowercased plain text with the "See also" tail removed.
pub fn normalize_article(markup: &str) -> String {
    to_plain_text(strip_see_also(markup)).to_lowercase()
}

pub fn to_plain_text(markup: &str) -> String {
    let text = regex(&RE_COMMENT, r"(?s)<!--.*?-->").replace_all(markup, "");
    let text = regex(&RE_REF_SELF_CLOSING, r"(?i)<ref[^>]*/>").replace_all(&text, "");
    let text = regex(&RE_REF_BLOCK, r"(?is)<ref[^>]*>.*?</ref>").replace_all(&text, "");
    let text = remove_balanced(&text, "{{", "}}");
    let text = remove_balanced(&text, "{|", "|}");
    let text = collapse_internal_links(&text);
    let text = regex(
        &RE_EXTERNAL_LINK,
        r"\[(?:https?:)?//[^\s\]]+(?:[ \t]+([^\]]*))?\]",
    )
    .replace_all(&text, "$1");
    let text = text.replace("'''", "").replace("''", "");
    let text = regex(&RE_HTML_TAG, r"</?[A-Za-z][^>]*>").replace_all(&text, "");
    let text = regex(&RE_MAGIC_WORD, r"__[A-Z]+__").replace_all(&text, "");
    let text = decode_entities(&text);

    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    let joined = lines.join("\n");
    regex(&RE_BLANK_RUN, r"\n{3,}")
        .replace_all(&joined, "\n\n")
        .trim()
        .to_string()
}

/// Remove every `open ... close` span, honoring nesting. An unterminated span runs to the end.
fn remove_balanced(text: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    let mut rest = text;
    while !rest.is_empty() {
        if rest.starts_with(open) {
            depth += 1;
            rest = &rest[open.len()..];
        } else if depth > 0 && rest.starts_with(close) {
            depth -= 1;
            rest = &rest[close.len()..];
        } else {
            let ch = rest.chars().next().unwrap_or_default();
            if depth == 0 {
                out.push(ch);
            }
            rest = &rest[ch.len_utf8()..];
        }
    }
    out
}

/// `[[target|label]]` → `label`, `[[target]]` → `target`; media and category links vanish.
fn collapse_internal_links(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("[[") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match matching_close(after) {
            Some(end) => {
                let inner = &after[..end];
                out.push_str(&link_display(inner));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(after);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn matching_close(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut idx = 0usize;
    while idx < text.len() {
        let tail = &text[idx..];
        if tail.starts_with("[[") {
            depth += 1;
            idx += 2;
        } else if tail.starts_with("]]") {
            if depth == 0 {
                return Some(idx);
            }
            depth -= 1;
            idx += 2;
        } else {
            idx += tail.chars().next().map(char::len_utf8).unwrap_or(1);
        }
    }
    None
}

fn link_display(inner: &str) -> String {
    let lowered = inner.trim_start_matches(':').trim_start().to_lowercase();
    if DROPPED_LINK_NAMESPACES.iter().any(|ns| lowered.starts_with(ns)) {
        return String::new();
    }
    let display = match inner.rfind('|') {
        Some(pipe) => &inner[pipe + 1..],
        None => inner,
    };
    collapse_internal_links(display.trim())
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}
