//! HTML clean-up for stored message bodies.

use crate::constants::EMPTY_BODY_TEXT;

/// Sanitize a message body, dropping every element named in `forbidden`
/// together with its content.
///
/// Parsing is done by ammonia (html5ever), so markup hidden in attribute
/// values or comments never counts as a tag. Tags outside ammonia's default
/// allow-list are unwrapped and keep their text.
pub fn sanitize_html(html: &str, forbidden: &[&str]) -> String {
    ammonia::Builder::default()
        .rm_tags(forbidden)
        .add_clean_content_tags(forbidden)
        .clean(html)
        .to_string()
}

/// Textual content of an HTML document, whitespace-collapsed.
pub fn html_to_text(html: &str) -> String {
    let rendered = html2text::config::plain_no_decorate()
        .string_from_read(html.as_bytes(), 10_000)
        .unwrap_or_default();
    normalize_text(&rendered)
}

/// Collapse runs of whitespace and invisible joiners into single spaces,
/// falling back to a placeholder when nothing readable remains.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_gap = false;
    for c in text.chars() {
        if c.is_whitespace() || c == '\u{200C}' || c == '\u{034F}' {
            in_gap = true;
        } else {
            if in_gap && !out.is_empty() {
                out.push(' ');
            }
            in_gap = false;
            out.push(c);
        }
    }
    if out.is_empty() {
        EMPTY_BODY_TEXT.to_string()
    } else {
        out
    }
}
