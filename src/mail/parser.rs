use chrono::{DateTime, Utc};
use mail_parser::{HeaderName, Message, MessageParser, MimeHeaders, PartType};

use super::error::ParseError;
use super::html::{html_to_text, normalize_text, sanitize_html};
use super::types::{EmailAddress, MailFlags, ParsedAttachment, ParsedMessage, RawMessage};
use crate::constants::{FORBIDDEN_HTML_TAGS, INBOX_LABEL, UNTITLED_ATTACHMENT};

/// Turn a fetched message into the structure mirrored into the store.
///
/// `mailbox` is the folder the message was fetched from; it always leads the
/// label list so the entry stays reachable from its box.
pub fn parse_message(raw: &RawMessage, mailbox: &str) -> Result<ParsedMessage, ParseError> {
    let message = MessageParser::default()
        .parse(&raw.body)
        .ok_or(ParseError::Malformed)?;

    let message_id = message
        .message_id()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(ParseError::MissingMessageId)?
        .to_string();

    let from = message
        .from()
        .and_then(|addrs| addrs.first())
        .and_then(to_email_address);

    let to = message
        .to()
        .map(|addrs| addrs.iter().filter_map(to_email_address).collect())
        .unwrap_or_default();

    let cc = message
        .cc()
        .map(|addrs| addrs.iter().filter_map(to_email_address).collect())
        .unwrap_or_default();

    let subject = message.subject().map(|s| s.to_string()).unwrap_or_default();

    let date = message
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .or(raw.internal_date)
        .unwrap_or_else(Utc::now);

    let html = extract_html_body(&message).map(|html| sanitize_html(&html, &FORBIDDEN_HTML_TAGS));
    let text = match &html {
        Some(html) => html_to_text(html),
        None => normalize_text(&extract_text_body(&message).unwrap_or_default()),
    };

    let attachments = message
        .attachments()
        .map(|part| ParsedAttachment {
            filename: part
                .attachment_name()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(UNTITLED_ATTACHMENT)
                .to_string(),
            size: part.contents().len(),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            content: part.contents().to_vec(),
        })
        .collect();

    let unsubscribe_url = message
        .header_raw(HeaderName::ListUnsubscribe)
        .and_then(first_http_url);

    Ok(ParsedMessage {
        message_id,
        subject,
        date,
        from,
        to,
        cc,
        text,
        html,
        attachments,
        unsubscribe_url,
        labels: normalize_labels(mailbox, &raw.labels),
    })
}

/// Message-ID from a header block or full message, without angle brackets.
pub fn parse_message_id(raw: &[u8]) -> Option<String> {
    MessageParser::default()
        .parse_headers(raw)?
        .message_id()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn to_email_address(addr: &mail_parser::Addr) -> Option<EmailAddress> {
    let address = addr.address()?.trim();
    if address.is_empty() {
        return None;
    }
    Some(EmailAddress {
        name: addr.name().map(|s| s.trim().to_string()).unwrap_or_default(),
        address: address.to_string(),
    })
}

fn extract_text_body(message: &Message) -> Option<String> {
    for part in message.text_bodies() {
        if let PartType::Text(text) = &part.body {
            return Some(text.to_string());
        }
    }

    // Fallback: any text/plain part
    for part in message.parts.iter() {
        if let PartType::Text(text) = &part.body {
            let plain = part
                .content_type()
                .map(|ct| ct.subtype() == Some("plain"))
                .unwrap_or(true);
            if plain {
                return Some(text.to_string());
            }
        }
    }

    None
}

fn extract_html_body(message: &Message) -> Option<String> {
    for part in message.html_bodies() {
        if let PartType::Html(html) = &part.body {
            return Some(html.to_string());
        }
    }

    None
}

/// First http(s) target of a `List-Unsubscribe` header (`<mailto:..>, <https://..>`).
fn first_http_url(header: &str) -> Option<String> {
    header
        .split(',')
        .map(|item| item.trim().trim_start_matches('<').trim_end_matches('>').trim())
        .find(|url| {
            let lower = url.to_ascii_lowercase();
            lower.starts_with("https://") || lower.starts_with("http://")
        })
        .map(str::to_string)
}

/// Folder name first, then provider labels with system prefixes removed.
pub fn normalize_labels(mailbox: &str, remote: &[String]) -> Vec<String> {
    let mut labels: Vec<String> = Vec::with_capacity(remote.len() + 1);
    let candidates = std::iter::once(mailbox).chain(remote.iter().map(String::as_str));

    for label in candidates {
        let label = label.trim().trim_matches('"');
        let label = label.strip_prefix('\\').unwrap_or(label);
        if label.is_empty() || label.eq_ignore_ascii_case("seen") {
            continue;
        }
        let label = if label.eq_ignore_ascii_case("inbox") {
            INBOX_LABEL
        } else {
            label
        };
        if !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
    }

    labels
}

pub fn parse_flags_from_imap(flags: &[async_imap::types::Flag<'_>]) -> MailFlags {
    let mut result = MailFlags::empty();

    for flag in flags {
        match flag {
            async_imap::types::Flag::Seen => result |= MailFlags::SEEN,
            async_imap::types::Flag::Answered => result |= MailFlags::ANSWERED,
            async_imap::types::Flag::Flagged => result |= MailFlags::FLAGGED,
            async_imap::types::Flag::Deleted => result |= MailFlags::DELETED,
            async_imap::types::Flag::Draft => result |= MailFlags::DRAFT,
            _ => {}
        }
    }

    result
}
