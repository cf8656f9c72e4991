use bitflags::bitflags;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct MailFlags: u32 {
        const SEEN = 0b00000001;
        const ANSWERED = 0b00000010;
        const FLAGGED = 0b00000100;
        const DELETED = 0b00001000;
        const DRAFT = 0b00010000;
    }
}

impl MailFlags {
    /// Render as an IMAP flag list body, e.g. `\Seen \Deleted`.
    pub fn imap_list(self) -> String {
        let mut names = Vec::new();
        if self.contains(Self::SEEN) {
            names.push("\\Seen");
        }
        if self.contains(Self::ANSWERED) {
            names.push("\\Answered");
        }
        if self.contains(Self::FLAGGED) {
            names.push("\\Flagged");
        }
        if self.contains(Self::DELETED) {
            names.push("\\Deleted");
        }
        if self.contains(Self::DRAFT) {
            names.push("\\Draft");
        }
        names.join(" ")
    }
}

/// A message as fetched from the remote mailbox.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub uid: u32,
    pub flags: MailFlags,
    /// Provider label metadata (Gmail `X-GM-LABELS`), unnormalized
    pub labels: Vec<String>,
    /// Message-ID without angle brackets, when the server returned the header
    pub message_id: Option<String>,
    /// Server arrival time (INTERNALDATE)
    pub internal_date: Option<DateTime<Utc>>,
    /// Full RFC 5322 message; empty when only metadata was fetched
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct ParsedAttachment {
    pub filename: String,
    pub size: usize,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Structured form of a fetched message, ready to be mirrored.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message_id: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub from: Option<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub text: String,
    pub html: Option<String>,
    pub attachments: Vec<ParsedAttachment>,
    pub unsubscribe_url: Option<String>,
    pub labels: Vec<String>,
}

impl ParsedMessage {
    /// From, then To, then Cc, first occurrence of each address only.
    pub fn all_addresses(&self) -> Vec<&EmailAddress> {
        let mut seen = std::collections::HashSet::new();
        self.from
            .iter()
            .chain(self.to.iter())
            .chain(self.cc.iter())
            .filter(|addr| seen.insert(addr.address.as_str()))
            .collect()
    }
}

//
// Stored records
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailEntry {
    pub id: String,
    #[serde(default)]
    pub uid: u32,
    pub message_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub seen: bool,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Label id of the folder the message currently lives in
    #[serde(default, rename = "box")]
    pub mailbox: String,
    #[serde(default)]
    pub unsubscribe_url: String,
    #[serde(default)]
    pub created: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    /// Parent label id, empty for roots
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    /// Stored file name
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub belongs_to: String,
}

const STORE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3fZ";

/// Format a timestamp the way the record store writes datetimes.
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.format(STORE_DATETIME_FORMAT).to_string()
}

/// Parse a record store datetime (also accepts RFC 3339).
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s.trim_end_matches('Z'), "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_imap_flag_list() {
        assert_eq!(MailFlags::DELETED.imap_list(), "\\Deleted");
        assert_eq!(
            (MailFlags::SEEN | MailFlags::DELETED).imap_list(),
            "\\Seen \\Deleted"
        );
    }

    #[test]
    fn test_datetime_round_trip_through_store_format() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 5, 8, 15, 30).unwrap();
        let stored = format_datetime(dt);
        assert_eq!(stored, "2024-03-05 08:15:30.000Z");
        assert_eq!(parse_datetime(&stored), Some(dt));
        assert_eq!(parse_datetime("2024-03-05T08:15:30Z"), Some(dt));
        assert_eq!(parse_datetime(""), None);
    }

    #[test]
    fn test_entry_decodes_box_and_empty_relations() {
        let entry: MailEntry = serde_json::from_value(serde_json::json!({
            "id": "e1",
            "uid": 7,
            "messageId": "m1@example.com",
            "box": "l1",
            "from": "",
            "to": [],
            "labels": ["l1"]
        }))
        .unwrap();
        assert_eq!(entry.mailbox, "l1");
        assert_eq!(entry.uid, 7);
        assert!(!entry.seen);
        assert!(entry.cc.is_empty());
    }
}
