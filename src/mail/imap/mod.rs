//! Remote mailbox access.
//!
//! This module is split into:
//! - `mod.rs` - Session traits, search criteria, fetch options, events
//! - `client.rs` - async-imap implementation over rustls
//! - `fake.rs` - Scripted in-memory mail server used by tests
//!
//! One mailbox is open per session; callers sequence `open_box` calls
//! themselves. The watcher keeps one long-lived session, every other
//! operation opens its own and closes it when done.

mod client;
#[cfg(test)]
pub mod fake;

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use super::error::MailError;
use super::types::{MailFlags, RawMessage};

pub use client::{ImapConnector, ImapSettings};

/// IMAP SEARCH keys the mirror needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCriteria {
    All,
    /// Internal date on or after this day (day resolution only)
    Since(NaiveDate),
    /// `HEADER Message-ID` match on the bracketed id. Servers match
    /// substrings, so hits still need [`find_by_message_id`]'s exact check.
    MessageId(String),
}

impl SearchCriteria {
    /// Render as an RFC 3501 search key.
    pub fn to_imap(&self) -> String {
        match self {
            Self::All => "ALL".to_string(),
            Self::Since(day) => format!("SINCE {}", day.format("%-d-%b-%Y")),
            Self::MessageId(id) => {
                let bare = id.trim().trim_start_matches('<').trim_end_matches('>');
                format!("HEADER Message-ID {}", quote(&format!("<{}>", bare)))
            }
        }
    }
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// What to fetch for each search hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchOptions {
    /// Full message (`BODY.PEEK[]`) plus provider labels
    pub bodies: bool,
}

impl FetchOptions {
    /// UID, flags, internal date and the Message-ID header only.
    pub fn metadata() -> Self {
        Self { bodies: false }
    }

    pub fn full() -> Self {
        Self { bodies: true }
    }
}

/// Outcome of waiting on an idle session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxEvent {
    NewMail,
    Timeout,
}

/// Opens sessions against the remote mailbox.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailError>;
}

/// An authenticated IMAP session.
///
/// Copy, flag and expunge failures are `MailError::RemoteMutation`; the
/// remaining commands fail with `MailError::Protocol`.
#[async_trait]
pub trait MailboxSession: Send {
    async fn open_box(&mut self, name: &str) -> Result<(), MailError>;

    async fn search(
        &mut self,
        criteria: &SearchCriteria,
        fetch: FetchOptions,
    ) -> Result<Vec<RawMessage>, MailError>;

    async fn add_flags(&mut self, uids: &[u32], flags: MailFlags) -> Result<(), MailError>;

    async fn copy(&mut self, uids: &[u32], destination: &str) -> Result<(), MailError>;

    async fn expunge(&mut self) -> Result<(), MailError>;

    async fn list_folders(&mut self) -> Result<Vec<String>, MailError>;

    /// Block in IDLE until the server reports activity or `timeout` elapses.
    /// An error here is the connection's error event.
    async fn wait_for_mail(&mut self, timeout: Duration) -> Result<MailboxEvent, MailError>;

    /// Log out. Errors are ignored.
    async fn close(&mut self);
}

/// Uids in the open mailbox whose Message-ID is exactly `message_id`.
///
/// `HEADER` search is a substring match, so `1@x.com` would also hit
/// `11@x.com`; the fetched header decides.
pub async fn find_by_message_id(
    session: &mut dyn MailboxSession,
    message_id: &str,
) -> Result<Vec<u32>, MailError> {
    let hits = session
        .search(
            &SearchCriteria::MessageId(message_id.to_string()),
            FetchOptions::metadata(),
        )
        .await?;
    Ok(hits
        .into_iter()
        .filter(|m| m.message_id.as_deref() == Some(message_id))
        .map(|m| m.uid)
        .collect())
}

/// Render uids as an IMAP sequence set ("3,7,9").
pub fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
