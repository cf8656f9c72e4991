//! Scripted in-memory mail server for tests.
//!
//! Keeps folders of messages with per-folder uid counters and applies the
//! same search, flag, copy and expunge semantics as a real server. Failures
//! can be injected for connects, idle waits and individual mutations.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::{FetchOptions, MailboxConnector, MailboxEvent, MailboxSession, SearchCriteria};
use crate::mail::error::MailError;
use crate::mail::types::{MailFlags, RawMessage};

#[derive(Debug, Clone)]
struct StoredMessage {
    uid: u32,
    flags: MailFlags,
    labels: Vec<String>,
    internal_date: DateTime<Utc>,
    body: Vec<u8>,
}

#[derive(Debug, Default)]
struct Folder {
    next_uid: u32,
    messages: Vec<StoredMessage>,
}

#[derive(Default)]
struct State {
    folders: BTreeMap<String, Folder>,
    failing_connects: u32,
    failing_waits: u32,
    /// Operation name to the number of calls that still succeed
    failing_ops: HashMap<&'static str, u32>,
    connects: u32,
    closes: u32,
    commands: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeMailServer {
    state: Arc<Mutex<State>>,
    mail: Arc<Notify>,
}

impl FakeMailServer {
    /// A server with empty INBOX and Trash folders.
    pub fn new() -> Self {
        let server = Self::default();
        server.add_folder("INBOX");
        server.add_folder("Trash");
        server
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_folder(&self, name: &str) {
        self.lock().folders.entry(name.to_string()).or_insert(Folder {
            next_uid: 1,
            messages: Vec::new(),
        });
    }

    /// Place a message in `folder` without waking idle sessions; returns its uid.
    pub fn append(&self, folder: &str, body: Vec<u8>, internal_date: DateTime<Utc>) -> u32 {
        self.append_with(folder, body, internal_date, MailFlags::empty(), Vec::new())
    }

    pub fn append_with(
        &self,
        folder: &str,
        body: Vec<u8>,
        internal_date: DateTime<Utc>,
        flags: MailFlags,
        labels: Vec<String>,
    ) -> u32 {
        let mut state = self.lock();
        let folder = state.folders.entry(folder.to_string()).or_insert(Folder {
            next_uid: 1,
            messages: Vec::new(),
        });
        let uid = folder.next_uid;
        folder.next_uid += 1;
        folder.messages.push(StoredMessage {
            uid,
            flags,
            labels,
            internal_date,
            body,
        });
        uid
    }

    /// Append a message and notify an idling session.
    pub fn deliver(&self, folder: &str, body: Vec<u8>, internal_date: DateTime<Utc>) -> u32 {
        let uid = self.append(folder, body, internal_date);
        self.mail.notify_one();
        uid
    }

    /// Reject the next `count` connection attempts.
    pub fn fail_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Make the next idle wait end with an error event.
    pub fn break_next_wait(&self) {
        self.lock().failing_waits += 1;
        self.mail.notify_one();
    }

    /// Make every `search`, `flag`, `copy` or `expunge` command fail.
    pub fn fail_operation(&self, operation: &'static str) {
        self.fail_operation_after(operation, 0);
    }

    /// Let `successes` calls of `operation` through, then fail the rest.
    pub fn fail_operation_after(&self, operation: &'static str, successes: u32) {
        self.lock().failing_ops.insert(operation, successes);
    }

    pub fn uids(&self, folder: &str) -> Vec<u32> {
        self.lock()
            .folders
            .get(folder)
            .map(|f| f.messages.iter().map(|m| m.uid).collect())
            .unwrap_or_default()
    }

    pub fn flags(&self, folder: &str, uid: u32) -> Option<MailFlags> {
        self.lock()
            .folders
            .get(folder)
            .and_then(|f| f.messages.iter().find(|m| m.uid == uid))
            .map(|m| m.flags)
    }

    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    pub fn closes(&self) -> u32 {
        self.lock().closes
    }

    /// Every command issued so far, e.g. `SELECT INBOX` or `COPY 1,2 Trash`.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }
}

#[async_trait]
impl MailboxConnector for FakeMailServer {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailError> {
        let mut state = self.lock();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(MailError::Connection("connection refused".to_string()));
        }
        Ok(Box::new(FakeSession {
            server: self.clone(),
            selected: None,
        }))
    }
}

pub struct FakeSession {
    server: FakeMailServer,
    selected: Option<String>,
}

impl FakeSession {
    fn record(&self, command: String) {
        self.server.lock().commands.push(command);
    }

    fn selected(&self) -> Result<String, MailError> {
        self.selected
            .clone()
            .ok_or_else(|| MailError::Protocol("no mailbox selected".to_string()))
    }

    fn check_op(&self, operation: &'static str) -> Result<(), MailError> {
        let mut state = self.server.lock();
        match state.failing_ops.get_mut(operation) {
            Some(0) if operation == "search" => {
                Err(MailError::Protocol("NO [UNAVAILABLE] search failed".to_string()))
            }
            Some(0) => Err(MailError::remote(operation, "NO [CANNOT] simulated failure")),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

fn matches(message: &StoredMessage, criteria: &SearchCriteria) -> bool {
    match criteria {
        SearchCriteria::All => true,
        SearchCriteria::Since(day) => message.internal_date.date_naive() >= *day,
        // Lenient like Gmail: substring of the bare id, brackets ignored
        SearchCriteria::MessageId(id) => {
            let needle = bare_id(id).to_ascii_lowercase();
            header_value(&message.body, "message-id")
                .is_some_and(|value| value.to_ascii_lowercase().contains(&needle))
        }
    }
}

fn bare_id(value: &str) -> &str {
    value.trim().trim_start_matches('<').trim_end_matches('>')
}

fn header_value(body: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    text.lines()
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
}

#[async_trait]
impl MailboxSession for FakeSession {
    async fn open_box(&mut self, name: &str) -> Result<(), MailError> {
        self.record(format!("SELECT {}", name));
        if !self.server.lock().folders.contains_key(name) {
            return Err(MailError::Protocol(format!("NO mailbox '{}' does not exist", name)));
        }
        self.selected = Some(name.to_string());
        Ok(())
    }

    async fn search(
        &mut self,
        criteria: &SearchCriteria,
        fetch: FetchOptions,
    ) -> Result<Vec<RawMessage>, MailError> {
        let folder = self.selected()?;
        self.record(format!("SEARCH {}", criteria.to_imap()));
        self.check_op("search")?;
        let state = self.server.lock();
        let messages = state
            .folders
            .get(&folder)
            .map(|f| f.messages.as_slice())
            .unwrap_or_default();

        Ok(messages
            .iter()
            .filter(|m| matches(m, criteria))
            .map(|m| RawMessage {
                uid: m.uid,
                flags: m.flags,
                labels: if fetch.bodies { m.labels.clone() } else { Vec::new() },
                message_id: header_value(&m.body, "message-id").map(|v| bare_id(&v).to_string()),
                internal_date: Some(m.internal_date),
                body: if fetch.bodies { m.body.clone() } else { Vec::new() },
            })
            .collect())
    }

    async fn add_flags(&mut self, uids: &[u32], flags: MailFlags) -> Result<(), MailError> {
        let folder = self.selected()?;
        self.record(format!("STORE {} +FLAGS ({})", super::uid_set(uids), flags.imap_list()));
        self.check_op("flag")?;
        let mut state = self.server.lock();
        if let Some(folder) = state.folders.get_mut(&folder) {
            for message in folder.messages.iter_mut().filter(|m| uids.contains(&m.uid)) {
                message.flags |= flags;
            }
        }
        Ok(())
    }

    async fn copy(&mut self, uids: &[u32], destination: &str) -> Result<(), MailError> {
        let source = self.selected()?;
        self.record(format!("COPY {} {}", super::uid_set(uids), destination));
        self.check_op("copy")?;
        let mut state = self.server.lock();
        if !state.folders.contains_key(destination) {
            return Err(MailError::remote("copy", "NO [TRYCREATE] no such mailbox"));
        }
        let copied: Vec<StoredMessage> = state
            .folders
            .get(&source)
            .map(|f| {
                f.messages
                    .iter()
                    .filter(|m| uids.contains(&m.uid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(dest) = state.folders.get_mut(destination) {
            for mut message in copied {
                message.uid = dest.next_uid;
                dest.next_uid += 1;
                dest.messages.push(message);
            }
        }
        Ok(())
    }

    async fn expunge(&mut self) -> Result<(), MailError> {
        let folder = self.selected()?;
        self.record("EXPUNGE".to_string());
        self.check_op("expunge")?;
        let mut state = self.server.lock();
        if let Some(folder) = state.folders.get_mut(&folder) {
            folder
                .messages
                .retain(|m| !m.flags.contains(MailFlags::DELETED));
        }
        Ok(())
    }

    async fn list_folders(&mut self) -> Result<Vec<String>, MailError> {
        self.record("LIST \"\" *".to_string());
        Ok(self.server.lock().folders.keys().cloned().collect())
    }

    async fn wait_for_mail(&mut self, timeout: Duration) -> Result<MailboxEvent, MailError> {
        self.selected()?;
        let notified = tokio::time::timeout(timeout, self.server.mail.notified()).await;

        let mut state = self.server.lock();
        if state.failing_waits > 0 {
            state.failing_waits -= 1;
            return Err(MailError::Protocol("connection reset by peer".to_string()));
        }
        match notified {
            Ok(()) => Ok(MailboxEvent::NewMail),
            Err(_) => Ok(MailboxEvent::Timeout),
        }
    }

    async fn close(&mut self) {
        self.server.lock().closes += 1;
    }
}

/// Minimal RFC 5322 message.
pub fn rfc822(message_id: &str, from: &str, to: &[&str], subject: &str) -> Vec<u8> {
    format!(
        "From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\nMessage-ID: <{message_id}>\r\nContent-Type: text/plain\r\n\r\nBody of {subject}\r\n",
        to = to.join(", "),
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_copy_assigns_destination_uids_and_expunge_removes_deleted() {
        let server = FakeMailServer::new();
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        server.append("Trash", rfc822("old@x", "a@x.com", &[], "old"), date);
        let uid = server.append("INBOX", rfc822("m1@x", "a@x.com", &[], "hi"), date);

        let mut session = server.connect().await.unwrap();
        session.open_box("INBOX").await.unwrap();
        session.copy(&[uid], "Trash").await.unwrap();
        session.add_flags(&[uid], MailFlags::DELETED).await.unwrap();
        session.expunge().await.unwrap();

        assert!(server.uids("INBOX").is_empty());
        assert_eq!(server.uids("Trash"), vec![1, 2]);

        session.open_box("Trash").await.unwrap();
        let found = session
            .search(&SearchCriteria::MessageId("m1@x".to_string()), FetchOptions::metadata())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uid, 2);
    }

    #[tokio::test]
    async fn test_since_has_day_resolution() {
        let server = FakeMailServer::new();
        let morning = Utc.with_ymd_and_hms(2024, 5, 1, 0, 30, 0).unwrap();
        let previous = Utc.with_ymd_and_hms(2024, 4, 30, 23, 59, 0).unwrap();
        server.append("INBOX", rfc822("a@x", "a@x.com", &[], "a"), morning);
        server.append("INBOX", rfc822("b@x", "a@x.com", &[], "b"), previous);

        let mut session = server.connect().await.unwrap();
        session.open_box("INBOX").await.unwrap();
        let day = morning.date_naive();
        let found = session
            .search(&SearchCriteria::Since(day), FetchOptions::full())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(!found[0].body.is_empty());
    }
}
