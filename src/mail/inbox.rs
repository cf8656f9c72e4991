//! Request-scoped access to the mirrored inbox.
//!
//! Every operation that touches the remote mailbox opens its own short-lived
//! session and closes it when done; the watcher's session is never shared.
//! Trash operations live in `trash.rs`, reads and listings in `entries.rs`.

use std::sync::Arc;

use super::error::MailError;
use super::imap::{MailboxConnector, MailboxSession};
use super::labels::LabelTree;
use super::sync::SyncReport;
use super::types::MailEntry;
use super::watcher::{WatchOptions, fetch_once};
use crate::config::ImapConfig;
use crate::constants::{ENTRIES_COLLECTION, TRASH_LABEL};
use crate::store::{Filter, ListOptions, RecordStore, decode_all};

pub struct MailInbox {
    pub(super) store: Arc<dyn RecordStore>,
    /// `None` when IMAP access is not configured
    connector: Option<Arc<dyn MailboxConnector>>,
    pub(super) inbox_folder: String,
    pub(super) trash_folder: String,
}

impl MailInbox {
    pub fn new(
        store: Arc<dyn RecordStore>,
        connector: Option<Arc<dyn MailboxConnector>>,
        imap: &ImapConfig,
    ) -> Self {
        Self {
            store,
            connector,
            inbox_folder: imap.inbox.clone(),
            trash_folder: imap.trash_folder.clone(),
        }
    }

    /// The connector, or a configuration error before anything is mutated.
    pub(super) fn connector(&self) -> Result<&dyn MailboxConnector, MailError> {
        self.connector.as_deref().ok_or_else(|| {
            MailError::Configuration("IMAP access is not configured".to_string())
        })
    }

    pub(super) async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailError> {
        self.connector()?.connect().await
    }

    /// One watermark pass over the inbox on a fresh session.
    pub async fn sync_once(&self, options: &WatchOptions) -> Result<SyncReport, MailError> {
        fetch_once(self.connector()?, self.store.clone(), options).await
    }

    /// Load the label tree and make sure the Trash root exists.
    pub(super) async fn tree_with_trash(&self) -> Result<(LabelTree, String), MailError> {
        let mut tree = LabelTree::load(self.store.as_ref()).await?;
        let trash_id = tree.ensure_root(self.store.as_ref(), TRASH_LABEL).await?;
        Ok((tree, trash_id))
    }

    /// Remote folder holding entries whose box is `box_id`.
    ///
    /// `trash_id` is `None` when no Trash label exists yet; an empty box
    /// then falls back to the inbox like any other unknown box.
    pub(super) fn folder_of(
        &self,
        tree: &LabelTree,
        trash_id: Option<&str>,
        box_id: &str,
    ) -> String {
        if trash_id == Some(box_id) {
            return self.trash_folder.clone();
        }
        let path = tree.full_path(box_id);
        if path.is_empty() {
            self.inbox_folder.clone()
        } else {
            path
        }
    }

    /// Entries with the given ids, in the order the ids were given.
    pub(super) async fn entries_by_id(&self, ids: &[String]) -> Result<Vec<MailEntry>, MailError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let records = self
            .store
            .get_full_list(ENTRIES_COLLECTION, &ListOptions::filtered(Filter::any_id(ids)))
            .await?;
        let found: Vec<MailEntry> = decode_all(records)?;

        let mut ordered = Vec::with_capacity(found.len());
        for id in ids {
            match found.iter().find(|entry| &entry.id == id) {
                Some(entry) if !ordered.iter().any(|e: &MailEntry| &e.id == id) => {
                    ordered.push(entry.clone())
                }
                Some(_) => {}
                None => tracing::warn!(entry = %id, "Entry not found"),
            }
        }
        Ok(ordered)
    }
}
