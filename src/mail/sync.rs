//! Mirrors fetched messages into the record store.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

use super::error::MailError;
use super::labels::LabelTree;
use super::parser::parse_message;
use super::types::{EmailAddress, MailFlags, ParsedMessage, RawMessage, format_datetime};
use crate::constants::{ADDRESSES_COLLECTION, ATTACHMENTS_COLLECTION, ENTRIES_COLLECTION};
use crate::store::{FileUpload, Filter, RecordStore, StoreError};

/// Outcome of one synchronization batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: usize,
    /// Already mirrored (same Message-ID)
    pub duplicates: usize,
    /// Unparsable or without Message-ID
    pub skipped: usize,
    /// Dedup check or entry creation failed
    pub failed: usize,
    /// Address or label references left out of an entry
    pub unresolved_links: usize,
}

pub struct MailSynchronizer {
    store: Arc<dyn RecordStore>,
}

impl MailSynchronizer {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Mirror `messages` fetched from `mailbox`, one after another.
    ///
    /// Only a failure to load the label tree aborts the batch. Per-message
    /// problems are logged and counted in the report.
    pub async fn sync(
        &self,
        messages: &[RawMessage],
        mailbox: &str,
    ) -> Result<SyncReport, MailError> {
        let mut report = SyncReport::default();
        if messages.is_empty() {
            return Ok(report);
        }

        let mut tree = LabelTree::load(self.store.as_ref()).await?;

        for raw in messages {
            let parsed = match parse_message(raw, mailbox) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(uid = raw.uid, "Skipping message: {}", e);
                    report.skipped += 1;
                    continue;
                }
            };

            match self.find_entry(&parsed.message_id).await {
                Ok(Some(_)) => {
                    tracing::debug!(message_id = %parsed.message_id, "Already mirrored");
                    report.duplicates += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(message_id = %parsed.message_id, "Dedup check failed: {}", e);
                    report.failed += 1;
                    continue;
                }
            }

            let seen = raw.flags.contains(MailFlags::SEEN);
            let entry_id = match self.create_entry(raw.uid, &parsed, seen).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::error!(message_id = %parsed.message_id, "Failed to create entry: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            report.created += 1;

            let addresses = self.ensure_addresses(&parsed).await;
            report.unresolved_links += self.link_addresses(&entry_id, &parsed, &addresses).await;
            self.store_attachments(&entry_id, &parsed).await;
            self.store_unsubscribe(&entry_id, &parsed).await;
            report.unresolved_links += self
                .assign_labels(&mut tree, &entry_id, &parsed, mailbox)
                .await;

            tracing::info!(
                entry = %entry_id,
                uid = raw.uid,
                message_id = %parsed.message_id,
                "Mirrored message"
            );
        }

        Ok(report)
    }

    async fn find_entry(&self, message_id: &str) -> Result<Option<Value>, StoreError> {
        self.store
            .get_first_list_item(ENTRIES_COLLECTION, &Filter::eq("messageId", message_id))
            .await
    }

    async fn create_entry(
        &self,
        uid: u32,
        parsed: &ParsedMessage,
        seen: bool,
    ) -> Result<String, StoreError> {
        let record = self
            .store
            .create(
                ENTRIES_COLLECTION,
                json!({
                    "uid": uid,
                    "messageId": parsed.message_id,
                    "subject": parsed.subject,
                    "date": format_datetime(parsed.date),
                    "text": parsed.text,
                    "html": parsed.html.clone().unwrap_or_default(),
                    "seen": seen,
                }),
            )
            .await?;

        record["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Decode("created entry has no id".to_string()))
    }

    /// Address string -> record id for every participant that could be resolved.
    async fn ensure_addresses(&self, parsed: &ParsedMessage) -> HashMap<String, String> {
        let mut ids = HashMap::new();
        for addr in parsed.all_addresses() {
            match self.ensure_address(addr).await {
                Ok(id) => {
                    ids.insert(addr.address.clone(), id);
                }
                Err(e) => {
                    tracing::warn!(address = %addr.address, "Failed to store address: {}", e);
                }
            }
        }
        ids
    }

    async fn ensure_address(&self, addr: &EmailAddress) -> Result<String, StoreError> {
        let existing = self
            .store
            .get_first_list_item(ADDRESSES_COLLECTION, &Filter::eq("address", &addr.address))
            .await?;
        let record = match existing {
            Some(record) => record,
            None => {
                self.store
                    .create(
                        ADDRESSES_COLLECTION,
                        json!({ "name": addr.name, "address": addr.address }),
                    )
                    .await?
            }
        };
        record["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Decode("address record has no id".to_string()))
    }

    /// Returns the number of participants left unlinked.
    async fn link_addresses(
        &self,
        entry_id: &str,
        parsed: &ParsedMessage,
        ids: &HashMap<String, String>,
    ) -> usize {
        let mut unresolved = 0;
        let mut resolve = |list: &[EmailAddress]| -> Vec<String> {
            list.iter()
                .filter_map(|addr| {
                    let id = ids.get(&addr.address).cloned();
                    if id.is_none() {
                        unresolved += 1;
                    }
                    id
                })
                .collect()
        };

        let from = resolve(parsed.from.as_slice()).pop().unwrap_or_default();
        let to = resolve(&parsed.to);
        let cc = resolve(&parsed.cc);

        let patch = json!({ "from": from, "to": to, "cc": cc });
        if let Err(e) = self.store.update(ENTRIES_COLLECTION, entry_id, patch).await {
            tracing::warn!(entry = %entry_id, "Failed to link addresses: {}", e);
        }
        unresolved
    }

    async fn store_attachments(&self, entry_id: &str, parsed: &ParsedMessage) {
        for attachment in &parsed.attachments {
            let upload = FileUpload {
                field: "file".to_string(),
                file_name: attachment.filename.clone(),
                content_type: attachment.content_type.clone(),
                content: attachment.content.clone(),
            };
            let data = json!({
                "name": attachment.filename,
                "size": attachment.size,
                "belongs_to": entry_id,
            });
            if let Err(e) = self
                .store
                .create_with_file(ATTACHMENTS_COLLECTION, data, upload)
                .await
            {
                tracing::warn!(
                    entry = %entry_id,
                    name = %attachment.filename,
                    "Failed to store attachment: {}", e
                );
            }
        }
    }

    async fn store_unsubscribe(&self, entry_id: &str, parsed: &ParsedMessage) {
        let Some(url) = &parsed.unsubscribe_url else {
            return;
        };
        if let Err(e) = self
            .store
            .update(ENTRIES_COLLECTION, entry_id, json!({ "unsubscribeUrl": url }))
            .await
        {
            tracing::warn!(entry = %entry_id, "Failed to store unsubscribe link: {}", e);
        }
    }

    /// Returns the number of labels that matched nothing.
    async fn assign_labels(
        &self,
        tree: &mut LabelTree,
        entry_id: &str,
        parsed: &ParsedMessage,
        mailbox: &str,
    ) -> usize {
        let box_id = match tree.ensure_path(self.store.as_ref(), mailbox).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(mailbox, "Failed to resolve box label: {}", e);
                None
            }
        };

        let mut unresolved = 0;
        let mut label_ids: Vec<String> = Vec::new();
        for path in &parsed.labels {
            match tree.resolve_id_by_path(path) {
                Some(id) => {
                    if !label_ids.contains(&id) {
                        label_ids.push(id);
                    }
                }
                None => {
                    tracing::debug!(label = %path, "No local label for remote label");
                    unresolved += 1;
                }
            }
        }
        if let Some(id) = &box_id
            && !label_ids.contains(id)
        {
            label_ids.push(id.clone());
        }

        for id in &label_ids {
            if let Err(e) = tree.adjust_count(self.store.as_ref(), id, 1).await {
                tracing::warn!(label = %id, "Failed to increment label count: {}", e);
            }
        }

        let patch = json!({
            "labels": label_ids,
            "box": box_id.unwrap_or_default(),
        });
        if let Err(e) = self.store.update(ENTRIES_COLLECTION, entry_id, patch).await {
            tracing::warn!(entry = %entry_id, "Failed to assign labels: {}", e);
        }
        unresolved
    }
}
