//! Trash operations. Each one mutates the remote mailbox first and touches
//! local records only after the remote step succeeded.

use serde::Serialize;
use serde_json::json;

use super::error::MailError;
use super::imap::{FetchOptions, MailboxSession, SearchCriteria, find_by_message_id};
use super::inbox::MailInbox;
use super::labels::LabelTree;
use super::types::{MailEntry, MailFlags};
use crate::constants::ENTRIES_COLLECTION;
use crate::store::{Filter, ListOptions};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrashReport {
    /// Entries moved or deleted
    pub affected: usize,
    /// Targets left alone (wrong folder, or not found in Trash afterwards)
    pub skipped: usize,
}

impl MailInbox {
    /// Move entries to Trash on both sides.
    ///
    /// Targets are taken from the folder of the first entry; entries living
    /// elsewhere are skipped since their uids mean nothing in that folder.
    pub async fn move_to_trash(&self, ids: &[String]) -> Result<TrashReport, MailError> {
        self.connector()?;
        let mut report = TrashReport::default();

        let targets = self.entries_by_id(ids).await?;
        let Some(first) = targets.first() else {
            return Err(MailError::NotFound(format!("entries {}", ids.join(", "))));
        };

        let (mut tree, trash_id) = self.tree_with_trash().await?;
        let source_box = first.mailbox.clone();
        let folder = self.folder_of(&tree, Some(trash_id.as_str()), &source_box);

        let (targets, elsewhere): (Vec<MailEntry>, Vec<MailEntry>) = targets
            .into_iter()
            .partition(|entry| entry.mailbox == source_box && entry.mailbox != trash_id);
        for entry in &elsewhere {
            tracing::warn!(entry = %entry.id, "Not in the source folder, skipping");
        }
        report.skipped += elsewhere.len();
        if targets.is_empty() {
            return Ok(report);
        }

        let mut session = self.connect().await?;
        let result = self
            .move_remote_then_local(session.as_mut(), &mut tree, &trash_id, &folder, &targets)
            .await;
        session.close().await;

        let moved = result?;
        report.affected = moved;
        report.skipped += targets.len() - moved;

        tree.adjust_count(self.store.as_ref(), &trash_id, moved as i64)
            .await?;
        tracing::info!(moved, folder = %folder, "Moved entries to Trash");
        Ok(report)
    }

    async fn move_remote_then_local(
        &self,
        session: &mut dyn MailboxSession,
        tree: &mut LabelTree,
        trash_id: &str,
        folder: &str,
        targets: &[MailEntry],
    ) -> Result<usize, MailError> {
        let uids: Vec<u32> = targets.iter().map(|entry| entry.uid).collect();

        session.open_box(folder).await?;
        session.copy(&uids, &self.trash_folder).await?;
        session.add_flags(&uids, MailFlags::DELETED).await?;
        session.expunge().await?;

        session.open_box(&self.trash_folder).await?;
        let mut moved = 0;
        for entry in targets {
            // The source is already expunged, so a failed lookup only
            // leaves this entry stale; the others still get their uids.
            let found = match find_by_message_id(session, &entry.message_id).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(entry = %entry.id, "Trash lookup failed: {}", e);
                    continue;
                }
            };
            // The copy just made is the newest one.
            let Some(trash_uid) = found.into_iter().max() else {
                tracing::warn!(entry = %entry.id, message_id = %entry.message_id, "Copy not found in Trash");
                continue;
            };

            let patch = json!({
                "box": trash_id,
                "labels": [trash_id],
                "uid": trash_uid,
            });
            if let Err(e) = self.store.update(ENTRIES_COLLECTION, &entry.id, patch).await {
                tracing::error!(entry = %entry.id, "Failed to move entry to Trash locally: {}", e);
                continue;
            }
            moved += 1;

            for label in entry.labels.iter().filter(|l| l.as_str() != trash_id) {
                if let Err(e) = tree.adjust_count(self.store.as_ref(), label, -1).await {
                    tracing::warn!(label = %label, "Failed to decrement label count: {}", e);
                }
            }
        }
        Ok(moved)
    }

    /// Delete Trash entries for good on both sides.
    pub async fn delete_permanently(&self, ids: &[String]) -> Result<TrashReport, MailError> {
        self.connector()?;
        let mut report = TrashReport::default();

        let (mut tree, trash_id) = self.tree_with_trash().await?;
        let (targets, elsewhere): (Vec<MailEntry>, Vec<MailEntry>) = self
            .entries_by_id(ids)
            .await?
            .into_iter()
            .partition(|entry| entry.mailbox == trash_id);
        for entry in &elsewhere {
            tracing::warn!(entry = %entry.id, "Not in Trash, skipping permanent delete");
        }
        report.skipped = elsewhere.len() + ids.len().saturating_sub(targets.len() + elsewhere.len());
        if targets.is_empty() {
            return Ok(report);
        }

        let uids: Vec<u32> = targets.iter().map(|entry| entry.uid).collect();
        let mut session = self.connect().await?;
        let result = async {
            session.open_box(&self.trash_folder).await?;
            session.add_flags(&uids, MailFlags::DELETED).await?;
            session.expunge().await
        }
        .await;
        session.close().await;
        result?;

        let mut deleted = 0;
        for entry in &targets {
            match self.store.delete(ENTRIES_COLLECTION, &entry.id).await {
                Ok(()) => deleted += 1,
                Err(e) => tracing::error!(entry = %entry.id, "Failed to delete entry: {}", e),
            }
        }
        report.affected = deleted;

        tree.adjust_count(self.store.as_ref(), &trash_id, -(deleted as i64))
            .await?;
        tracing::info!(deleted, "Deleted entries permanently");
        Ok(report)
    }

    /// Expunge everything in the remote Trash, then drop every local Trash entry.
    pub async fn empty_trash(&self) -> Result<TrashReport, MailError> {
        self.connector()?;
        let (mut tree, trash_id) = self.tree_with_trash().await?;

        let mut session = self.connect().await?;
        let result = async {
            session.open_box(&self.trash_folder).await?;
            let messages = session
                .search(&SearchCriteria::All, FetchOptions::metadata())
                .await?;
            if messages.is_empty() {
                return Ok(0);
            }
            let uids: Vec<u32> = messages.iter().map(|m| m.uid).collect();
            session.add_flags(&uids, MailFlags::DELETED).await?;
            session.expunge().await?;
            Ok::<usize, MailError>(uids.len())
        }
        .await;
        session.close().await;
        let expunged = result?;

        let filter = Filter::Or(vec![
            Filter::eq("box", &trash_id),
            Filter::contains("labels", &trash_id),
        ]);
        let records = self
            .store
            .get_full_list(ENTRIES_COLLECTION, &ListOptions::filtered(filter))
            .await?;

        let mut report = TrashReport::default();
        for record in records {
            let Some(id) = record["id"].as_str() else {
                continue;
            };
            match self.store.delete(ENTRIES_COLLECTION, id).await {
                Ok(()) => report.affected += 1,
                Err(e) => {
                    tracing::error!(entry = %id, "Failed to delete entry: {}", e);
                    report.skipped += 1;
                }
            }
        }

        tree.reset_count(self.store.as_ref(), &trash_id).await?;
        tracing::info!(expunged, deleted = report.affected, "Emptied Trash");
        Ok(report)
    }
}
