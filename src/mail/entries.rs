//! Reading and listing mirrored entries and labels.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::json;

use super::error::MailError;
use super::imap::find_by_message_id;
use super::inbox::MailInbox;
use super::labels::LabelTree;
use super::types::{Address, Attachment, MailEntry, MailFlags};
use crate::constants::{
    ADDRESSES_COLLECTION, ATTACHMENTS_COLLECTION, ENTRIES_COLLECTION, ENTRY_PAGE_SIZE,
    INBOX_LABEL, LABELS_COLLECTION, TRASH_LABEL,
};
use crate::store::{Filter, ListOptions, ListPage, StoreError, decode, decode_all};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressView {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentView {
    pub name: String,
    pub size: u64,
    /// `collection/record/file` path under the store's file endpoint
    pub file: String,
}

/// An entry with its address and attachment relations resolved.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryView {
    pub id: String,
    pub uid: u32,
    pub message_id: String,
    pub subject: String,
    pub date: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    pub seen: bool,
    pub from: Option<AddressView>,
    pub to: Vec<AddressView>,
    pub cc: Vec<AddressView>,
    pub labels: Vec<String>,
    #[serde(rename = "box")]
    pub mailbox: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub unsubscribe_url: String,
    pub attachments: Vec<AttachmentView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelView {
    pub id: String,
    pub name: String,
    pub parent: String,
    pub count: i64,
    pub path: String,
}

/// Which entries a listing shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelSelector {
    All,
    Inbox,
    Trash,
    Id(String),
}

impl LabelSelector {
    pub fn parse(value: &str) -> Self {
        match value {
            "" | "all" => Self::All,
            "inbox" => Self::Inbox,
            "trash" => Self::Trash,
            id => Self::Id(id.to_string()),
        }
    }
}

impl MailInbox {
    /// One entry, expanded. Unseen entries are marked seen remotely and
    /// locally; any remote trouble degrades to the stored copy.
    pub async fn read_entry(&self, id: &str) -> Result<EntryView, MailError> {
        let record = match self.store.get_one(ENTRIES_COLLECTION, id).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => return Err(MailError::NotFound(format!("entry {}", id))),
            Err(e) => return Err(e.into()),
        };
        let mut entry: MailEntry = decode(record)?;

        if !entry.seen {
            match self.mark_seen(&entry).await {
                Ok(true) => entry.seen = true,
                Ok(false) => tracing::debug!(entry = %entry.id, "Message not found remotely"),
                Err(e) => {
                    tracing::warn!(entry = %entry.id, "Could not mark entry seen, returning stored copy: {}", e)
                }
            }
        }

        let mut views = self.expand(vec![entry], true).await?;
        views
            .pop()
            .ok_or_else(|| MailError::NotFound(format!("entry {}", id)))
    }

    async fn mark_seen(&self, entry: &MailEntry) -> Result<bool, MailError> {
        let connector = self.connector()?;
        let tree = LabelTree::load(self.store.as_ref()).await?;
        let trash_id = tree.resolve_id_by_path(TRASH_LABEL);
        let folder = self.folder_of(&tree, trash_id.as_deref(), &entry.mailbox);

        let mut session = connector.connect().await?;
        let result = async {
            session.open_box(&folder).await?;
            let uids = find_by_message_id(session.as_mut(), &entry.message_id).await?;
            if uids.is_empty() {
                return Ok(false);
            }
            session.add_flags(&uids, MailFlags::SEEN).await?;
            Ok::<bool, MailError>(true)
        }
        .await;
        session.close().await;

        if result? {
            self.store
                .update(ENTRIES_COLLECTION, &entry.id, json!({ "seen": true }))
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// A page of entries, newest first, without HTML bodies.
    pub async fn list_entries(
        &self,
        selector: &LabelSelector,
        page: usize,
    ) -> Result<ListPage<EntryView>, MailError> {
        let label_id = match selector {
            LabelSelector::All => None,
            LabelSelector::Inbox => self.root_label_id(INBOX_LABEL).await?,
            LabelSelector::Trash => self.root_label_id(TRASH_LABEL).await?,
            LabelSelector::Id(id) => Some(id.clone()),
        };

        let mut options = ListOptions::default().sorted("-date");
        options.filter = label_id.map(|id| Filter::contains("labels", id));

        let result = self
            .store
            .get_list(ENTRIES_COLLECTION, page.max(1), ENTRY_PAGE_SIZE, &options)
            .await?
            .decode::<MailEntry>()?;

        let items = self.expand(result.items, false).await?;
        Ok(ListPage {
            page: result.page,
            per_page: result.per_page,
            total_items: result.total_items,
            total_pages: result.total_pages,
            items,
        })
    }

    async fn root_label_id(&self, name: &str) -> Result<Option<String>, MailError> {
        let filter = Filter::And(vec![Filter::eq("name", name), Filter::eq("parent", "")]);
        let record = self
            .store
            .get_first_list_item(LABELS_COLLECTION, &filter)
            .await?;
        Ok(record.and_then(|r| r["id"].as_str().map(str::to_string)))
    }

    /// Every label with its full path, sorted by path.
    pub async fn list_labels(&self) -> Result<Vec<LabelView>, MailError> {
        let tree = LabelTree::load(self.store.as_ref()).await?;
        let mut views: Vec<LabelView> = tree
            .labels()
            .map(|label| LabelView {
                id: label.id.clone(),
                name: label.name.clone(),
                parent: label.parent.clone(),
                count: label.count,
                path: tree.full_path(&label.id),
            })
            .collect();
        views.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(views)
    }

    /// Mirror the remote folder hierarchy into the label tree.
    /// Returns the number of labels created.
    pub async fn import_labels(&self) -> Result<usize, MailError> {
        let connector = self.connector()?;
        let mut session = connector.connect().await?;
        let folders = session.list_folders().await;
        session.close().await;
        let folders = folders?;

        let mut tree = LabelTree::load(self.store.as_ref()).await?;
        let before = tree.len();
        for folder in &folders {
            if let Err(e) = tree.ensure_path(self.store.as_ref(), folder).await {
                tracing::warn!(folder = %folder, "Failed to import label: {}", e);
            }
        }
        let created = tree.len() - before;
        tracing::info!(folders = folders.len(), created, "Imported remote labels");
        Ok(created)
    }

    /// Resolve address and attachment relations for `entries`.
    async fn expand(
        &self,
        entries: Vec<MailEntry>,
        with_html: bool,
    ) -> Result<Vec<EntryView>, MailError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let address_ids: Vec<&String> = entries
            .iter()
            .flat_map(|e| std::iter::once(&e.from).chain(&e.to).chain(&e.cc))
            .filter(|id| !id.is_empty())
            .collect();
        let addresses: HashMap<String, AddressView> = if address_ids.is_empty() {
            HashMap::new()
        } else {
            let records = self
                .store
                .get_full_list(
                    ADDRESSES_COLLECTION,
                    &ListOptions::filtered(Filter::any_id(address_ids)),
                )
                .await?;
            decode_all::<Address>(records)?
                .into_iter()
                .map(|a| {
                    (
                        a.id,
                        AddressView {
                            name: a.name,
                            address: a.address,
                        },
                    )
                })
                .collect()
        };

        let owners = Filter::Or(entries.iter().map(|e| Filter::eq("belongs_to", &e.id)).collect());
        let attachment_records = self
            .store
            .get_full_list(ATTACHMENTS_COLLECTION, &ListOptions::filtered(owners).sorted("created"))
            .await?;
        let mut attachments: HashMap<String, Vec<AttachmentView>> = HashMap::new();
        for attachment in decode_all::<Attachment>(attachment_records)? {
            attachments
                .entry(attachment.belongs_to.clone())
                .or_default()
                .push(AttachmentView {
                    file: format!("{}/{}/{}", ATTACHMENTS_COLLECTION, attachment.id, attachment.file),
                    name: attachment.name,
                    size: attachment.size,
                });
        }

        let lookup = |ids: &[String]| -> Vec<AddressView> {
            ids.iter().filter_map(|id| addresses.get(id).cloned()).collect()
        };

        Ok(entries
            .into_iter()
            .map(|entry| EntryView {
                from: addresses.get(&entry.from).cloned(),
                to: lookup(&entry.to),
                cc: lookup(&entry.cc),
                attachments: attachments.remove(&entry.id).unwrap_or_default(),
                html: with_html.then_some(entry.html),
                id: entry.id,
                uid: entry.uid,
                message_id: entry.message_id,
                subject: entry.subject,
                date: entry.date,
                text: entry.text,
                seen: entry.seen,
                labels: entry.labels,
                mailbox: entry.mailbox,
                unsubscribe_url: entry.unsubscribe_url,
            })
            .collect())
    }
}
