//! Record store client: the document database the mailbox is mirrored into.
//!
//! This module is split into:
//! - `mod.rs` - `RecordStore` trait, list options, errors, decoding helpers
//! - `filter.rs` - Typed filters rendered to PocketBase syntax
//! - `pocketbase.rs` - HTTP implementation against the PocketBase REST API
//! - `memory.rs` - In-memory implementation used by tests

mod filter;
#[cfg(test)]
pub mod memory;
mod pocketbase;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::constants::FULL_LIST_BATCH_SIZE;

pub use filter::Filter;
pub use pocketbase::PocketBaseStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record store rejected request ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("record store unreachable: {0}")]
    Transport(String),
    #[error("unexpected record shape: {0}")]
    Decode(String),
}

/// Filtering and ordering for list queries.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub filter: Option<Filter>,
    /// Comma separated fields, `-` prefix for descending (e.g. `-created`)
    pub sort: Option<String>,
    /// Skip counting total items (cheaper on large collections)
    pub skip_total: bool,
}

impl ListOptions {
    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Self::default()
        }
    }

    pub fn sorted(mut self, sort: &str) -> Self {
        self.sort = Some(sort.to_string());
        self
    }
}

/// One page of a list query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage<T> {
    pub page: usize,
    pub per_page: usize,
    #[serde(default)]
    pub total_items: i64,
    #[serde(default)]
    pub total_pages: i64,
    pub items: Vec<T>,
}

impl ListPage<Value> {
    pub fn decode<T: DeserializeOwned>(self) -> Result<ListPage<T>, StoreError> {
        Ok(ListPage {
            page: self.page,
            per_page: self.per_page,
            total_items: self.total_items,
            total_pages: self.total_pages,
            items: decode_all(self.items)?,
        })
    }
}

/// A file attached to a record on creation.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub field: String,
    pub file_name: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Collection-oriented document store.
///
/// Every call is a single remote round trip. Update patches may use the
/// `field+` / `field-` keys to add to or subtract from a numeric field.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create(&self, collection: &str, data: Value) -> Result<Value, StoreError>;

    async fn create_with_file(
        &self,
        collection: &str,
        data: Value,
        file: FileUpload,
    ) -> Result<Value, StoreError>;

    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<Value, StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    async fn get_one(&self, collection: &str, id: &str) -> Result<Value, StoreError>;

    async fn get_list(
        &self,
        collection: &str,
        page: usize,
        per_page: usize,
        options: &ListOptions,
    ) -> Result<ListPage<Value>, StoreError>;

    /// First record matching `filter`, or `None`.
    async fn get_first_list_item(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Value>, StoreError> {
        let options = ListOptions {
            filter: Some(filter.clone()),
            sort: None,
            skip_total: true,
        };
        let page = self.get_list(collection, 1, 1, &options).await?;
        Ok(page.items.into_iter().next())
    }

    /// Every record matching `options`, fetched in batches.
    async fn get_full_list(
        &self,
        collection: &str,
        options: &ListOptions,
    ) -> Result<Vec<Value>, StoreError> {
        let options = ListOptions {
            skip_total: true,
            ..options.clone()
        };
        let mut records = Vec::new();
        let mut page = 1;
        loop {
            let batch = self
                .get_list(collection, page, FULL_LIST_BATCH_SIZE, &options)
                .await?;
            let done = batch.items.len() < FULL_LIST_BATCH_SIZE;
            records.extend(batch.items);
            if done {
                return Ok(records);
            }
            page += 1;
        }
    }
}

pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Decode(e.to_string()))
}

pub fn decode_all<T: DeserializeOwned>(values: Vec<Value>) -> Result<Vec<T>, StoreError> {
    values.into_iter().map(decode).collect()
}
