//! In-memory record store for tests.
//!
//! Mirrors the PocketBase behaviours the mail code relies on: generated ids,
//! `created` ordering, `field+`/`field-` numeric modifiers, filters, sorting
//! and paging. Individual collections can be made to reject creates so
//! partial-failure paths can be exercised.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{FileUpload, ListOptions, ListPage, RecordStore, StoreError};

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Vec<Value>>,
    next_id: u64,
    failing_creates: HashSet<String>,
}

#[derive(Default)]
pub struct InMemoryRecordStore {
    inner: Mutex<Inner>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every create in `collection` with an API error.
    pub fn fail_creates_in(&self, collection: &str) {
        self.lock().failing_creates.insert(collection.to_string());
    }

    /// Snapshot of every record in `collection`, in insertion order.
    pub fn records(&self, collection: &str) -> Vec<Value> {
        self.lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, collection: &str, data: Value) -> Result<Value, StoreError> {
        let mut inner = self.lock();
        if inner.failing_creates.contains(collection) {
            return Err(StoreError::Api {
                status: 400,
                message: format!("create rejected in {}", collection),
            });
        }

        inner.next_id += 1;
        let id = format!("r{:014}", inner.next_id);
        // Zero-padded sequence keeps `created` lexically ordered like real timestamps.
        let created = format!("2000-01-01 00:00:00.{:09}Z", inner.next_id);

        let mut record = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        record.insert("id".to_string(), json!(id));
        record.insert("created".to_string(), json!(created));
        record.insert("updated".to_string(), json!(created));

        let record = Value::Object(record);
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }
}

fn apply_patch(record: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        if let Some(field) = key.strip_suffix('+') {
            let current = record.get(field).and_then(Value::as_i64).unwrap_or(0);
            record.insert(field.to_string(), json!(current + value.as_i64().unwrap_or(0)));
        } else if let Some(field) = key.strip_suffix('-') {
            let current = record.get(field).and_then(Value::as_i64).unwrap_or(0);
            record.insert(field.to_string(), json!(current - value.as_i64().unwrap_or(0)));
        } else {
            record.insert(key, value);
        }
    }
}

fn compare_field(a: &Value, b: &Value, field: &str) -> Ordering {
    match (a.get(field), b.get(field)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

fn sort_records(records: &mut [Value], sort: &str) {
    let keys: Vec<(&str, bool)> = sort
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| match k.strip_prefix('-') {
            Some(field) => (field, true),
            None => (k.trim_start_matches('+'), false),
        })
        .collect();

    records.sort_by(|a, b| {
        for (field, descending) in &keys {
            let ord = compare_field(a, b, field);
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create(&self, collection: &str, data: Value) -> Result<Value, StoreError> {
        self.insert(collection, data)
    }

    async fn create_with_file(
        &self,
        collection: &str,
        data: Value,
        file: FileUpload,
    ) -> Result<Value, StoreError> {
        let mut data = data;
        if let Value::Object(map) = &mut data {
            map.insert(file.field, json!(file.file_name));
        }
        self.insert(collection, data)
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<Value, StoreError> {
        let mut inner = self.lock();
        let record = inner
            .collections
            .get_mut(collection)
            .and_then(|records| records.iter_mut().find(|r| r["id"] == id))
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", collection, id)))?;

        if let (Value::Object(map), Value::Object(patch)) = (record, patch) {
            apply_patch(map, patch);
        }

        // Re-borrow to return the updated copy.
        let updated = inner.collections[collection]
            .iter()
            .find(|r| r["id"] == id)
            .cloned()
            .unwrap_or(Value::Null);
        Ok(updated)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let records = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", collection, id)))?;
        let before = records.len();
        records.retain(|r| r["id"] != id);
        if records.len() == before {
            return Err(StoreError::NotFound(format!("{}/{}", collection, id)));
        }
        Ok(())
    }

    async fn get_one(&self, collection: &str, id: &str) -> Result<Value, StoreError> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|records| records.iter().find(|r| r["id"] == id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", collection, id)))
    }

    async fn get_list(
        &self,
        collection: &str,
        page: usize,
        per_page: usize,
        options: &ListOptions,
    ) -> Result<ListPage<Value>, StoreError> {
        let mut matching: Vec<Value> = self
            .records(collection)
            .into_iter()
            .filter(|r| options.filter.as_ref().is_none_or(|f| f.matches(r)))
            .collect();

        if let Some(sort) = &options.sort {
            sort_records(&mut matching, sort);
        }

        let total = matching.len();
        let per_page = per_page.max(1);
        let items: Vec<Value> = matching
            .into_iter()
            .skip(page.saturating_sub(1) * per_page)
            .take(per_page)
            .collect();

        let (total_items, total_pages) = if options.skip_total {
            (-1, -1)
        } else {
            (total as i64, total.div_ceil(per_page) as i64)
        };

        Ok(ListPage {
            page,
            per_page,
            total_items,
            total_pages,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Filter;

    #[tokio::test]
    async fn test_counter_modifiers() {
        let store = InMemoryRecordStore::new();
        let label = store
            .create("labels", json!({"name": "INBOX", "count": 0}))
            .await
            .unwrap();
        let id = label["id"].as_str().unwrap();

        store.update("labels", id, json!({"count+": 3})).await.unwrap();
        let updated = store.update("labels", id, json!({"count-": 1})).await.unwrap();

        assert_eq!(updated["count"], 2);
    }

    #[tokio::test]
    async fn test_sort_and_page() {
        let store = InMemoryRecordStore::new();
        for date in ["2024-01-02", "2024-01-03", "2024-01-01"] {
            store.create("entries", json!({"date": date})).await.unwrap();
        }

        let options = ListOptions::default().sorted("-date");
        let page = store.get_list("entries", 1, 2, &options).await.unwrap();
        assert_eq!(page.total_items, 3);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.items[0]["date"], "2024-01-03");
        assert_eq!(page.items[1]["date"], "2024-01-02");

        let newest = store
            .get_list("entries", 1, 1, &ListOptions::default().sorted("-created"))
            .await
            .unwrap();
        assert_eq!(newest.items[0]["date"], "2024-01-01");
    }

    #[tokio::test]
    async fn test_first_list_item_and_failing_creates() {
        let store = InMemoryRecordStore::new();
        store
            .create("addresses", json!({"address": "a@x.com"}))
            .await
            .unwrap();

        let found = store
            .get_first_list_item("addresses", &Filter::eq("address", "a@x.com"))
            .await
            .unwrap();
        assert!(found.is_some());

        store.fail_creates_in("addresses");
        assert!(store.create("addresses", json!({})).await.is_err());
        assert_eq!(store.count("addresses"), 1);
    }
}
