//! Local label tree.
//!
//! Labels reference their parent by id. The tree is kept as an id-indexed map
//! plus a `(parent, name)` child index; ancestor walks are iterative and stop
//! at a missing parent or a cycle.

use std::collections::{HashMap, HashSet};

use serde_json::json;

use super::types::Label;
use crate::constants::LABELS_COLLECTION;
use crate::store::{ListOptions, RecordStore, StoreError, decode, decode_all};

#[derive(Debug, Default, Clone)]
pub struct LabelTree {
    by_id: HashMap<String, Label>,
    children: HashMap<(String, String), String>,
}

impl LabelTree {
    pub fn new(labels: Vec<Label>) -> Self {
        let mut tree = Self::default();
        for label in labels {
            tree.insert(label);
        }
        tree
    }

    /// Fetch every label from the store.
    pub async fn load(store: &dyn RecordStore) -> Result<Self, StoreError> {
        let records = store
            .get_full_list(LABELS_COLLECTION, &ListOptions::default().sorted("created"))
            .await?;
        Ok(Self::new(decode_all(records)?))
    }

    fn insert(&mut self, label: Label) {
        // First label wins when siblings share a name.
        self.children
            .entry((label.parent.clone(), label.name.clone()))
            .or_insert_with(|| label.id.clone());
        self.by_id.insert(label.id.clone(), label);
    }

    pub fn get(&self, id: &str) -> Option<&Label> {
        self.by_id.get(id)
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// `/`-joined names from the root down to `id`; empty for an unknown id.
    pub fn full_path(&self, id: &str) -> String {
        let mut names = Vec::new();
        let mut visited = HashSet::new();
        let mut current = self.by_id.get(id);

        while let Some(label) = current {
            if !visited.insert(label.id.as_str()) {
                tracing::warn!(label = %label.id, "Label parent chain has a cycle");
                break;
            }
            names.push(label.name.as_str());
            current = if label.parent.is_empty() {
                None
            } else {
                self.by_id.get(&label.parent)
            };
        }

        names.reverse();
        names.join("/")
    }

    /// Id of the deepest label matching a prefix of `path`.
    ///
    /// Matching starts at the roots. An unmatched segment ends the walk and
    /// the last matched ancestor is returned; `None` only when the first
    /// segment matches nothing.
    pub fn resolve_id_by_path(&self, path: &str) -> Option<String> {
        let mut parent = String::new();
        let mut matched = None;

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match self.children.get(&(parent.clone(), segment.to_string())) {
                Some(id) => {
                    matched = Some(id.clone());
                    parent = id.clone();
                }
                None => break,
            }
        }

        matched
    }

    /// Id of the root label `name`, creating it when absent.
    pub async fn ensure_root(
        &mut self,
        store: &dyn RecordStore,
        name: &str,
    ) -> Result<String, StoreError> {
        self.ensure_child(store, "", name).await
    }

    /// Id of the label at `path`, creating every missing segment.
    pub async fn ensure_path(
        &mut self,
        store: &dyn RecordStore,
        path: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut parent = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            parent = self.ensure_child(store, &parent, segment).await?;
        }
        Ok((!parent.is_empty()).then_some(parent))
    }

    async fn ensure_child(
        &mut self,
        store: &dyn RecordStore,
        parent: &str,
        name: &str,
    ) -> Result<String, StoreError> {
        if let Some(id) = self.children.get(&(parent.to_string(), name.to_string())) {
            return Ok(id.clone());
        }

        let record = store
            .create(
                LABELS_COLLECTION,
                json!({ "name": name, "parent": parent, "count": 0 }),
            )
            .await?;
        let label: Label = decode(record)?;
        tracing::info!(label = %label.id, name, parent, "Created label");

        let id = label.id.clone();
        self.insert(label);
        Ok(id)
    }

    /// Add `delta` to a label's count in the store and in this tree.
    pub async fn adjust_count(
        &mut self,
        store: &dyn RecordStore,
        id: &str,
        delta: i64,
    ) -> Result<(), StoreError> {
        if delta == 0 {
            return Ok(());
        }
        let patch = if delta > 0 {
            json!({ "count+": delta })
        } else {
            json!({ "count-": -delta })
        };
        store.update(LABELS_COLLECTION, id, patch).await?;
        if let Some(label) = self.by_id.get_mut(id) {
            label.count += delta;
        }
        Ok(())
    }

    /// Set a label's count outright.
    pub async fn reset_count(
        &mut self,
        store: &dyn RecordStore,
        id: &str,
    ) -> Result<(), StoreError> {
        store
            .update(LABELS_COLLECTION, id, json!({ "count": 0 }))
            .await?;
        if let Some(label) = self.by_id.get_mut(id) {
            label.count = 0;
        }
        Ok(())
    }
}
