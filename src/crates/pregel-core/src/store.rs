//! Long-term store shared across threads and runs
//!
//! A [`Store`] is a namespaced key-value interface that nodes can use for
//! memory that outlives a single thread (user profiles, learned facts, ...).
//! The graph holds it behind an `Arc` and hands it to every node through
//! [`Runtime::store`](crate::runtime::Runtime::store). The engine calls
//! [`Store::start`] before the first superstep and [`Store::stop`] once the
//! run ends, so implementations backed by connections or batchers can manage
//! their lifecycle.
//!
//! Namespaces are hierarchical paths such as `["users", "alice", "prefs"]`.
//!
//! ```rust
//! use pregel_core::store::{InMemoryStore, Store};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), pregel_core::store::StoreError> {
//! let store = InMemoryStore::new();
//! let ns = vec!["users".to_string(), "alice".to_string()];
//! store.put(&ns, "prefs", json!({"theme": "dark"})).await?;
//!
//! let item = store.get(&ns, "prefs").await?.unwrap();
//! assert_eq!(item.value["theme"], "dark");
//!
//! let found = store.search(&["users".to_string()], None, 10, 0).await?;
//! assert_eq!(found.len(), 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Store error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A stored value with its address and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Item>>;

    /// Insert or replace the value at `(namespace, key)`.
    async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<()>;

    /// Returns whether an item was removed.
    async fn delete(&self, namespace: &[String], key: &str) -> Result<bool>;

    /// Items whose namespace starts with `namespace_prefix`.
    ///
    /// `filter` keeps items whose value has every given top-level field with
    /// the given value. Results are ordered by namespace, then key.
    async fn search(
        &self,
        namespace_prefix: &[String],
        filter: Option<&HashMap<String, Value>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Item>>;

    /// Distinct namespaces under `prefix`, truncated to `max_depth` segments.
    async fn list_namespaces(
        &self,
        prefix: Option<&[String]>,
        max_depth: Option<usize>,
    ) -> Result<Vec<Vec<String>>>;

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

type Slots = BTreeMap<(Vec<String>, String), Item>;

/// Process-local [`Store`]; clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<Slots>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

fn check_namespace(namespace: &[String]) -> Result<()> {
    if namespace.is_empty() {
        return Err(StoreError::InvalidNamespace("namespace cannot be empty".into()));
    }
    if let Some(label) = namespace.iter().find(|label| label.is_empty() || label.contains('.')) {
        return Err(StoreError::InvalidNamespace(format!(
            "labels must be non-empty and may not contain '.', got {label:?}"
        )));
    }
    Ok(())
}

fn matches_filter(value: &Value, filter: Option<&HashMap<String, Value>>) -> bool {
    filter.map_or(true, |filter| {
        filter.iter().all(|(field, expected)| value.get(field) == Some(expected))
    })
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Item>> {
        Ok(self.data.read().get(&(namespace.to_vec(), key.to_string())).cloned())
    }

    async fn put(&self, namespace: &[String], key: &str, value: Value) -> Result<()> {
        check_namespace(namespace)?;
        let now = Utc::now();
        let mut data = self.data.write();
        let slot = (namespace.to_vec(), key.to_string());
        let created_at = data.get(&slot).map_or(now, |item| item.created_at);
        data.insert(
            slot,
            Item {
                namespace: namespace.to_vec(),
                key: key.to_string(),
                value,
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn delete(&self, namespace: &[String], key: &str) -> Result<bool> {
        Ok(self
            .data
            .write()
            .remove(&(namespace.to_vec(), key.to_string()))
            .is_some())
    }

    async fn search(
        &self,
        namespace_prefix: &[String],
        filter: Option<&HashMap<String, Value>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Item>> {
        let data = self.data.read();
        Ok(data
            .values()
            .filter(|item| item.namespace.starts_with(namespace_prefix))
            .filter(|item| matches_filter(&item.value, filter))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_namespaces(
        &self,
        prefix: Option<&[String]>,
        max_depth: Option<usize>,
    ) -> Result<Vec<Vec<String>>> {
        let data = self.data.read();
        let namespaces: BTreeSet<Vec<String>> = data
            .keys()
            .map(|(ns, _)| ns)
            .filter(|ns| prefix.map_or(true, |prefix| ns.starts_with(prefix)))
            .map(|ns| match max_depth {
                Some(depth) => ns.iter().take(depth).cloned().collect(),
                None => ns.clone(),
            })
            .collect();
        Ok(namespaces.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryStore::new();
        store.put(&ns(&["users", "1"]), "name", json!("Alice")).await.unwrap();

        let item = store.get(&ns(&["users", "1"]), "name").await.unwrap().unwrap();
        assert_eq!(item.value, json!("Alice"));
        assert_eq!(item.namespace, ns(&["users", "1"]));

        assert!(store.delete(&ns(&["users", "1"]), "name").await.unwrap());
        assert!(!store.delete(&ns(&["users", "1"]), "name").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_created_at() {
        let store = InMemoryStore::new();
        store.put(&ns(&["a"]), "k", json!(1)).await.unwrap();
        let first = store.get(&ns(&["a"]), "k").await.unwrap().unwrap();
        store.put(&ns(&["a"]), "k", json!(2)).await.unwrap();
        let second = store.get(&ns(&["a"]), "k").await.unwrap().unwrap();

        assert_eq!(second.value, json!(2));
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_namespace() {
        let store = InMemoryStore::new();
        assert!(store.put(&[], "k", json!(1)).await.is_err());
        assert!(store.put(&ns(&["a.b"]), "k", json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_search_with_prefix_filter_and_paging() {
        let store = InMemoryStore::new();
        store.put(&ns(&["docs", "a"]), "1", json!({"kind": "note"})).await.unwrap();
        store.put(&ns(&["docs", "a"]), "2", json!({"kind": "todo"})).await.unwrap();
        store.put(&ns(&["docs", "b"]), "3", json!({"kind": "note"})).await.unwrap();
        store.put(&ns(&["other"]), "4", json!({"kind": "note"})).await.unwrap();

        let all = store.search(&ns(&["docs"]), None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 3);

        let mut filter = HashMap::new();
        filter.insert("kind".to_string(), json!("note"));
        let notes = store.search(&ns(&["docs"]), Some(&filter), 10, 0).await.unwrap();
        assert_eq!(
            notes.iter().map(|i| i.key.as_str()).collect::<Vec<_>>(),
            vec!["1", "3"]
        );

        let page = store.search(&ns(&["docs"]), None, 1, 1).await.unwrap();
        assert_eq!(page[0].key, "2");
    }

    #[tokio::test]
    async fn test_list_namespaces_with_depth() {
        let store = InMemoryStore::new();
        store.put(&ns(&["users", "1", "prefs"]), "k", json!(1)).await.unwrap();
        store.put(&ns(&["users", "2", "prefs"]), "k", json!(1)).await.unwrap();
        store.put(&ns(&["teams", "x"]), "k", json!(1)).await.unwrap();

        let users = store
            .list_namespaces(Some(&ns(&["users"])), Some(2))
            .await
            .unwrap();
        assert_eq!(users, vec![ns(&["users", "1"]), ns(&["users", "2"])]);

        let top = store.list_namespaces(None, Some(1)).await.unwrap();
        assert_eq!(top, vec![ns(&["teams"]), ns(&["users"])]);
    }
}
