//! In-memory checkpoint saver
//!
//! Keeps every checkpoint of every thread in process memory, organised as
//! `thread_id -> checkpoint_ns -> [entries in creation order]`. Checkpoints are
//! stored serialized, so callers can never mutate a persisted snapshot.
//! Suitable for tests and single-process deployments; nothing survives a
//! restart.

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
        PendingWrite,
    },
    error::{CheckpointError, Result},
    serializer::{JsonSerializer, SerializerProtocol},
    traits::{CheckpointSaver, CheckpointStream},
};
use async_trait::async_trait;
use futures::stream;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CheckpointEntry {
    checkpoint_id: String,
    checkpoint: Vec<u8>,
    metadata: CheckpointMetadata,
    config: CheckpointConfig,
    parent_config: Option<CheckpointConfig>,
    writes: Vec<PendingWrite>,
}

type NamespaceEntries = HashMap<String, Vec<CheckpointEntry>>;
type CheckpointStorage = Arc<RwLock<HashMap<String, NamespaceEntries>>>;

/// In-memory [`CheckpointSaver`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointSaver {
    storage: CheckpointStorage,
    serde: JsonSerializer,
}

fn require_thread(config: &CheckpointConfig) -> Result<&str> {
    config
        .thread_id
        .as_deref()
        .ok_or_else(|| CheckpointError::Invalid("thread_id is required".to_string()))
}

impl InMemoryCheckpointSaver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of threads with at least one checkpoint
    pub async fn thread_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Total number of checkpoints across threads and namespaces
    pub async fn checkpoint_count(&self) -> usize {
        self.storage
            .read()
            .await
            .values()
            .flat_map(|namespaces| namespaces.values())
            .map(Vec::len)
            .sum()
    }

    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }

    fn to_tuple(&self, entry: &CheckpointEntry) -> Result<CheckpointTuple> {
        let checkpoint: Checkpoint = self.serde.loads(&entry.checkpoint)?;
        let mut tuple = CheckpointTuple::new(entry.config.clone(), checkpoint, entry.metadata.clone())
            .with_pending_writes(entry.writes.clone());
        tuple.parent_config = entry.parent_config.clone();
        Ok(tuple)
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let thread_id = require_thread(config)?;
        let storage = self.storage.read().await;
        let Some(entries) = storage
            .get(thread_id)
            .and_then(|namespaces| namespaces.get(config.namespace()))
        else {
            return Ok(None);
        };

        let entry = match &config.checkpoint_id {
            Some(checkpoint_id) => entries.iter().find(|e| &e.checkpoint_id == checkpoint_id),
            None => entries.last(),
        };
        entry.map(|e| self.to_tuple(e)).transpose()
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let storage = self.storage.read().await;
        let thread_filter = config.and_then(|c| c.thread_id.as_deref());
        let ns_filter = config.and_then(|c| c.checkpoint_ns.as_deref());
        let before_id = before.and_then(|b| b.checkpoint_id.as_deref());

        let mut matching: Vec<&CheckpointEntry> = storage
            .iter()
            .filter(|(thread_id, _)| thread_filter.map_or(true, |t| t == thread_id.as_str()))
            .flat_map(|(_, namespaces)| namespaces.iter())
            .filter(|(ns, _)| ns_filter.map_or(true, |n| n == ns.as_str()))
            .flat_map(|(_, entries)| entries.iter())
            .filter(|entry| before_id.map_or(true, |id| entry.checkpoint_id.as_str() < id))
            .filter(|entry| filter.as_ref().map_or(true, |f| entry.metadata.matches(f)))
            .collect();

        // ids are time-sortable, newest first
        matching.sort_by(|a, b| b.checkpoint_id.cmp(&a.checkpoint_id));
        if let Some(limit) = limit {
            matching.truncate(limit);
        }

        let results: Vec<Result<CheckpointTuple>> =
            matching.into_iter().map(|e| self.to_tuple(e)).collect();
        Ok(Box::pin(stream::iter(results)))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        let thread_id = require_thread(config)?.to_string();
        let checkpoint_config = CheckpointConfig {
            thread_id: Some(thread_id.clone()),
            checkpoint_id: Some(checkpoint.id.clone()),
            checkpoint_ns: Some(config.namespace().to_string()),
            extra: config.extra.clone(),
        };
        let entry = CheckpointEntry {
            checkpoint_id: checkpoint.id.clone(),
            checkpoint: self.serde.dumps(&checkpoint)?,
            metadata,
            config: checkpoint_config.clone(),
            parent_config: config.checkpoint_id.as_ref().map(|_| config.clone()),
            writes: Vec::new(),
        };

        let mut storage = self.storage.write().await;
        storage
            .entry(thread_id)
            .or_default()
            .entry(config.namespace().to_string())
            .or_default()
            .push(entry);
        Ok(checkpoint_config)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: String,
    ) -> Result<()> {
        let thread_id = require_thread(config)?;
        let checkpoint_id = config
            .checkpoint_id
            .as_ref()
            .ok_or_else(|| CheckpointError::Invalid("checkpoint_id is required".to_string()))?;

        let mut storage = self.storage.write().await;
        let entry = storage
            .get_mut(thread_id)
            .and_then(|namespaces| namespaces.get_mut(config.namespace()))
            .and_then(|entries| entries.iter_mut().find(|e| &e.checkpoint_id == checkpoint_id))
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.clone()))?;

        entry
            .writes
            .retain(|(tid, channel, _)| tid != &task_id || !writes.iter().any(|(c, _)| c == channel));
        entry.writes.extend(
            writes
                .into_iter()
                .map(|(channel, value)| (task_id.clone(), channel, value)),
        );
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.storage.write().await.remove(thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSource;
    use futures::StreamExt;
    use serde_json::json;

    fn thread(id: &str) -> CheckpointConfig {
        CheckpointConfig::new().with_thread_id(id)
    }

    #[tokio::test]
    async fn test_save_and_load_checkpoint() {
        let saver = InMemoryCheckpointSaver::new();
        let checkpoint = Checkpoint::empty();
        let metadata = CheckpointMetadata::new().with_source(CheckpointSource::Input);

        let saved_config = saver
            .put(&thread("thread-1"), checkpoint.clone(), metadata, HashMap::new())
            .await
            .unwrap();
        assert_eq!(saved_config.checkpoint_id.as_deref(), Some(checkpoint.id.as_str()));

        let tuple = saver.get_tuple(&saved_config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint, checkpoint);
        assert!(tuple.parent_config.is_none());
    }

    #[tokio::test]
    async fn test_parent_config_links_checkpoints() {
        let saver = InMemoryCheckpointSaver::new();
        let first = saver
            .put(&thread("t"), Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();
        let second = saver
            .put(&first, Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();

        let latest = saver.get_tuple(&thread("t")).await.unwrap().unwrap();
        assert_eq!(latest.config.checkpoint_id, second.checkpoint_id);
        assert_eq!(latest.parent_config.unwrap().checkpoint_id, first.checkpoint_id);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let saver = InMemoryCheckpointSaver::new();
        saver
            .put(&thread("t"), Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();
        let child = thread("t").with_checkpoint_ns("child:1");
        assert!(saver.get_tuple(&child).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_newest_first_with_filters() {
        let saver = InMemoryCheckpointSaver::new();
        let mut config = thread("thread-1");
        let mut ids = Vec::new();
        for step in 0..4 {
            let checkpoint = Checkpoint::empty();
            ids.push(checkpoint.id.clone());
            let metadata = CheckpointMetadata::new()
                .with_source(CheckpointSource::Loop)
                .with_step(step);
            config = saver.put(&config, checkpoint, metadata, HashMap::new()).await.unwrap();
        }

        let all: Vec<_> = saver
            .list(Some(&thread("thread-1")), None, None, None)
            .await
            .unwrap()
            .collect()
            .await;
        let listed: Vec<String> = all.into_iter().map(|t| t.unwrap().checkpoint.id).collect();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(listed, expected);

        let before = thread("thread-1").with_checkpoint_id(ids[2].clone());
        let older: Vec<_> = saver
            .list(Some(&thread("thread-1")), None, Some(&before), Some(1))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].as_ref().unwrap().checkpoint.id, ids[1]);

        let mut filter = HashMap::new();
        filter.insert("step".to_string(), json!(3));
        let filtered: Vec<_> = saver
            .list(None, Some(filter), None, None)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(filtered.len(), 1);
    }

    #[tokio::test]
    async fn test_put_writes_replaces_same_channel_for_task() {
        let saver = InMemoryCheckpointSaver::new();
        let saved = saver
            .put(&thread("t"), Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();

        saver
            .put_writes(&saved, vec![("__resume__".into(), json!(["a"]))], "task-1".into())
            .await
            .unwrap();
        saver
            .put_writes(&saved, vec![("__interrupt__".into(), json!([]))], "task-1".into())
            .await
            .unwrap();
        saver
            .put_writes(&saved, vec![("__resume__".into(), json!(["a", "b"]))], "task-1".into())
            .await
            .unwrap();

        let tuple = saver.get_tuple(&saved).await.unwrap().unwrap();
        assert_eq!(tuple.pending_writes.len(), 2);
        assert!(tuple
            .pending_writes
            .contains(&("task-1".to_string(), "__resume__".to_string(), json!(["a", "b"]))));
    }

    #[tokio::test]
    async fn test_put_writes_requires_existing_checkpoint() {
        let saver = InMemoryCheckpointSaver::new();
        let config = thread("t").with_checkpoint_id("missing");
        let err = saver
            .put_writes(&config, vec![("x".into(), json!(1))], "task".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_thread_and_clear() {
        let saver = InMemoryCheckpointSaver::new();
        for id in ["a", "b"] {
            saver
                .put(&thread(id), Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
                .await
                .unwrap();
        }
        assert_eq!(saver.thread_count().await, 2);
        saver.delete_thread("a").await.unwrap();
        assert_eq!(saver.thread_count().await, 1);
        saver.clear().await;
        assert_eq!(saver.checkpoint_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_thread_id_is_invalid() {
        let saver = InMemoryCheckpointSaver::new();
        let err = saver.get_tuple(&CheckpointConfig::new()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Invalid(_)));
    }
}
