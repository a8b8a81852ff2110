//! Checkpoint saver trait
//!
//! A [`CheckpointSaver`] persists checkpoints per `(thread_id, checkpoint_ns)`
//! together with the pending writes of the tasks that ran against them. The
//! engine calls it from the execution loop and from the state inspection /
//! update APIs; implementations must be safe to share across tasks.

use crate::{
    checkpoint::{
        ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata,
        CheckpointTuple,
    },
    error::Result,
};
use async_trait::async_trait;
use futures::stream::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;

/// Stream of checkpoint tuples, newest first.
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send + 'static>>;

#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch a checkpoint
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|tuple| tuple.checkpoint))
    }

    /// Fetch a checkpoint tuple.
    ///
    /// With `config.checkpoint_id` set, returns that checkpoint; otherwise the
    /// latest checkpoint of the thread/namespace.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// List checkpoints newest first.
    ///
    /// * `config` - restricts to a thread and namespace
    /// * `filter` - metadata key/value pairs that must all match
    /// * `before` - only checkpoints created before this checkpoint id
    /// * `limit` - maximum number of results
    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream>;

    /// Store a checkpoint.
    ///
    /// `config.checkpoint_id`, when set, is recorded as the parent of the new
    /// checkpoint. Returns the config addressing the stored checkpoint.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig>;

    /// Store writes produced by `task_id` against the checkpoint in `config`.
    ///
    /// Writing the same channels for the same task again replaces the earlier
    /// values, so retried or resumed tasks do not duplicate writes.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: String,
    ) -> Result<()>;

    /// Delete every checkpoint and write of a thread
    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let _ = thread_id;
        Ok(())
    }

    /// Version to assign to a channel whose current version is `current`.
    fn get_next_version(&self, current: Option<&ChannelVersion>) -> ChannelVersion {
        ChannelVersion::increment(current)
    }
}
