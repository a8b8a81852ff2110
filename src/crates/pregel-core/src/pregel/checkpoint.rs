//! Persisting checkpoints and pending writes according to the run's durability
//!
//! | Durability | `put` / `put_writes`                         | `flush`                       |
//! |------------|----------------------------------------------|-------------------------------|
//! | `Sync`     | awaited inline                               | no-op                         |
//! | `Async`    | queued to a background task, in order        | waits for the queue to drain  |
//! | `Exit`     | buffered; only the latest checkpoint is kept | writes the buffer             |
//!
//! Every mode reports the address of the new checkpoint immediately, so the
//! loop never waits on storage to continue with the next step.

use crate::config::Durability;
use crate::error::{GraphError, Result};
use pregel_checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

enum WriteOp {
    Put {
        config: CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    },
    PutWrites {
        config: CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: String,
    },
    Flush(oneshot::Sender<Result<()>>),
}

struct PendingCheckpoint {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    new_versions: ChannelVersions,
}

pub(crate) enum CheckpointWriter {
    /// The graph has no checkpointer
    Disabled,
    Sync(Arc<dyn CheckpointSaver>),
    Async(mpsc::UnboundedSender<WriteOp>),
    Exit {
        saver: Arc<dyn CheckpointSaver>,
        /// Parent of the first checkpoint put during this run
        parent: Option<CheckpointConfig>,
        latest: Option<PendingCheckpoint>,
        writes: Vec<(String, Vec<(String, Value)>)>,
    },
}

/// Address of `checkpoint` once stored under `parent`'s thread and namespace.
fn address_of(parent: &CheckpointConfig, checkpoint: &Checkpoint) -> CheckpointConfig {
    CheckpointConfig {
        thread_id: parent.thread_id.clone(),
        checkpoint_id: Some(checkpoint.id.clone()),
        checkpoint_ns: Some(parent.namespace().to_string()),
        extra: parent.extra.clone(),
    }
}

impl CheckpointWriter {
    pub fn new(saver: Option<Arc<dyn CheckpointSaver>>, durability: Durability) -> Self {
        let Some(saver) = saver else {
            return CheckpointWriter::Disabled;
        };
        match durability {
            Durability::Sync => CheckpointWriter::Sync(saver),
            Durability::Exit => CheckpointWriter::Exit {
                saver,
                parent: None,
                latest: None,
                writes: Vec::new(),
            },
            Durability::Async => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(background_writer(saver, rx));
                CheckpointWriter::Async(tx)
            }
        }
    }

    pub async fn put(
        &mut self,
        parent: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        let address = address_of(parent, &checkpoint);
        match self {
            CheckpointWriter::Disabled => {}
            CheckpointWriter::Sync(saver) => {
                return Ok(saver.put(parent, checkpoint, metadata, new_versions).await?);
            }
            CheckpointWriter::Async(tx) => {
                tx.send(WriteOp::Put {
                    config: parent.clone(),
                    checkpoint,
                    metadata,
                    new_versions,
                })
                .map_err(|_| GraphError::Execution("checkpoint writer stopped".into()))?;
            }
            CheckpointWriter::Exit {
                parent: first_parent,
                latest,
                writes,
                ..
            } => {
                first_parent.get_or_insert_with(|| parent.clone());
                *latest = Some(PendingCheckpoint {
                    checkpoint,
                    metadata,
                    new_versions,
                });
                writes.clear();
            }
        }
        Ok(address)
    }

    pub async fn put_writes(
        &mut self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<()> {
        match self {
            CheckpointWriter::Disabled => Ok(()),
            CheckpointWriter::Sync(saver) => {
                Ok(saver.put_writes(config, writes, task_id.to_string()).await?)
            }
            CheckpointWriter::Async(tx) => tx
                .send(WriteOp::PutWrites {
                    config: config.clone(),
                    writes,
                    task_id: task_id.to_string(),
                })
                .map_err(|_| GraphError::Execution("checkpoint writer stopped".into())),
            CheckpointWriter::Exit {
                saver,
                latest,
                writes: buffered,
                ..
            } => {
                if latest.is_none() {
                    // the checkpoint the run started from is already stored
                    return Ok(saver.put_writes(config, writes, task_id.to_string()).await?);
                }
                buffered.push((task_id.to_string(), writes));
                Ok(())
            }
        }
    }

    /// Wait until everything handed to the writer is stored.
    pub async fn flush(&mut self) -> Result<()> {
        match self {
            CheckpointWriter::Disabled | CheckpointWriter::Sync(_) => Ok(()),
            CheckpointWriter::Async(tx) => {
                let (done_tx, done_rx) = oneshot::channel();
                tx.send(WriteOp::Flush(done_tx))
                    .map_err(|_| GraphError::Execution("checkpoint writer stopped".into()))?;
                done_rx
                    .await
                    .map_err(|_| GraphError::Execution("checkpoint writer stopped".into()))?
            }
            CheckpointWriter::Exit {
                saver,
                parent,
                latest,
                writes,
            } => {
                let Some(pending) = latest.take() else {
                    return Ok(());
                };
                let parent = parent.take().unwrap_or_default();
                let stored = saver
                    .put(&parent, pending.checkpoint, pending.metadata, pending.new_versions)
                    .await?;
                for (task_id, task_writes) in writes.drain(..) {
                    saver.put_writes(&stored, task_writes, task_id).await?;
                }
                debug!(checkpoint_id = ?stored.checkpoint_id, "flushed checkpoint on exit");
                Ok(())
            }
        }
    }
}

async fn background_writer(saver: Arc<dyn CheckpointSaver>, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    let mut failure: Option<GraphError> = None;
    while let Some(op) = rx.recv().await {
        let result = match op {
            WriteOp::Flush(done) => {
                let _ = done.send(failure.take().map_or(Ok(()), Err));
                continue;
            }
            _ if failure.is_some() => continue,
            WriteOp::Put {
                config,
                checkpoint,
                metadata,
                new_versions,
            } => saver
                .put(&config, checkpoint, metadata, new_versions)
                .await
                .map(|_| ()),
            WriteOp::PutWrites {
                config,
                writes,
                task_id,
            } => saver.put_writes(&config, writes, task_id).await,
        };
        if let Err(err) = result {
            error!(error = %err, "background checkpoint write failed");
            failure = Some(err.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pregel_checkpoint::InMemoryCheckpointSaver;
    use serde_json::json;

    fn root() -> CheckpointConfig {
        CheckpointConfig::new().with_thread_id("t").with_checkpoint_ns("")
    }

    #[tokio::test]
    async fn test_async_writer_persists_in_order() {
        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let mut writer = CheckpointWriter::new(Some(saver.clone()), Durability::Async);

        let checkpoint = Checkpoint::empty();
        let address = writer
            .put(&root(), checkpoint.clone(), CheckpointMetadata::new(), ChannelVersions::new())
            .await
            .unwrap();
        assert_eq!(address.checkpoint_id.as_deref(), Some(checkpoint.id.as_str()));
        writer
            .put_writes(&address, vec![("x".into(), json!(1))], "task-1")
            .await
            .unwrap();
        writer.flush().await.unwrap();

        let tuple = saver.get_tuple(&address).await.unwrap().unwrap();
        assert_eq!(tuple.pending_writes.len(), 1);
    }

    #[tokio::test]
    async fn test_exit_writer_keeps_only_latest_checkpoint() {
        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let mut writer = CheckpointWriter::new(Some(saver.clone()), Durability::Exit);

        let first = writer
            .put(&root(), Checkpoint::empty(), CheckpointMetadata::new(), ChannelVersions::new())
            .await
            .unwrap();
        writer
            .put_writes(&first, vec![("x".into(), json!(1))], "stale")
            .await
            .unwrap();
        let second = writer
            .put(&first, Checkpoint::empty(), CheckpointMetadata::new(), ChannelVersions::new())
            .await
            .unwrap();
        writer
            .put_writes(&second, vec![("x".into(), json!(2))], "task")
            .await
            .unwrap();
        assert_eq!(saver.checkpoint_count().await, 0);

        writer.flush().await.unwrap();
        assert_eq!(saver.checkpoint_count().await, 1);
        let tuple = saver.get_tuple(&second).await.unwrap().unwrap();
        assert_eq!(tuple.pending_writes, vec![("task".to_string(), "x".to_string(), json!(2))]);
    }

    #[tokio::test]
    async fn test_sync_writer_surfaces_errors() {
        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let mut writer = CheckpointWriter::new(Some(saver), Durability::Sync);
        let missing = root().with_checkpoint_id("missing");
        let err = writer
            .put_writes(&missing, vec![("x".into(), json!(1))], "task")
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Checkpoint(_)));
    }
}
