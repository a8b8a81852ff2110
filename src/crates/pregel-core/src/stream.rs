//! Streaming of run events
//!
//! Every run produces an ordered sequence of [`StreamChunk`]s, each a
//! `(namespace, mode, payload)` triple. The namespace is empty for the root
//! graph and lists `node:task_id` segments for nested graphs (only emitted
//! when the run is configured with `subgraphs: true`).
//!
//! | Mode          | Payload                                                   |
//! |---------------|-----------------------------------------------------------|
//! | `values`      | full output state after the input and every superstep     |
//! | `updates`     | `{node: update}` per finished task                        |
//! | `checkpoints` | the state snapshot of every saved checkpoint              |
//! | `tasks`       | task start (`input`, `triggers`) and result events        |
//! | `debug`       | checkpoints and tasks, wrapped with `type`/`step`/`timestamp` |
//! | `messages`    | `[message, metadata]` pairs emitted by nodes              |
//! | `custom`      | arbitrary values written by nodes                         |
//!
//! The loop owns a [`StreamMultiplexer`] that drops chunks of modes nobody
//! asked for. Nodes reach it through a [`StreamWriter`] on their
//! [`Runtime`](crate::runtime::Runtime).

use crate::error::{GraphError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Path of `node:task_id` segments identifying a (nested) graph run.
pub type Namespace = Vec<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Full state after each step
    #[default]
    Values,
    /// Per-node outputs
    Updates,
    /// Checkpoint and task events with step and timestamp
    Debug,
    Messages,
    Custom,
    Checkpoints,
    Tasks,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMode::Values => "values",
            StreamMode::Updates => "updates",
            StreamMode::Debug => "debug",
            StreamMode::Messages => "messages",
            StreamMode::Custom => "custom",
            StreamMode::Checkpoints => "checkpoints",
            StreamMode::Tasks => "tasks",
        }
    }
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One streamed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub namespace: Namespace,
    pub mode: StreamMode,
    pub payload: Value,
}

impl StreamChunk {
    pub fn new(namespace: Namespace, mode: StreamMode, payload: Value) -> Self {
        Self {
            namespace,
            mode,
            payload,
        }
    }
}

/// Filters chunks by mode and forwards them to the consumer.
///
/// Clones share the consumer; [`StreamMultiplexer::child`] derives the
/// multiplexer of a nested graph.
#[derive(Debug, Clone)]
pub struct StreamMultiplexer {
    modes: Arc<HashSet<StreamMode>>,
    namespace: Namespace,
    tx: mpsc::UnboundedSender<StreamChunk>,
}

impl StreamMultiplexer {
    pub fn new(modes: impl IntoIterator<Item = StreamMode>, tx: mpsc::UnboundedSender<StreamChunk>) -> Self {
        Self {
            modes: Arc::new(modes.into_iter().collect()),
            namespace: Vec::new(),
            tx,
        }
    }

    /// Multiplexer for a graph nested under `segment`.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut namespace = self.namespace.clone();
        namespace.push(segment.into());
        Self {
            modes: Arc::clone(&self.modes),
            namespace,
            tx: self.tx.clone(),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Whether chunks of `mode` reach the consumer, directly or through `debug`.
    pub fn has_mode(&self, mode: StreamMode) -> bool {
        self.modes.contains(&mode)
            || (matches!(mode, StreamMode::Tasks | StreamMode::Checkpoints)
                && self.modes.contains(&StreamMode::Debug))
    }

    /// Send `payload` if `mode` is enabled.
    ///
    /// `tasks` and `checkpoints` payloads are also mirrored into `debug`
    /// when that mode is on. Fails with [`GraphError::Cancelled`] once the
    /// consumer is gone.
    pub fn emit(&self, mode: StreamMode, payload: Value, step: i64) -> Result<()> {
        if matches!(mode, StreamMode::Tasks | StreamMode::Checkpoints)
            && self.modes.contains(&StreamMode::Debug)
        {
            let kind = match mode {
                StreamMode::Checkpoints => "checkpoint",
                _ if payload.get("input").is_some() => "task",
                _ => "task_result",
            };
            self.send(StreamMode::Debug, debug_payload(kind, step, payload.clone()))?;
        }
        if self.modes.contains(&mode) {
            self.send(mode, payload)?;
        }
        Ok(())
    }

    fn send(&self, mode: StreamMode, payload: Value) -> Result<()> {
        self.tx
            .send(StreamChunk::new(self.namespace.clone(), mode, payload))
            .map_err(|_| GraphError::Cancelled)
    }
}

fn debug_payload(kind: &str, step: i64, payload: Value) -> Value {
    json!({
        "type": kind,
        "step": step,
        "timestamp": Utc::now().to_rfc3339(),
        "payload": payload,
    })
}

/// Handle nodes use to emit `custom` and `messages` chunks.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    stream: StreamMultiplexer,
    node: String,
    step: i64,
}

impl StreamWriter {
    pub(crate) fn new(stream: StreamMultiplexer, node: impl Into<String>, step: i64) -> Self {
        Self {
            stream,
            node: node.into(),
            step,
        }
    }

    /// Emit a `custom` chunk.
    pub fn write(&self, data: Value) -> Result<()> {
        self.stream.emit(StreamMode::Custom, data, self.step)
    }

    /// Emit a `messages` chunk tagged with the emitting node and step.
    pub fn write_message(&self, message: Value) -> Result<()> {
        let metadata = json!({
            "langgraph_node": self.node,
            "langgraph_step": self.step,
        });
        self.stream
            .emit(StreamMode::Messages, json!([message, metadata]), self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_modes_are_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = StreamMultiplexer::new([StreamMode::Updates], tx);

        stream.emit(StreamMode::Values, json!({"x": 1}), 0).unwrap();
        stream.emit(StreamMode::Updates, json!({"a": {"x": 1}}), 0).unwrap();

        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.mode, StreamMode::Updates);
        assert!(chunk.namespace.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_debug_wraps_tasks_and_checkpoints() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = StreamMultiplexer::new([StreamMode::Debug], tx);
        assert!(stream.has_mode(StreamMode::Tasks));

        stream
            .emit(StreamMode::Tasks, json!({"id": "t", "name": "a", "input": {}}), 3)
            .unwrap();
        stream
            .emit(StreamMode::Tasks, json!({"id": "t", "name": "a", "result": {}}), 3)
            .unwrap();

        let start = rx.try_recv().unwrap();
        assert_eq!(start.mode, StreamMode::Debug);
        assert_eq!(start.payload["type"], "task");
        assert_eq!(start.payload["step"], 3);
        assert_eq!(rx.try_recv().unwrap().payload["type"], "task_result");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_child_namespace_and_writer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = StreamMultiplexer::new([StreamMode::Custom, StreamMode::Messages], tx);
        let child = stream.child("inner:abc");
        let writer = StreamWriter::new(child, "inner_node", 1);

        writer.write(json!("progress")).unwrap();
        writer.write_message(json!({"content": "hi"})).unwrap();

        let custom = rx.try_recv().unwrap();
        assert_eq!(custom.namespace, vec!["inner:abc".to_string()]);
        assert_eq!(custom.payload, json!("progress"));

        let message = rx.try_recv().unwrap();
        assert_eq!(message.payload[1]["langgraph_node"], "inner_node");
    }

    #[test]
    fn test_emit_after_consumer_dropped_is_cancelled() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let stream = StreamMultiplexer::new([StreamMode::Values], tx);
        assert!(matches!(
            stream.emit(StreamMode::Values, json!({}), 0),
            Err(GraphError::Cancelled)
        ));
    }
}
