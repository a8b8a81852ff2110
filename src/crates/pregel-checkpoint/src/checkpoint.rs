//! Core checkpoint data structures
//!
//! A [`Checkpoint`] is an immutable snapshot of every channel taken at the end
//! of a superstep. Checkpoints are grouped by thread (and by namespace, for
//! nested graphs) and linked to their parent through
//! [`CheckpointTuple::parent_config`], which is what makes history listing,
//! forking and time travel possible.
//!
//! # Versioning
//!
//! ```text
//!  step -1 (input)         step 0 (loop)           step 1 (loop)
//! ┌────────────────┐      ┌────────────────┐      ┌────────────────┐
//! │ versions:      │      │ versions:      │      │ versions:      │
//! │   x: 1         │ ───▶ │   x: 2         │ ───▶ │   x: 2         │
//! │                │      │   y: 2         │      │   y: 2  z: 3   │
//! │ seen:          │      │ seen:          │      │ seen:          │
//! │   {}           │      │   a: {x: 1}    │      │   b: {y: 2}    │
//! └────────────────┘      └────────────────┘      └────────────────┘
//! ```
//!
//! A node is due to run when a channel it subscribes to carries a version
//! newer than the one recorded for it in `versions_seen`. Versions only ever
//! increase, and only change when a channel is written.
//!
//! # Example
//!
//! ```rust
//! use pregel_checkpoint::{Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource};
//!
//! let checkpoint = Checkpoint::empty();
//! let config = CheckpointConfig::new()
//!     .with_thread_id("thread-1")
//!     .with_checkpoint_id(checkpoint.id.clone());
//! let metadata = CheckpointMetadata::new()
//!     .with_source(CheckpointSource::Input)
//!     .with_step(-1);
//!
//! assert_eq!(config.thread_id.as_deref(), Some("thread-1"));
//! assert_eq!(metadata.step, Some(-1));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a checkpoint. Generated as a UUIDv7, so ids sort by
/// creation time.
pub type CheckpointId = String;

/// A write that has not yet been applied to channels: `(task_id, channel, value)`.
pub type PendingWrite = (String, String, serde_json::Value);

/// Monotonically increasing version of a single channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelVersion {
    Int(i64),
    Float(f64),
    /// Zero-padded string versions, for stores that need lexical ordering.
    String(String),
}

impl ChannelVersion {
    /// The version following `self`.
    pub fn next(&self) -> Self {
        match self {
            ChannelVersion::Int(v) => ChannelVersion::Int(v + 1),
            ChannelVersion::Float(v) => ChannelVersion::Float(v.floor() + 1.0),
            ChannelVersion::String(s) => {
                let current = s
                    .split('.')
                    .next()
                    .and_then(|prefix| prefix.parse::<u64>().ok())
                    .unwrap_or(0);
                ChannelVersion::String(format!("{:032}", current + 1))
            }
        }
    }

    /// Next version after `current`, starting at 1 for channels never written.
    pub fn increment(current: Option<&ChannelVersion>) -> ChannelVersion {
        match current {
            Some(version) => version.next(),
            None => ChannelVersion::Int(1),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ChannelVersion::Int(v) => Some(*v as f64),
            ChannelVersion::Float(v) => Some(*v),
            ChannelVersion::String(_) => None,
        }
    }
}

impl PartialEq for ChannelVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ChannelVersion {}

impl PartialOrd for ChannelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ChannelVersion::Int(a), ChannelVersion::Int(b)) => a.cmp(b),
            (ChannelVersion::String(a), ChannelVersion::String(b)) => a.cmp(b),
            // numeric versions always sort before string versions
            (ChannelVersion::String(_), _) => Ordering::Greater,
            (_, ChannelVersion::String(_)) => Ordering::Less,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => Ordering::Equal,
            },
        }
    }
}

/// Current version of every channel that has ever been written.
pub type ChannelVersions = HashMap<String, ChannelVersion>;

/// What produced a checkpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Input was applied to the graph
    Input,
    /// End of a superstep
    Loop,
    /// Manual state update
    Update,
    /// Copy of another checkpoint
    Fork,
}

/// Metadata stored alongside a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// Superstep number; `-1` for the input checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// Checkpoint ids of parent graphs, keyed by namespace
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parents: HashMap<String, String>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_parents(mut self, parents: HashMap<String, String>) -> Self {
        self.parents = parents;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Whether every key/value in `filter` matches this metadata.
    pub fn matches(&self, filter: &HashMap<String, serde_json::Value>) -> bool {
        let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(self) else {
            return filter.is_empty();
        };
        filter
            .iter()
            .all(|(key, expected)| fields.get(key) == Some(expected))
    }
}

/// Snapshot of all channel state at the end of a superstep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// Format version
    pub v: i32,

    pub id: CheckpointId,

    pub ts: DateTime<Utc>,

    /// Serialized value of every non-empty channel
    pub channel_values: HashMap<String, serde_json::Value>,

    pub channel_versions: ChannelVersions,

    /// Per consumer (node name or `__interrupt__`), the channel versions it
    /// has already reacted to
    pub versions_seen: HashMap<String, ChannelVersions>,

    /// Channels written during the step that produced this checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_channels: Option<Vec<String>>,
}

impl Checkpoint {
    pub const CURRENT_VERSION: i32 = 1;

    /// Fresh time-sortable checkpoint id.
    pub fn new_id() -> CheckpointId {
        Uuid::now_v7().to_string()
    }

    pub fn new(
        id: CheckpointId,
        channel_values: HashMap<String, serde_json::Value>,
        channel_versions: ChannelVersions,
        versions_seen: HashMap<String, ChannelVersions>,
    ) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id,
            ts: Utc::now(),
            channel_values,
            channel_versions,
            versions_seen,
            updated_channels: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(
            Self::new_id(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        )
    }

    /// Copy with a fresh id and timestamp, keeping all channel state.
    pub fn fork(&self) -> Self {
        Self {
            id: Self::new_id(),
            ts: Utc::now(),
            ..self.clone()
        }
    }

    pub fn with_updated_channels(mut self, channels: Vec<String>) -> Self {
        self.updated_channels = Some(channels);
        self
    }

    /// Highest version across all channels.
    pub fn max_version(&self) -> Option<&ChannelVersion> {
        self.channel_versions.values().max()
    }
}

/// Address of a checkpoint: thread, namespace, and optionally a specific id.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,

    /// Namespace of a nested graph; `None` or `""` for the root graph
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_ns: Option<String>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_checkpoint_ns(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(checkpoint_ns.into());
        self
    }

    /// Namespace, defaulting to the root namespace `""`.
    pub fn namespace(&self) -> &str {
        self.checkpoint_ns.as_deref().unwrap_or("")
    }
}

/// A checkpoint together with its address, metadata, parent and pending writes.
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    pub parent_config: Option<CheckpointConfig>,
    pub pending_writes: Vec<PendingWrite>,
}

impl CheckpointTuple {
    pub fn new(
        config: CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self {
            config,
            checkpoint,
            metadata,
            parent_config: None,
            pending_writes: Vec::new(),
        }
    }

    pub fn with_parent_config(mut self, parent_config: CheckpointConfig) -> Self {
        self.parent_config = Some(parent_config);
        self
    }

    pub fn with_pending_writes(mut self, writes: Vec<PendingWrite>) -> Self {
        self.pending_writes = writes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_creation() {
        let checkpoint = Checkpoint::empty();
        assert_eq!(checkpoint.v, Checkpoint::CURRENT_VERSION);
        assert!(checkpoint.channel_values.is_empty());
        assert!(checkpoint.channel_versions.is_empty());
        assert!(checkpoint.versions_seen.is_empty());
    }

    #[test]
    fn test_checkpoint_ids_sort_by_creation() {
        let first = Checkpoint::empty();
        let second = Checkpoint::empty();
        assert!(first.id < second.id);
    }

    #[test]
    fn test_fork_gets_new_id() {
        let mut checkpoint = Checkpoint::empty();
        checkpoint.channel_values.insert("x".into(), json!(1));
        let forked = checkpoint.fork();
        assert_ne!(forked.id, checkpoint.id);
        assert_eq!(forked.channel_values, checkpoint.channel_values);
    }

    #[test]
    fn test_channel_version_increment() {
        assert_eq!(ChannelVersion::Int(1).next(), ChannelVersion::Int(2));
        assert_eq!(ChannelVersion::Float(1.5).next(), ChannelVersion::Float(2.0));
        assert_eq!(ChannelVersion::increment(None), ChannelVersion::Int(1));

        let s = ChannelVersion::String(format!("{:032}", 7));
        assert_eq!(s.next(), ChannelVersion::String(format!("{:032}", 8)));
        assert!(s.next() > s);
    }

    #[test]
    fn test_mixed_numeric_versions_compare() {
        assert!(ChannelVersion::Int(2) > ChannelVersion::Float(1.5));
        assert!(ChannelVersion::Float(3.0) > ChannelVersion::Int(2));
    }

    #[test]
    fn test_checkpoint_metadata_matches_filter() {
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Loop)
            .with_step(3)
            .with_extra("user", json!("alice"));

        let mut filter = HashMap::new();
        filter.insert("source".to_string(), json!("loop"));
        filter.insert("user".to_string(), json!("alice"));
        assert!(metadata.matches(&filter));

        filter.insert("step".to_string(), json!(4));
        assert!(!metadata.matches(&filter));
    }

    #[test]
    fn test_checkpoint_config_namespace_default() {
        let config = CheckpointConfig::new().with_thread_id("thread-1");
        assert_eq!(config.namespace(), "");
        let nested = config.with_checkpoint_ns("child:abc");
        assert_eq!(nested.namespace(), "child:abc");
    }

    proptest! {
        #[test]
        fn prop_next_is_strictly_greater(v in -1_000_000i64..1_000_000) {
            let version = ChannelVersion::Int(v);
            prop_assert!(version.next() > version);
        }
    }
}
