//! Per-run configuration
//!
//! [`RunConfig`] is passed by value to every run. It addresses the thread to
//! run on, bounds the run (recursion limit, step timeout, concurrency) and
//! selects what gets streamed and persisted. It can be loaded from YAML:
//!
//! ```rust
//! use pregel_core::{Durability, RunConfig, StreamMode};
//!
//! let config = RunConfig::from_yaml_str(
//!     r#"
//! thread_id: support-42
//! recursion_limit: 50
//! durability: sync
//! stream_mode: [updates, custom]
//! "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.thread_id.as_deref(), Some("support-42"));
//! assert_eq!(config.recursion_limit, 50);
//! assert_eq!(config.durability().unwrap(), Durability::Sync);
//! assert_eq!(config.stream_mode, vec![StreamMode::Updates, StreamMode::Custom]);
//! ```

use crate::error::{GraphError, Result};
use crate::stream::StreamMode;
use pregel_checkpoint::CheckpointConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// When checkpoints reach the checkpointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Only when the run exits (finishes, fails or is interrupted)
    Exit,
    /// After every step, written in the background in order
    #[default]
    Async,
    /// After every step, before the next step starts
    Sync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub thread_id: Option<String>,

    /// Namespace of the graph level to address; empty for the root graph
    pub checkpoint_ns: Option<String>,

    /// Resume from (or fork off) this checkpoint instead of the latest one
    pub checkpoint_id: Option<String>,

    /// Maximum number of supersteps per run
    pub recursion_limit: usize,

    /// Maximum number of tasks running at once
    pub max_concurrency: Option<usize>,

    pub durability: Option<Durability>,

    /// Deprecated: `false` means [`Durability::Exit`], `true` means
    /// [`Durability::Async`]. Cannot be combined with `durability`.
    pub checkpoint_during: Option<bool>,

    pub stream_mode: Vec<StreamMode>,

    /// Stream events of nested graphs too
    pub subgraphs: bool,

    /// Extra nodes to pause before, on top of the compiled ones
    pub interrupt_before: Option<Vec<String>>,

    /// Extra nodes to pause after, on top of the compiled ones
    pub interrupt_after: Option<Vec<String>>,

    /// Upper bound for a single superstep
    pub step_timeout_ms: Option<u64>,

    pub run_id: Option<String>,

    pub tags: Vec<String>,

    /// Copied into the metadata of every checkpoint of the run
    pub metadata: HashMap<String, Value>,

    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            thread_id: None,
            checkpoint_ns: None,
            checkpoint_id: None,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            max_concurrency: None,
            durability: None,
            checkpoint_during: None,
            stream_mode: vec![StreamMode::Values],
            subgraphs: false,
            interrupt_before: None,
            interrupt_after: None,
            step_timeout_ms: None,
            run_id: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            cancellation: None,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_checkpoint_ns(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(checkpoint_ns.into());
        self
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = Some(durability);
        self
    }

    pub fn with_stream_mode(mut self, mode: StreamMode) -> Self {
        self.stream_mode = vec![mode];
        self
    }

    pub fn with_stream_modes(mut self, modes: Vec<StreamMode>) -> Self {
        self.stream_mode = modes;
        self
    }

    pub fn with_subgraphs(mut self, subgraphs: bool) -> Self {
        self.subgraphs = subgraphs;
        self
    }

    pub fn with_interrupt_before(mut self, nodes: Vec<String>) -> Self {
        self.interrupt_before = Some(nodes);
        self
    }

    pub fn with_interrupt_after(mut self, nodes: Vec<String>) -> Self {
        self.interrupt_after = Some(nodes);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }

    /// Effective durability, resolving the deprecated `checkpoint_during`.
    pub fn durability(&self) -> Result<Durability> {
        match (self.durability, self.checkpoint_during) {
            (Some(_), Some(_)) => Err(GraphError::Configuration(
                "cannot use both `checkpoint_during` and `durability`; use `durability` only".into(),
            )),
            (Some(durability), None) => Ok(durability),
            (None, Some(false)) => Ok(Durability::Exit),
            (None, Some(true)) | (None, None) => Ok(Durability::Async),
        }
    }

    /// Checkpointer address of this run.
    pub fn checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig {
            thread_id: self.thread_id.clone(),
            checkpoint_id: self.checkpoint_id.clone(),
            checkpoint_ns: Some(self.checkpoint_ns.clone().unwrap_or_default()),
            extra: HashMap::new(),
        }
    }
}

impl From<&CheckpointConfig> for RunConfig {
    fn from(config: &CheckpointConfig) -> Self {
        Self {
            thread_id: config.thread_id.clone(),
            checkpoint_ns: config.checkpoint_ns.clone(),
            checkpoint_id: config.checkpoint_id.clone(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.recursion_limit, 25);
        assert_eq!(config.stream_mode, vec![StreamMode::Values]);
        assert_eq!(config.durability().unwrap(), Durability::Async);
        assert!(!config.subgraphs);
    }

    #[test]
    fn test_checkpoint_during_maps_to_durability() {
        let mut config = RunConfig::new();
        config.checkpoint_during = Some(false);
        assert_eq!(config.durability().unwrap(), Durability::Exit);
        config.checkpoint_during = Some(true);
        assert_eq!(config.durability().unwrap(), Durability::Async);
    }

    #[test]
    fn test_checkpoint_during_and_durability_conflict() {
        let mut config = RunConfig::new().with_durability(Durability::Sync);
        config.checkpoint_during = Some(true);
        assert!(matches!(config.durability(), Err(GraphError::Configuration(_))));
    }

    #[test]
    fn test_yaml_partial_config_keeps_defaults() {
        let config = RunConfig::from_yaml_str("thread_id: t1\nmax_concurrency: 4\n").unwrap();
        assert_eq!(config.thread_id.as_deref(), Some("t1"));
        assert_eq!(config.max_concurrency, Some(4));
        assert_eq!(config.recursion_limit, DEFAULT_RECURSION_LIMIT);
    }

    #[test]
    fn test_checkpoint_config_round_trip() {
        let config = RunConfig::new().with_thread_id("t").with_checkpoint_id("c1");
        let address = config.checkpoint_config();
        assert_eq!(address.namespace(), "");
        let back = RunConfig::from(&address);
        assert_eq!(back.thread_id.as_deref(), Some("t"));
        assert_eq!(back.checkpoint_id.as_deref(), Some("c1"));
    }
}
