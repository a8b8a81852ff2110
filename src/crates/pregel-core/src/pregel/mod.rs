//! Pregel-inspired execution engine for stateful graph workflows
//!
//! The Pregel computational model divides execution into **supersteps**:
//!
//! 1. **Plan**: pick the nodes whose trigger channels changed since they last ran
//! 2. **Execute**: run those nodes concurrently against a frozen view of the channels
//! 3. **Update**: apply all writes of the step at once, in a deterministic order
//! 4. **Checkpoint**: save a snapshot of the channels and their versions
//!
//! Execution stops when no node is triggered, when the recursion limit is
//! reached, or when an interrupt pauses the run.
//!
//! # Execution Flow
//!
//! ```text
//! input ──> input checkpoint (step -1)
//!             │
//!             ├─> step 0: run triggered nodes ──> loop checkpoint
//!             │
//!             ├─> step 1: run triggered nodes ──> loop checkpoint
//!             │
//!             └─> no task triggered ──> done
//! ```
//!
//! ## With Interrupts (Human-in-the-Loop)
//!
//! ```text
//! step 1: node calls runtime.interrupt(..)
//!   └─> writes (__interrupt__) saved against the current checkpoint
//!   └─> run returns {"__interrupt__": [...]} to the caller
//!
//! [caller invokes again with Command::resume(answer)]
//!   │
//!   └─> step 1 re-runs only the interrupted task; finished tasks keep their writes
//! ```
//!
//! # Module Organization
//!
//! - [`types`] - task and snapshot types
//! - [`algo`] - task preparation and write application
//! - [`write`] - mapping node outputs to channel writes
//! - [`io`] - mapping inputs and outputs
//! - [`checkpoint`] - durability-aware checkpoint writer
//! - [`loop_impl`] - the per-run state machine
//! - [`runner`] - concurrent task execution
//! - [`execution`] - `invoke` / `stream`
//! - [`state`] - state inspection and manual updates

pub mod algo;
pub(crate) mod checkpoint;
pub mod execution;
pub mod io;
pub(crate) mod loop_impl;
pub(crate) mod runner;
pub mod state;
pub mod types;
pub mod write;

pub use algo::{default_task_id, TaskIdFn};
pub use types::{
    Interrupt, PregelExecutableTask, PregelTask, PregelTaskWrites, StateSnapshot, TaskPath,
};
pub use write::ChannelWrite;

use crate::cache::Cache;
use crate::constants::{RESERVED, TASKS};
use crate::error::{GraphError, Result};
use crate::interrupt::ALL_NODES;
use crate::node::PregelNode;
use crate::retry::RetryPolicy;
use crate::store::Store;
use pregel_checkpoint::{Channel, CheckpointSaver};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A compiled graph ready to run: nodes, the channels they communicate
/// through, and the services runs persist to.
#[derive(Clone)]
pub struct Pregel {
    pub(crate) name: String,
    pub(crate) nodes: BTreeMap<String, Arc<PregelNode>>,
    pub(crate) channels: HashMap<String, Channel>,
    /// Writers mapping graph input to channel writes
    pub(crate) input_writers: Vec<ChannelWrite>,
    /// Channels exposed as the graph's state (input, output and `values` stream)
    pub(crate) state_keys: Vec<String>,
    pub(crate) trigger_to_nodes: HashMap<String, Vec<String>>,
    pub(crate) interrupt_before: Vec<String>,
    pub(crate) interrupt_after: Vec<String>,
    pub(crate) checkpointer: Option<Arc<dyn CheckpointSaver>>,
    pub(crate) store: Option<Arc<dyn Store>>,
    pub(crate) cache: Option<Arc<dyn Cache>>,
    /// Applies to nodes without their own policy
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) task_id_fn: TaskIdFn,
}

impl Pregel {
    pub fn new(name: impl Into<String>) -> Self {
        let mut channels = HashMap::new();
        channels.insert(TASKS.to_string(), Channel::topic(false));
        Self {
            name: name.into(),
            nodes: BTreeMap::new(),
            channels,
            input_writers: Vec::new(),
            state_keys: Vec::new(),
            trigger_to_nodes: HashMap::new(),
            interrupt_before: Vec::new(),
            interrupt_after: Vec::new(),
            checkpointer: None,
            store: None,
            cache: None,
            retry_policy: None,
            task_id_fn: Arc::new(default_task_id),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_channel(mut self, name: impl Into<String>, channel: Channel) -> Self {
        self.channels.insert(name.into(), channel);
        self
    }

    pub fn with_state_keys(mut self, keys: Vec<String>) -> Self {
        self.state_keys = keys;
        self
    }

    /// Add a node, indexing its triggers for scheduling.
    pub fn with_node(mut self, node: PregelNode) -> Self {
        for trigger in &node.triggers {
            let subscribers = self.trigger_to_nodes.entry(trigger.clone()).or_default();
            if !subscribers.contains(&node.name) {
                subscribers.push(node.name.clone());
            }
        }
        self.nodes.insert(node.name.clone(), Arc::new(node));
        self
    }

    pub fn with_input_writers(mut self, writers: Vec<ChannelWrite>) -> Self {
        self.input_writers = writers;
        self
    }

    pub fn with_interrupt_before(mut self, nodes: Vec<String>) -> Self {
        self.interrupt_before = nodes;
        self
    }

    pub fn with_interrupt_after(mut self, nodes: Vec<String>) -> Self {
        self.interrupt_after = nodes;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Replace the derivation of task ids.
    pub fn with_task_id_fn(mut self, task_id_fn: TaskIdFn) -> Self {
        self.task_id_fn = task_id_fn;
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn checkpointer(&self) -> Option<&Arc<dyn CheckpointSaver>> {
        self.checkpointer.as_ref()
    }

    pub fn store(&self) -> Option<&Arc<dyn Store>> {
        self.store.as_ref()
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn state_keys(&self) -> &[String] {
        &self.state_keys
    }

    /// Check that every channel and node the graph refers to exists.
    pub fn validate(&self) -> Result<()> {
        for (name, node) in &self.nodes {
            if RESERVED.contains(&name.as_str()) {
                return Err(GraphError::validation(format!("node name `{name}` is reserved")));
            }
            if node.triggers.is_empty() {
                return Err(GraphError::validation(format!("node `{name}` has no triggers")));
            }
            for channel in node.triggers.iter().chain(&node.channels) {
                self.require_channel(channel, || format!("node `{name}`"))?;
            }
            for writer in &node.writers {
                self.validate_writer(writer, || format!("writer of node `{name}`"))?;
            }
        }
        for writer in &self.input_writers {
            self.validate_writer(writer, || "input writer".to_string())?;
        }
        for key in &self.state_keys {
            self.require_channel(key, || "state keys".to_string())?;
        }
        for node in self.interrupt_before.iter().chain(&self.interrupt_after) {
            if node != ALL_NODES && !self.nodes.contains_key(node) {
                return Err(GraphError::validation(format!(
                    "interrupt node `{node}` is not in the graph"
                )));
            }
        }
        Ok(())
    }

    fn validate_writer(&self, writer: &ChannelWrite, owner: impl Fn() -> String) -> Result<()> {
        match writer {
            ChannelWrite::State { keys } => keys
                .iter()
                .try_for_each(|key| self.require_channel(key, &owner)),
            ChannelWrite::Edge { channel, .. } => self.require_channel(channel, &owner),
            ChannelWrite::Branch(_) => Ok(()),
        }
    }

    fn require_channel(&self, channel: &str, owner: impl Fn() -> String) -> Result<()> {
        if self.channels.contains_key(channel) {
            Ok(())
        } else {
            Err(GraphError::validation(format!(
                "{} refers to unknown channel `{channel}`",
                owner()
            )))
        }
    }
}

impl fmt::Debug for Pregel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut channels: Vec<&String> = self.channels.keys().collect();
        channels.sort();
        f.debug_struct("Pregel")
            .field("name", &self.name)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("channels", &channels)
            .field("state_keys", &self.state_keys)
            .field("interrupt_before", &self.interrupt_before)
            .field("interrupt_after", &self.interrupt_after)
            .field("checkpointer", &self.checkpointer.is_some())
            .finish()
    }
}
