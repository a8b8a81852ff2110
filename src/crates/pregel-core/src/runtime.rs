//! Runtime context handed to every node invocation
//!
//! A [`Runtime`] is built per task attempt and gives the node access to:
//!
//! - where it runs: node name, step, task id, checkpoint namespace, thread
//! - the long-term [`Store`] configured on the graph
//! - a [`StreamWriter`] for `custom` and `messages` chunks
//! - the run budget (`remaining_steps`, `is_last_step`) and cancellation
//! - [`Runtime::interrupt`], which pauses the run for human input
//!
//! ```rust,no_run
//! use pregel_core::{node_fn, Runtime};
//! use serde_json::{json, Value};
//!
//! let review = node_fn(|state: Value, runtime: Runtime| async move {
//!     if let Some(writer) = runtime.stream_writer() {
//!         writer.write(json!({"reviewing": state["draft"]}))?;
//!     }
//!     let verdict = runtime.interrupt(json!({"question": "approve draft?"}))?;
//!     Ok(json!({"approved": verdict == json!("yes")}))
//! });
//! ```

use crate::config::{Durability, RunConfig};
use crate::error::{GraphError, Result};
use crate::interrupt::{interrupt_id, Scratchpad};
use crate::pregel::types::Interrupt;
use crate::store::Store;
use crate::stream::{StreamMultiplexer, StreamWriter};
use parking_lot::Mutex;
use pregel_checkpoint::CheckpointSaver;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a nested graph inherits from the task that runs it.
#[derive(Clone, Default)]
pub(crate) struct ParentContext {
    pub checkpointer: Option<Arc<dyn CheckpointSaver>>,
    pub store: Option<Arc<dyn Store>>,
    /// Multiplexer for the nested graph's chunks; only set when the run streams subgraphs
    pub stream: Option<StreamMultiplexer>,
    /// The parent run is resuming from a checkpoint
    pub resuming: bool,
    /// Resume values keyed by interrupt id, passed down to nested graphs
    pub resume_map: Option<Arc<HashMap<String, Value>>>,
    /// Config of the parent run, inherited by nested runs
    pub config: RunConfig,
}

/// Execution context of one task attempt.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) node: String,
    pub(crate) step: i64,
    pub(crate) task_id: String,
    pub(crate) checkpoint_ns: String,
    pub(crate) thread_id: Option<String>,
    pub(crate) store: Option<Arc<dyn Store>>,
    pub(crate) stream_writer: Option<StreamWriter>,
    pub(crate) scratchpad: Arc<Mutex<Scratchpad>>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) remaining_steps: usize,
    pub(crate) recursion_limit: usize,
    pub(crate) durability: Durability,
    pub(crate) parent: ParentContext,
}

impl Runtime {
    /// Runtime not attached to any run; useful to call node functions directly.
    pub fn detached(node: impl Into<String>) -> Self {
        let config = RunConfig::default();
        Self {
            node: node.into(),
            step: 0,
            task_id: crate::constants::NULL_TASK_ID.to_string(),
            checkpoint_ns: String::new(),
            thread_id: None,
            store: None,
            stream_writer: None,
            scratchpad: Arc::new(Mutex::new(Scratchpad::default())),
            cancellation: CancellationToken::new(),
            remaining_steps: config.recursion_limit,
            recursion_limit: config.recursion_limit,
            durability: Durability::default(),
            parent: ParentContext {
                config,
                ..ParentContext::default()
            },
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn step(&self) -> i64 {
        self.step
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Namespace of this task; nested graphs checkpoint under it.
    pub fn checkpoint_ns(&self) -> &str {
        &self.checkpoint_ns
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn store(&self) -> Option<&Arc<dyn Store>> {
        self.store.as_ref()
    }

    /// Writer for `custom` and `messages` chunks, when the run streams.
    pub fn stream_writer(&self) -> Option<&StreamWriter> {
        self.stream_writer.as_ref()
    }

    /// Supersteps left before the recursion limit is hit, this one included.
    pub fn remaining_steps(&self) -> usize {
        self.remaining_steps
    }

    pub fn is_last_step(&self) -> bool {
        self.remaining_steps <= 1
    }

    pub fn recursion_limit(&self) -> usize {
        self.recursion_limit
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Pause the run and surface `value` to the caller.
    ///
    /// Returns the resume value once the thread is resumed. Each call inside a
    /// node consumes the next resume value in order, so a node may interrupt
    /// several times; on every resume the node re-runs from the top and the
    /// earlier calls return their recorded answers.
    pub fn interrupt(&self, value: Value) -> Result<Value> {
        let (index, answer) = self.scratchpad.lock().next_resume();
        match answer {
            Some(answer) => Ok(answer),
            None => Err(GraphError::Interrupt(vec![Interrupt::new(
                value,
                interrupt_id(&self.checkpoint_ns, index),
            )])),
        }
    }

    /// Take the pending step-wide resume value, for handing to a nested graph.
    pub(crate) fn take_null_resume(&self) -> Option<Value> {
        self.scratchpad.lock().null_resume.take()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("node", &self.node)
            .field("step", &self.step)
            .field("task_id", &self.task_id)
            .field("checkpoint_ns", &self.checkpoint_ns)
            .field("thread_id", &self.thread_id)
            .field("remaining_steps", &self.remaining_steps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interrupt_without_resume_pauses() {
        let runtime = Runtime::detached("review");
        let err = runtime.interrupt(json!("approve?")).unwrap_err();
        let interrupts = err.interrupts().unwrap();
        assert_eq!(interrupts.len(), 1);
        assert_eq!(interrupts[0].value, json!("approve?"));
        assert_eq!(interrupts[0].id, interrupt_id("", 0));
    }

    #[test]
    fn test_interrupt_replays_resume_values_in_order() {
        let runtime = Runtime::detached("review");
        runtime.scratchpad.lock().resume = vec![json!("first")];
        runtime.scratchpad.lock().null_resume = Some(json!("second"));

        assert_eq!(runtime.interrupt(json!("q1")).unwrap(), json!("first"));
        assert_eq!(runtime.interrupt(json!("q2")).unwrap(), json!("second"));
        let err = runtime.interrupt(json!("q3")).unwrap_err();
        assert_eq!(err.interrupts().unwrap()[0].id, interrupt_id("", 2));
    }

    #[test]
    fn test_budget_accessors() {
        let mut runtime = Runtime::detached("n");
        assert!(!runtime.is_last_step());
        runtime.remaining_steps = 1;
        assert!(runtime.is_last_step());
        assert!(!runtime.is_cancelled());
    }
}
