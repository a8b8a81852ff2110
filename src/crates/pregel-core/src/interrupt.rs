//! Human-in-the-loop interrupts
//!
//! A run can pause in two ways:
//!
//! - **Static breakpoints** ([`InterruptConfig`]) pause before or after the
//!   listed nodes run. The step's tasks are prepared (or applied) and the run
//!   returns with an empty `__interrupt__` entry.
//! - **Dynamic interrupts** are raised from inside a node with
//!   [`Runtime::interrupt`](crate::runtime::Runtime::interrupt). The node's
//!   task stops, the value is surfaced under `__interrupt__`, and the task is
//!   re-run from the top when the thread is resumed. On the re-run the same
//!   `interrupt` call returns the resume value instead of pausing.
//!
//! Resuming takes a [`Command`](crate::Command) with `resume` set: either one
//! value, handed to the next pending interrupt of every interrupted task, or
//! a map from interrupt id to value. Interrupt ids are derived from the task's
//! checkpoint namespace and the position of the call inside the node, so they
//! are stable across re-runs.

use crate::constants::NULL_TASK_ID;
use crate::constants::RESUME;
use pregel_checkpoint::PendingWrite;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Marker that matches every node in an interrupt list
pub const ALL_NODES: &str = "*";

/// Nodes to pause before or after.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterruptConfig {
    pub interrupt_before: Vec<String>,
    pub interrupt_after: Vec<String>,
}

impl InterruptConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interrupt_before<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_before = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interrupt_after<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_after = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interrupt_before_all(mut self) -> Self {
        self.interrupt_before = vec![ALL_NODES.to_string()];
        self
    }

    pub fn with_interrupt_after_all(mut self) -> Self {
        self.interrupt_after = vec![ALL_NODES.to_string()];
        self
    }

    pub fn should_interrupt_before(&self, node: &str) -> bool {
        matches_node(&self.interrupt_before, node)
    }

    pub fn should_interrupt_after(&self, node: &str) -> bool {
        matches_node(&self.interrupt_after, node)
    }
}

pub(crate) fn matches_node(nodes: &[String], node: &str) -> bool {
    nodes.iter().any(|n| n == ALL_NODES || n == node)
}

/// Stable id of the `index`-th interrupt raised by the task running in `task_ns`.
pub fn interrupt_id(task_ns: &str, index: usize) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{task_ns}#{index}").as_bytes()).to_string()
}

/// Resume bookkeeping of one task.
#[derive(Debug, Clone, Default)]
pub(crate) struct Scratchpad {
    /// Answers to this task's interrupts, in call order
    pub resume: Vec<Value>,
    /// Answer for the next unanswered interrupt, shared by all tasks of the step
    pub null_resume: Option<Value>,
    /// Number of `interrupt` calls made by the current attempt
    pub interrupt_counter: usize,
}

impl Scratchpad {
    /// Build from the pending writes of the checkpoint the task runs against.
    pub fn from_pending_writes(task_id: &str, pending_writes: &[PendingWrite]) -> Self {
        let resume = pending_writes
            .iter()
            .filter(|(tid, channel, _)| tid == task_id && channel == RESUME)
            .flat_map(|(_, _, value)| match value {
                Value::Array(values) => values.clone(),
                other => vec![other.clone()],
            })
            .collect();
        let null_resume = pending_writes
            .iter()
            .find(|(tid, channel, _)| tid == NULL_TASK_ID && channel == RESUME)
            .map(|(_, _, value)| value.clone());
        Self {
            resume,
            null_resume,
            interrupt_counter: 0,
        }
    }

    /// Next answer for an `interrupt` call, or `None` when the task must pause.
    ///
    /// Answers taken from the null resume are appended to `resume`, so the
    /// runner can persist them for later re-runs.
    pub fn next_resume(&mut self) -> (usize, Option<Value>) {
        let index = self.interrupt_counter;
        self.interrupt_counter += 1;
        if let Some(value) = self.resume.get(index) {
            return (index, Some(value.clone()));
        }
        match self.null_resume.take() {
            Some(value) => {
                self.resume.push(value.clone());
                (index, Some(value))
            }
            None => (index, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interrupt_config_matching() {
        let config = InterruptConfig::new()
            .with_interrupt_before(["review"])
            .with_interrupt_after_all();
        assert!(config.should_interrupt_before("review"));
        assert!(!config.should_interrupt_before("draft"));
        assert!(config.should_interrupt_after("anything"));
    }

    #[test]
    fn test_interrupt_id_is_stable_and_positional() {
        let a = interrupt_id("review:abc", 0);
        assert_eq!(a, interrupt_id("review:abc", 0));
        assert_ne!(a, interrupt_id("review:abc", 1));
        assert_ne!(a, interrupt_id("review:def", 0));
    }

    #[test]
    fn test_scratchpad_replays_then_consumes_null_resume() {
        let writes: Vec<PendingWrite> = vec![
            ("t1".into(), RESUME.into(), json!(["first"])),
            (NULL_TASK_ID.into(), RESUME.into(), json!("second")),
            ("t2".into(), RESUME.into(), json!(["other"])),
        ];
        let mut pad = Scratchpad::from_pending_writes("t1", &writes);
        assert_eq!(pad.next_resume(), (0, Some(json!("first"))));
        assert_eq!(pad.next_resume(), (1, Some(json!("second"))));
        assert_eq!(pad.next_resume(), (2, None));
        assert_eq!(pad.resume, vec![json!("first"), json!("second")]);
    }
}
