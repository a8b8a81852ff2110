//! Task and snapshot types shared by the algorithm, the loop and the façade.

use crate::cache::CacheKey;
use crate::constants::{INPUT, PULL, PUSH};
use crate::interrupt::Scratchpad;
use crate::node::PregelNode;
use crate::retry::RetryPolicy;
use parking_lot::Mutex;
use pregel_checkpoint::{CheckpointConfig, CheckpointMetadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// How a task came to exist.
///
/// The derived order (input writes, then pulled nodes by name, then pushed
/// packets by index) is the order in which writes of one step are applied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "lowercase")]
pub enum TaskPath {
    /// Graph input or a manual state update
    Input,
    /// A node triggered by channel updates
    Pull(String),
    /// The n-th `Send` packet of the step
    Push(usize),
}

impl TaskPath {
    pub fn marker(&self) -> &'static str {
        match self {
            TaskPath::Input => INPUT,
            TaskPath::Pull(_) => PULL,
            TaskPath::Push(_) => PUSH,
        }
    }
}

impl fmt::Display for TaskPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPath::Input => f.write_str(INPUT),
            TaskPath::Pull(node) => write!(f, "{PULL}:{node}"),
            TaskPath::Push(index) => write!(f, "{PUSH}:{index}"),
        }
    }
}

/// A value surfaced to the caller when a run pauses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub value: Value,
    /// Key for answering this interrupt in a resume map
    pub id: String,
}

impl Interrupt {
    pub fn new(value: Value, id: impl Into<String>) -> Self {
        Self {
            value,
            id: id.into(),
        }
    }
}

/// Inspection view of a task in a [`StateSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct PregelTask {
    pub id: String,
    pub name: String,
    pub path: TaskPath,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub interrupts: Vec<Interrupt>,
    /// Writes of a task that already finished, keyed by channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// State of the nested graph run by this task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Box<StateSnapshot>>,
}

/// State of a thread at one checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    /// Current values of the output channels
    pub values: Value,
    /// Nodes that run next
    pub next: Vec<String>,
    /// Address of this checkpoint
    pub config: CheckpointConfig,
    pub metadata: Option<CheckpointMetadata>,
    pub created_at: Option<String>,
    pub parent_config: Option<CheckpointConfig>,
    pub tasks: Vec<PregelTask>,
    /// Interrupts raised by the pending tasks
    pub interrupts: Vec<Interrupt>,
}

/// A task prepared for execution in the current step.
#[derive(Clone)]
pub struct PregelExecutableTask {
    pub id: String,
    pub name: String,
    pub path: TaskPath,
    pub input: Value,
    /// Channels whose updates triggered this task
    pub triggers: Vec<String>,
    /// Writes produced by the task, or restored from pending writes
    pub writes: Vec<(String, Value)>,
    pub retry_policy: Option<RetryPolicy>,
    pub cache_key: Option<CacheKey>,
    /// Namespace of this task; nested graphs checkpoint under it
    pub checkpoint_ns: String,
    pub(crate) node: Arc<PregelNode>,
    pub(crate) scratchpad: Arc<Mutex<Scratchpad>>,
}

impl fmt::Debug for PregelExecutableTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PregelExecutableTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("path", &self.path)
            .field("input", &self.input)
            .field("triggers", &self.triggers)
            .field("writes", &self.writes)
            .field("checkpoint_ns", &self.checkpoint_ns)
            .finish()
    }
}

/// Anything whose writes can be applied to channels.
pub trait WritesProtocol: Send + Sync {
    fn id(&self) -> &str;
    fn path(&self) -> &TaskPath;
    fn name(&self) -> &str;
    fn writes(&self) -> &[(String, Value)];
    fn triggers(&self) -> &[String];
}

/// Writes that do not come from a node: graph input, commands and manual updates.
#[derive(Debug, Clone)]
pub struct PregelTaskWrites {
    pub id: String,
    pub path: TaskPath,
    pub name: String,
    pub writes: Vec<(String, Value)>,
    pub triggers: Vec<String>,
}

impl PregelTaskWrites {
    pub fn new(name: impl Into<String>, writes: Vec<(String, Value)>) -> Self {
        Self {
            id: crate::constants::NULL_TASK_ID.to_string(),
            path: TaskPath::Input,
            name: name.into(),
            writes,
            triggers: Vec::new(),
        }
    }
}

impl WritesProtocol for PregelTaskWrites {
    fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> &TaskPath {
        &self.path
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn writes(&self) -> &[(String, Value)] {
        &self.writes
    }

    fn triggers(&self) -> &[String] {
        &self.triggers
    }
}

impl WritesProtocol for PregelExecutableTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> &TaskPath {
        &self.path
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn writes(&self) -> &[(String, Value)] {
        &self.writes
    }

    fn triggers(&self) -> &[String] {
        &self.triggers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_path_order() {
        let mut paths = vec![
            TaskPath::Push(0),
            TaskPath::Pull("b".into()),
            TaskPath::Input,
            TaskPath::Pull("a".into()),
        ];
        paths.sort();
        assert_eq!(
            paths,
            vec![
                TaskPath::Input,
                TaskPath::Pull("a".into()),
                TaskPath::Pull("b".into()),
                TaskPath::Push(0),
            ]
        );
    }

    #[test]
    fn test_task_path_display_and_serde() {
        assert_eq!(TaskPath::Pull("a".into()).to_string(), "__pregel_pull:a");
        assert_eq!(
            serde_json::to_value(TaskPath::Push(2)).unwrap(),
            json!({"kind": "push", "target": 2})
        );
    }

    #[test]
    fn test_task_writes_are_attributed_to_input() {
        let writes = PregelTaskWrites::new("__input__", vec![("x".into(), json!(1))]);
        assert_eq!(writes.path(), &TaskPath::Input);
        assert!(writes.triggers().is_empty());
        assert_eq!(writes.writes().len(), 1);
    }
}
