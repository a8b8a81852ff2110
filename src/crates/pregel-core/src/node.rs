//! Nodes as the engine runs them
//!
//! A [`PregelNode`] is the compiled form of a graph node: what it subscribes
//! to, what it reads, what it runs, and how its output becomes channel writes.
//! Node functions receive their input and a [`Runtime`] and return anything
//! convertible into a [`NodeOutput`]:
//!
//! ```rust
//! use pregel_core::{Command, NodeOutput};
//! use serde_json::json;
//!
//! // a plain state update
//! let update: NodeOutput = json!({"count": 1}).into();
//! assert_eq!(update.update(), Some(&json!({"count": 1})));
//!
//! // an update plus explicit routing
//! let routed: NodeOutput = Command::new()
//!     .with_update(json!({"count": 2}))
//!     .with_goto("report")
//!     .into();
//! assert!(routed.command().is_some());
//! ```

use crate::cache::CachePolicy;
use crate::command::Command;
use crate::error::Result;
use crate::pregel::write::ChannelWrite;
use crate::pregel::Pregel;
use crate::retry::RetryPolicy;
use crate::runtime::Runtime;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// What a node returns.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    /// Values for state keys; `null` writes nothing
    Update(Value),
    /// State update and routing in one
    Command(Command),
}

impl NodeOutput {
    pub fn update(&self) -> Option<&Value> {
        match self {
            NodeOutput::Update(value) => Some(value),
            NodeOutput::Command(cmd) => cmd.update.as_ref(),
        }
    }

    pub fn command(&self) -> Option<&Command> {
        match self {
            NodeOutput::Update(_) => None,
            NodeOutput::Command(cmd) => Some(cmd),
        }
    }
}

impl From<Value> for NodeOutput {
    fn from(value: Value) -> Self {
        NodeOutput::Update(value)
    }
}

impl From<Command> for NodeOutput {
    fn from(cmd: Command) -> Self {
        NodeOutput::Command(cmd)
    }
}

impl From<()> for NodeOutput {
    fn from(_: ()) -> Self {
        NodeOutput::Update(Value::Null)
    }
}

pub type NodeFuture = BoxFuture<'static, Result<NodeOutput>>;

/// Type-erased node function.
pub type NodeFunc = Arc<dyn Fn(Value, Runtime) -> NodeFuture + Send + Sync>;

/// Erase a node function returning any `Into<NodeOutput>`.
pub fn node_fn<F, Fut, O>(func: F) -> NodeFunc
where
    F: Fn(Value, Runtime) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
    O: Into<NodeOutput>,
{
    Arc::new(move |input, runtime| {
        let fut = func(input, runtime);
        Box::pin(async move { fut.await.map(Into::into) })
    })
}

/// What a node executes.
#[derive(Clone)]
pub enum NodeAction {
    Function(NodeFunc),
    /// A compiled graph run as a nested graph, checkpointed under the task's namespace
    Subgraph(Arc<Pregel>),
}

impl fmt::Debug for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeAction::Function(_) => f.write_str("Function(<function>)"),
            NodeAction::Subgraph(graph) => f.debug_tuple("Subgraph").field(&graph.name()).finish(),
        }
    }
}

/// A node of the execution plan.
#[derive(Debug, Clone)]
pub struct PregelNode {
    pub name: String,
    /// Channels whose updates schedule this node
    pub triggers: Vec<String>,
    /// Channels read into the node's input object
    pub channels: Vec<String>,
    /// Turn the node's output into channel writes, in order
    pub writers: Vec<ChannelWrite>,
    pub action: NodeAction,
    pub retry_policy: Option<RetryPolicy>,
    pub cache_policy: Option<CachePolicy>,
    /// Nodes this node may route to with `Command::goto`
    pub ends: Vec<String>,
}

impl PregelNode {
    pub fn new(name: impl Into<String>, action: NodeAction) -> Self {
        Self {
            name: name.into(),
            triggers: Vec::new(),
            channels: Vec::new(),
            writers: Vec::new(),
            action,
            retry_policy: None,
            cache_policy: None,
            ends: Vec::new(),
        }
    }

    pub fn with_triggers(mut self, triggers: Vec<String>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_writers(mut self, writers: Vec<ChannelWrite>) -> Self {
        self.writers = writers;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    pub fn subgraph(&self) -> Option<&Arc<Pregel>> {
        match &self.action {
            NodeAction::Subgraph(graph) => Some(graph),
            NodeAction::Function(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_output_conversions() {
        let out: NodeOutput = ().into();
        assert_eq!(out, NodeOutput::Update(Value::Null));

        let cmd = Command::new().with_update(json!({"a": 1})).with_goto("b");
        let out: NodeOutput = cmd.clone().into();
        assert_eq!(out.update(), Some(&json!({"a": 1})));
        assert_eq!(out.command(), Some(&cmd));
    }

    #[tokio::test]
    async fn test_node_fn_erases_output_type() {
        let func = node_fn(|input: Value, _runtime| async move {
            Ok(json!({"echo": input["x"].clone()}))
        });
        let out = func(json!({"x": 5}), Runtime::detached("echo")).await.unwrap();
        assert_eq!(out, NodeOutput::Update(json!({"echo": 5})));
    }
}
