//! Commands: combined state update, routing and resume instructions
//!
//! A [`Command`] can be returned by a node (to update state and choose the
//! next nodes in one go) or passed as run input (to resume an interrupted
//! thread, optionally updating state first).
//!
//! ```rust
//! use pregel_core::{Command, GraphInput};
//! use serde_json::json;
//!
//! // from a node: record a decision and jump to `publish`
//! let cmd = Command::new()
//!     .with_update(json!({"approved": true}))
//!     .with_goto("publish");
//! assert!(cmd.goto.is_some());
//!
//! // as input: answer a pending interrupt
//! let input: GraphInput = Command::resume(json!("yes")).into();
//! assert!(input.is_resume());
//! ```

use crate::send::{BranchTarget, Send};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Where a command sends control next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GotoTarget {
    Node(String),
    Nodes(Vec<String>),
    Send(Send),
    Sends(Vec<Send>),
}

impl GotoTarget {
    pub fn into_targets(self) -> Vec<BranchTarget> {
        match self {
            GotoTarget::Node(node) => vec![BranchTarget::Node(node)],
            GotoTarget::Nodes(nodes) => nodes.into_iter().map(BranchTarget::Node).collect(),
            GotoTarget::Send(send) => vec![BranchTarget::Send(send)],
            GotoTarget::Sends(sends) => sends.into_iter().map(BranchTarget::Send).collect(),
        }
    }
}

impl From<String> for GotoTarget {
    fn from(node: String) -> Self {
        GotoTarget::Node(node)
    }
}

impl From<&str> for GotoTarget {
    fn from(node: &str) -> Self {
        GotoTarget::Node(node.to_string())
    }
}

impl From<Vec<String>> for GotoTarget {
    fn from(nodes: Vec<String>) -> Self {
        GotoTarget::Nodes(nodes)
    }
}

impl From<Send> for GotoTarget {
    fn from(send: Send) -> Self {
        GotoTarget::Send(send)
    }
}

impl From<Vec<Send>> for GotoTarget {
    fn from(sends: Vec<Send>) -> Self {
        GotoTarget::Sends(sends)
    }
}

/// Value(s) answering pending interrupts.
///
/// Serialized untagged; deserializing always yields `Single`, so build
/// `ByInterruptId` explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResumeValue {
    /// Answers the next interrupt of every interrupted task
    Single(Value),
    /// Answers specific interrupts by id
    ByInterruptId(HashMap<String, Value>),
}

impl From<Value> for ResumeValue {
    fn from(value: Value) -> Self {
        ResumeValue::Single(value)
    }
}

impl From<HashMap<String, Value>> for ResumeValue {
    fn from(map: HashMap<String, Value>) -> Self {
        ResumeValue::ByInterruptId(map)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// State update, applied like a node's return value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeValue>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub goto: Option<GotoTarget>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for `Command::new().with_resume(value)`
    pub fn resume(value: impl Into<ResumeValue>) -> Self {
        Self::new().with_resume(value)
    }

    pub fn with_update(mut self, update: Value) -> Self {
        self.update = Some(update);
        self
    }

    pub fn with_resume(mut self, resume: impl Into<ResumeValue>) -> Self {
        self.resume = Some(resume.into());
        self
    }

    pub fn with_goto(mut self, goto: impl Into<GotoTarget>) -> Self {
        self.goto = Some(goto.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.update.is_none() && self.resume.is_none() && self.goto.is_none()
    }
}

/// Input of a run: fresh values, or a command for an existing thread.
///
/// `GraphInput::Value(Value::Null)` resumes the thread from its latest
/// checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphInput {
    Value(Value),
    Command(Command),
}

impl GraphInput {
    /// Input that continues an existing thread instead of starting new work.
    pub fn is_resume(&self) -> bool {
        match self {
            GraphInput::Value(value) => value.is_null(),
            GraphInput::Command(cmd) => cmd.resume.is_some(),
        }
    }
}

impl Default for GraphInput {
    fn default() -> Self {
        GraphInput::Value(Value::Null)
    }
}

impl From<Value> for GraphInput {
    fn from(value: Value) -> Self {
        GraphInput::Value(value)
    }
}

impl From<Command> for GraphInput {
    fn from(cmd: Command) -> Self {
        GraphInput::Command(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_builders() {
        let cmd = Command::new();
        assert!(cmd.is_empty());

        let cmd = Command::new()
            .with_update(json!({"status": "done"}))
            .with_goto(vec!["a".to_string(), "b".to_string()]);
        assert!(!cmd.is_empty());
        assert_eq!(cmd.update, Some(json!({"status": "done"})));
        assert_eq!(
            cmd.goto.unwrap().into_targets(),
            vec![BranchTarget::Node("a".into()), BranchTarget::Node("b".into())]
        );
    }

    #[test]
    fn test_resume_serializes_untagged() {
        let single = serde_json::to_value(Command::resume(json!("yes"))).unwrap();
        assert_eq!(single, json!({"resume": "yes"}));

        let mut by_id = HashMap::new();
        by_id.insert("abc".to_string(), json!(1));
        let keyed = serde_json::to_value(Command::resume(by_id)).unwrap();
        assert_eq!(keyed, json!({"resume": {"abc": 1}}));
    }

    #[test]
    fn test_graph_input_resume_detection() {
        assert!(GraphInput::Value(Value::Null).is_resume());
        assert!(!GraphInput::Value(json!({"x": 1})).is_resume());
        assert!(GraphInput::from(Command::resume(json!(true))).is_resume());
        assert!(!GraphInput::from(Command::new().with_goto("a")).is_resume());
    }
}
