//! `Send` packets and branch routing results
//!
//! A [`Send`] schedules one extra task of a node for the next superstep with
//! a custom input, independent of the graph state. Routers return `Send`s to
//! fan work out (map-reduce style):
//!
//! ```rust
//! use pregel_core::{BranchResult, Send};
//! use serde_json::json;
//!
//! let state = json!({"subjects": ["cats", "dogs"]});
//! let sends: Vec<Send> = state["subjects"]
//!     .as_array()
//!     .into_iter()
//!     .flatten()
//!     .map(|s| Send::new("write_joke", json!({"subject": s})))
//!     .collect();
//! let route: BranchResult = sends.into();
//! assert_eq!(route.sends().count(), 2);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Instruction to run `node` in the next step with `arg` as its input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Send {
    pub node: String,
    pub arg: Value,
}

impl Send {
    pub fn new(node: impl Into<String>, arg: Value) -> Self {
        Self {
            node: node.into(),
            arg,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn arg(&self) -> &Value {
        &self.arg
    }
}

/// One destination chosen by a router.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchTarget {
    Node(String),
    Send(Send),
}

/// Destinations chosen by a conditional edge.
///
/// `Node`/`Nodes` entries are looked up in the branch's path map when it has
/// one. Routing to [`END`](crate::constants::END) schedules nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchResult {
    Node(String),
    Nodes(Vec<String>),
    Sends(Vec<Send>),
    Mixed(Vec<BranchTarget>),
}

impl BranchResult {
    /// Flatten into individual targets, preserving order.
    pub fn into_targets(self) -> Vec<BranchTarget> {
        match self {
            BranchResult::Node(node) => vec![BranchTarget::Node(node)],
            BranchResult::Nodes(nodes) => nodes.into_iter().map(BranchTarget::Node).collect(),
            BranchResult::Sends(sends) => sends.into_iter().map(BranchTarget::Send).collect(),
            BranchResult::Mixed(targets) => targets,
        }
    }

    pub fn sends(&self) -> impl Iterator<Item = &Send> {
        let sends: Vec<&Send> = match self {
            BranchResult::Sends(sends) => sends.iter().collect(),
            BranchResult::Mixed(targets) => targets
                .iter()
                .filter_map(|t| match t {
                    BranchTarget::Send(send) => Some(send),
                    BranchTarget::Node(_) => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        sends.into_iter()
    }
}

impl From<&str> for BranchResult {
    fn from(node: &str) -> Self {
        BranchResult::Node(node.to_string())
    }
}

impl From<String> for BranchResult {
    fn from(node: String) -> Self {
        BranchResult::Node(node)
    }
}

impl From<Vec<String>> for BranchResult {
    fn from(nodes: Vec<String>) -> Self {
        BranchResult::Nodes(nodes)
    }
}

impl From<Vec<&str>> for BranchResult {
    fn from(nodes: Vec<&str>) -> Self {
        BranchResult::Nodes(nodes.iter().map(|s| s.to_string()).collect())
    }
}

impl From<Send> for BranchResult {
    fn from(send: Send) -> Self {
        BranchResult::Sends(vec![send])
    }
}

impl From<Vec<Send>> for BranchResult {
    fn from(sends: Vec<Send>) -> Self {
        BranchResult::Sends(sends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_serialization_shape() {
        let send = Send::new("process", json!({"item": "test"}));
        let value = serde_json::to_value(&send).unwrap();
        assert_eq!(value, json!({"node": "process", "arg": {"item": "test"}}));
        let back: Send = serde_json::from_value(value).unwrap();
        assert_eq!(back, send);
    }

    #[test]
    fn test_into_targets_keeps_order() {
        let mixed = BranchResult::Mixed(vec![
            BranchTarget::Node("a".into()),
            BranchTarget::Send(Send::new("b", json!(1))),
        ]);
        let targets = mixed.into_targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0], BranchTarget::Node("a".into()));

        let nodes: BranchResult = vec!["x", "y"].into();
        assert_eq!(
            nodes.into_targets(),
            vec![BranchTarget::Node("x".into()), BranchTarget::Node("y".into())]
        );
    }

    #[test]
    fn test_sends_iterator_skips_nodes() {
        let mixed = BranchResult::Mixed(vec![
            BranchTarget::Node("a".into()),
            BranchTarget::Send(Send::new("b", json!(1))),
        ]);
        assert_eq!(mixed.sends().count(), 1);
        assert_eq!(BranchResult::from("a").sends().count(), 0);
    }
}
