//! Turning node outputs into channel writes

use super::algo::local_read;
use super::Pregel;
use crate::constants::{branch_channel, END, TASKS};
use crate::error::{GraphError, Result};
use crate::graph::Branch;
use crate::node::NodeOutput;
use crate::send::BranchTarget;
use pregel_checkpoint::Channel;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// One step of mapping a node's output to writes.
#[derive(Debug, Clone)]
pub enum ChannelWrite {
    /// Write the keys of the update object that are state keys
    State { keys: Vec<String> },
    /// Write a fixed value once the node finished
    Edge { channel: String, value: Value },
    /// Route on the state as seen after the writes so far
    Branch(Branch),
}

impl ChannelWrite {
    pub fn state(keys: Vec<String>) -> Self {
        ChannelWrite::State { keys }
    }

    pub fn edge(channel: impl Into<String>, value: Value) -> Self {
        ChannelWrite::Edge {
            channel: channel.into(),
            value,
        }
    }
}

/// Writes produced by `node` returning `output`.
///
/// Writers run in order; `Command::goto` targets are appended last.
pub(crate) fn compute_writes(
    graph: &Pregel,
    node: &str,
    writers: &[ChannelWrite],
    output: &NodeOutput,
    channels: &HashMap<String, Channel>,
) -> Result<Vec<(String, Value)>> {
    let mut writes = Vec::new();
    for writer in writers {
        match writer {
            ChannelWrite::State { keys } => {
                if let Some(update) = output.update() {
                    writes.extend(state_writes(node, update, keys)?);
                }
            }
            ChannelWrite::Edge { channel, value } => writes.push((channel.clone(), value.clone())),
            ChannelWrite::Branch(branch) => {
                let state = local_read(channels, &graph.state_keys, &writes)?;
                writes.extend(target_writes(graph, branch.resolve(&state)?)?);
            }
        }
    }
    if let Some(goto) = output.command().and_then(|cmd| cmd.goto.clone()) {
        writes.extend(target_writes(graph, goto.into_targets())?);
    }
    Ok(writes)
}

fn state_writes(node: &str, update: &Value, keys: &[String]) -> Result<Vec<(String, Value)>> {
    match update {
        Value::Null => Ok(Vec::new()),
        Value::Object(fields) => Ok(fields
            .iter()
            .filter_map(|(key, value)| {
                if keys.contains(key) {
                    Some((key.clone(), value.clone()))
                } else {
                    debug!(node, key = %key, "ignoring update for unknown state key");
                    None
                }
            })
            .collect()),
        other => Err(GraphError::invalid_update(format!(
            "node `{node}` returned {other}; expected an object of state updates"
        ))),
    }
}

/// Writes that schedule `targets` in the next step.
pub(crate) fn target_writes(graph: &Pregel, targets: Vec<BranchTarget>) -> Result<Vec<(String, Value)>> {
    let mut writes = Vec::new();
    for target in targets {
        match target {
            BranchTarget::Node(node) if node == END => {}
            BranchTarget::Node(node) => {
                if !graph.nodes.contains_key(&node) {
                    return Err(GraphError::invalid_update(format!(
                        "cannot route to unknown node `{node}`"
                    )));
                }
                writes.push((branch_channel(&node), Value::Null));
            }
            BranchTarget::Send(send) => {
                if send.node == END {
                    return Err(GraphError::invalid_update(
                        "Cannot send a packet to the END node",
                    ));
                }
                if !graph.nodes.contains_key(&send.node) {
                    return Err(GraphError::invalid_update(format!(
                        "cannot send a packet to unknown node `{}`",
                        send.node
                    )));
                }
                writes.push((TASKS.to_string(), serde_json::to_value(&send)?));
            }
        }
    }
    Ok(writes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::node::{node_fn, NodeAction, PregelNode};
    use crate::send::Send;
    use serde_json::json;

    fn graph() -> Pregel {
        let noop = NodeAction::Function(node_fn(|_, _| async { Ok(Value::Null) }));
        Pregel::new("test")
            .with_channel("x", Channel::last_value())
            .with_channel("y", Channel::last_value())
            .with_state_keys(vec!["x".into(), "y".into()])
            .with_node(PregelNode::new("a", noop.clone()))
            .with_node(PregelNode::new("b", noop))
    }

    #[test]
    fn test_state_writes_filter_unknown_keys() {
        let graph = graph();
        let writers = vec![ChannelWrite::state(vec!["x".into(), "y".into()])];
        let output = NodeOutput::Update(json!({"x": 1, "z": 2}));
        let writes = compute_writes(&graph, "a", &writers, &output, &graph.channels).unwrap();
        assert_eq!(writes, vec![("x".to_string(), json!(1))]);
    }

    #[test]
    fn test_non_object_update_is_invalid() {
        let graph = graph();
        let writers = vec![ChannelWrite::state(vec!["x".into()])];
        let err = compute_writes(&graph, "a", &writers, &NodeOutput::Update(json!(3)), &graph.channels)
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidUpdate(_)));
    }

    #[test]
    fn test_goto_is_appended_after_edges() {
        let graph = graph();
        let writers = vec![
            ChannelWrite::state(vec!["x".into()]),
            ChannelWrite::edge(branch_channel("b"), Value::Null),
        ];
        let cmd = Command::new()
            .with_update(json!({"x": 5}))
            .with_goto(vec![Send::new("a", json!({"x": 9}))]);
        let writes =
            compute_writes(&graph, "a", &writers, &NodeOutput::Command(cmd), &graph.channels).unwrap();
        assert_eq!(writes[0], ("x".to_string(), json!(5)));
        assert_eq!(writes[1], (branch_channel("b"), Value::Null));
        assert_eq!(writes[2], (TASKS.to_string(), json!({"node": "a", "arg": {"x": 9}})));
    }

    #[test]
    fn test_branch_reads_own_writes() {
        let graph = graph();
        let branch = Branch::new(|state: &Value| {
            if state["x"] == json!(1) { "b" } else { END }
        });
        let writers = vec![
            ChannelWrite::state(vec!["x".into()]),
            ChannelWrite::Branch(branch),
        ];
        let writes = compute_writes(
            &graph,
            "a",
            &writers,
            &NodeOutput::Update(json!({"x": 1})),
            &graph.channels,
        )
        .unwrap();
        assert_eq!(writes.last().unwrap().0, branch_channel("b"));
    }

    #[test]
    fn test_invalid_targets() {
        let graph = graph();
        let to_end = target_writes(&graph, vec![BranchTarget::Send(Send::new(END, json!({})))]);
        assert!(matches!(to_end, Err(GraphError::InvalidUpdate(msg)) if msg.contains("END")));
        let unknown = target_writes(&graph, vec![BranchTarget::Node("zzz".into())]);
        assert!(matches!(unknown, Err(GraphError::InvalidUpdate(_))));
        assert!(target_writes(&graph, vec![BranchTarget::Node(END.into())])
            .unwrap()
            .is_empty());
    }
}
