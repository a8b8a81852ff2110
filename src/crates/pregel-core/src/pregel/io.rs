//! I/O operations for Pregel execution.
//!
//! Functions for mapping inputs and commands to channel writes, and channel
//! state and task writes to stream payloads.

use super::write::{compute_writes, ChannelWrite};
use super::Pregel;
use crate::command::Command;
use crate::constants::START;
use crate::error::Result;
use crate::node::NodeOutput;
use pregel_checkpoint::Channel;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};

/// Read a single channel value.
///
/// Returns `None` if the channel is empty or doesn't exist.
pub fn read_channel(channels: &HashMap<String, Channel>, chan: &str) -> Option<Value> {
    channels.get(chan).and_then(|channel| channel.get().ok())
}

/// Map user input to channel writes through the graph's input writers.
pub(crate) fn map_input(
    graph: &Pregel,
    input: Value,
    channels: &HashMap<String, Channel>,
) -> Result<Vec<(String, Value)>> {
    if input.is_null() {
        return Ok(Vec::new());
    }
    compute_writes(
        graph,
        START,
        &graph.input_writers,
        &NodeOutput::Update(input),
        channels,
    )
}

/// Map the `update` and `goto` parts of a command to writes.
///
/// `resume` is handled by the loop since it targets pending writes rather
/// than channels.
pub(crate) fn map_command(
    graph: &Pregel,
    command: &Command,
    channels: &HashMap<String, Channel>,
) -> Result<Vec<(String, Value)>> {
    let writers = [ChannelWrite::state(graph.state_keys.clone())];
    let routing = Command {
        resume: None,
        ..command.clone()
    };
    compute_writes(graph, START, &writers, &NodeOutput::Command(routing), channels)
}

/// Map output values from channels after writes.
///
/// Emits the current values of `output_keys` when `updated` touched one of
/// them; `None` for `updated` forces the output (e.g. after input or on
/// resume).
pub fn map_output_values(
    output_keys: &[String],
    updated: Option<&BTreeSet<String>>,
    channels: &HashMap<String, Channel>,
) -> Option<Value> {
    let should_emit = match updated {
        None => true,
        Some(updated) => output_keys.iter().any(|key| updated.contains(key)),
    };
    if !should_emit {
        return None;
    }
    let mut values = Map::new();
    for key in output_keys {
        if let Some(value) = read_channel(channels, key) {
            values.insert(key.clone(), value);
        }
    }
    Some(Value::Object(values))
}

/// Map the writes of finished tasks to a per-node summary.
///
/// - A node writing each output key at most once: `{"node": {"k1": v1, "k2": v2}}`
/// - A node writing a key several times: `{"node": [{"k": v1}, {"k": v2}]}`
/// - A node with no output: `{"node": null}`
///
/// Several tasks of the same node (fan-out through `Send`) are collected
/// into an array in task order.
pub fn map_output_updates(
    output_keys: &[String],
    tasks_and_writes: &[(&str, &[(String, Value)])],
) -> Option<Value> {
    if tasks_and_writes.is_empty() {
        return None;
    }

    let mut per_node: Vec<(&str, Vec<Value>)> = Vec::new();
    for (task_name, writes) in tasks_and_writes {
        let relevant: Vec<&(String, Value)> = writes
            .iter()
            .filter(|(chan, _)| output_keys.contains(chan))
            .collect();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for (chan, _) in &relevant {
            *counts.entry(chan.as_str()).or_insert(0) += 1;
        }

        let mut node_updates: Vec<Value> = Vec::new();
        if counts.values().any(|&count| count > 1) {
            for (chan, value) in &relevant {
                let mut obj = Map::new();
                obj.insert(chan.clone(), value.clone());
                node_updates.push(Value::Object(obj));
            }
        } else if !relevant.is_empty() {
            let obj: Map<String, Value> = relevant
                .iter()
                .map(|(chan, value)| (chan.clone(), value.clone()))
                .collect();
            node_updates.push(Value::Object(obj));
        }

        let node_value = match node_updates.len() {
            0 => Value::Null,
            1 => node_updates.swap_remove(0),
            _ => Value::Array(node_updates),
        };

        match per_node.iter_mut().find(|(name, _)| name == task_name) {
            Some((_, values)) => values.push(node_value),
            None => per_node.push((*task_name, vec![node_value])),
        }
    }

    let grouped: Map<String, Value> = per_node
        .into_iter()
        .map(|(name, mut values)| {
            let value = if values.len() == 1 {
                values.swap_remove(0)
            } else {
                Value::Array(values)
            };
            (name.to_string(), value)
        })
        .collect();
    Some(Value::Object(grouped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{node_fn, NodeAction, PregelNode};
    use crate::send::Send;
    use crate::constants::{branch_channel, TASKS};
    use serde_json::json;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn channels() -> HashMap<String, Channel> {
        let mut channels = HashMap::new();
        let mut a = Channel::last_value();
        a.update(vec![json!(1)]).unwrap();
        channels.insert("a".to_string(), a);
        channels.insert("b".to_string(), Channel::last_value());
        channels
    }

    #[test]
    fn test_read_channel_empty() {
        let channels = channels();
        assert_eq!(read_channel(&channels, "b"), None);
        assert_eq!(read_channel(&channels, "missing"), None);
        assert_eq!(read_channel(&channels, "a"), Some(json!(1)));
    }

    #[test]
    fn test_map_output_values_force_emit() {
        let output = map_output_values(&keys(&["a", "b"]), None, &channels());
        assert_eq!(output, Some(json!({"a": 1})));
    }

    #[test]
    fn test_map_output_values_writes_to_other_channel() {
        let updated: BTreeSet<String> = ["branch:to:x".to_string()].into();
        assert_eq!(map_output_values(&keys(&["a"]), Some(&updated), &channels()), None);

        let updated: BTreeSet<String> = ["a".to_string()].into();
        assert_eq!(
            map_output_values(&keys(&["a"]), Some(&updated), &channels()),
            Some(json!({"a": 1}))
        );
    }

    #[test]
    fn test_map_output_updates_single_task() {
        let writes = vec![
            ("a".to_string(), json!(1)),
            (branch_channel("next"), Value::Null),
        ];
        let output = map_output_updates(&keys(&["a", "b"]), &[("node", writes.as_slice())]);
        assert_eq!(output, Some(json!({"node": {"a": 1}})));
    }

    #[test]
    fn test_map_output_updates_repeated_key() {
        let writes = vec![("a".to_string(), json!(1)), ("a".to_string(), json!(2))];
        let output = map_output_updates(&keys(&["a"]), &[("node", writes.as_slice())]);
        assert_eq!(output, Some(json!({"node": [{"a": 1}, {"a": 2}]})));
    }

    #[test]
    fn test_map_output_updates_fan_out() {
        let first = vec![("a".to_string(), json!(1))];
        let second = vec![("a".to_string(), json!(2))];
        let silent: Vec<(String, Value)> = Vec::new();
        let output = map_output_updates(
            &keys(&["a"]),
            &[
                ("worker", first.as_slice()),
                ("worker", second.as_slice()),
                ("other", silent.as_slice()),
            ],
        );
        assert_eq!(
            output,
            Some(json!({"worker": [{"a": 1}, {"a": 2}], "other": null}))
        );
        assert_eq!(map_output_updates(&keys(&["a"]), &[]), None);
    }

    #[test]
    fn test_map_command_ignores_resume() {
        let noop = NodeAction::Function(node_fn(|_, _| async { Ok(Value::Null) }));
        let graph = Pregel::new("io")
            .with_channel("a", Channel::last_value())
            .with_state_keys(keys(&["a"]))
            .with_node(PregelNode::new("worker", noop));
        let command = Command::resume(json!("yes"))
            .with_update(json!({"a": 3, "unknown": 1}))
            .with_goto(Send::new("worker", json!({"a": 4})));
        let writes = map_command(&graph, &command, &graph.channels).unwrap();
        assert_eq!(
            writes,
            vec![
                ("a".to_string(), json!(3)),
                (TASKS.to_string(), json!({"node": "worker", "arg": {"a": 4}})),
            ]
        );
    }
}
