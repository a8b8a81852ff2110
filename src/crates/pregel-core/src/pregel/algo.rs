//! Core superstep algorithms: scheduling, write application and interrupt checks
//!
//! These functions are pure over the channel map and checkpoint they are
//! given, so the loop, `get_state` and `update_state` share them.
//!
//! # Version-based triggering
//!
//! Every channel carries a version that is bumped when a write changes it.
//! Every node remembers, per trigger channel, the version it last reacted to
//! (`versions_seen`). A node runs in the next step when one of its trigger
//! channels holds a value with a newer version than the one it has seen:
//!
//! ```text
//!   channel_versions:  branch:to:b = 3
//!   versions_seen[b]:  branch:to:b = 2      → b is scheduled
//! ```
//!
//! # Write application order
//!
//! [`apply_writes`] sorts tasks by `(path, id)` before grouping their writes,
//! so the resulting state does not depend on the order in which tasks
//! finished.

use super::types::{PregelExecutableTask, TaskPath, WritesProtocol};
use super::Pregel;
use crate::cache::CacheKey;
use crate::constants::{is_special_channel, CACHE_NS_WRITES, INTERRUPT, NS_END, NS_SEP, PUSH, TASKS};
use crate::error::{GraphError, Result};
use crate::interrupt::{matches_node, Scratchpad};
use crate::node::PregelNode;
use parking_lot::Mutex;
use pregel_checkpoint::{Channel, ChannelVersion, Checkpoint, CheckpointError, PendingWrite};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Derives a task id from `(checkpoint_id, checkpoint_ns, step, node, path)`.
pub type TaskIdFn = Arc<dyn Fn(&str, &str, i64, &str, &TaskPath) -> String + Send + Sync>;

/// Assigns the version following the given one.
pub type VersionFn<'a> = &'a (dyn Fn(Option<&ChannelVersion>) -> ChannelVersion + Send + Sync);

/// UUIDv5 over the task coordinates, in the namespace of the checkpoint id.
pub fn default_task_id(
    checkpoint_id: &str,
    checkpoint_ns: &str,
    step: i64,
    name: &str,
    path: &TaskPath,
) -> String {
    let namespace = Uuid::parse_str(checkpoint_id)
        .unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, checkpoint_id.as_bytes()));
    let target = match path {
        TaskPath::Input => Value::from(name),
        TaskPath::Pull(node) => Value::from(node.as_str()),
        TaskPath::Push(index) => Value::from(*index),
    };
    let coordinates = json!([checkpoint_ns, step, name, path.marker(), target]);
    Uuid::new_v5(&namespace, coordinates.to_string().as_bytes()).to_string()
}

/// Namespace of a task running under `parent_ns`.
pub(crate) fn task_namespace(parent_ns: &str, name: &str, task_id: &str) -> String {
    if parent_ns.is_empty() {
        format!("{name}{NS_END}{task_id}")
    } else {
        format!("{parent_ns}{NS_SEP}{name}{NS_END}{task_id}")
    }
}

/// Read `keys` into an object, skipping empty channels.
pub(crate) fn read_channels(channels: &HashMap<String, Channel>, keys: &[String]) -> Value {
    let values: Map<String, Value> = keys
        .iter()
        .filter_map(|key| {
            channels
                .get(key)
                .and_then(|channel| channel.get().ok())
                .map(|value| (key.clone(), value))
        })
        .collect();
    Value::Object(values)
}

/// State as seen by a task after its own `writes`, without touching `channels`.
pub(crate) fn local_read(
    channels: &HashMap<String, Channel>,
    select: &[String],
    writes: &[(String, Value)],
) -> Result<Value> {
    let mut local: HashMap<String, Channel> = select
        .iter()
        .filter_map(|key| channels.get(key).map(|c| (key.clone(), c.clone())))
        .collect();
    for (key, values) in group_writes(writes.iter()) {
        if let Some(channel) = local.get_mut(&key) {
            channel
                .update(values)
                .map_err(|e| invalid_channel_update(&key, e))?;
        }
    }
    Ok(read_channels(&local, select))
}

fn group_writes<'w>(writes: impl Iterator<Item = &'w (String, Value)>) -> BTreeMap<String, Vec<Value>> {
    let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for (channel, value) in writes {
        if !is_special_channel(channel) {
            grouped.entry(channel.clone()).or_default().push(value.clone());
        }
    }
    grouped
}

fn invalid_channel_update(channel: &str, err: CheckpointError) -> GraphError {
    GraphError::invalid_update(format!("channel `{channel}`: {err}"))
}

/// Apply the writes of one step to `channels`.
///
/// Returns the channels that were updated and now hold a value. Versions
/// are only bumped when `next_version` is given.
pub(crate) fn apply_writes(
    checkpoint: &mut Checkpoint,
    channels: &mut HashMap<String, Channel>,
    tasks: &[&dyn WritesProtocol],
    next_version: Option<VersionFn<'_>>,
) -> Result<BTreeSet<String>> {
    let mut tasks: Vec<&dyn WritesProtocol> = tasks.to_vec();
    tasks.sort_by(|a, b| (a.path(), a.id()).cmp(&(b.path(), b.id())));

    let bump_step = tasks.iter().any(|t| !t.triggers().is_empty());

    for task in &tasks {
        let seen = checkpoint
            .versions_seen
            .entry(task.name().to_string())
            .or_default();
        for trigger in task.triggers() {
            if let Some(version) = checkpoint.channel_versions.get(trigger) {
                seen.insert(trigger.clone(), version.clone());
            }
        }
    }

    let version = next_version.map(|next| next(checkpoint.max_version()));
    let bump = |checkpoint: &mut Checkpoint, channel: &str| {
        if let Some(version) = &version {
            checkpoint
                .channel_versions
                .insert(channel.to_string(), version.clone());
        }
    };

    for task in &tasks {
        for trigger in task.triggers() {
            if let Some(channel) = channels.get_mut(trigger) {
                if channel.consume() {
                    bump(checkpoint, trigger);
                }
            }
        }
    }

    let mut grouped = group_writes(tasks.iter().flat_map(|t| t.writes().iter()));
    grouped.retain(|channel, _| {
        let known = channels.contains_key(channel);
        if !known {
            warn!(channel = %channel, "skipping write to unknown channel");
        }
        known
    });

    let mut updated = BTreeSet::new();
    for (name, values) in &grouped {
        if let Some(channel) = channels.get_mut(name) {
            if channel
                .update(values.clone())
                .map_err(|e| invalid_channel_update(name, e))?
            {
                bump(checkpoint, name);
                if channel.is_available() {
                    updated.insert(name.clone());
                }
            }
        }
    }

    if bump_step {
        for (name, channel) in channels.iter_mut() {
            if grouped.contains_key(name) || !channel.is_available() {
                continue;
            }
            if channel
                .update(Vec::new())
                .map_err(|e| invalid_channel_update(name, e))?
            {
                bump(checkpoint, name);
                if channel.is_available() {
                    updated.insert(name.clone());
                }
            }
        }
    }

    checkpoint.updated_channels = Some(updated.iter().cloned().collect());
    Ok(updated)
}

/// Inputs of [`prepare_next_tasks`] besides the checkpoint and channels.
pub(crate) struct PrepareContext<'a> {
    pub step: i64,
    pub checkpoint_ns: &'a str,
    /// Channels updated by the previous step; `None` checks every node
    pub updated_channels: Option<&'a BTreeSet<String>>,
}

/// Tasks of the next step, keyed by task id.
///
/// PUSH tasks come from the packets in the tasks topic; PULL tasks from
/// nodes with a trigger channel newer than the version they last saw.
pub(crate) fn prepare_next_tasks(
    graph: &Pregel,
    checkpoint: &Checkpoint,
    pending_writes: &[PendingWrite],
    channels: &HashMap<String, Channel>,
    ctx: &PrepareContext<'_>,
) -> Result<BTreeMap<String, PregelExecutableTask>> {
    let mut tasks = BTreeMap::new();

    let packet_count = channels
        .get(TASKS)
        .and_then(|channel| channel.get().ok())
        .and_then(|packets| packets.as_array().map(Vec::len))
        .unwrap_or(0);
    let candidates: BTreeSet<&String> = match ctx.updated_channels {
        Some(updated) => updated
            .iter()
            .filter_map(|c| graph.trigger_to_nodes.get(c))
            .flatten()
            .collect(),
        None => graph.nodes.keys().collect(),
    };

    let paths = (0..packet_count)
        .map(TaskPath::Push)
        .chain(candidates.into_iter().map(|name| TaskPath::Pull(name.clone())));
    for path in paths {
        if let Some(task) = prepare_single_task(graph, checkpoint, pending_writes, channels, ctx, path)? {
            tasks.insert(task.id.clone(), task);
        }
    }
    Ok(tasks)
}

/// The task at `path` if it is runnable in the current step.
///
/// A `Push(i)` path addresses the i-th packet of the tasks topic; a
/// `Pull(node)` path is runnable when one of the node's triggers changed
/// since the node last ran.
pub(crate) fn prepare_single_task(
    graph: &Pregel,
    checkpoint: &Checkpoint,
    pending_writes: &[PendingWrite],
    channels: &HashMap<String, Channel>,
    ctx: &PrepareContext<'_>,
    path: TaskPath,
) -> Result<Option<PregelExecutableTask>> {
    match &path {
        TaskPath::Input => Ok(None),
        TaskPath::Push(index) => {
            let packet = channels
                .get(TASKS)
                .and_then(|channel| channel.get().ok())
                .and_then(|packets| packets.get(*index).cloned());
            let Some(packet) = packet else {
                return Ok(None);
            };
            let send: crate::send::Send = match serde_json::from_value(packet) {
                Ok(send) => send,
                Err(err) => {
                    warn!(error = %err, "skipping malformed packet");
                    return Ok(None);
                }
            };
            let Some(node) = graph.nodes.get(&send.node) else {
                warn!(node = %send.node, "skipping packet for unknown node");
                return Ok(None);
            };
            Ok(Some(new_task(
                graph,
                checkpoint,
                pending_writes,
                ctx,
                node,
                path,
                send.arg,
                vec![PUSH.to_string()],
            )))
        }
        TaskPath::Pull(name) => {
            let Some(node) = graph.nodes.get(name) else {
                return Ok(None);
            };
            let seen = checkpoint.versions_seen.get(name);
            let mut triggers: Vec<String> = node
                .triggers
                .iter()
                .filter(|chan| {
                    let available = channels.get(*chan).is_some_and(Channel::is_available);
                    let current = checkpoint.channel_versions.get(*chan);
                    let last = seen.and_then(|s| s.get(*chan));
                    available
                        && match (current, last) {
                            (Some(current), Some(last)) => current > last,
                            (Some(_), None) => true,
                            (None, _) => false,
                        }
                })
                .cloned()
                .collect();
            if triggers.is_empty() {
                return Ok(None);
            }
            triggers.sort();
            let input = read_channels(channels, &node.channels);
            Ok(Some(new_task(
                graph,
                checkpoint,
                pending_writes,
                ctx,
                node,
                path,
                input,
                triggers,
            )))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn new_task(
    graph: &Pregel,
    checkpoint: &Checkpoint,
    pending_writes: &[PendingWrite],
    ctx: &PrepareContext<'_>,
    node: &Arc<PregelNode>,
    path: TaskPath,
    input: Value,
    triggers: Vec<String>,
) -> PregelExecutableTask {
    let node = Arc::clone(node);
    let name = node.name.as_str();
    let id = (graph.task_id_fn)(&checkpoint.id, ctx.checkpoint_ns, ctx.step, name, &path);
    let cache_key = node.cache_policy.as_ref().map(|policy| {
        CacheKey::new(
            vec![CACHE_NS_WRITES.to_string(), name.to_string()],
            policy.key_for(&input),
            policy.ttl,
        )
    });
    PregelExecutableTask {
        checkpoint_ns: task_namespace(ctx.checkpoint_ns, name, &id),
        scratchpad: Arc::new(Mutex::new(Scratchpad::from_pending_writes(&id, pending_writes))),
        retry_policy: node.retry_policy.clone().or_else(|| graph.retry_policy.clone()),
        name: name.to_string(),
        id,
        path,
        input,
        triggers,
        writes: Vec::new(),
        cache_key,
        node: Arc::clone(&node),
    }
}

/// Whether a static breakpoint in `interrupt_nodes` fires for `tasks`.
pub(crate) fn should_interrupt<'t>(
    checkpoint: &Checkpoint,
    interrupt_nodes: &[String],
    mut tasks: impl Iterator<Item = &'t PregelExecutableTask>,
) -> bool {
    if interrupt_nodes.is_empty() {
        return false;
    }
    let seen = checkpoint.versions_seen.get(INTERRUPT);
    let any_updates = checkpoint.channel_versions.iter().any(|(chan, version)| {
        seen.and_then(|s| s.get(chan))
            .map_or(true, |last| version > last)
    });
    any_updates && tasks.any(|task| matches_node(interrupt_nodes, &task.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{branch_channel, TASKS};
    use crate::node::{node_fn, NodeAction, PregelNode};
    use crate::pregel::types::PregelTaskWrites;
    use proptest::prelude::*;

    fn next(current: Option<&ChannelVersion>) -> ChannelVersion {
        ChannelVersion::increment(current)
    }

    fn graph() -> Pregel {
        let noop = NodeAction::Function(node_fn(|_, _| async { Ok(Value::Null) }));
        let node = |name: &str| {
            PregelNode::new(name, noop.clone())
                .with_triggers(vec![branch_channel(name)])
                .with_channels(vec!["x".into()])
        };
        Pregel::new("test")
            .with_channel("x", Channel::last_value())
            .with_channel(TASKS, Channel::topic(false))
            .with_channel(branch_channel("a"), Channel::ephemeral(false))
            .with_channel(branch_channel("b"), Channel::ephemeral(false))
            .with_state_keys(vec!["x".into()])
            .with_node(node("a"))
            .with_node(node("b"))
    }

    fn ctx() -> PrepareContext<'static> {
        PrepareContext {
            step: 1,
            checkpoint_ns: "",
            updated_channels: None,
        }
    }

    #[test]
    fn test_task_ids_are_deterministic() {
        let a = default_task_id("ckpt", "", 1, "a", &TaskPath::Pull("a".into()));
        assert_eq!(a, default_task_id("ckpt", "", 1, "a", &TaskPath::Pull("a".into())));
        assert_ne!(a, default_task_id("ckpt", "", 2, "a", &TaskPath::Pull("a".into())));
        assert_ne!(a, default_task_id("ckpt", "", 1, "a", &TaskPath::Push(0)));
        assert_eq!(task_namespace("", "a", "id"), "a:id");
        assert_eq!(task_namespace("p:1", "a", "id"), "p:1|a:id");
    }

    #[test]
    fn test_apply_then_prepare_triggers_next_node() {
        let graph = graph();
        let mut checkpoint = Checkpoint::empty();
        let mut channels = graph.channels.clone();

        let input = PregelTaskWrites::new(
            "__input__",
            vec![("x".into(), json!(1)), (branch_channel("a"), Value::Null)],
        );
        let updated = apply_writes(&mut checkpoint, &mut channels, &[&input], Some(&next)).unwrap();
        assert!(updated.contains(&branch_channel("a")));

        let tasks = prepare_next_tasks(&graph, &checkpoint, &[], &channels, &ctx()).unwrap();
        assert_eq!(tasks.len(), 1);
        let task = tasks.values().next().unwrap();
        assert_eq!(task.name, "a");
        assert_eq!(task.input, json!({"x": 1}));
        assert_eq!(task.triggers, vec![branch_channel("a")]);

        // once the task's writes are applied, `a` has seen its trigger
        let mut done = task.clone();
        done.writes = vec![("x".into(), json!(2))];
        let updated = apply_writes(&mut checkpoint, &mut channels, &[&done], Some(&next)).unwrap();
        // the trigger was cleared at the barrier; nothing is left to run
        assert_eq!(updated, BTreeSet::from(["x".to_string()]));
        let tasks = prepare_next_tasks(&graph, &checkpoint, &[], &channels, &ctx()).unwrap();
        assert!(tasks.is_empty());
        assert_eq!(channels["x"].get().unwrap(), json!(2));
    }

    #[test]
    fn test_push_tasks_from_packets() {
        let graph = graph();
        let mut checkpoint = Checkpoint::empty();
        let mut channels = graph.channels.clone();
        let writes = PregelTaskWrites::new(
            "__input__",
            vec![
                (TASKS.into(), json!({"node": "b", "arg": {"x": 7}})),
                (TASKS.into(), json!({"node": "missing", "arg": {}})),
            ],
        );
        apply_writes(&mut checkpoint, &mut channels, &[&writes], Some(&next)).unwrap();

        let tasks = prepare_next_tasks(&graph, &checkpoint, &[], &channels, &ctx()).unwrap();
        assert_eq!(tasks.len(), 1);
        let task = tasks.values().next().unwrap();
        assert_eq!(task.path, TaskPath::Push(0));
        assert_eq!(task.input, json!({"x": 7}));
    }

    #[test]
    fn test_invalid_channel_update_names_channel() {
        let mut channels = HashMap::new();
        channels.insert("once".to_string(), Channel::ephemeral(true));
        let writes = PregelTaskWrites::new(
            "__input__",
            vec![("once".into(), json!(1)), ("once".into(), json!(2))],
        );
        let err = apply_writes(
            &mut Checkpoint::empty(),
            &mut channels,
            &[&writes],
            Some(&next),
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::InvalidUpdate(msg) if msg.contains("once")));
    }

    #[test]
    fn test_should_interrupt_respects_seen_versions() {
        let graph = graph();
        let mut checkpoint = Checkpoint::empty();
        let mut channels = graph.channels.clone();
        let input = PregelTaskWrites::new("__input__", vec![(branch_channel("a"), Value::Null)]);
        apply_writes(&mut checkpoint, &mut channels, &[&input], Some(&next)).unwrap();
        let tasks = prepare_next_tasks(&graph, &checkpoint, &[], &channels, &ctx()).unwrap();

        let nodes = vec!["a".to_string()];
        assert!(should_interrupt(&checkpoint, &nodes, tasks.values()));
        assert!(!should_interrupt(&checkpoint, &["b".to_string()], tasks.values()));

        checkpoint
            .versions_seen
            .insert(INTERRUPT.to_string(), checkpoint.channel_versions.clone());
        assert!(!should_interrupt(&checkpoint, &nodes, tasks.values()));
    }

    #[test]
    fn test_local_read_does_not_mutate() {
        let graph = graph();
        let channels = graph.channels.clone();
        let state = local_read(&channels, &graph.state_keys, &[("x".into(), json!(3))]).unwrap();
        assert_eq!(state, json!({"x": 3}));
        assert!(channels["x"].get().is_err());
    }

    proptest! {
        #[test]
        fn prop_write_order_does_not_change_result(values in proptest::collection::vec(0i64..100, 1..6)) {
            let mut channels_fwd = HashMap::new();
            channels_fwd.insert("total".to_string(), Channel::sum());
            let mut channels_rev = channels_fwd.clone();

            let tasks: Vec<PregelTaskWrites> = values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let mut t = PregelTaskWrites::new(format!("n{i}"), vec![("total".into(), json!(v))]);
                    t.path = TaskPath::Pull(format!("n{i}"));
                    t.id = format!("{i:04}");
                    t
                })
                .collect();
            let fwd: Vec<&dyn WritesProtocol> = tasks.iter().map(|t| t as &dyn WritesProtocol).collect();
            let rev: Vec<&dyn WritesProtocol> = fwd.iter().rev().copied().collect();

            let mut ck_fwd = Checkpoint::empty();
            let mut ck_rev = Checkpoint::empty();
            apply_writes(&mut ck_fwd, &mut channels_fwd, &fwd, Some(&next)).unwrap();
            apply_writes(&mut ck_rev, &mut channels_rev, &rev, Some(&next)).unwrap();

            prop_assert_eq!(channels_fwd["total"].get().unwrap(), channels_rev["total"].get().unwrap());
            prop_assert_eq!(ck_fwd.channel_versions, ck_rev.channel_versions);
        }
    }
}
