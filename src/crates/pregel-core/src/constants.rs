//! Reserved channel, node and task names.

/// Virtual entry node of a graph
pub const START: &str = "__start__";
/// Virtual exit node of a graph
pub const END: &str = "__end__";

/// Topic channel carrying [`Send`](crate::send::Send) packets for the next step
pub const TASKS: &str = "__pregel_tasks";
/// Pseudo-task name for input and update writes
pub const INPUT: &str = "__input__";
/// Pending write marking a failed task
pub const ERROR: &str = "__error__";
/// Pending write carrying a task's interrupts; also the `versions_seen` key
/// of the interrupt check
pub const INTERRUPT: &str = "__interrupt__";
/// Pending write carrying resume values
pub const RESUME: &str = "__resume__";
/// Pending write marking a task that finished without writes
pub const NO_WRITES: &str = "__no_writes__";
/// `as_node` value that forks a checkpoint in `update_state`
pub const COPY: &str = "__copy__";
/// Path marker of tasks created from `Send` packets
pub const PUSH: &str = "__pregel_push";
/// Path marker of tasks triggered by channel updates
pub const PULL: &str = "__pregel_pull";

/// Task id used for writes that do not belong to any task
pub const NULL_TASK_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Separates graph levels in a checkpoint namespace: `parent:task|child:task`
pub const NS_SEP: char = '|';
/// Separates a node name from its task id in a namespace segment
pub const NS_END: char = ':';

/// Cache namespace for memoized task writes
pub const CACHE_NS_WRITES: &str = "__pregel_ns_writes";

/// Names users may not use for nodes or state keys
pub const RESERVED: &[&str] = &[
    START, END, TASKS, INPUT, ERROR, INTERRUPT, RESUME, NO_WRITES, COPY, PUSH, PULL,
];

/// Pending-write channels that never reach a channel
pub(crate) fn is_special_channel(channel: &str) -> bool {
    matches!(
        channel,
        ERROR | INTERRUPT | RESUME | NO_WRITES | PUSH
    )
}

/// Trigger channel that schedules `node` in the next step.
pub fn branch_channel(node: &str) -> String {
    format!("branch:to:{node}")
}

/// Barrier channel joining `sources` into `target`.
pub fn join_channel(sources: &[String], target: &str) -> String {
    format!("join:{}:{}", sources.join("+"), target)
}
