//! StateGraph builder API for constructing stateful graph workflows
//!
//! A [`StateGraph`] collects state keys, nodes and edges, then compiles them
//! into a [`CompiledGraph`] running on the Pregel engine. Every state key
//! becomes a channel; nodes read the whole state and return partial updates
//! that are merged into it per key (last value wins, or a reducer).
//!
//! # Architecture
//!
//! ```text
//! StateGraph                              Pregel
//! ──────────                              ──────
//! state key "x"           ──compile──▶    channel "x" (last value / reducer)
//! node "a"                                node "a", triggered by "branch:to:a"
//! edge a ─▶ b                             "a" writes "branch:to:b"
//! waiting edge [a, b] ─▶ c                "a", "b" write "join:a+b:c"; "c" waits on it
//! conditional edge from a                 "a" routes after its writes are visible
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pregel_core::{RunConfig, StateGraph, END, START};
//! use serde_json::{json, Value};
//!
//! # async fn example() -> pregel_core::Result<()> {
//! let mut graph = StateGraph::new();
//! graph.add_state_key("count")?;
//! graph.add_reducer("log", |left, right| {
//!     let mut items = left.as_array().cloned().unwrap_or_default();
//!     items.push(right);
//!     Value::Array(items)
//! })?;
//!
//! graph.add_node("increment", |state: Value, _runtime| async move {
//!     let count = state["count"].as_i64().unwrap_or(0);
//!     Ok(json!({"count": count + 1, "log": "incremented"}))
//! })?;
//! graph.add_edge(START, "increment")?;
//! graph.add_edge("increment", END)?;
//!
//! let compiled = graph.compile()?;
//! let result = compiled.invoke(json!({"count": 41}), RunConfig::new()).await?;
//! assert_eq!(result["count"], json!(42));
//! # Ok(())
//! # }
//! ```
//!
//! # Conditional routing
//!
//! ```rust,no_run
//! use pregel_core::{Branch, StateGraph, END, START};
//! use serde_json::{json, Value};
//!
//! # fn example() -> pregel_core::Result<()> {
//! let mut graph = StateGraph::new();
//! graph.add_state_key("score")?;
//! graph.add_node("grade", |_: Value, _| async { Ok(json!({"score": 87})) })?;
//! graph.add_node("celebrate", |_: Value, _| async { Ok(Value::Null) })?;
//! graph.add_edge(START, "grade")?;
//! graph.add_conditional_edges(
//!     "grade",
//!     Branch::new(|state: &Value| {
//!         if state["score"].as_i64().unwrap_or(0) > 80 { "pass" } else { "fail" }
//!     })
//!     .with_path_map([("pass", "celebrate"), ("fail", END)]),
//! )?;
//! graph.add_edge("celebrate", END)?;
//! let compiled = graph.compile()?;
//! # Ok(())
//! # }
//! ```

use crate::cache::CachePolicy;
use crate::compiled::CompiledGraph;
use crate::constants::{branch_channel, join_channel, END, NS_END, NS_SEP, RESERVED, START};
use crate::error::{GraphError, Result};
use crate::graph::{Branch, Graph, NodeInfo};
use crate::interrupt::InterruptConfig;
use crate::node::{node_fn, NodeAction, NodeOutput, PregelNode};
use crate::pregel::{ChannelWrite, Pregel};
use crate::retry::RetryPolicy;
use crate::runtime::Runtime;
use pregel_checkpoint::Channel;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Per-node settings for [`StateGraph::add_node_with_options`].
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub retry_policy: Option<RetryPolicy>,
    pub cache_policy: Option<CachePolicy>,
    /// Nodes the node may route to with `Command::goto`
    pub ends: Vec<String>,
}

impl NodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    pub fn with_ends<I, S>(mut self, ends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ends = ends.into_iter().map(Into::into).collect();
        self
    }
}

struct NodeSpec {
    action: NodeAction,
    options: NodeOptions,
}

/// Builder for graphs whose nodes share one state object.
pub struct StateGraph {
    name: String,
    graph: Graph,
    /// State keys in declaration order, with their channels
    state: Vec<(String, Channel)>,
    nodes: BTreeMap<String, NodeSpec>,
}

impl StateGraph {
    pub fn new() -> Self {
        Self::with_name("StateGraph")
    }

    /// Builder whose compiled graph logs under `name`.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: Graph::new(),
            state: Vec::new(),
            nodes: BTreeMap::new(),
        }
    }

    /// Add a state key whose value is replaced by each write.
    ///
    /// Two nodes writing the key in the same step is not an error; the
    /// write applied last wins.
    pub fn add_state_key(&mut self, key: impl Into<String>) -> Result<&mut Self> {
        self.add_channel(key, Channel::last_value())
    }

    /// Add a state key backed by a specific channel.
    pub fn add_channel(&mut self, key: impl Into<String>, channel: Channel) -> Result<&mut Self> {
        let key = key.into();
        if key.is_empty() || RESERVED.contains(&key.as_str()) {
            return Err(GraphError::validation(format!("state key `{key}` is reserved")));
        }
        if self.state.iter().any(|(existing, _)| *existing == key) {
            return Err(GraphError::validation(format!("state key `{key}` already exists")));
        }
        if self.nodes.contains_key(&key) {
            return Err(GraphError::validation(format!(
                "`{key}` is already being used as a node name"
            )));
        }
        self.state.push((key, channel));
        Ok(self)
    }

    /// Add a state key folding writes with `reducer(current, update)`.
    ///
    /// The first write is folded into `null`.
    pub fn add_reducer<F>(&mut self, key: impl Into<String>, reducer: F) -> Result<&mut Self>
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        self.add_channel(key, Channel::binary_operator(reducer))
    }

    /// Add a node running an async function over the current state.
    pub fn add_node<F, Fut, O>(&mut self, name: impl Into<String>, func: F) -> Result<&mut Self>
    where
        F: Fn(Value, Runtime) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: Into<NodeOutput>,
    {
        self.add_node_with_options(name, func, NodeOptions::default())
    }

    pub fn add_node_with_options<F, Fut, O>(
        &mut self,
        name: impl Into<String>,
        func: F,
        options: NodeOptions,
    ) -> Result<&mut Self>
    where
        F: Fn(Value, Runtime) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: Into<NodeOutput>,
    {
        self.insert_node(name.into(), NodeAction::Function(node_fn(func)), options)
    }

    /// Add a compiled graph as a node.
    ///
    /// The nested graph receives the parent state, checkpoints under the
    /// task's namespace on the same thread, and its output is applied to
    /// the parent's state keys.
    pub fn add_subgraph(&mut self, name: impl Into<String>, subgraph: &CompiledGraph) -> Result<&mut Self> {
        let action = NodeAction::Subgraph(Arc::new(subgraph.pregel().clone()));
        self.insert_node(name.into(), action, NodeOptions::default())
    }

    fn insert_node(&mut self, name: String, action: NodeAction, options: NodeOptions) -> Result<&mut Self> {
        if name.is_empty() || RESERVED.contains(&name.as_str()) {
            return Err(GraphError::validation(format!("node name `{name}` is reserved")));
        }
        if name.contains(NS_SEP) || name.contains(NS_END) {
            return Err(GraphError::validation(format!(
                "node name `{name}` must not contain `{NS_SEP}` or `{NS_END}`"
            )));
        }
        if self.nodes.contains_key(&name) {
            return Err(GraphError::validation(format!("node `{name}` already exists")));
        }
        if self.state.iter().any(|(key, _)| *key == name) {
            return Err(GraphError::validation(format!(
                "`{name}` is already being used as a state key"
            )));
        }
        self.graph.nodes.insert(
            name.clone(),
            NodeInfo {
                ends: options.ends.clone(),
                is_subgraph: matches!(action, NodeAction::Subgraph(_)),
            },
        );
        self.nodes.insert(name, NodeSpec { action, options });
        Ok(self)
    }

    /// Run `to` after `from` finished.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> Result<&mut Self> {
        let (from, to) = (from.into(), to.into());
        if from == END {
            return Err(GraphError::validation("END cannot be the start of an edge"));
        }
        if to == START {
            return Err(GraphError::validation("START cannot be the end of an edge"));
        }
        self.graph.edges.insert((from, to));
        Ok(self)
    }

    /// Run `to` once every node in `sources` finished.
    pub fn add_waiting_edge<I, S>(&mut self, sources: I, to: impl Into<String>) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let to = to.into();
        let mut sources: Vec<String> = sources.into_iter().map(Into::into).collect();
        sources.sort();
        sources.dedup();
        if sources.is_empty() {
            return Err(GraphError::validation("a waiting edge needs at least one source"));
        }
        if sources.iter().any(|s| s == START || s == END) {
            return Err(GraphError::validation(
                "waiting edges can only start at graph nodes",
            ));
        }
        if to == START {
            return Err(GraphError::validation("START cannot be the end of an edge"));
        }
        self.graph.waiting_edges.insert((sources, to));
        Ok(self)
    }

    /// Route with `branch` after `source` finished.
    pub fn add_conditional_edges(&mut self, source: impl Into<String>, branch: Branch) -> Result<&mut Self> {
        let source = source.into();
        if source == END {
            return Err(GraphError::validation("END cannot be the start of an edge"));
        }
        self.graph.branches.entry(source).or_default().push(branch);
        Ok(self)
    }

    pub fn set_entry_point(&mut self, node: impl Into<String>) -> Result<&mut Self> {
        self.add_edge(START, node)
    }

    pub fn set_finish_point(&mut self, node: impl Into<String>) -> Result<&mut Self> {
        self.add_edge(node, END)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn compile(self) -> Result<CompiledGraph> {
        self.compile_with_interrupts(InterruptConfig::default())
    }

    /// Compile with static breakpoints before or after the given nodes.
    pub fn compile_with_interrupts(mut self, interrupts: InterruptConfig) -> Result<CompiledGraph> {
        if self.state.is_empty() {
            return Err(GraphError::validation("graph has no state keys"));
        }
        let interrupt_nodes: Vec<String> = interrupts
            .interrupt_before
            .iter()
            .chain(&interrupts.interrupt_after)
            .cloned()
            .collect();
        self.graph.validate(&interrupt_nodes)?;

        let state_keys: Vec<String> = self.state.iter().map(|(key, _)| key.clone()).collect();
        let mut pregel = Pregel::new(self.name.clone()).with_state_keys(state_keys.clone());
        for (key, channel) in &self.state {
            pregel = pregel.with_channel(key.clone(), channel.clone());
        }
        for name in self.nodes.keys() {
            pregel = pregel.with_channel(branch_channel(name), Channel::ephemeral(false));
        }
        let joins: BTreeSet<(Vec<String>, String)> = self
            .graph
            .waiting_edges
            .iter()
            .filter(|(_, target)| target != END)
            .cloned()
            .collect();
        for (sources, target) in &joins {
            pregel = pregel.with_channel(
                join_channel(sources, target),
                Channel::named_barrier(sources.iter().cloned()),
            );
        }

        pregel = pregel.with_input_writers(self.writers_for(START, &state_keys));

        let nodes = std::mem::take(&mut self.nodes);
        for (name, spec) in nodes {
            let mut triggers = vec![branch_channel(&name)];
            triggers.extend(
                joins
                    .iter()
                    .filter(|(_, target)| *target == name)
                    .map(|(sources, target)| join_channel(sources, target)),
            );
            let writers = self.writers_for(&name, &state_keys);
            let mut node = PregelNode::new(name.clone(), spec.action)
                .with_triggers(triggers)
                .with_channels(state_keys.clone())
                .with_writers(writers);
            node.ends = spec.options.ends;
            if let Some(policy) = spec.options.retry_policy {
                node = node.with_retry_policy(policy);
            }
            if let Some(policy) = spec.options.cache_policy {
                node = node.with_cache_policy(policy);
            }
            pregel = pregel.with_node(node);
        }

        pregel = pregel
            .with_interrupt_before(interrupts.interrupt_before)
            .with_interrupt_after(interrupts.interrupt_after);
        pregel.validate()?;

        debug!(
            graph = %self.name,
            nodes = self.graph.nodes.len(),
            edges = self.graph.edges.len(),
            "compiled state graph"
        );
        Ok(CompiledGraph::new(pregel, self.graph))
    }

    /// Writers of `node`: its state update, then its edges, then its branches.
    fn writers_for(&self, node: &str, state_keys: &[String]) -> Vec<ChannelWrite> {
        let mut writers = vec![ChannelWrite::state(state_keys.to_vec())];
        writers.extend(
            self.graph
                .edges
                .iter()
                .filter(|(source, target)| source == node && target != END)
                .map(|(_, target)| ChannelWrite::edge(branch_channel(target), Value::Null)),
        );
        writers.extend(
            self.graph
                .waiting_edges
                .iter()
                .filter(|(sources, target)| target != END && sources.iter().any(|s| s == node))
                .map(|(sources, target)| {
                    ChannelWrite::edge(join_channel(sources, target), Value::from(node))
                }),
        );
        writers.extend(
            self.graph
                .branches
                .get(node)
                .into_iter()
                .flatten()
                .cloned()
                .map(ChannelWrite::Branch),
        );
        writers
    }
}

impl Default for StateGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use serde_json::json;

    fn append(left: Value, right: Value) -> Value {
        let mut items = left.as_array().cloned().unwrap_or_default();
        match right {
            Value::Array(more) => items.extend(more),
            other => items.push(other),
        }
        Value::Array(items)
    }

    fn echo(label: &'static str) -> impl Fn(Value, Runtime) -> std::future::Ready<Result<Value>> {
        move |_, _| std::future::ready(Ok(json!({"trail": [label]})))
    }

    #[test]
    fn test_rejects_bad_node_names() {
        let mut graph = StateGraph::new();
        graph.add_state_key("x").unwrap();
        assert!(graph.add_node(START, echo("s")).is_err());
        assert!(graph.add_node("a|b", echo("a")).is_err());
        assert!(graph.add_node("a:b", echo("a")).is_err());
        assert!(graph.add_node("x", echo("x")).is_err());
        graph.add_node("a", echo("a")).unwrap();
        let err = graph.add_node("a", echo("a")).err().unwrap();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_rejects_edges_from_end_and_to_start() {
        let mut graph = StateGraph::new();
        assert!(graph.add_edge(END, "a").is_err());
        assert!(graph.add_edge("a", START).is_err());
        assert!(graph.add_waiting_edge(["a", START], "b").is_err());
        assert!(graph.add_state_key("__interrupt__").is_err());
    }

    #[test]
    fn test_compile_validates_topology() {
        let mut graph = StateGraph::new();
        graph.add_state_key("x").unwrap();
        graph.add_node("a", echo("a")).unwrap();
        graph.add_edge("a", END).unwrap();
        let err = graph.compile().err().unwrap();
        assert!(err.to_string().contains("entry point"));

        let mut graph = StateGraph::new();
        graph.add_state_key("x").unwrap();
        graph.add_node("a", echo("a")).unwrap();
        graph.add_edge(START, "a").unwrap();
        graph.add_edge("a", "ghost").unwrap();
        assert!(matches!(graph.compile(), Err(GraphError::Validation(_))));

        let mut graph = StateGraph::new();
        graph.add_state_key("x").unwrap();
        graph.add_node("a", echo("a")).unwrap();
        graph.add_node("island", echo("island")).unwrap();
        graph.add_edge(START, "a").unwrap();
        assert!(matches!(
            graph.compile(),
            Err(GraphError::UnreachableNode(node)) if node == "island"
        ));

        let mut graph = StateGraph::new();
        graph.add_state_key("x").unwrap();
        graph.add_node("a", echo("a")).unwrap();
        graph.add_edge(START, "a").unwrap();
        let interrupts = InterruptConfig::new().with_interrupt_before(["nope"]);
        assert!(graph.compile_with_interrupts(interrupts).is_err());
    }

    #[test]
    fn test_lowering_creates_trigger_and_join_channels() {
        let mut graph = StateGraph::new();
        graph.add_reducer("trail", append).unwrap();
        for name in ["a", "b", "c"] {
            graph.add_node(name, echo(name)).unwrap();
        }
        graph.add_edge(START, "a").unwrap();
        graph.add_edge(START, "b").unwrap();
        graph.add_waiting_edge(["b", "a"], "c").unwrap();
        graph.add_edge("c", END).unwrap();
        let compiled = graph.compile().unwrap();

        let pregel = compiled.pregel();
        let join = join_channel(&["a".to_string(), "b".to_string()], "c");
        assert!(pregel.channels.contains_key(&branch_channel("a")));
        assert!(pregel.channels.contains_key(&join));
        assert_eq!(
            pregel.nodes["c"].triggers,
            vec![branch_channel("c"), join.clone()]
        );
        assert_eq!(pregel.trigger_to_nodes[&join], vec!["c".to_string()]);
        assert_eq!(pregel.input_writers.len(), 3);
    }

    #[tokio::test]
    async fn test_waiting_edge_joins_parallel_branches() {
        let mut graph = StateGraph::new();
        graph.add_reducer("trail", append).unwrap();
        graph.add_node("fast", echo("fast")).unwrap();
        graph.add_node("slow_1", echo("slow_1")).unwrap();
        graph.add_node("slow_2", echo("slow_2")).unwrap();
        graph.add_node("join", echo("join")).unwrap();
        graph.add_edge(START, "fast").unwrap();
        graph.add_edge(START, "slow_1").unwrap();
        graph.add_edge("slow_1", "slow_2").unwrap();
        graph.add_waiting_edge(["fast", "slow_2"], "join").unwrap();
        graph.add_edge("join", END).unwrap();

        let output = graph
            .compile()
            .unwrap()
            .invoke(json!({"trail": []}), RunConfig::new())
            .await
            .unwrap();
        // join runs once, after both of its sources
        assert_eq!(
            output,
            json!({"trail": ["fast", "slow_1", "slow_2", "join"]})
        );
    }

    #[tokio::test]
    async fn test_conditional_edges_with_path_map() {
        let mut graph = StateGraph::new();
        graph.add_state_key("n").unwrap();
        graph.add_state_key("verdict").unwrap();
        graph
            .add_node("check", |state: Value, _| async move {
                Ok(json!({"n": state["n"].as_i64().unwrap_or(0) * 2}))
            })
            .unwrap();
        graph
            .add_node("big", |_: Value, _| async { Ok(json!({"verdict": "big"})) })
            .unwrap();
        graph
            .add_node("small", |_: Value, _| async { Ok(json!({"verdict": "small"})) })
            .unwrap();
        graph.set_entry_point("check").unwrap();
        graph
            .add_conditional_edges(
                "check",
                Branch::new(|state: &Value| {
                    if state["n"].as_i64().unwrap_or(0) > 10 {
                        "high"
                    } else {
                        "low"
                    }
                })
                .with_path_map([("high", "big"), ("low", "small")]),
            )
            .unwrap();
        graph.set_finish_point("big").unwrap();
        graph.set_finish_point("small").unwrap();
        let compiled = graph.compile().unwrap();

        let output = compiled.invoke(json!({"n": 6}), RunConfig::new()).await.unwrap();
        assert_eq!(output, json!({"n": 12, "verdict": "big"}));
        let output = compiled.invoke(json!({"n": 2}), RunConfig::new()).await.unwrap();
        assert_eq!(output, json!({"n": 4, "verdict": "small"}));
    }
}
