//! Graph topology: nodes, edges, waiting edges and conditional branches
//!
//! [`Graph`] is the structural description a [`StateGraph`](crate::StateGraph)
//! assembles before it is lowered into channels and Pregel nodes. It is kept
//! on the compiled graph for validation and rendering.
//!
//! ```text
//!   __start__ ──▶ plan ──▶ research ─┐
//!                   │                ├──▶ (join) ──▶ write ──▶ __end__
//!                   └────▶ outline ──┘
//! ```
//!
//! Conditional edges are [`Branch`]es: a router over the state after the
//! source node ran, plus an optional path map from router keys to nodes.

use crate::constants::{END, START};
use crate::error::{GraphError, Result};
use crate::send::{BranchResult, BranchTarget};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Router of a conditional edge.
pub type RouterFn = Arc<dyn Fn(&Value) -> BranchResult + Send + Sync>;

/// A conditional edge.
#[derive(Clone)]
pub struct Branch {
    pub router: RouterFn,
    /// Router key to node; without a map the router returns node names
    pub path_map: Option<HashMap<String, String>>,
}

impl Branch {
    pub fn new<F, R>(router: F) -> Self
    where
        F: Fn(&Value) -> R + Send + Sync + 'static,
        R: Into<BranchResult>,
    {
        Self {
            router: Arc::new(move |state| router(state).into()),
            path_map: None,
        }
    }

    pub fn with_path_map<I, K, V>(mut self, path_map: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.path_map = Some(
            path_map
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Route `state` and translate router keys through the path map.
    pub fn resolve(&self, state: &Value) -> Result<Vec<BranchTarget>> {
        let targets = (self.router)(state).into_targets();
        let Some(path_map) = &self.path_map else {
            return Ok(targets);
        };
        targets
            .into_iter()
            .map(|target| match target {
                BranchTarget::Node(key) => path_map
                    .get(&key)
                    .map(|node| BranchTarget::Node(node.clone()))
                    .ok_or_else(|| {
                        GraphError::invalid_update(format!(
                            "branch returned `{key}`, which is not in its path map"
                        ))
                    }),
                send => Ok(send),
            })
            .collect()
    }

    /// Nodes this branch can route to, or `None` when any node is possible.
    pub fn possible_targets(&self) -> Option<BTreeSet<String>> {
        self.path_map
            .as_ref()
            .map(|map| map.values().cloned().collect())
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("router", &"<function>")
            .field("path_map", &self.path_map)
            .finish()
    }
}

/// Structural facts about a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfo {
    /// Nodes reachable through `Command::goto`
    pub ends: Vec<String>,
    pub is_subgraph: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub nodes: BTreeMap<String, NodeInfo>,
    /// Plain edges, `(source, target)`
    pub edges: BTreeSet<(String, String)>,
    /// Edges that fire once every source finished, `(sources, target)`
    pub waiting_edges: BTreeSet<(Vec<String>, String)>,
    /// Conditional edges by source node
    pub branches: BTreeMap<String, Vec<Branch>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_known(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    /// Check that the topology can be compiled.
    ///
    /// `interrupt_nodes` are the nodes named in static breakpoints.
    pub fn validate(&self, interrupt_nodes: &[String]) -> Result<()> {
        for (source, target) in &self.edges {
            if source != START && !self.is_known(source) {
                return Err(GraphError::validation(format!(
                    "edge starts at unknown node `{source}`"
                )));
            }
            if target != END && !self.is_known(target) {
                return Err(GraphError::validation(format!(
                    "edge ends at unknown node `{target}`"
                )));
            }
        }
        for (sources, target) in &self.waiting_edges {
            if let Some(unknown) = sources.iter().find(|s| !self.is_known(s)) {
                return Err(GraphError::validation(format!(
                    "waiting edge starts at unknown node `{unknown}`"
                )));
            }
            if target != END && !self.is_known(target) {
                return Err(GraphError::validation(format!(
                    "waiting edge ends at unknown node `{target}`"
                )));
            }
        }
        for (source, branches) in &self.branches {
            if source != START && !self.is_known(source) {
                return Err(GraphError::validation(format!(
                    "branch starts at unknown node `{source}`"
                )));
            }
            for target in branches.iter().filter_map(Branch::possible_targets).flatten() {
                if target != END && !self.is_known(&target) {
                    return Err(GraphError::validation(format!(
                        "branch from `{source}` maps to unknown node `{target}`"
                    )));
                }
            }
        }
        for (name, info) in &self.nodes {
            if let Some(unknown) = info.ends.iter().find(|e| *e != END && !self.is_known(e)) {
                return Err(GraphError::validation(format!(
                    "node `{name}` may route to unknown node `{unknown}`"
                )));
            }
        }

        let has_entry = self.edges.iter().any(|(source, _)| source == START)
            || self.branches.contains_key(START);
        if !has_entry {
            return Err(GraphError::validation(
                "graph has no entry point; add an edge from START or set an entry point",
            ));
        }

        if let Some(unknown) = interrupt_nodes
            .iter()
            .find(|n| *n != crate::interrupt::ALL_NODES && !self.is_known(n))
        {
            return Err(GraphError::validation(format!(
                "interrupt set on unknown node `{unknown}`"
            )));
        }

        let reachable = self.reachable();
        if let Some(unreachable) = self.nodes.keys().find(|n| !reachable.contains(*n)) {
            return Err(GraphError::UnreachableNode(unreachable.clone()));
        }
        Ok(())
    }

    /// Nodes reachable from START.
    pub fn reachable(&self) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([START.to_string()]);
        while let Some(node) = queue.pop_front() {
            for next in self.successors(&node) {
                if next != END && seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    fn successors(&self, node: &str) -> Vec<String> {
        let mut next: Vec<String> = self
            .edges
            .iter()
            .filter(|(source, _)| source == node)
            .map(|(_, target)| target.clone())
            .collect();
        next.extend(
            self.waiting_edges
                .iter()
                .filter(|(sources, _)| sources.iter().any(|s| s == node))
                .map(|(_, target)| target.clone()),
        );
        for branch in self.branches.get(node).into_iter().flatten() {
            match branch.possible_targets() {
                Some(targets) => next.extend(targets),
                None => next.extend(self.nodes.keys().cloned()),
            }
        }
        if let Some(info) = self.nodes.get(node) {
            next.extend(info.ends.iter().cloned());
        }
        next
    }

    /// Render the topology as a Mermaid flowchart.
    pub fn draw_mermaid(&self) -> String {
        let mut output = String::from("graph TD\n");
        output.push_str(&format!("    {}((START))\n", sanitize_id(START)));
        output.push_str(&format!("    {}((END))\n", sanitize_id(END)));

        for (name, info) in &self.nodes {
            let (open, close) = if info.is_subgraph {
                ("[[", "]]")
            } else if self.branches.contains_key(name) {
                ("{", "}")
            } else {
                ("[", "]")
            };
            output.push_str(&format!(
                "    {}{open}\"{}\"{close}\n",
                sanitize_id(name),
                escape_mermaid(name)
            ));
        }

        for (source, target) in &self.edges {
            output.push_str(&format!("    {} --> {}\n", sanitize_id(source), sanitize_id(target)));
        }
        for (sources, target) in &self.waiting_edges {
            for source in sources {
                output.push_str(&format!(
                    "    {} ==> {}\n",
                    sanitize_id(source),
                    sanitize_id(target)
                ));
            }
        }
        for (source, branches) in &self.branches {
            for branch in branches {
                match &branch.path_map {
                    Some(path_map) => {
                        let sorted: BTreeMap<_, _> = path_map.iter().collect();
                        for (label, target) in sorted {
                            output.push_str(&format!(
                                "    {} -.\"{}\".-> {}\n",
                                sanitize_id(source),
                                escape_mermaid(label),
                                sanitize_id(target)
                            ));
                        }
                    }
                    None => {
                        for target in self.nodes.keys().map(String::as_str).chain([END]) {
                            output.push_str(&format!(
                                "    {} -.-> {}\n",
                                sanitize_id(source),
                                sanitize_id(target)
                            ));
                        }
                    }
                }
            }
        }
        for (source, info) in &self.nodes {
            for target in &info.ends {
                output.push_str(&format!("    {} -.-> {}\n", sanitize_id(source), sanitize_id(target)));
            }
        }
        output
    }
}

fn escape_mermaid(s: &str) -> String {
    s.replace('"', "&quot;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Mermaid ids must be alphanumeric or underscore
fn sanitize_id(s: &str) -> String {
    s.trim_matches('_').replace(['-', '.', ' '], "_")
}
