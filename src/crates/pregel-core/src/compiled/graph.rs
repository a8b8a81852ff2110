//! CompiledGraph struct and builder methods

use crate::cache::Cache;
use crate::graph::Graph;
use crate::pregel::Pregel;
use crate::retry::RetryPolicy;
use crate::store::Store;
use pregel_checkpoint::CheckpointSaver;
use std::ops::Deref;
use std::sync::Arc;

/// Compiled graph ready for execution
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pregel: Pregel,
    graph: Graph,
}

impl CompiledGraph {
    pub(crate) fn new(pregel: Pregel, graph: Graph) -> Self {
        Self { pregel, graph }
    }

    /// Persist runs of this graph, enabling resume and state inspection.
    pub fn with_checkpointer(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.pregel = self.pregel.with_checkpointer(saver);
        self
    }

    /// Set the store for persistent state access
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.pregel = self.pregel.with_store(store);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.pregel = self.pregel.with_cache(cache);
        self
    }

    /// Retry policy for nodes that do not set their own.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.pregel = self.pregel.with_retry_policy(policy);
        self
    }

    /// The engine running this graph.
    pub fn pregel(&self) -> &Pregel {
        &self.pregel
    }

    /// Get a reference to the underlying graph
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn into_pregel(self) -> Pregel {
        self.pregel
    }

    /// Render the topology as a Mermaid flowchart.
    pub fn draw_mermaid(&self) -> String {
        self.graph.draw_mermaid()
    }
}

impl Deref for CompiledGraph {
    type Target = Pregel;

    fn deref(&self) -> &Pregel {
        &self.pregel
    }
}
