//! Compiled graphs ready to run
//!
//! [`StateGraph::compile`](crate::StateGraph::compile) lowers the builder's
//! topology into a [`Pregel`](crate::Pregel) engine and keeps the topology
//! next to it. A [`CompiledGraph`] dereferences to the engine, so `invoke`,
//! `stream`, `get_state` and `update_state` are called on it directly:
//!
//! ```rust,no_run
//! use pregel_core::{CompiledGraph, RunConfig};
//! use pregel_checkpoint::InMemoryCheckpointSaver;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example(compiled: CompiledGraph) -> pregel_core::Result<()> {
//! let graph = compiled.with_checkpointer(Arc::new(InMemoryCheckpointSaver::new()));
//! let config = RunConfig::new().with_thread_id("thread-1");
//! graph.invoke(json!({"question": "why?"}), config.clone()).await?;
//! let snapshot = graph.get_state(&config, false).await?;
//! println!("next: {:?}", snapshot.next);
//! # Ok(())
//! # }
//! ```

mod graph;

pub use graph::CompiledGraph;
