//! # pregel-core - Bulk-synchronous graph execution with checkpoints
//!
//! `pregel-core` runs graphs of asynchronous nodes that communicate through
//! named channels, in the style of Google's Pregel. Execution proceeds in
//! supersteps: every node triggered by a channel that changed in the previous
//! step runs concurrently, its writes are buffered, and all writes are applied
//! together at the step barrier. After each step the channel state can be
//! persisted through a [`CheckpointSaver`](pregel_checkpoint::CheckpointSaver),
//! which makes runs resumable, inspectable and forkable.
//!
//! ## Core Concepts
//!
//! ### 1. StateGraph - building graphs
//!
//! [`StateGraph`] declares state keys (each backed by a channel with an
//! optional reducer), nodes, edges, waiting edges and conditional branches.
//! [`StateGraph::compile`] lowers that description into a [`Pregel`] engine
//! wrapped in a [`CompiledGraph`].
//!
//! ### 2. Supersteps
//!
//! - **Plan**: pick the nodes whose trigger channels changed since they last ran,
//!   plus any pending [`Send`] packets
//! - **Execute**: run the tasks concurrently with retry, caching and cancellation
//! - **Apply**: commit buffered writes in a deterministic order, bump channel
//!   versions and checkpoint
//!
//! ### 3. Human-in-the-loop
//!
//! Static breakpoints ([`InterruptConfig`]) pause before or after named nodes.
//! Nodes can also pause themselves with [`Runtime::interrupt`]; the run is then
//! resumed with [`Command::resume`], and the node is re-executed with the
//! answer in hand.
//!
//! ### 4. Time travel
//!
//! [`Pregel::get_state`], [`Pregel::get_state_history`] and
//! [`Pregel::update_state`] read and edit checkpointed state. Updates are
//! attributed to a node so the graph continues as if that node had written
//! them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pregel_core::{RunConfig, Runtime, StateGraph, END, START};
//! use serde_json::{json, Value};
//!
//! # async fn example() -> pregel_core::Result<()> {
//! let mut graph = StateGraph::new();
//! graph.add_state_key("count")?;
//! graph.add_node("increment", |state: Value, _runtime: Runtime| async move {
//!     let count = state["count"].as_i64().unwrap_or(0);
//!     Ok(json!({"count": count + 1}))
//! })?;
//! graph.add_edge(START, "increment")?;
//! graph.add_edge("increment", END)?;
//!
//! let app = graph.compile()?;
//! let output = app.invoke(json!({"count": 0}), RunConfig::new()).await?;
//! assert_eq!(output["count"], 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`builder`] - the [`StateGraph`] builder
//! - [`compiled`] - [`CompiledGraph`], the handle returned by compilation
//! - [`pregel`] - the engine: task planning, the superstep loop, state APIs
//! - [`graph`] - graph topology, branches and validation
//! - [`node`] - node actions and their outputs
//! - [`command`] / [`send`] - control-flow values returned by nodes
//! - [`stream`] - stream modes and chunks
//! - [`runtime`] - the per-task context passed to nodes
//! - [`retry`], [`cache`], [`store`] - per-node policies and shared storage
//!
//! ## See Also
//!
//! - [`pregel_checkpoint`] - channels, checkpoints and savers

pub mod builder;
pub mod cache;
pub mod command;
pub mod compiled;
pub mod config;
pub mod constants;
pub mod error;
pub mod graph;
pub mod interrupt;
pub mod node;
pub mod pregel;
pub mod retry;
pub mod runtime;
pub mod send;
pub mod store;
pub mod stream;

// Re-export main types
pub use builder::{NodeOptions, StateGraph};
pub use cache::{Cache, CacheKey, CachePolicy, InMemoryCache};
pub use command::{Command, GotoTarget, GraphInput, ResumeValue};
pub use compiled::CompiledGraph;
pub use config::{Durability, RunConfig, DEFAULT_RECURSION_LIMIT};
pub use constants::{COPY, END, INPUT, START};
pub use error::{GraphError, Result};
pub use graph::{Branch, Graph};
pub use interrupt::InterruptConfig;
pub use node::{node_fn, NodeOutput, PregelNode};
pub use pregel::execution::GraphStream;
pub use pregel::state::{StateSnapshotStream, StateUpdate};
pub use pregel::{Interrupt, Pregel, PregelTask, StateSnapshot, TaskPath};
pub use retry::RetryPolicy;
pub use runtime::Runtime;
pub use send::{BranchResult, Send};
pub use store::{InMemoryStore, Store};
pub use stream::{StreamChunk, StreamMode, StreamWriter};

pub use pregel_checkpoint::{CheckpointConfig, CheckpointSaver, InMemoryCheckpointSaver};
