//! Error types for graph construction and execution
//!
//! All fallible operations in this crate return [`Result<T>`], an alias over
//! [`GraphError`]. Errors fall into three groups:
//!
//! - **Build errors** - raised while assembling or compiling a graph:
//!   [`GraphError::Validation`], [`GraphError::UnreachableNode`]
//! - **Run errors** - raised by a run: [`GraphError::EmptyInput`],
//!   [`GraphError::InvalidUpdate`], [`GraphError::Recursion`],
//!   [`GraphError::NodeExecution`], [`GraphError::Timeout`],
//!   [`GraphError::Cancelled`]
//! - **Control flow** - [`GraphError::Interrupt`] pauses a run. At the top
//!   level it never reaches the caller: the run returns normally with an
//!   `__interrupt__` entry instead. Nested graphs propagate it to the parent.
//!
//! Node functions return `Result<_, GraphError>` as well, so a node can
//! propagate serialization errors with `?` or raise its own
//! [`GraphError::Custom`].
//!
//! ```rust
//! use pregel_core::GraphError;
//!
//! let err = GraphError::invalid_update("Expected an object, got 3");
//! assert_eq!(err.to_string(), "Invalid update: Expected an object, got 3");
//! assert!(!err.is_interrupt());
//! ```

use crate::pregel::types::Interrupt;
use thiserror::Error;

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while building or running a graph
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure or configuration is invalid
    #[error("Graph validation failed: {0}")]
    Validation(String),

    /// A node cannot be reached from the entry point
    #[error("Node `{0}` is not reachable from the start of the graph")]
    UnreachableNode(String),

    /// A run was started without input and there was nothing to resume
    #[error("Received no input: {0}")]
    EmptyInput(String),

    /// A write could not be applied to its channel
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    /// The run paused waiting for external input
    #[error("Graph interrupted ({} pending interrupt(s))", .0.len())]
    Interrupt(Vec<Interrupt>),

    /// The run exceeded its superstep budget
    #[error(
        "Recursion limit of {limit} reached without hitting a stop condition. \
         Raise `recursion_limit` in the run config if the graph is expected to run longer"
    )]
    Recursion { limit: usize },

    /// A node failed after exhausting its retries
    #[error("Node `{node}` failed at step {step}: {source}")]
    NodeExecution {
        node: String,
        step: i64,
        #[source]
        source: Box<GraphError>,
    },

    /// Engine-level execution failure
    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] pregel_checkpoint::CheckpointError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Missing or conflicting configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Operation timed out after {duration_ms}ms: {operation}")]
    Timeout {
        operation: String,
        duration_ms: u64,
    },

    /// The run was cancelled
    #[error("Execution cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(String),

    #[error("{0}")]
    Custom(String),
}

impl GraphError {
    pub fn node_execution(node: impl Into<String>, step: i64, source: GraphError) -> Self {
        Self::NodeExecution {
            node: node.into(),
            step,
            source: Box::new(source),
        }
    }

    pub fn invalid_update(message: impl Into<String>) -> Self {
        Self::InvalidUpdate(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }

    /// Whether this error (or the node error it wraps) pauses the run.
    pub fn is_interrupt(&self) -> bool {
        self.interrupts().is_some()
    }

    /// Interrupts carried by this error, looking through node wrappers.
    pub fn interrupts(&self) -> Option<&[Interrupt]> {
        match self {
            Self::Interrupt(interrupts) => Some(interrupts),
            Self::NodeExecution { source, .. } => source.interrupts(),
            _ => None,
        }
    }

    /// Errors that retrying the same task cannot fix.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Interrupt(_)
            | Self::InvalidUpdate(_)
            | Self::Validation(_)
            | Self::Cancelled
            | Self::Recursion { .. } => true,
            Self::NodeExecution { source, .. } => source.is_permanent(),
            _ => false,
        }
    }
}

impl From<crate::store::StoreError> for GraphError {
    fn from(err: crate::store::StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interrupts_seen_through_node_wrapper() {
        let interrupt = Interrupt::new(json!("approve?"), "id-1");
        let err = GraphError::node_execution(
            "review",
            2,
            GraphError::Interrupt(vec![interrupt.clone()]),
        );
        assert!(err.is_interrupt());
        assert_eq!(err.interrupts().unwrap(), &[interrupt]);
        assert!(err.is_permanent());
    }

    #[test]
    fn test_node_execution_message_includes_step() {
        let err = GraphError::node_execution("fetch", 3, GraphError::custom("boom"));
        assert_eq!(err.to_string(), "Node `fetch` failed at step 3: boom");
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_recursion_message_mentions_limit() {
        let err = GraphError::Recursion { limit: 25 };
        assert!(err.to_string().contains("25"));
    }
}
