//! # pregel-checkpoint - channels and state persistence for the pregel engine
//!
//! This crate holds the data model shared by the execution engine and any
//! persistence backend:
//!
//! - [`Channel`] - the closed set of state slots (last value, topic,
//!   ephemeral, binary operator, named barrier) with their merge policies
//! - [`Checkpoint`] - an immutable snapshot of every channel after a superstep,
//!   with the channel versions that drive scheduling
//! - [`CheckpointSaver`] - the async persistence trait, and
//!   [`InMemoryCheckpointSaver`], its in-process implementation
//!
//! ## Lifecycle of a checkpoint
//!
//! ```text
//!   channels ──create_checkpoint──▶ Checkpoint ──put──▶ CheckpointSaver
//!      ▲                                                     │
//!      └──────────channels_from_checkpoint◀──get_tuple───────┘
//! ```
//!
//! Writes produced by tasks between two checkpoints are stored with
//! [`CheckpointSaver::put_writes`] as pending writes, so a step that was
//! interrupted or partially failed can resume without re-running the tasks
//! that already finished.
//!
//! ## Example
//!
//! ```rust
//! use pregel_checkpoint::{
//!     create_checkpoint, Channel, Checkpoint, CheckpointConfig, CheckpointMetadata,
//!     CheckpointSaver, InMemoryCheckpointSaver,
//! };
//! use serde_json::json;
//! use std::collections::HashMap;
//!
//! # #[tokio::main]
//! # async fn main() -> pregel_checkpoint::Result<()> {
//! let mut channels = HashMap::new();
//! channels.insert("count".to_string(), Channel::sum());
//! channels.get_mut("count").unwrap().update(vec![json!(2), json!(3)])?;
//!
//! let checkpoint = create_checkpoint(&Checkpoint::empty(), Some(&channels));
//! let saver = InMemoryCheckpointSaver::new();
//! let config = CheckpointConfig::new().with_thread_id("thread-1");
//! let saved = saver
//!     .put(&config, checkpoint, CheckpointMetadata::new(), HashMap::new())
//!     .await?;
//!
//! let restored = saver.get(&saved).await?.unwrap();
//! assert_eq!(restored.channel_values["count"], json!(5));
//! # Ok(())
//! # }
//! ```

pub mod channels;
pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod serializer;
pub mod traits;

pub use channels::{channels_from_checkpoint, create_checkpoint, Channel, Reducer};
pub use checkpoint::{
    ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointId,
    CheckpointMetadata, CheckpointSource, CheckpointTuple, PendingWrite,
};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointSaver;
pub use serializer::{JsonSerializer, SerializerProtocol};
pub use traits::{CheckpointSaver, CheckpointStream};
