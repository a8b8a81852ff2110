//! Running a graph: `invoke`, `stream` and nested runs
//!
//! Both entry points drive the same loop; they differ only in how the
//! stream chunks reach the caller. `invoke` buffers them and returns the
//! final output, `stream` hands them out as they are produced:
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use pregel_core::{GraphInput, Pregel, RunConfig, StreamMode};
//! use serde_json::json;
//!
//! # async fn example(graph: Pregel) -> pregel_core::Result<()> {
//! let config = RunConfig::new().with_stream_modes(vec![StreamMode::Updates, StreamMode::Custom]);
//! let mut chunks = graph.stream(GraphInput::Value(json!({"topic": "rust"})), config);
//! while let Some(chunk) = chunks.next().await {
//!     let chunk = chunk?;
//!     println!("{:?} {:?}: {}", chunk.namespace, chunk.mode, chunk.payload);
//! }
//! # Ok(())
//! # }
//! ```

use super::loop_impl::PregelLoop;
use super::runner::PregelRunner;
use super::Pregel;
use crate::command::{Command, GraphInput, ResumeValue};
use crate::config::RunConfig;
use crate::error::{GraphError, Result};
use crate::runtime::{ParentContext, Runtime};
use crate::stream::{StreamChunk, StreamMode, StreamMultiplexer};
use futures::stream::Stream;
use serde_json::Value;
use std::pin::Pin;
use tokio::sync::mpsc;
use tracing::instrument;

/// Chunks produced by [`Pregel::stream`].
pub type GraphStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

impl Pregel {
    /// Run the graph until it finishes or pauses.
    ///
    /// With the default `values` stream mode, returns the final state (plus
    /// `__interrupt__` when the run paused). With other modes, returns the
    /// array of payloads streamed in those modes; each entry is
    /// `[mode, payload]` when several modes are selected.
    #[instrument(skip_all, fields(graph = %self.name, thread_id = ?config.thread_id))]
    pub async fn invoke(&self, input: impl Into<GraphInput>, config: RunConfig) -> Result<Value> {
        let modes = config.stream_mode.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = StreamMultiplexer::new(modes.clone(), tx);
        let config = RunConfig {
            subgraphs: false,
            ..config
        };
        let output = self.run(input.into(), config, stream, None).await?;

        if modes.is_empty() || modes == [StreamMode::Values] {
            return Ok(output);
        }
        let mut payloads = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            if modes.len() == 1 {
                payloads.push(chunk.payload);
            } else {
                payloads.push(Value::Array(vec![
                    Value::from(chunk.mode.as_str()),
                    chunk.payload,
                ]));
            }
        }
        Ok(Value::Array(payloads))
    }

    /// Run the graph, yielding chunks as they are produced.
    ///
    /// The run happens on a spawned task; dropping the stream cancels it.
    /// A failed run ends the stream with its error.
    pub fn stream(&self, input: impl Into<GraphInput>, config: RunConfig) -> GraphStream {
        let graph = self.clone();
        let input = input.into();
        let cancellation = config
            .cancellation
            .as_ref()
            .map(|token| token.child_token())
            .unwrap_or_default();
        let config = RunConfig {
            cancellation: Some(cancellation.clone()),
            ..config
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = StreamMultiplexer::new(config.stream_mode.clone(), tx);
        let handle = tokio::spawn(async move { graph.run(input, config, stream, None).await });

        let guard = cancellation.drop_guard();
        Box::pin(async_stream::stream! {
            let _guard = guard;
            while let Some(chunk) = rx.recv().await {
                yield Ok(chunk);
            }
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => yield Err(err),
                Err(join_err) => yield Err(GraphError::Execution(format!("run task failed: {join_err}"))),
            }
        })
    }

    /// Run several inputs concurrently with the same config.
    pub async fn batch(&self, inputs: Vec<GraphInput>, config: RunConfig) -> Vec<Result<Value>> {
        let runs = inputs
            .into_iter()
            .map(|input| self.invoke(input, config.clone()));
        futures::future::join_all(runs).await
    }

    pub(crate) async fn run(
        &self,
        input: GraphInput,
        config: RunConfig,
        stream: StreamMultiplexer,
        parent: Option<ParentContext>,
    ) -> Result<Value> {
        let mut lp = PregelLoop::setup(self, input, config, stream, parent).await?;
        let result = drive(&mut lp).await;
        lp.finish(result).await
    }

    /// Run this graph as the node of the task `runtime` belongs to.
    ///
    /// The nested run checkpoints under the task's namespace on the same
    /// thread. When the parent is resuming and the nested graph has a
    /// checkpoint there, the nested run resumes instead of starting over.
    pub(crate) async fn run_nested(&self, input: Value, runtime: &Runtime) -> Result<Value> {
        let parent = runtime.parent.clone();
        let config = RunConfig {
            checkpoint_ns: Some(runtime.checkpoint_ns.clone()),
            checkpoint_id: None,
            cancellation: Some(runtime.cancellation.clone()),
            stream_mode: parent.config.stream_mode.clone(),
            ..parent.config.clone()
        };

        let has_checkpoint = match self.checkpointer.as_ref().or(parent.checkpointer.as_ref()) {
            Some(saver) if parent.resuming => saver
                .get_tuple(&config.checkpoint_config())
                .await?
                .is_some(),
            _ => false,
        };
        let input = if has_checkpoint {
            match (&parent.resume_map, runtime.take_null_resume()) {
                (Some(answers), _) => GraphInput::Command(Command::resume(
                    ResumeValue::ByInterruptId((**answers).clone()),
                )),
                (None, Some(answer)) => GraphInput::Command(Command::resume(answer)),
                (None, None) => GraphInput::Value(Value::Null),
            }
        } else {
            GraphInput::Value(input)
        };

        let stream = match &parent.stream {
            Some(stream) => stream.clone(),
            None => {
                let (tx, _rx) = mpsc::unbounded_channel();
                StreamMultiplexer::new(Vec::new(), tx)
            }
        };
        self.run(input, config, stream, Some(parent)).await
    }
}

async fn drive(lp: &mut PregelLoop<'_>) -> Result<()> {
    while lp.tick().await? {
        PregelRunner::tick(lp).await?;
        lp.after_tick().await?;
    }
    Ok(())
}
