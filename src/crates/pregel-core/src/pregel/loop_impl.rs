//! The per-run state machine driving supersteps
//!
//! A [`PregelLoop`] owns the live channels of one run. The driver calls
//! [`PregelLoop::tick`] to plan a step, hands the planned tasks to the
//! runner, then calls [`PregelLoop::after_tick`] to apply their writes and
//! checkpoint the result:
//!
//! ```text
//! setup ─> tick ─┬─> (runner) ─> after_tick ─> tick ─> ... ─> finish
//!                └─> false: done / out of steps
//! ```
//!
//! Interrupts surface as `Err(GraphError::Interrupt)` from `tick`,
//! `after_tick` or the runner; [`PregelLoop::finish`] turns them into the
//! `__interrupt__` field of the output for top-level runs.

use super::algo::{
    apply_writes, prepare_next_tasks, should_interrupt, PrepareContext, VersionFn,
};
use super::checkpoint::CheckpointWriter;
use super::io::{map_command, map_input, map_output_updates, map_output_values};
use super::types::{Interrupt, PregelExecutableTask, PregelTaskWrites, WritesProtocol};
use super::Pregel;
use crate::cache::Cache;
use crate::command::{GraphInput, ResumeValue};
use crate::config::RunConfig;
use crate::constants::{ERROR, INPUT, INTERRUPT, NS_END, NULL_TASK_ID, RESUME};
use crate::error::{GraphError, Result};
use crate::runtime::{ParentContext, Runtime};
use crate::store::Store;
use crate::stream::{StreamMode, StreamMultiplexer, StreamWriter};
use pregel_checkpoint::{
    channels_from_checkpoint, create_checkpoint, Channel, ChannelVersion, ChannelVersions,
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
    PendingWrite,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopStatus {
    Pending,
    Done,
    OutOfSteps,
    InterruptBefore,
    InterruptAfter,
}

/// Version assignment backed by the checkpointer when there is one.
pub(crate) fn version_fn(
    saver: Option<Arc<dyn CheckpointSaver>>,
) -> impl Fn(Option<&ChannelVersion>) -> ChannelVersion + Send + Sync {
    move |current| match &saver {
        Some(saver) => saver.get_next_version(current),
        None => ChannelVersion::increment(current),
    }
}

pub(crate) struct PregelLoop<'g> {
    pub graph: &'g Pregel,
    pub config: RunConfig,
    input: Option<GraphInput>,
    pub stream: StreamMultiplexer,
    writer: CheckpointWriter,
    pub checkpointer: Option<Arc<dyn CheckpointSaver>>,
    pub store: Option<Arc<dyn Store>>,
    pub cache: Option<Arc<dyn Cache>>,

    pub checkpoint: Checkpoint,
    pub checkpoint_config: CheckpointConfig,
    checkpoint_metadata: CheckpointMetadata,
    checkpoint_parent_config: Option<CheckpointConfig>,
    pub checkpoint_pending_writes: Vec<PendingWrite>,
    /// Versions as of the last stored checkpoint
    stored_versions: ChannelVersions,
    pub checkpoint_ns: String,

    pub channels: HashMap<String, Channel>,
    pub step: i64,
    pub stop: i64,
    pub status: LoopStatus,
    pub tasks: BTreeMap<String, PregelExecutableTask>,
    updated_channels: Option<BTreeSet<String>>,

    is_nested: bool,
    parent: ParentContext,
    pub is_resuming: bool,
    resume_map: Option<Arc<HashMap<String, Value>>>,
    pub cancellation: CancellationToken,
    interrupt_before: Vec<String>,
    interrupt_after: Vec<String>,
}

impl<'g> PregelLoop<'g> {
    /// Load the thread's checkpoint and restore the channels.
    pub async fn setup(
        graph: &'g Pregel,
        input: GraphInput,
        config: RunConfig,
        stream: StreamMultiplexer,
        parent: Option<ParentContext>,
    ) -> Result<Self> {
        let durability = config.durability()?;
        let is_nested = parent.is_some();
        let parent = parent.unwrap_or_default();
        let checkpointer = graph
            .checkpointer
            .clone()
            .or_else(|| parent.checkpointer.clone());
        let store = graph.store.clone().or_else(|| parent.store.clone());

        if checkpointer.is_some() && config.thread_id.is_none() {
            return Err(GraphError::Configuration(
                "a graph with a checkpointer needs `thread_id` in the run config".into(),
            ));
        }

        let mut checkpoint_config = config.checkpoint_config();
        let tuple = match &checkpointer {
            Some(saver) => saver.get_tuple(&checkpoint_config).await?,
            None => None,
        };
        let (checkpoint, metadata, parent_config, pending_writes) = match tuple {
            Some(tuple) => {
                checkpoint_config = tuple.config;
                (
                    tuple.checkpoint,
                    tuple.metadata,
                    tuple.parent_config,
                    tuple.pending_writes,
                )
            }
            None => (Checkpoint::empty(), CheckpointMetadata::new(), None, Vec::new()),
        };

        let channels = channels_from_checkpoint(graph.channels.iter(), &checkpoint)?;
        let step = metadata.step.map_or(-1, |step| step + 1);
        let checkpoint_ns = checkpoint_config.namespace().to_string();
        let cancellation = config.cancellation.clone().unwrap_or_default();

        if let Some(store) = &store {
            store.start().await?;
        }

        info!(
            graph = %graph.name,
            thread_id = ?config.thread_id,
            checkpoint_ns = %checkpoint_ns,
            step,
            "starting run"
        );

        Ok(Self {
            writer: CheckpointWriter::new(checkpointer.clone(), durability),
            interrupt_before: config
                .interrupt_before
                .clone()
                .unwrap_or_else(|| graph.interrupt_before.clone()),
            interrupt_after: config
                .interrupt_after
                .clone()
                .unwrap_or_else(|| graph.interrupt_after.clone()),
            stored_versions: checkpoint.channel_versions.clone(),
            graph,
            input: Some(input),
            stream,
            checkpointer,
            store,
            cache: graph.cache.clone(),
            checkpoint,
            checkpoint_config,
            checkpoint_metadata: metadata,
            checkpoint_parent_config: parent_config,
            checkpoint_pending_writes: pending_writes,
            checkpoint_ns,
            channels,
            step,
            stop: step,
            status: LoopStatus::Pending,
            tasks: BTreeMap::new(),
            updated_channels: None,
            is_nested,
            resume_map: parent.resume_map.clone(),
            parent,
            is_resuming: false,
            cancellation,
            config,
        })
    }

    /// Plan the next step.
    ///
    /// Returns `Ok(true)` when there are tasks to run.
    pub async fn tick(&mut self) -> Result<bool> {
        if let Some(input) = self.input.take() {
            self.first(input).await?;
        }
        if self.status != LoopStatus::Pending {
            return Ok(false);
        }

        let ctx = PrepareContext {
            step: self.step,
            checkpoint_ns: &self.checkpoint_ns,
            updated_channels: self.updated_channels.as_ref(),
        };
        self.tasks = prepare_next_tasks(
            self.graph,
            &self.checkpoint,
            &self.checkpoint_pending_writes,
            &self.channels,
            &ctx,
        )?;

        if self.tasks.is_empty() {
            self.status = LoopStatus::Done;
            return Ok(false);
        }
        if self.step >= self.stop {
            self.status = LoopStatus::OutOfSteps;
            return Ok(false);
        }

        // finished tasks of an interrupted or failed step keep their writes
        if !self.checkpoint_pending_writes.is_empty() {
            for (task_id, channel, value) in &self.checkpoint_pending_writes {
                if matches!(channel.as_str(), ERROR | INTERRUPT | RESUME) {
                    continue;
                }
                if let Some(task) = self.tasks.get_mut(task_id) {
                    task.writes.push((channel.clone(), value.clone()));
                }
            }
            let restored: Vec<(&str, &[(String, Value)])> = self
                .tasks
                .values()
                .filter(|task| !task.writes.is_empty())
                .map(|task| (task.name.as_str(), task.writes.as_slice()))
                .collect();
            if let Some(updates) = map_output_updates(&self.graph.state_keys, &restored) {
                self.stream.emit(StreamMode::Updates, updates, self.step)?;
            }
        }

        if should_interrupt(&self.checkpoint, &self.interrupt_before, self.tasks.values()) {
            self.status = LoopStatus::InterruptBefore;
            return Err(GraphError::Interrupt(Vec::new()));
        }

        if self.stream.has_mode(StreamMode::Tasks) {
            for task in self.tasks.values().filter(|task| task.writes.is_empty()) {
                self.stream.emit(
                    StreamMode::Tasks,
                    json!({
                        "id": task.id,
                        "name": task.name,
                        "input": task.input,
                        "triggers": task.triggers,
                    }),
                    self.step,
                )?;
            }
        }

        debug!(step = self.step, tasks = self.tasks.len(), "planned step");
        Ok(true)
    }

    /// Apply the writes of the step that just ran and checkpoint the result.
    pub async fn after_tick(&mut self) -> Result<()> {
        let updated = {
            let next_version = version_fn(self.checkpointer.clone());
            let tasks: Vec<&dyn WritesProtocol> = self
                .tasks
                .values()
                .map(|task| task as &dyn WritesProtocol)
                .collect();
            apply_writes(
                &mut self.checkpoint,
                &mut self.channels,
                &tasks,
                Some(&next_version as VersionFn<'_>),
            )?
        };

        self.emit_values(Some(&updated))?;
        self.updated_channels = Some(updated);
        self.checkpoint_pending_writes.clear();
        self.put_checkpoint(CheckpointSource::Loop).await?;

        if should_interrupt(&self.checkpoint, &self.interrupt_after, self.tasks.values()) {
            self.status = LoopStatus::InterruptAfter;
            return Err(GraphError::Interrupt(Vec::new()));
        }
        Ok(())
    }

    /// Handle the run input: resume, apply a command, or start fresh.
    async fn first(&mut self, input: GraphInput) -> Result<()> {
        let has_versions = !self.checkpoint.channel_versions.is_empty();
        let run_id_matches = !self.is_nested
            && self.config.run_id.as_ref().is_some_and(|run_id| {
                self.checkpoint_metadata.extra.get("run_id") == Some(&Value::from(run_id.as_str()))
            });
        let is_command = matches!(input, GraphInput::Command(_));
        let null_input = matches!(&input, GraphInput::Value(Value::Null));
        self.is_resuming =
            has_versions && (null_input || is_command || self.parent.resuming || run_id_matches);

        let mut command_updates = None;
        if let GraphInput::Command(command) = &input {
            if let Some(resume) = &command.resume {
                self.record_resume(resume).await?;
            }
            let writes = map_command(self.graph, command, &self.channels)?;
            if !writes.is_empty() {
                let task = PregelTaskWrites::new(INPUT, writes);
                let next_version = version_fn(self.checkpointer.clone());
                command_updates = Some(apply_writes(
                    &mut self.checkpoint,
                    &mut self.channels,
                    &[&task as &dyn WritesProtocol],
                    Some(&next_version as VersionFn<'_>),
                )?);
            }
        }

        if self.is_resuming {
            let versions = self.checkpoint.channel_versions.clone();
            self.checkpoint
                .versions_seen
                .insert(INTERRUPT.to_string(), versions);
            self.updated_channels = None;
            self.emit_values(None)?;
            debug!(step = self.step, "resuming thread");
        } else if let GraphInput::Value(value) = input {
            if value.is_null() {
                return Err(GraphError::EmptyInput(
                    "no input was given and the thread has nothing to resume".into(),
                ));
            }
            let input_writes = map_input(self.graph, value, &self.channels)?;
            if input_writes.is_empty() {
                return Err(GraphError::EmptyInput(
                    "the input did not write to any input channel".into(),
                ));
            }

            // unfinished tasks of the previous checkpoint are discarded
            let ctx = PrepareContext {
                step: self.step,
                checkpoint_ns: &self.checkpoint_ns,
                updated_channels: None,
            };
            let discarded = prepare_next_tasks(
                self.graph,
                &self.checkpoint,
                &self.checkpoint_pending_writes,
                &self.channels,
                &ctx,
            )?;
            let updated = {
                let input_task = PregelTaskWrites::new(INPUT, input_writes);
                let mut tasks: Vec<&dyn WritesProtocol> = discarded
                    .values()
                    .map(|task| task as &dyn WritesProtocol)
                    .collect();
                tasks.push(&input_task);

                let next_version = version_fn(self.checkpointer.clone());
                apply_writes(
                    &mut self.checkpoint,
                    &mut self.channels,
                    &tasks,
                    Some(&next_version as VersionFn<'_>),
                )?
            };
            self.updated_channels = Some(updated);
            self.checkpoint_pending_writes.clear();
            self.emit_values(None)?;
            self.put_checkpoint(CheckpointSource::Input).await?;
        } else if let Some(updated) = command_updates {
            self.updated_channels = Some(updated);
            self.emit_values(None)?;
            self.put_checkpoint(CheckpointSource::Input).await?;
        } else {
            return Err(GraphError::EmptyInput(
                "the command has nothing to apply and the thread has nothing to resume".into(),
            ));
        }

        let limit = i64::try_from(self.config.recursion_limit).map_err(|_| {
            GraphError::Configuration(format!(
                "recursion_limit {} does not fit a step counter",
                self.config.recursion_limit
            ))
        })?;
        self.stop = self.step.saturating_add(limit);
        Ok(())
    }

    /// Store resume values where the interrupted tasks will find them.
    async fn record_resume(&mut self, resume: &ResumeValue) -> Result<()> {
        match resume {
            ResumeValue::Single(value) => {
                self.put_writes(NULL_TASK_ID, vec![(RESUME.to_string(), value.clone())])
                    .await
            }
            ResumeValue::ByInterruptId(answers) => {
                let mut per_task: BTreeMap<String, Vec<Value>> = BTreeMap::new();
                for (task_id, channel, value) in &self.checkpoint_pending_writes {
                    if channel != INTERRUPT {
                        continue;
                    }
                    let interrupts: Vec<Interrupt> = serde_json::from_value(value.clone())?;
                    for interrupt in interrupts {
                        if let Some(answer) = answers.get(&interrupt.id) {
                            per_task
                                .entry(task_id.clone())
                                .or_default()
                                .push(answer.clone());
                        }
                    }
                }
                for (task_id, mut new_answers) in per_task {
                    let mut resume: Vec<Value> = self
                        .checkpoint_pending_writes
                        .iter()
                        .filter(|(tid, channel, _)| *tid == task_id && channel == RESUME)
                        .flat_map(|(_, _, value)| match value {
                            Value::Array(values) => values.clone(),
                            other => vec![other.clone()],
                        })
                        .collect();
                    resume.append(&mut new_answers);
                    self.put_writes(&task_id, vec![(RESUME.to_string(), Value::Array(resume))])
                        .await?;
                }
                self.resume_map = Some(Arc::new(answers.clone()));
                Ok(())
            }
        }
    }

    /// Record writes of `task_id` against the current checkpoint.
    ///
    /// Writing a channel again for the same task replaces the earlier value.
    pub async fn put_writes(&mut self, task_id: &str, writes: Vec<(String, Value)>) -> Result<()> {
        self.checkpoint_pending_writes.retain(|(tid, channel, _)| {
            tid != task_id || !writes.iter().any(|(written, _)| written == channel)
        });
        self.checkpoint_pending_writes.extend(
            writes
                .iter()
                .map(|(channel, value)| (task_id.to_string(), channel.clone(), value.clone())),
        );
        if self.checkpoint_config.checkpoint_id.is_some() {
            self.writer
                .put_writes(&self.checkpoint_config, writes, task_id)
                .await?;
        }
        Ok(())
    }

    async fn put_checkpoint(&mut self, source: CheckpointSource) -> Result<()> {
        let mut metadata = CheckpointMetadata::new()
            .with_source(source)
            .with_step(self.step);
        for (key, value) in &self.config.metadata {
            metadata = metadata.with_extra(key.clone(), value.clone());
        }
        if let Some(run_id) = &self.config.run_id {
            metadata = metadata.with_extra("run_id", Value::from(run_id.as_str()));
        }

        self.checkpoint = create_checkpoint(&self.checkpoint, Some(&self.channels));
        let new_versions: ChannelVersions = self
            .checkpoint
            .channel_versions
            .iter()
            .filter(|(channel, version)| self.stored_versions.get(*channel) != Some(*version))
            .map(|(channel, version)| (channel.clone(), version.clone()))
            .collect();

        let parent = self.checkpoint_config.clone();
        self.checkpoint_config = self
            .writer
            .put(&parent, self.checkpoint.clone(), metadata.clone(), new_versions)
            .await?;
        self.stored_versions = self.checkpoint.channel_versions.clone();
        self.checkpoint_metadata = metadata;
        self.checkpoint_parent_config = parent.checkpoint_id.is_some().then_some(parent);

        debug!(
            checkpoint_id = %self.checkpoint.id,
            step = self.step,
            source = ?source,
            "created checkpoint"
        );

        if self.stream.has_mode(StreamMode::Checkpoints) {
            let payload = self.checkpoint_payload()?;
            self.stream.emit(StreamMode::Checkpoints, payload, self.step)?;
        }
        self.step += 1;
        Ok(())
    }

    fn checkpoint_payload(&self) -> Result<Value> {
        let ctx = PrepareContext {
            step: self.step + 1,
            checkpoint_ns: &self.checkpoint_ns,
            updated_channels: self.updated_channels.as_ref(),
        };
        let next_tasks =
            prepare_next_tasks(self.graph, &self.checkpoint, &[], &self.channels, &ctx)?;
        let values = map_output_values(&self.graph.state_keys, None, &self.channels);
        Ok(json!({
            "config": self.checkpoint_config,
            "parent_config": self.checkpoint_parent_config,
            "metadata": self.checkpoint_metadata,
            "values": values,
            "next": next_tasks.values().map(|task| task.name.clone()).collect::<Vec<_>>(),
            "tasks": next_tasks
                .values()
                .map(|task| json!({"id": task.id, "name": task.name, "interrupts": []}))
                .collect::<Vec<_>>(),
        }))
    }

    fn emit_values(&self, updated: Option<&BTreeSet<String>>) -> Result<()> {
        if !self.stream.has_mode(StreamMode::Values) {
            return Ok(());
        }
        match map_output_values(&self.graph.state_keys, updated, &self.channels) {
            Some(values) => self.stream.emit(StreamMode::Values, values, self.step),
            None => Ok(()),
        }
    }

    /// Current values of the state channels.
    pub fn output(&self) -> Value {
        map_output_values(&self.graph.state_keys, None, &self.channels)
            .unwrap_or_else(|| json!({}))
    }

    /// Runtime handed to `task`'s node.
    pub fn runtime_for(&self, task: &PregelExecutableTask) -> Runtime {
        let stream_writer = (self.stream.has_mode(StreamMode::Custom)
            || self.stream.has_mode(StreamMode::Messages))
        .then(|| StreamWriter::new(self.stream.clone(), task.name.clone(), self.step));
        let nested_stream = self
            .config
            .subgraphs
            .then(|| self.stream.child(format!("{}{NS_END}{}", task.name, task.id)));
        Runtime {
            node: task.name.clone(),
            step: self.step,
            task_id: task.id.clone(),
            checkpoint_ns: task.checkpoint_ns.clone(),
            thread_id: self.config.thread_id.clone(),
            store: self.store.clone(),
            stream_writer,
            scratchpad: Arc::clone(&task.scratchpad),
            cancellation: self.cancellation.child_token(),
            remaining_steps: usize::try_from(self.stop - self.step).unwrap_or(0),
            recursion_limit: self.config.recursion_limit,
            durability: self.config.durability().unwrap_or_default(),
            parent: ParentContext {
                checkpointer: self.checkpointer.clone(),
                store: self.store.clone(),
                stream: nested_stream,
                resuming: self.is_resuming,
                resume_map: self.resume_map.clone(),
                config: self.config.clone(),
            },
        }
    }

    /// Flush persistence and turn the run result into the output.
    pub async fn finish(&mut self, result: Result<()>) -> Result<Value> {
        let flushed = self.writer.flush().await;
        if let Some(store) = &self.store {
            store.stop().await?;
        }
        info!(
            graph = %self.graph.name,
            step = self.step,
            status = ?self.status,
            "run finished"
        );

        match result {
            Ok(()) => {
                flushed?;
                if self.status == LoopStatus::OutOfSteps {
                    return Err(GraphError::Recursion {
                        limit: self.config.recursion_limit,
                    });
                }
                Ok(self.output())
            }
            Err(GraphError::Interrupt(interrupts)) if !self.is_nested => {
                flushed?;
                let interrupts = serde_json::to_value(&interrupts)?;
                let mut payload = serde_json::Map::new();
                payload.insert(INTERRUPT.to_string(), interrupts.clone());
                self.stream
                    .emit(StreamMode::Updates, Value::Object(payload), self.step)?;
                let mut output = self.output();
                if let Value::Object(fields) = &mut output {
                    fields.insert(INTERRUPT.to_string(), interrupts);
                }
                Ok(output)
            }
            Err(err) => {
                if let Err(flush_err) = flushed {
                    tracing::error!(error = %flush_err, "failed to flush checkpoints");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::branch_channel;
    use crate::node::{node_fn, NodeAction, PregelNode};
    use crate::pregel::write::ChannelWrite;
    use pregel_checkpoint::InMemoryCheckpointSaver;
    use tokio::sync::mpsc;

    fn graph() -> Pregel {
        let noop = NodeAction::Function(node_fn(|_, _| async { Ok(Value::Null) }));
        Pregel::new("loop")
            .with_channel("x", Channel::last_value())
            .with_channel(branch_channel("a"), Channel::ephemeral(false))
            .with_state_keys(vec!["x".into()])
            .with_input_writers(vec![
                ChannelWrite::state(vec!["x".into()]),
                ChannelWrite::edge(branch_channel("a"), Value::Null),
            ])
            .with_node(
                PregelNode::new("a", noop)
                    .with_triggers(vec![branch_channel("a")])
                    .with_channels(vec!["x".into()]),
            )
    }

    fn stream(modes: Vec<StreamMode>) -> (StreamMultiplexer, mpsc::UnboundedReceiver<crate::stream::StreamChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamMultiplexer::new(modes, tx), rx)
    }

    #[tokio::test]
    async fn test_first_tick_plans_entry_node() {
        let graph = graph();
        let (stream, _rx) = stream(vec![StreamMode::Values]);
        let mut lp = PregelLoop::setup(
            &graph,
            GraphInput::Value(json!({"x": 1})),
            RunConfig::default(),
            stream,
            None,
        )
        .await
        .unwrap();

        assert!(lp.tick().await.unwrap());
        assert_eq!(lp.step, 0);
        assert_eq!(lp.stop, 25);
        let task = lp.tasks.values().next().unwrap();
        assert_eq!(task.name, "a");
        assert_eq!(task.input, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_null_input_on_fresh_thread_is_empty_input() {
        let graph = graph();
        let (stream, _rx) = stream(vec![StreamMode::Values]);
        let mut lp = PregelLoop::setup(
            &graph,
            GraphInput::Value(Value::Null),
            RunConfig::default(),
            stream,
            None,
        )
        .await
        .unwrap();
        assert!(matches!(lp.tick().await, Err(GraphError::EmptyInput(_))));
    }

    #[tokio::test]
    async fn test_recursion_limit_must_fit_step_counter() {
        let graph = graph();
        let (stream, _rx) = stream(vec![]);
        let config = RunConfig::new().with_recursion_limit(usize::MAX);
        let mut lp = PregelLoop::setup(&graph, GraphInput::Value(json!({"x": 1})), config, stream, None)
            .await
            .unwrap();
        assert!(matches!(lp.tick().await, Err(GraphError::Configuration(_))));
    }

    fn assert_send<T: std::marker::Send>(_: T) {}

    #[tokio::test]
    async fn test_step_futures_are_send() {
        let graph = graph();
        let (stream, _rx) = stream(vec![]);
        let mut lp = PregelLoop::setup(
            &graph,
            GraphInput::Value(json!({"x": 1})),
            RunConfig::default(),
            stream,
            None,
        )
        .await
        .unwrap();
        // spawned runs and subgraph nodes need these to cross threads
        assert_send(lp.tick());
        assert_send(lp.after_tick());
    }

    #[tokio::test]
    async fn test_checkpointer_requires_thread_id() {
        let graph = graph().with_checkpointer(Arc::new(InMemoryCheckpointSaver::new()));
        let (stream, _rx) = stream(vec![]);
        let result = PregelLoop::setup(
            &graph,
            GraphInput::Value(json!({"x": 1})),
            RunConfig::default(),
            stream,
            None,
        )
        .await;
        assert!(matches!(result, Err(GraphError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_after_tick_saves_loop_checkpoint() {
        let saver = Arc::new(InMemoryCheckpointSaver::new());
        let graph = graph().with_checkpointer(saver.clone());
        let config = RunConfig::new()
            .with_thread_id("t1")
            .with_durability(crate::config::Durability::Sync);
        let (stream, _rx) = stream(vec![StreamMode::Values]);
        let mut lp = PregelLoop::setup(&graph, GraphInput::Value(json!({"x": 1})), config, stream, None)
            .await
            .unwrap();

        assert!(lp.tick().await.unwrap());
        for task in lp.tasks.values_mut() {
            task.writes.push(("x".into(), json!(2)));
        }
        lp.after_tick().await.unwrap();
        assert!(!lp.tick().await.unwrap());
        assert_eq!(lp.status, LoopStatus::Done);
        let output = lp.finish(Ok(())).await.unwrap();
        assert_eq!(output, json!({"x": 2}));

        let latest = saver
            .get_tuple(&CheckpointConfig::new().with_thread_id("t1").with_checkpoint_ns(""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.metadata.source, Some(CheckpointSource::Loop));
        assert_eq!(latest.metadata.step, Some(0));
        assert!(latest.parent_config.is_some());
        assert_eq!(saver.checkpoint_count().await, 2);
    }
}
