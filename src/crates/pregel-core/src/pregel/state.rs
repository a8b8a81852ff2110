//! State inspection and manual updates
//!
//! Snapshots are rebuilt from checkpoints alone: the channels are restored,
//! the next step is planned with the same algorithm the loop uses, and
//! pending writes tell which of those tasks already finished, failed or
//! paused. No node runs.
//!
//! Manual updates write a new checkpoint as if a node had produced the
//! given values. A few reserved `as_node` values change what happens:
//!
//! | `as_node` | values | effect |
//! |-----------|--------|--------|
//! | a node    | update | node writers run on the values; successors are scheduled |
//! | [`START`] | input  | input writers run on the values |
//! | [`END`]   | `null` | pending tasks are marked done; nothing runs next |
//! | [`COPY`]  | `null` or `[[values, node], ..]` | fork, optionally updating the fork |
//! | [`INPUT`] | input  | replay as graph input (`input` checkpoint) |

use super::algo::{apply_writes, prepare_next_tasks, PrepareContext, VersionFn};
use super::io::{map_input, map_output_values};
use super::loop_impl::version_fn;
use super::types::{
    Interrupt, PregelExecutableTask, PregelTask, PregelTaskWrites, StateSnapshot, TaskPath,
    WritesProtocol,
};
use super::write::compute_writes;
use super::Pregel;
use crate::config::RunConfig;
use crate::constants::{COPY, END, ERROR, INPUT, INTERRUPT, NS_END, NS_SEP, RESUME, START};
use crate::error::{GraphError, Result};
use crate::node::NodeOutput;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{Stream, StreamExt};
use pregel_checkpoint::{
    channels_from_checkpoint, create_checkpoint, Channel, ChannelVersions, Checkpoint,
    CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource, CheckpointTuple,
    PendingWrite,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Snapshots produced by [`Pregel::get_state_history`], newest first.
pub type StateSnapshotStream = Pin<Box<dyn Stream<Item = Result<StateSnapshot>> + Send>>;

/// One update of a superstep passed to [`Pregel::bulk_update_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub values: Value,
    /// Node the update is attributed to; inferred when `None`
    pub as_node: Option<String>,
    /// Id of the task the writes are recorded for
    pub task_id: Option<String>,
}

impl StateUpdate {
    pub fn new(values: Value) -> Self {
        Self {
            values,
            as_node: None,
            task_id: None,
        }
    }

    pub fn as_node(mut self, node: impl Into<String>) -> Self {
        self.as_node = Some(node.into());
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

enum SuperstepOutcome {
    Applied(CheckpointConfig),
    /// A fork followed by updates to apply on top of it
    Forked(CheckpointConfig, Vec<StateUpdate>),
}

impl Pregel {
    fn require_checkpointer(&self) -> Result<Arc<dyn CheckpointSaver>> {
        self.checkpointer.clone().ok_or_else(|| {
            GraphError::Configuration("no checkpointer set; state is only kept with one".into())
        })
    }

    /// Graph running at `namespace`, walking subgraph nodes segment by segment.
    fn graph_at(&self, namespace: &str) -> Result<&Pregel> {
        if namespace.is_empty() {
            return Ok(self);
        }
        let mut graph = self;
        for segment in namespace.split(NS_SEP) {
            let name = segment.split(NS_END).next().unwrap_or(segment);
            graph = graph
                .nodes
                .get(name)
                .and_then(|node| node.subgraph())
                .map(|subgraph| &**subgraph)
                .ok_or_else(|| {
                    GraphError::Configuration(format!("no subgraph found for namespace `{namespace}`"))
                })?;
        }
        Ok(graph)
    }

    /// State of the thread at `config` (the latest checkpoint unless
    /// `checkpoint_id` is set).
    ///
    /// With `subgraphs`, tasks running a nested graph carry that graph's
    /// state as well.
    #[instrument(skip_all, fields(graph = %self.name, thread_id = ?config.thread_id))]
    pub async fn get_state(&self, config: &RunConfig, subgraphs: bool) -> Result<StateSnapshot> {
        let saver = self.require_checkpointer()?;
        let checkpoint_config = config.checkpoint_config();
        let graph = self.graph_at(checkpoint_config.namespace())?;
        match saver.get_tuple(&checkpoint_config).await? {
            Some(tuple) => {
                let latest = checkpoint_config.checkpoint_id.is_none();
                graph.prepare_snapshot(&saver, tuple, subgraphs, latest).await
            }
            None => Ok(StateSnapshot {
                values: Value::Object(Map::new()),
                next: Vec::new(),
                config: checkpoint_config,
                metadata: None,
                created_at: None,
                parent_config: None,
                tasks: Vec::new(),
                interrupts: Vec::new(),
            }),
        }
    }

    /// Snapshots of every checkpoint of the thread, newest first.
    pub async fn get_state_history(
        &self,
        config: &RunConfig,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<StateSnapshotStream> {
        let saver = self.require_checkpointer()?;
        let checkpoint_config = CheckpointConfig {
            checkpoint_id: None,
            ..config.checkpoint_config()
        };
        let graph = self.graph_at(checkpoint_config.namespace())?.clone();
        let mut tuples = saver
            .list(Some(&checkpoint_config), filter, before, limit)
            .await?;

        Ok(Box::pin(async_stream::stream! {
            while let Some(tuple) = tuples.next().await {
                match tuple {
                    Ok(tuple) => yield graph.prepare_snapshot(&saver, tuple, false, false).await,
                    Err(err) => {
                        yield Err(GraphError::from(err));
                        break;
                    }
                }
            }
        }))
    }

    /// Snapshot of the checkpoint in `tuple`.
    ///
    /// With `apply_pending_writes` (the latest checkpoint of a thread), the
    /// writes of tasks that already finished are folded into the values and
    /// those tasks leave `next`.
    fn prepare_snapshot<'a>(
        &'a self,
        saver: &'a Arc<dyn CheckpointSaver>,
        tuple: CheckpointTuple,
        subgraphs: bool,
        apply_pending_writes: bool,
    ) -> BoxFuture<'a, Result<StateSnapshot>> {
        async move {
            let CheckpointTuple {
                config,
                checkpoint,
                metadata,
                parent_config,
                pending_writes,
            } = tuple;
            let mut channels = channels_from_checkpoint(self.channels.iter(), &checkpoint)?;
            let next_tasks = self.tasks_with_pending_writes(
                &checkpoint,
                &pending_writes,
                &channels,
                metadata.step.map_or(0, |step| step + 1),
                config.namespace(),
            )?;

            let mut next = Vec::new();
            let mut tasks = Vec::with_capacity(next_tasks.len());
            for task in next_tasks.values() {
                let mut view = self.task_view(task, &pending_writes)?;
                if !apply_pending_writes || task.writes.is_empty() {
                    next.push(task.name.clone());
                }
                if subgraphs {
                    if let Some(subgraph) = task.node.subgraph() {
                        let child_config = CheckpointConfig {
                            thread_id: config.thread_id.clone(),
                            checkpoint_ns: Some(task.checkpoint_ns.clone()),
                            ..CheckpointConfig::default()
                        };
                        if let Some(child) = saver.get_tuple(&child_config).await? {
                            let state = subgraph.prepare_snapshot(saver, child, true, true).await?;
                            view.state = Some(Box::new(state));
                        }
                    }
                }
                tasks.push(view);
            }

            if apply_pending_writes {
                let finished: Vec<&dyn WritesProtocol> = next_tasks
                    .values()
                    .filter(|task| !task.writes.is_empty())
                    .map(|task| task as &dyn WritesProtocol)
                    .collect();
                if !finished.is_empty() {
                    let mut applied = checkpoint.clone();
                    apply_writes(&mut applied, &mut channels, &finished, None)?;
                }
            }

            let interrupts = tasks
                .iter()
                .flat_map(|task| task.interrupts.iter().cloned())
                .collect();
            Ok(StateSnapshot {
                values: map_output_values(&self.state_keys, None, &channels)
                    .unwrap_or_else(|| Value::Object(Map::new())),
                next,
                created_at: Some(checkpoint.ts.to_rfc3339()),
                config,
                metadata: Some(metadata),
                parent_config,
                tasks,
                interrupts,
            })
        }
        .boxed()
    }

    /// Inspection view of `task` given the writes recorded so far.
    fn task_view(&self, task: &PregelExecutableTask, pending_writes: &[PendingWrite]) -> Result<PregelTask> {
        let mut error = None;
        let mut interrupts = Vec::new();
        let mut result: Option<Map<String, Value>> = None;
        for (_, channel, value) in pending_writes.iter().filter(|(id, _, _)| *id == task.id) {
            match channel.as_str() {
                ERROR => {
                    error = Some(
                        value
                            .as_str()
                            .map_or_else(|| value.to_string(), str::to_string),
                    )
                }
                INTERRUPT => {
                    interrupts.extend(serde_json::from_value::<Vec<Interrupt>>(value.clone())?)
                }
                RESUME => {}
                _ => {
                    let written = result.get_or_insert_with(Map::new);
                    if self.state_keys.contains(channel) {
                        written.insert(channel.clone(), value.clone());
                    }
                }
            }
        }
        Ok(PregelTask {
            id: task.id.clone(),
            name: task.name.clone(),
            path: task.path.clone(),
            error,
            interrupts,
            result: result.map(Value::Object),
            state: None,
        })
    }

    /// Write `values` to the thread as if `as_node` had returned them.
    ///
    /// Returns the address of the new checkpoint.
    pub async fn update_state(
        &self,
        config: &RunConfig,
        values: Value,
        as_node: Option<&str>,
    ) -> Result<CheckpointConfig> {
        let mut update = StateUpdate::new(values);
        update.as_node = as_node.map(str::to_string);
        self.bulk_update_state(config, vec![vec![update]]).await
    }

    /// Apply several supersteps of updates, each one checkpointed on top of
    /// the previous one.
    #[instrument(skip_all, fields(graph = %self.name, thread_id = ?config.thread_id))]
    pub async fn bulk_update_state(
        &self,
        config: &RunConfig,
        supersteps: Vec<Vec<StateUpdate>>,
    ) -> Result<CheckpointConfig> {
        let saver = self.require_checkpointer()?;
        if supersteps.is_empty() {
            return Err(GraphError::invalid_update("no supersteps provided"));
        }
        if supersteps.iter().any(Vec::is_empty) {
            return Err(GraphError::invalid_update("a superstep has no updates"));
        }
        let mut current = config.checkpoint_config();
        let graph = self.graph_at(current.namespace())?;

        for updates in supersteps {
            let mut outcome = graph.update_superstep(&saver, &current, updates).await?;
            loop {
                match outcome {
                    SuperstepOutcome::Applied(next) => {
                        current = next;
                        break;
                    }
                    SuperstepOutcome::Forked(fork, updates) => {
                        outcome = graph.update_superstep(&saver, &fork, updates).await?;
                    }
                }
            }
        }
        Ok(current)
    }

    async fn update_superstep(
        &self,
        saver: &Arc<dyn CheckpointSaver>,
        config: &CheckpointConfig,
        updates: Vec<StateUpdate>,
    ) -> Result<SuperstepOutcome> {
        let saved = saver.get_tuple(config).await?;
        let mut checkpoint = saved
            .as_ref()
            .map_or_else(Checkpoint::empty, |saved| saved.checkpoint.clone());
        let previous_versions = checkpoint.channel_versions.clone();
        let step = saved
            .as_ref()
            .and_then(|saved| saved.metadata.step)
            .unwrap_or(-1);
        let parents = saved
            .as_ref()
            .map(|saved| saved.metadata.parents.clone())
            .unwrap_or_default();
        let checkpoint_config = match &saved {
            Some(saved) => saved.config.clone(),
            None => CheckpointConfig {
                checkpoint_id: None,
                checkpoint_ns: Some(config.namespace().to_string()),
                ..config.clone()
            },
        };
        let update_metadata = |step: i64| {
            CheckpointMetadata::new()
                .with_source(CheckpointSource::Update)
                .with_step(step)
                .with_parents(parents.clone())
        };
        let next_version = version_fn(Some(Arc::clone(saver)));

        let first = &updates[0];
        let as_node = first.as_node.as_deref();

        // nothing to write: checkpoint the current state as is
        if first.values.is_null() && as_node.is_none() {
            if updates.len() > 1 {
                return Err(GraphError::invalid_update(
                    "cannot create an empty checkpoint with several updates",
                ));
            }
            let next = saver
                .put(
                    &checkpoint_config,
                    create_checkpoint(&checkpoint, None),
                    update_metadata(step + 1),
                    ChannelVersions::new(),
                )
                .await?;
            return Ok(SuperstepOutcome::Applied(next));
        }

        let mut channels = channels_from_checkpoint(self.channels.iter(), &checkpoint)?;

        if first.values.is_null() && as_node == Some(END) {
            if updates.len() > 1 {
                return Err(GraphError::invalid_update(
                    "cannot apply several updates when clearing state",
                ));
            }
            if let Some(saved) = &saved {
                let tasks = self.tasks_with_pending_writes(
                    &checkpoint,
                    &saved.pending_writes,
                    &channels,
                    step + 1,
                    config.namespace(),
                )?;
                let tasks: Vec<&dyn WritesProtocol> =
                    tasks.values().map(|task| task as &dyn WritesProtocol).collect();
                apply_writes(
                    &mut checkpoint,
                    &mut channels,
                    &tasks,
                    Some(&next_version as VersionFn<'_>),
                )?;
            }
            let new_versions = new_channel_versions(&previous_versions, &checkpoint.channel_versions);
            let next = saver
                .put(
                    &checkpoint_config,
                    create_checkpoint(&checkpoint, Some(&channels)),
                    update_metadata(step + 1),
                    new_versions,
                )
                .await?;
            debug!(checkpoint_id = ?next.checkpoint_id, "cleared pending tasks");
            return Ok(SuperstepOutcome::Applied(next));
        }

        if as_node == Some(COPY) {
            if updates.len() > 1 {
                return Err(GraphError::invalid_update(
                    "cannot copy a checkpoint with several updates",
                ));
            }
            let Some(saved) = &saved else {
                return Err(GraphError::invalid_update("cannot copy a checkpoint that does not exist"));
            };
            let fork = saver
                .put(
                    &saved.config,
                    create_checkpoint(&checkpoint, None),
                    CheckpointMetadata::new()
                        .with_source(CheckpointSource::Fork)
                        .with_step(step + 1)
                        .with_parents(parents.clone()),
                    ChannelVersions::new(),
                )
                .await?;
            debug!(checkpoint_id = ?fork.checkpoint_id, "forked checkpoint");
            return Ok(match copy_updates(&first.values)? {
                Some(updates) => SuperstepOutcome::Forked(fork, updates),
                None => SuperstepOutcome::Applied(fork),
            });
        }

        if as_node == Some(INPUT) {
            if updates.len() > 1 {
                return Err(GraphError::invalid_update(
                    "cannot apply several updates when updating as input",
                ));
            }
            let writes = map_input(self, first.values.clone(), &channels)?;
            if writes.is_empty() {
                return Err(GraphError::invalid_update(
                    "the values did not write to any input channel",
                ));
            }
            let task = PregelTaskWrites::new(INPUT, writes);
            apply_writes(
                &mut checkpoint,
                &mut channels,
                &[&task as &dyn WritesProtocol],
                Some(&next_version as VersionFn<'_>),
            )?;
            let input_step = if saved.is_some() { step + 1 } else { -1 };
            let new_versions = new_channel_versions(&previous_versions, &checkpoint.channel_versions);
            let next = saver
                .put(
                    &checkpoint_config,
                    create_checkpoint(&checkpoint, Some(&channels)),
                    CheckpointMetadata::new()
                        .with_source(CheckpointSource::Input)
                        .with_step(input_step)
                        .with_parents(parents.clone()),
                    new_versions,
                )
                .await?;
            return Ok(SuperstepOutcome::Applied(next));
        }

        // finished tasks of an interrupted step keep their writes
        if let Some(saved) = &saved {
            if config.checkpoint_id.is_none() && !saved.pending_writes.is_empty() {
                let tasks = self.tasks_with_pending_writes(
                    &checkpoint,
                    &saved.pending_writes,
                    &channels,
                    step + 1,
                    config.namespace(),
                )?;
                let finished: Vec<&dyn WritesProtocol> = tasks
                    .values()
                    .filter(|task| !task.writes.is_empty())
                    .map(|task| task as &dyn WritesProtocol)
                    .collect();
                if !finished.is_empty() {
                    apply_writes(&mut checkpoint, &mut channels, &finished, None)?;
                }
            }
        }

        let attributed: Vec<(String, StateUpdate)> = if updates.len() == 1 {
            let update = updates.into_iter().next().ok_or_else(|| {
                GraphError::invalid_update("a superstep has no updates")
            })?;
            let node = match &update.as_node {
                Some(node) => node.clone(),
                None => self.infer_as_node(&checkpoint)?,
            };
            vec![(node, update)]
        } else {
            updates
                .into_iter()
                .map(|update| match &update.as_node {
                    Some(node) => Ok((node.clone(), update)),
                    None => Err(GraphError::invalid_update(
                        "`as_node` is required when applying several updates",
                    )),
                })
                .collect::<Result<_>>()?
        };

        let mut tasks = Vec::with_capacity(attributed.len());
        let mut written = Map::new();
        for (index, (node, update)) in attributed.into_iter().enumerate() {
            let writers = if node == START {
                &self.input_writers
            } else {
                let pregel_node = self.nodes.get(&node).ok_or_else(|| {
                    GraphError::invalid_update(format!("node `{node}` does not exist"))
                })?;
                &pregel_node.writers
            };
            if writers.is_empty() {
                return Err(GraphError::invalid_update(format!(
                    "no writers found for node `{node}`"
                )));
            }
            let writes = compute_writes(
                self,
                &node,
                writers,
                &NodeOutput::Update(update.values.clone()),
                &channels,
            )?;
            let id = update.task_id.clone().unwrap_or_else(|| {
                let seed = format!("{}{}{index}", INTERRUPT, checkpoint.id);
                Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
            });
            written.insert(node.clone(), update.values);
            tasks.push(PregelTaskWrites {
                id,
                path: TaskPath::Pull(node.clone()),
                name: node,
                writes,
                triggers: vec![INTERRUPT.to_string()],
            });
        }

        let tasks: Vec<&dyn WritesProtocol> =
            tasks.iter().map(|task| task as &dyn WritesProtocol).collect();
        apply_writes(&mut checkpoint, &mut channels, &tasks, Some(&next_version as VersionFn<'_>))?;
        let new_versions = new_channel_versions(&previous_versions, &checkpoint.channel_versions);
        let next = saver
            .put(
                &checkpoint_config,
                create_checkpoint(&checkpoint, Some(&channels)),
                update_metadata(step + 1).with_extra("writes", Value::Object(written)),
                new_versions,
            )
            .await?;
        debug!(checkpoint_id = ?next.checkpoint_id, step = step + 1, "applied state update");
        Ok(SuperstepOutcome::Applied(next))
    }

    /// Tasks of the step after `checkpoint`, with the writes they already
    /// recorded.
    fn tasks_with_pending_writes(
        &self,
        checkpoint: &Checkpoint,
        pending_writes: &[PendingWrite],
        channels: &HashMap<String, Channel>,
        step: i64,
        checkpoint_ns: &str,
    ) -> Result<BTreeMap<String, PregelExecutableTask>> {
        let ctx = PrepareContext {
            step,
            checkpoint_ns,
            updated_channels: None,
        };
        let mut tasks = prepare_next_tasks(self, checkpoint, pending_writes, channels, &ctx)?;
        for (task_id, channel, value) in pending_writes {
            if matches!(channel.as_str(), ERROR | INTERRUPT | RESUME) {
                continue;
            }
            if let Some(task) = tasks.get_mut(task_id) {
                task.writes.push((channel.clone(), value.clone()));
            }
        }
        Ok(tasks)
    }

    /// Node an unattributed update belongs to.
    ///
    /// A single-node graph attributes to that node and a thread nobody ran
    /// on yet to [`START`]. Otherwise the node that saw the newest channel
    /// version wins; a tie is ambiguous.
    fn infer_as_node(&self, checkpoint: &Checkpoint) -> Result<String> {
        if self.nodes.len() == 1 {
            if let Some(name) = self.nodes.keys().next() {
                return Ok(name.clone());
            }
        }
        let mut last_seen: Vec<(&pregel_checkpoint::ChannelVersion, &String)> = checkpoint
            .versions_seen
            .iter()
            .filter(|(node, _)| node.as_str() != INTERRUPT && self.nodes.contains_key(*node))
            .filter_map(|(node, seen)| seen.values().max().map(|version| (version, node)))
            .collect();
        if last_seen.is_empty() {
            return Ok(START.to_string());
        }
        last_seen.sort();
        match last_seen.as_slice() {
            [.., (second, _), (newest, node)] if second != newest => Ok((*node).clone()),
            [(_, node)] => Ok((*node).clone()),
            _ => Err(GraphError::invalid_update(
                "ambiguous update, specify `as_node`",
            )),
        }
    }
}

/// Updates encoded in the values of a `COPY`: `[[values, node], ...]`.
fn copy_updates(values: &Value) -> Result<Option<Vec<StateUpdate>>> {
    let Some(pairs) = values.as_array().filter(|pairs| !pairs.is_empty()) else {
        return Ok(None);
    };
    pairs
        .iter()
        .map(|pair| match pair.as_array().map(Vec::as_slice) {
            Some([values, Value::String(node)]) => Ok(StateUpdate::new(values.clone()).as_node(node.clone())),
            _ => Err(GraphError::invalid_update(
                "updates of a copy must be `[values, node]` pairs",
            )),
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn new_channel_versions(previous: &ChannelVersions, current: &ChannelVersions) -> ChannelVersions {
    current
        .iter()
        .filter(|(channel, version)| previous.get(*channel) != Some(*version))
        .map(|(channel, version)| (channel.clone(), version.clone()))
        .collect()
}
