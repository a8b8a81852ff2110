//! Concurrent execution of the tasks of one step
//!
//! Tasks run concurrently on the current tokio task through
//! `FuturesUnordered`, bounded by a semaphore when the run sets
//! `max_concurrency`. Each finished task is committed right away, so its
//! writes are saved even if a sibling fails or the run is interrupted.

use super::loop_impl::PregelLoop;
use super::types::{Interrupt, PregelExecutableTask};
use super::write::compute_writes;
use crate::cache::Cache;
use crate::constants::{ERROR, INTERRUPT, NO_WRITES, RESUME};
use crate::error::{GraphError, Result};
use crate::node::{NodeAction, NodeFuture, NodeOutput};
use crate::runtime::Runtime;
use crate::stream::StreamMode;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// What a task produced.
pub(crate) enum TaskOutput {
    Fresh(NodeOutput),
    /// Writes memoized by an earlier run with the same cache key
    Cached(Vec<(String, Value)>),
}

type TaskFuture = BoxFuture<'static, (PregelExecutableTask, Result<TaskOutput>)>;

pub(crate) struct PregelRunner;

impl PregelRunner {
    /// Run every task of the step that has no writes yet.
    ///
    /// Returns the first task error once all tasks settled, or the
    /// interrupts raised by the step.
    pub async fn tick(lp: &mut PregelLoop<'_>) -> Result<()> {
        let pending: Vec<PregelExecutableTask> = lp
            .tasks
            .values()
            .filter(|task| task.writes.is_empty())
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let semaphore = lp
            .config
            .max_concurrency
            .map(|max| Arc::new(Semaphore::new(max.max(1))));
        let mut running: FuturesUnordered<TaskFuture> = pending
            .into_iter()
            .map(|task| {
                let runtime = lp.runtime_for(&task);
                run_task(task, runtime, lp.cache.clone(), semaphore.clone()).boxed()
            })
            .collect();

        let timeout = lp.config.step_timeout();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let cancellation = lp.cancellation.clone();
        let mut first_error: Option<GraphError> = None;
        let mut interrupts: Vec<Interrupt> = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(GraphError::Cancelled),
                next = next_before(&mut running, deadline) => next,
            };
            let Some((task, outcome)) = next.map_err(|_| GraphError::Timeout {
                operation: format!("step {}", lp.step),
                duration_ms: timeout.map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            })?
            else {
                break;
            };

            match commit(lp, task, outcome).await? {
                Committed::Done => {}
                Committed::Interrupted(raised) => interrupts.extend(raised),
                Committed::Failed(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None if !interrupts.is_empty() => Err(GraphError::Interrupt(interrupts)),
            None => Ok(()),
        }
    }
}

async fn next_before(
    running: &mut FuturesUnordered<TaskFuture>,
    deadline: Option<Instant>,
) -> std::result::Result<Option<(PregelExecutableTask, Result<TaskOutput>)>, tokio::time::error::Elapsed> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, running.next()).await,
        None => Ok(running.next().await),
    }
}

enum Committed {
    Done,
    Interrupted(Vec<Interrupt>),
    Failed(GraphError),
}

/// Save the outcome of one task and report it on the stream.
async fn commit(
    lp: &mut PregelLoop<'_>,
    task: PregelExecutableTask,
    outcome: Result<TaskOutput>,
) -> Result<Committed> {
    let writes = outcome.and_then(|output| match output {
        TaskOutput::Cached(writes) => Ok((writes, false)),
        TaskOutput::Fresh(output) => {
            compute_writes(lp.graph, &task.name, &task.node.writers, &output, &lp.channels)
                .map(|writes| (writes, true))
                .map_err(|err| GraphError::node_execution(&task.name, lp.step, err))
        }
    });

    match writes {
        Ok((writes, fresh)) => {
            if fresh {
                if let (Some(cache), Some(key)) = (&lp.cache, &task.cache_key) {
                    cache
                        .set(vec![(key.clone(), serde_json::to_value(&writes)?)])
                        .await;
                }
            }
            let persisted = if writes.is_empty() {
                vec![(NO_WRITES.to_string(), Value::Null)]
            } else {
                writes.clone()
            };
            lp.put_writes(&task.id, persisted).await?;
            if let Some(updates) = super::io::map_output_updates(
                &lp.graph.state_keys,
                &[(task.name.as_str(), writes.as_slice())],
            ) {
                lp.stream.emit(StreamMode::Updates, updates, lp.step)?;
            }
            emit_result(lp, &task, &writes, None, &[])?;
            if let Some(slot) = lp.tasks.get_mut(&task.id) {
                slot.writes = writes;
            }
            debug!(task = %task.id, node = %task.name, step = lp.step, "task finished");
            Ok(Committed::Done)
        }
        Err(GraphError::Interrupt(raised)) => {
            let resume = task.scratchpad.lock().resume.clone();
            let mut writes = vec![(INTERRUPT.to_string(), serde_json::to_value(&raised)?)];
            if !resume.is_empty() {
                writes.push((RESUME.to_string(), Value::Array(resume)));
            }
            lp.put_writes(&task.id, writes).await?;
            emit_result(lp, &task, &[], None, &raised)?;
            debug!(task = %task.id, node = %task.name, interrupts = raised.len(), "task interrupted");
            Ok(Committed::Interrupted(raised))
        }
        Err(GraphError::Cancelled) => Err(GraphError::Cancelled),
        Err(err) => {
            error!(task = %task.id, node = %task.name, step = lp.step, error = %err, "task failed");
            lp.put_writes(&task.id, vec![(ERROR.to_string(), Value::from(err.to_string()))])
                .await?;
            emit_result(lp, &task, &[], Some(&err), &[])?;
            Ok(Committed::Failed(err))
        }
    }
}

fn emit_result(
    lp: &PregelLoop<'_>,
    task: &PregelExecutableTask,
    writes: &[(String, Value)],
    error: Option<&GraphError>,
    interrupts: &[Interrupt],
) -> Result<()> {
    if !lp.stream.has_mode(StreamMode::Tasks) {
        return Ok(());
    }
    lp.stream.emit(
        StreamMode::Tasks,
        json!({
            "id": task.id,
            "name": task.name,
            "error": error.map(ToString::to_string),
            "result": writes,
            "interrupts": interrupts,
        }),
        lp.step,
    )
}

/// Run one task to completion, consulting the cache and retrying per its policy.
async fn run_task(
    task: PregelExecutableTask,
    runtime: Runtime,
    cache: Option<Arc<dyn Cache>>,
    semaphore: Option<Arc<Semaphore>>,
) -> (PregelExecutableTask, Result<TaskOutput>) {
    let _permit = match semaphore {
        Some(semaphore) => semaphore.acquire_owned().await.ok(),
        None => None,
    };

    if let (Some(cache), Some(key)) = (&cache, &task.cache_key) {
        if let Some(cached) = cache.get(std::slice::from_ref(key)).await.remove(key) {
            match serde_json::from_value::<Vec<(String, Value)>>(cached) {
                Ok(writes) => {
                    debug!(task = %task.id, node = %task.name, "using cached writes");
                    return (task, Ok(TaskOutput::Cached(writes)));
                }
                Err(err) => warn!(node = %task.name, error = %err, "ignoring malformed cache entry"),
            }
        }
    }

    let mut attempts = 0;
    let outcome = loop {
        attempts += 1;
        runtime.scratchpad.lock().interrupt_counter = 0;
        match execute(&task, runtime.clone()).await {
            Ok(output) => break Ok(output),
            Err(err) => {
                let policy = task
                    .retry_policy
                    .as_ref()
                    .filter(|policy| policy.should_retry(attempts, &err));
                let Some(policy) = policy else {
                    break Err(err);
                };
                let delay = policy.calculate_delay(attempts - 1);
                warn!(
                    task = %task.id,
                    node = %task.name,
                    attempt = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "task failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    };

    let outcome = outcome.map(TaskOutput::Fresh).map_err(|err| match err {
        GraphError::Interrupt(_) | GraphError::Cancelled => err,
        err => GraphError::node_execution(&task.name, runtime.step(), err),
    });
    (task, outcome)
}

fn execute(task: &PregelExecutableTask, runtime: Runtime) -> NodeFuture {
    match &task.node.action {
        NodeAction::Function(func) => func(task.input.clone(), runtime),
        NodeAction::Subgraph(graph) => {
            let graph = Arc::clone(graph);
            let input = task.input.clone();
            Box::pin(async move {
                graph
                    .run_nested(input, &runtime)
                    .await
                    .map(NodeOutput::Update)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheKey, InMemoryCache};
    use crate::interrupt::Scratchpad;
    use crate::node::{node_fn, PregelNode};
    use crate::pregel::types::TaskPath;
    use crate::retry::RetryPolicy;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task(action: NodeAction, retry_policy: Option<RetryPolicy>) -> PregelExecutableTask {
        let node = Arc::new(PregelNode::new("work", action));
        PregelExecutableTask {
            id: "task-1".into(),
            name: "work".into(),
            path: TaskPath::Pull("work".into()),
            input: json!({"n": 1}),
            triggers: vec!["branch:to:work".into()],
            writes: Vec::new(),
            retry_policy,
            cache_key: None,
            checkpoint_ns: "work:task-1".into(),
            node,
            scratchpad: Arc::new(Mutex::new(Scratchpad::default())),
        }
    }

    fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> NodeAction {
        NodeAction::Function(node_fn(move |_, _| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(GraphError::Execution("transient".into()))
                } else {
                    Ok(json!({"ok": true}))
                }
            }
        }))
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(3).with_initial_interval(0.0).with_jitter(false);
        let task = task(flaky(2, calls.clone()), Some(policy));
        let (_, outcome) = run_task(task, Runtime::detached("work"), None, None).await;
        assert!(matches!(outcome, Ok(TaskOutput::Fresh(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_without_policy_is_wrapped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let task = task(flaky(5, calls.clone()), None);
        let (_, outcome) = run_task(task, Runtime::detached("work"), None, None).await;
        match outcome {
            Err(GraphError::NodeExecution { node, .. }) => assert_eq!(node, "work"),
            _ => panic!("expected a node execution error"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interrupts_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let action = NodeAction::Function(node_fn(move |_, runtime: Runtime| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                runtime.interrupt(json!("approve?"))?;
                Ok(Value::Null)
            }
        }));
        let policy = RetryPolicy::new(3).with_initial_interval(0.0);
        let (_, outcome) = run_task(task(action, Some(policy)), Runtime::detached("work"), None, None).await;
        assert!(matches!(outcome, Err(GraphError::Interrupt(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_writes_skip_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new(CacheConfig::default()));
        let key = CacheKey::new(vec!["work".into()], "k", None);
        cache
            .set(vec![(key.clone(), json!([["out", 7]]))])
            .await;
        let mut task = task(flaky(0, calls.clone()), None);
        task.cache_key = Some(key);
        let (_, outcome) = run_task(task, Runtime::detached("work"), Some(cache), None).await;
        match outcome {
            Ok(TaskOutput::Cached(writes)) => assert_eq!(writes, vec![("out".to_string(), json!(7))]),
            _ => panic!("expected cached writes"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
