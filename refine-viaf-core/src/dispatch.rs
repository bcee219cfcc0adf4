//! Batch dispatch
//!
//! A batch is a map of caller keys to queries. Each entry becomes an
//! independent [`Job`]; an [`Executor`] decides how the jobs run (one after
//! another, or several at once under a permit cap) and [`dispatch`] turns the
//! outcomes back into a [`BatchResult`]. A failing or panicking entry only
//! empties its own result.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::ReconcileConfig;
use crate::error::{ReconcileError, Result};
use crate::parser::Match;
use crate::query::Query;
use crate::response::{BatchResult, QueryResult};

/// One entry's pipeline, ready to run.
pub type Job = BoxFuture<'static, Result<Vec<Match>>>;

/// Outcome of one job, tagged with its caller key.
pub type Outcome = (String, Result<Vec<Match>>);

/// Runs a set of keyed jobs.
///
/// Implementations return exactly one outcome per job, in submission order.
/// A job that panics or is lost is reported as
/// [`ReconcileError::WorkerFailed`] rather than taking the others down.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, jobs: Vec<(String, Job)>) -> Vec<Outcome>;

    /// Label for logs
    fn name(&self) -> &'static str;
}

/// Runs jobs one at a time on the calling task.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialExecutor;

#[async_trait]
impl Executor for SequentialExecutor {
    async fn run(&self, jobs: Vec<(String, Job)>) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(jobs.len());

        for (key, job) in jobs {
            let outcome = match AssertUnwindSafe(job).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(ReconcileError::WorkerFailed {
                    key: key.clone(),
                    reason: panic_message(panic.as_ref()),
                }),
            };
            outcomes.push((key, outcome));
        }

        outcomes
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

/// Spawns every job onto the runtime but lets at most `pool_size` of them
/// run at once.
///
/// The permit pool belongs to the executor, not to a single call, so an
/// executor shared between requests caps their combined load on the
/// registry.
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    permits: Arc<Semaphore>,
    pool_size: usize,
}

impl BoundedExecutor {
    pub fn new(pool_size: usize) -> Result<Self> {
        if pool_size == 0 {
            return Err(ReconcileError::Config(
                "threadpool_size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}

#[async_trait]
impl Executor for BoundedExecutor {
    async fn run(&self, jobs: Vec<(String, Job)>) -> Vec<Outcome> {
        let keys: Vec<String> = jobs.iter().map(|(key, _)| key.clone()).collect();

        // dropping the set aborts every queued or running task
        let mut tasks = JoinSet::new();
        for (index, (_, job)) in jobs.into_iter().enumerate() {
            let permits = Arc::clone(&self.permits);
            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => AssertUnwindSafe(job)
                        .catch_unwind()
                        .await
                        .map_err(|panic| panic_message(panic.as_ref())),
                    Err(_) => Err("worker pool closed".to_string()),
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<Result<Vec<Match>>>> = keys.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(result))) => slots[index] = Some(result),
                Ok((index, Err(reason))) => {
                    slots[index] = Some(Err(ReconcileError::WorkerFailed {
                        key: keys[index].clone(),
                        reason,
                    }));
                }
                Err(e) => tracing::error!(error = %e, "Batch worker task lost"),
            }
        }

        keys.into_iter()
            .zip(slots)
            .map(|(key, slot)| {
                let outcome = slot.unwrap_or_else(|| {
                    Err(ReconcileError::WorkerFailed {
                        key: key.clone(),
                        reason: "worker task lost".to_string(),
                    })
                });
                (key, outcome)
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "bounded"
    }
}

/// Pick the executor the configuration asks for.
pub fn executor_for(config: &ReconcileConfig) -> Result<Arc<dyn Executor>> {
    if config.threading_enabled {
        Ok(Arc::new(BoundedExecutor::new(config.threadpool_size)?))
    } else {
        Ok(Arc::new(SequentialExecutor))
    }
}

/// Run `pipeline` for every entry of `queries` and collect the results.
///
/// Every input key is present in the output. Entries whose pipeline fails
/// are logged and get an empty match list.
pub async fn dispatch<F>(
    executor: &dyn Executor,
    queries: BTreeMap<String, Query>,
    pipeline: F,
) -> BatchResult
where
    F: Fn(Query) -> Job,
{
    let mut batch: BatchResult = queries
        .keys()
        .map(|key| (key.clone(), QueryResult::default()))
        .collect();

    let jobs: Vec<(String, Job)> = queries
        .into_iter()
        .map(|(key, query)| (key, pipeline(query)))
        .collect();

    tracing::debug!(
        executor = executor.name(),
        entries = jobs.len(),
        "Dispatching batch"
    );

    for (key, outcome) in executor.run(jobs).await {
        match outcome {
            Ok(matches) => {
                batch.insert(key, QueryResult::new(matches));
            }
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Batch entry failed");
            }
        }
    }

    batch
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
