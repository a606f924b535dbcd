//! Batch scheduling across tasks.
//!
//! A fixed number of workers pull jobs from a shared queue and report each
//! result on a channel. A failing job never stops its siblings: the first
//! error is returned once every job has run.

use crate::context::RunContext;
use crate::engine::{PipelineEngine, TaskOutcome};
use benchman_core::{BenchError, Result, Task};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

/// How many jobs run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// One job after another on the calling task
    Sequential,
    /// A fixed worker pool
    Workers(NonZeroUsize),
    /// One worker per available core
    AllCores,
}

impl Parallelism {
    /// Mode for a configured process count: 0 means all cores, 1 or less
    /// means sequential.
    pub fn from_processes(processes: i64) -> Self {
        match processes {
            0 => Parallelism::AllCores,
            n if n <= 1 => Parallelism::Sequential,
            n => usize::try_from(n)
                .ok()
                .and_then(NonZeroUsize::new)
                .map_or(Parallelism::Sequential, Parallelism::Workers),
        }
    }

    /// Number of workers to spawn.
    pub fn workers(&self) -> usize {
        match self {
            Parallelism::Sequential => 1,
            Parallelism::Workers(n) => n.get(),
            Parallelism::AllCores => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        }
    }
}

/// Runs jobs with bounded parallelism.
#[derive(Debug, Clone, Copy)]
pub struct BatchScheduler {
    parallelism: Parallelism,
}

impl BatchScheduler {
    /// Scheduler using `parallelism`.
    pub fn new(parallelism: Parallelism) -> Self {
        Self { parallelism }
    }

    /// Run `job` for every item.
    ///
    /// Returns the results in completion order, or the first error after all
    /// jobs have finished. A panicking job counts as an error.
    pub async fn run<T, O, F, Fut>(&self, items: Vec<T>, job: F) -> Result<Vec<O>>
    where
        T: Send + 'static,
        O: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let total = items.len();
        let workers = self.parallelism.workers().min(total.max(1));
        info!(jobs = total, workers, "starting batch");

        let mut results = Vec::with_capacity(total);
        if self.parallelism == Parallelism::Sequential || workers == 1 {
            for item in items {
                results.push(job(item).await);
            }
        } else {
            results = run_pool(items, job, workers).await;
        }

        let mut first_error = None;
        let mut outputs = Vec::with_capacity(total);
        for result in results {
            match result {
                Ok(output) => outputs.push(output),
                Err(e) => {
                    error!(error = %e, "job failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        info!(jobs = total, failed = total - outputs.len(), "batch finished");
        match first_error {
            Some(e) => Err(e),
            None => Ok(outputs),
        }
    }

    /// Run the pipeline of `engine` for every task.
    pub async fn run_pipeline(
        &self,
        engine: Arc<PipelineEngine>,
        ctx: Arc<RunContext>,
        tasks: Vec<Task>,
    ) -> Result<Vec<TaskOutcome>> {
        self.run(tasks, move |task| {
            let engine = engine.clone();
            let ctx = ctx.clone();
            async move { engine.run_task(&ctx, &task).await }
        })
        .await
    }
}

async fn run_pool<T, O, F, Fut>(items: Vec<T>, job: F, workers: usize) -> Vec<Result<O>>
where
    T: Send + 'static,
    O: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    for item in items {
        // The receiver is alive, sending cannot fail.
        let _ = queue_tx.send(item);
    }
    drop(queue_tx);

    let queue = Arc::new(Mutex::new(queue_rx));
    let job = Arc::new(job);
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let queue = queue.clone();
        let job = job.clone();
        let result_tx = result_tx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let next = queue.lock().await.recv().await;
                let Some(item) = next else {
                    break;
                };
                let result = match tokio::spawn(job(item)).await {
                    Ok(result) => result,
                    Err(e) => Err(BenchError::Worker(e.to_string())),
                };
                if result_tx.send(result).is_err() {
                    break;
                }
            }
            debug!(worker, "worker done");
        }));
    }
    drop(result_tx);

    let mut results = Vec::new();
    while let Some(result) = result_rx.recv().await {
        results.push(result);
    }
    for handle in handles {
        if let Err(e) = handle.await {
            results.push(Err(BenchError::Worker(e.to_string())));
        }
    }
    results
}
