//! Ordered async task pipeline
//!
//! A FIFO queue of futures with a single in-flight slot. The shard spawn
//! queue and every REST request queue are built on it: a task starts only
//! after the previous one has settled. Under an unwinding panic strategy a
//! task that panics is dropped and the worker moves on to the next one; the
//! release profile aborts instead.

use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The pipeline worker has stopped and can no longer accept tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineClosed;

/// Strictly ordered task pipeline
///
/// Dropping every handle to the pipeline lets the worker drain the
/// remaining tasks and exit.
#[derive(Debug, Clone)]
pub struct TaskPipeline {
    name: &'static str,
    tx: mpsc::UnboundedSender<Job>,
}

impl TaskPipeline {
    /// Create a pipeline and spawn its worker
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!(pipeline = name, "Pipeline task panicked");
                }
            }
            trace!(pipeline = name, "Task pipeline drained");
        });

        Self { name, tx }
    }

    /// Pipeline name used in logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append a task and wait for its output
    ///
    /// The task is queued immediately; awaiting the returned future is only
    /// needed to observe the result. Resolves to `PipelineClosed` if the
    /// task panicked.
    pub fn push<F, T>(&self, task: F) -> impl Future<Output = Result<T, PipelineClosed>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let queued = self
            .tx
            .send(Box::pin(async move {
                let output = task.await;
                let _ = done_tx.send(output);
            }))
            .is_ok();

        async move {
            if !queued {
                return Err(PipelineClosed);
            }
            done_rx.await.map_err(|_| PipelineClosed)
        }
    }

    /// Append a task without waiting for it
    pub fn submit<F>(&self, task: F) -> Result<(), PipelineClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.send(Box::pin(task)).map_err(|_| PipelineClosed)
    }
}
