//! Fire-and-forget background work.
//!
//! Jobs run one at a time, each on its own task so a panicking job cannot take
//! the worker down. A job failure or panic is logged and dropped; nothing flows back to the request that scheduled it. When the queue is
//! full new jobs are discarded, so a slow database can never back-pressure request
//! handling.

use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, error, info_span, warn};

const DEFAULT_CAPACITY: usize = 1024;

type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

enum Job {
    Run { name: &'static str, task: JobFuture },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct TaskQueue {
    sender: mpsc::Sender<Job>,
}

impl TaskQueue {
    /// Start the worker on the current tokio runtime.
    #[must_use]
    pub fn spawn() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_worker(receiver));
        Self { sender }
    }

    /// Enqueue `task` without waiting for it. Returns `false` if it was dropped.
    pub fn schedule<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job = Job::Run {
            name,
            task: Box::pin(task),
        };
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(job = name, "deferred queue full, dropping job");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(job = name, "deferred worker stopped, dropping job");
                false
            }
        }
    }

    /// Wait until every job scheduled before this call has finished.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(Job::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }
}

async fn run_worker(mut receiver: mpsc::Receiver<Job>) {
    while let Some(job) = receiver.recv().await {
        match job {
            Job::Run { name, task } => {
                let span = info_span!("deferred.job", job = name);
                match tokio::spawn(task.instrument(span)).await {
                    Ok(Ok(())) => debug!(job = name, "deferred job finished"),
                    Ok(Err(err)) => error!(job = name, "deferred job failed: {err:#}"),
                    Err(err) => error!(job = name, "deferred job aborted: {err}"),
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
