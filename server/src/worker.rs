//! Bounded background job queue.
//!
//! Jobs are boxed futures sent over an mpsc channel; a dispatcher task runs
//! each one under a semaphore permit. Completion is observable per job through
//! [`JobHandle`] and globally through the failure channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::debug;

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// Failure report of one job.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub job: String,
    pub error: String,
}

struct Job {
    label: String,
    fut: JobFuture,
    done: oneshot::Sender<Result<(), String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job queue is shut down")]
    Closed,
}

/// Awaitable completion of a submitted job.
pub struct JobHandle {
    rx: oneshot::Receiver<Result<(), String>>,
}

impl JobHandle {
    /// `Err` carries the job's error message, or notes that it never ran to completion.
    pub async fn wait(self) -> Result<(), String> {
        self.rx.await.unwrap_or_else(|_| Err("job dropped before completion".to_string()))
    }
}

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    /// Starts the dispatcher on the current runtime. Failures are reported on
    /// the returned receiver; dropping it is fine.
    pub fn start(max_concurrent: usize) -> (Self, mpsc::UnboundedReceiver<JobFailure>) {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let (fail_tx, fail_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx, Arc::new(Semaphore::new(max_concurrent.max(1))), fail_tx));
        (Self { tx }, fail_rx)
    }

    pub fn submit<F>(&self, label: impl Into<String>, fut: F) -> Result<JobHandle, QueueError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        self.tx.send(Job { label: label.into(), fut: Box::pin(fut), done }).map_err(|_| QueueError::Closed)?;
        Ok(JobHandle { rx })
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Job>, permits: Arc<Semaphore>, failures: mpsc::UnboundedSender<JobFailure>) {
    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else { break };
        let failures = failures.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = job.fut.await.map_err(|e| format!("{:#}", e));
            match &outcome {
                Ok(()) => debug!(job = %job.label, "job finished"),
                Err(err) => {
                    debug!(job = %job.label, error = %err, "job failed");
                    let _ = failures.send(JobFailure { job: job.label.clone(), error: err.clone() });
                }
            }
            let _ = job.done.send(outcome);
        });
    }
    debug!("job queue closed");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn handles_report_outcome_and_failures_are_broadcast() {
        let (queue, mut failures) = JobQueue::start(2);
        let ok = queue.submit("ok", async { Ok(()) }).unwrap();
        let bad = queue.submit("bad", async { Err(anyhow::anyhow!("extraction exploded")) }).unwrap();
        assert!(ok.wait().await.is_ok());
        assert!(bad.wait().await.unwrap_err().contains("extraction exploded"));
        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.job, "bad");
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let (queue, _failures) = JobQueue::start(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..8 {
            let (running, peak) = (running.clone(), peak.clone());
            handles.push(queue.submit(format!("job-{}", i), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }).unwrap());
        }
        for h in handles { h.wait().await.unwrap(); }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }
}
