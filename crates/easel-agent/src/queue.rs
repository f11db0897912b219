//! Single-slot job queue: provisioning runs execute one at a time, in
//! submission order. Cancelling a running job aborts it where it stands.

use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
};

use easel_project::JobId;
use tokio::sync::{mpsc, oneshot};

use crate::pipeline::format_error_chain;

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

struct QueuedJob {
    id: JobId,
    label: String,
    fut: JobFuture,
    done: oneshot::Sender<JobOutcome>,
}

#[derive(Default)]
struct Slots {
    queued: HashSet<JobId>,
    cancelled: HashSet<JobId>,
    running: Option<(JobId, tokio::task::AbortHandle)>,
}

#[derive(Debug)]
pub struct JobHandle {
    pub id: JobId,
    done: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    pub async fn wait(self) -> JobOutcome {
        self.done.await.unwrap_or(JobOutcome::Cancelled)
    }
}

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
    slots: Arc<Mutex<Slots>>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").finish_non_exhaustive()
    }
}

impl JobQueue {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let slots = Arc::new(Mutex::new(Slots::default()));
        tokio::spawn(worker(rx, slots.clone()));
        Self { tx, slots }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        lock(&self.slots)
    }

    pub fn enqueue(&self, label: impl Into<String>, fut: JobFuture) -> anyhow::Result<JobHandle> {
        let id = JobId::new();
        let (done_tx, done_rx) = oneshot::channel();
        let label = label.into();
        self.slots().queued.insert(id.clone());
        if self
            .tx
            .send(QueuedJob {
                id: id.clone(),
                label: label.clone(),
                fut,
                done: done_tx,
            })
            .is_err()
        {
            self.slots().queued.remove(&id);
            anyhow::bail!("job queue worker has stopped");
        }
        tracing::info!(job_id = %id, %label, "job queued");
        Ok(JobHandle { id, done: done_rx })
    }

    /// Cancel a queued or running job. `false` if the id is unknown or finished.
    pub fn cancel(&self, id: &JobId) -> bool {
        let mut slots = self.slots();
        if slots.queued.remove(id) {
            slots.cancelled.insert(id.clone());
            tracing::info!(job_id = %id, "queued job cancelled");
            return true;
        }
        if let Some((running, abort)) = &slots.running
            && running == id
        {
            abort.abort();
            tracing::info!(job_id = %id, "running job aborted");
            return true;
        }
        false
    }
}

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

async fn worker(mut rx: mpsc::UnboundedReceiver<QueuedJob>, slots: Arc<Mutex<Slots>>) {
    while let Some(job) = rx.recv().await {
        let QueuedJob { id, label, fut, done } = job;

        let handle = {
            let mut s = lock(&slots);
            s.queued.remove(&id);
            if s.cancelled.remove(&id) {
                drop(s);
                let _ = done.send(JobOutcome::Cancelled);
                continue;
            }
            let handle = tokio::spawn(fut);
            s.running = Some((id.clone(), handle.abort_handle()));
            handle
        };

        tracing::info!(job_id = %id, %label, "job started");
        let outcome = match handle.await {
            Ok(Ok(())) => JobOutcome::Succeeded,
            Ok(Err(e)) => JobOutcome::Failed(format_error_chain(&e)),
            Err(e) if e.is_cancelled() => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed(format!("job panicked: {e}")),
        };
        lock(&slots).running = None;

        match &outcome {
            JobOutcome::Succeeded => tracing::info!(job_id = %id, %label, "job finished"),
            JobOutcome::Failed(msg) => tracing::error!(job_id = %id, %label, error = %msg, "job failed"),
            JobOutcome::Cancelled => tracing::warn!(job_id = %id, %label, "job cancelled"),
        }
        let _ = done.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Context as _;

    use super::*;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn job(log: &Arc<Mutex<Vec<String>>>, name: &'static str, delay_ms: u64) -> JobFuture {
        let log = log.clone();
        Box::pin(async move {
            log.lock().unwrap().push(format!("{name} start"));
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            log.lock().unwrap().push(format!("{name} end"));
            Ok(())
        })
    }

    #[tokio::test]
    async fn jobs_run_one_at_a_time_in_order() {
        let q = JobQueue::start();
        let log = recorder();
        let a = q.enqueue("a", job(&log, "a", 50)).unwrap();
        let b = q.enqueue("b", job(&log, "b", 0)).unwrap();
        assert_ne!(a.id, b.id);

        assert_eq!(a.wait().await, JobOutcome::Succeeded);
        assert_eq!(b.wait().await, JobOutcome::Succeeded);
        assert_eq!(
            *log.lock().unwrap(),
            ["a start", "a end", "b start", "b end"]
        );
    }

    #[tokio::test]
    async fn cancelled_queued_job_never_runs() {
        let q = JobQueue::start();
        let log = recorder();
        let a = q.enqueue("a", job(&log, "a", 100)).unwrap();
        let b = q.enqueue("b", job(&log, "b", 0)).unwrap();
        assert!(q.cancel(&b.id));

        assert_eq!(a.wait().await, JobOutcome::Succeeded);
        assert_eq!(b.wait().await, JobOutcome::Cancelled);
        assert_eq!(*log.lock().unwrap(), ["a start", "a end"]);
    }

    #[tokio::test]
    async fn running_job_is_aborted() {
        let q = JobQueue::start();
        let log = recorder();
        let a = q.enqueue("a", job(&log, "a", 10_000)).unwrap();
        for _ in 0..100 {
            if !log.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(q.cancel(&a.id));
        assert_eq!(a.wait().await, JobOutcome::Cancelled);
        assert_eq!(*log.lock().unwrap(), ["a start"]);
        assert!(!q.cancel(&JobId::new()));
    }

    #[tokio::test]
    async fn failures_carry_the_error_chain() {
        let q = JobQueue::start();
        let h = q
            .enqueue(
                "bad",
                Box::pin(async {
                    Err::<(), _>(anyhow::anyhow!("disk full")).context("write state")
                }),
            )
            .unwrap();
        assert_eq!(h.wait().await, JobOutcome::Failed("write state: disk full".to_string()));
    }
}
