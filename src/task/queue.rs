use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Collaborators, Task};
use crate::error::{Error, Result};

/// Tasks waiting for a free worker.
const JOB_QUEUE_CAPACITY: usize = 64;

/// Registry of live tasks, keyed by id.
#[derive(Debug)]
pub struct TaskQueue {
    tasks: Mutex<HashMap<String, Arc<Task>>>,
    scratch_root: PathBuf,
    timeout: Duration,
}

impl TaskQueue {
    pub fn new(scratch_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            scratch_root: scratch_root.into(),
            timeout,
        }
    }

    /// Create and register a task for `image` under a fresh id.
    pub fn add(&self, image: &str) -> Result<Arc<Task>> {
        let id = Uuid::new_v4().to_string();
        let task = Arc::new(Task::new(id.clone(), image, &self.scratch_root, self.timeout)?);
        self.tasks.lock().insert(id.clone(), task.clone());
        info!(task = %id, image, "task added");
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Task>> {
        self.tasks
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    /// Unregister a task, cancel it and delete its scratch directory.
    pub fn remove(&self, id: &str) -> Result<()> {
        let task = self
            .tasks
            .lock()
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        task.cleanup()?;
        debug!(task = %id, "task removed");
        Ok(())
    }

    /// Remove every task. Returns the cleanup failures; the queue is empty
    /// afterwards either way.
    pub fn cleanup_all(&self) -> Vec<Error> {
        let tasks: Vec<Arc<Task>> = self.tasks.lock().drain().map(|(_, t)| t).collect();
        tasks
            .into_iter()
            .filter_map(|task| {
                task.cleanup()
                    .map_err(|e| {
                        warn!(task = task.id(), error = %e, "failed to clean up task");
                        e
                    })
                    .err()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

/// Handle for handing tasks to the worker pool.
#[derive(Debug, Clone)]
pub struct JobSender {
    jobs: mpsc::Sender<Arc<Task>>,
}

impl JobSender {
    /// Queue `task` without waiting. Fails with [`Error::QueueFull`] when the
    /// backlog is at capacity.
    pub fn submit(&self, task: Arc<Task>) -> Result<()> {
        self.jobs.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull,
            TrySendError::Closed(_) => {
                Error::InvalidState("worker pool has shut down".to_string())
            }
        })
    }

    /// A sender whose jobs nobody picks up until the receiver is read.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<Arc<Task>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { jobs: tx }, rx)
    }
}

/// Fixed set of workers processing tasks in submission order.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` workers (at least one). The pool stops once every
    /// [`JobSender`] has been dropped and the backlog is drained.
    pub fn spawn(workers: usize, collaborators: Arc<Collaborators>) -> (JobSender, Self) {
        let (tx, rx) = mpsc::channel::<Arc<Task>>(JOB_QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let collaborators = collaborators.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(task) = next else { break };
                        if task.is_cancelled() {
                            debug!(worker, task = task.id(), "skipping removed task");
                            continue;
                        }
                        debug!(worker, task = task.id(), "processing task");
                        if let Err(e) = task.process(&collaborators).await {
                            warn!(worker, task = task.id(), error = %e, "task not processed");
                        }
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();

        (JobSender { jobs: tx }, Self { handles })
    }

    /// Wait for all workers to stop.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker panicked");
            }
        }
    }
}
