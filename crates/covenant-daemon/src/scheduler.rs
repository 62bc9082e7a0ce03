//! Scheduled-job queue.
//!
//! A monotonic priority queue of jobs (vote finalization, transfer
//! timeouts). Jobs persist under `scheduler/<job-id>` so a restart resumes
//! them; firing routes the payload back through the handler pipeline under
//! the reprocess cause.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use covenant_core::bitcoin::{Address, Hash32};
use covenant_core::protocol::Timestamp;

use crate::storage::{Storage, StorageError};

/// Errors from scheduler persistence.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Blob store failure.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// A persisted job did not decode.
    #[error("corrupt job {0}")]
    Corrupt(String),
}

/// What a fired job asks the pipeline to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPayload {
    /// Tally a vote at its cut-off.
    FinalizeVote {
        /// The vote's id (the Vote response tx id).
        vote_tx_id: Hash32,
    },
    /// Abort a pending transfer that missed its settlement.
    TransferTimeout {
        /// The transfer request tx id.
        transfer_tx_id: Hash32,
    },
}

/// A persisted scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Stable id; scheduling an existing id replaces the job.
    pub id: String,
    /// Contract the job belongs to.
    pub contract: Address,
    /// When the job fires.
    pub due: Timestamp,
    /// What to do.
    pub payload: JobPayload,
}

impl Job {
    /// The canonical id for a vote finalizer.
    #[must_use]
    pub fn vote_id(vote_tx_id: &Hash32) -> String {
        format!("vote-{vote_tx_id}")
    }

    /// The canonical id for a transfer timeout.
    #[must_use]
    pub fn transfer_id(transfer_tx_id: &Hash32) -> String {
        format!("transfer-{transfer_tx_id}")
    }
}

#[derive(PartialEq, Eq)]
struct QueueEntry {
    due: Timestamp,
    id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, &self.id).cmp(&(other.due, &other.id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    queue: BinaryHeap<Reverse<QueueEntry>>,
    jobs: std::collections::HashMap<String, Job>,
}

/// The job scheduler.
pub struct Scheduler {
    storage: Arc<dyn Storage>,
    inner: Mutex<Inner>,
    changed: Notify,
}

fn job_key(id: &str) -> String {
    format!("scheduler/{id}")
}

impl Scheduler {
    /// Builds a scheduler over `storage`, loading persisted jobs.
    pub fn load(storage: Arc<dyn Storage>) -> Result<Self, SchedulerError> {
        let mut inner = Inner {
            queue: BinaryHeap::new(),
            jobs: std::collections::HashMap::new(),
        };
        for key in storage.list("scheduler/")? {
            let data = storage.read(&key)?;
            let job: Job = serde_json::from_slice(&data)
                .map_err(|_| SchedulerError::Corrupt(key.clone()))?;
            inner.queue.push(Reverse(QueueEntry {
                due: job.due,
                id: job.id.clone(),
            }));
            inner.jobs.insert(job.id.clone(), job);
        }
        Ok(Scheduler {
            storage,
            inner: Mutex::new(inner),
            changed: Notify::new(),
        })
    }

    /// Schedules (or replaces) a job.
    pub fn schedule(&self, job: Job) -> Result<(), SchedulerError> {
        let data = serde_json::to_vec(&job).expect("job serializes");
        self.storage.write(&job_key(&job.id), &data)?;

        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        inner.queue.push(Reverse(QueueEntry {
            due: job.due,
            id: job.id.clone(),
        }));
        inner.jobs.insert(job.id.clone(), job);
        drop(inner);

        self.changed.notify_one();
        Ok(())
    }

    /// Cancels a job by id. Cancelling an unknown id is a no-op.
    pub fn cancel(&self, id: &str) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        if inner.jobs.remove(id).is_none() {
            return Ok(());
        }
        drop(inner);
        match self.storage.remove(&job_key(id)) {
            Ok(()) | Err(StorageError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        self.changed.notify_one();
        Ok(())
    }

    /// Jobs currently scheduled, soonest first.
    #[must_use]
    pub fn pending(&self) -> Vec<Job> {
        let inner = self.inner.lock().expect("scheduler lock poisoned");
        let mut jobs: Vec<Job> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.due);
        jobs
    }

    /// Pops every job due at or before `now`, removing each from
    /// persistence.
    pub fn due_jobs(&self, now: Timestamp) -> Result<Vec<Job>, SchedulerError> {
        let mut fired = Vec::new();
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        loop {
            let has_due = matches!(inner.queue.peek(), Some(Reverse(entry)) if entry.due <= now);
            if !has_due {
                break;
            }
            let id = inner
                .queue
                .pop()
                .map(|Reverse(e)| e.id)
                .expect("peeked entry exists");
            // Stale queue entries (replaced or cancelled jobs) are skipped.
            if let Some(job) = inner.jobs.get(&id) {
                if job.due <= now {
                    fired.push(inner.jobs.remove(&id).expect("job present"));
                }
            }
        }
        drop(inner);

        for job in &fired {
            match self.storage.remove(&job_key(&job.id)) {
                Ok(()) | Err(StorageError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(fired)
    }

    /// Time until the next job is due, if any.
    #[must_use]
    pub fn next_due(&self) -> Option<Timestamp> {
        let inner = self.inner.lock().expect("scheduler lock poisoned");
        inner.jobs.values().map(|j| j.due).min()
    }

    /// Runs the dispatch loop, sending fired jobs to `sink` until
    /// `shutdown` resolves. The queue wakes on schedule changes and at due
    /// times.
    pub async fn run(
        self: Arc<Self>,
        sink: mpsc::Sender<Job>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            let now = Timestamp::now();
            match self.due_jobs(now) {
                Ok(jobs) => {
                    for job in jobs {
                        debug!(job = %job.id, "job due");
                        if sink.send(job).await.is_err() {
                            return; // pipeline gone
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to pop due jobs"),
            }

            let sleep = match self.next_due() {
                Some(due) if due.nanos() > now.nanos() => {
                    Duration::from_nanos(due.nanos() - now.nanos())
                }
                Some(_) => Duration::from_millis(0),
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.changed.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
