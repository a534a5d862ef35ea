use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::events::EventBus;

/// Lifecycle of one upload-to-listings job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Created,
    Discovering,
    Refining,
    /// Auto-refine got stuck; a human needs to look at the test results.
    NeedsReview,
    AwaitingApproval,
    Approved,
    Executing,
    Complete,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job not found")]
    NotFound,
    #[error("job is already running a task")]
    Busy,
}

/// Shared cancellation and identity handle, cloned into background tasks.
/// Cancellation is advisory: long-running loops check it between steps.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: Uuid,
    cancel: Arc<AtomicBool>,
}

impl JobContext {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct JobEntry {
    pub context: JobContext,
    pub bus: EventBus,
    pub created_at: DateTime<Utc>,
    phase: Mutex<JobPhase>,
    busy: AtomicBool,
}

impl JobEntry {
    pub async fn phase(&self) -> JobPhase {
        *self.phase.lock().await
    }

    pub async fn set_phase(&self, phase: JobPhase) {
        let mut guard = self.phase.lock().await;
        tracing::info!(
            target = "listwright.jobs",
            job_id = %self.context.id,
            from = ?*guard,
            to = ?phase,
            "phase change"
        );
        *guard = phase;
    }
}

/// Holds the job's busy flag; dropping it releases the job for the next
/// refine or batch request.
pub struct BusyGuard {
    entry: Arc<JobEntry>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.entry.busy.store(false, Ordering::SeqCst);
    }
}

/// In-process registry of active jobs. At most one long-running task (refine
/// or batch) may hold a job at a time; a second request gets `Busy` instead
/// of a duplicate run.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, Arc<JobEntry>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self) -> Arc<JobEntry> {
        let id = Uuid::new_v4();
        let entry = Arc::new(JobEntry {
            context: JobContext::new(id),
            bus: EventBus::default(),
            created_at: Utc::now(),
            phase: Mutex::new(JobPhase::Created),
            busy: AtomicBool::new(false),
        });
        self.jobs.lock().await.insert(id, Arc::clone(&entry));
        tracing::info!(target = "listwright.jobs", job_id = %id, "job created");
        entry
    }

    pub async fn get(&self, id: Uuid) -> Result<Arc<JobEntry>, JobError> {
        self.jobs
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(JobError::NotFound)
    }

    /// Claim a job for exclusive background work.
    pub fn try_begin(&self, entry: &Arc<JobEntry>) -> Result<BusyGuard, JobError> {
        entry
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| JobError::Busy)?;
        Ok(BusyGuard {
            entry: Arc::clone(entry),
        })
    }
}
