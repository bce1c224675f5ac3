//! Job persistence contract and the in-process reference implementation.
//!
//! The orchestrator only ever talks to [`JobStore`]; a deployment backs
//! it with a relational database. [`MemoryJobStore`] keeps everything in
//! a map and backs the monotonic job-id counter with its own counter,
//! which is the store's transactional increment.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::job::{Job, JobState};

/// Optional fields attached to a state transition.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    /// Scheduler handle; may only be supplied once, when entering
    /// `queued`.
    pub internal_id: Option<String>,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

impl StateUpdate {
    pub fn with_internal_id(internal_id: impl Into<String>) -> Self {
        Self {
            internal_id: Some(internal_id.into()),
            ..Default::default()
        }
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Persistence collaborator for job metadata.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job row in state `new` and return its id. Ids are
    /// monotonic and unique.
    async fn create_job(
        &self,
        submitter: &str,
        application: &str,
        destination: &str,
        name: &str,
    ) -> Result<i64, StoreError>;

    /// Atomically move a job to `new_state`, recording any of the
    /// optional fields. Transitions outside the state graph are rejected.
    async fn set_state(
        &self,
        job_id: i64,
        new_state: JobState,
        update: StateUpdate,
    ) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: i64) -> Result<Job, StoreError>;

    /// All jobs not yet in `ok` or `error`; used once at startup to
    /// resume polling.
    async fn list_non_terminal(&self) -> Result<Vec<Job>, StoreError>;
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    next_id: i64,
    jobs: HashMap<i64, Job>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(
        &self,
        submitter: &str,
        application: &str,
        destination: &str,
        name: &str,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .jobs
            .insert(id, Job::new(id, name, application, submitter, destination));
        Ok(id)
    }

    async fn set_state(
        &self,
        job_id: i64,
        new_state: JobState,
        update: StateUpdate,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound(job_id))?;
        if !job.state.can_transition(new_state) {
            return Err(StoreError::InvalidTransition {
                job_id,
                from: job.state,
                to: new_state,
            });
        }
        if let Some(internal_id) = update.internal_id {
            match &job.internal_id {
                Some(existing) if *existing != internal_id => {
                    return Err(StoreError::Internal(format!(
                        "job {job_id} already has scheduler handle {existing}"
                    )));
                }
                _ => job.internal_id = Some(internal_id),
            }
        }
        if update.exit_code.is_some() {
            job.exit_code = update.exit_code;
        }
        if update.reason.is_some() {
            job.reason = update.reason;
        }
        job.state = new_state;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> Result<Job, StoreError> {
        self.inner
            .read()
            .await
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn list_non_terminal(&self) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| !job.state.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }
}
