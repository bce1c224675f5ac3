//! Scheduler abstraction and its back-ends.
//!
//! A scheduler accepts a [`JobDescription`], hands back an opaque
//! scheduler-native identifier, and reports one of four states until the
//! job reaches `ok` or `error`. Concrete back-ends:
//!
//! - [`memory::MemoryScheduler`]: bounded pool of in-process worker fibers
//! - [`slurm::SlurmScheduler`]: `sbatch`/`squeue`/`sacct` over SSH or locally
//! - [`queue::QueueScheduler`]: redis-backed queue drained by external workers
//! - [`grid::GridScheduler`]: DIRAC workload management via its CLI tools

pub mod grid;
pub mod memory;
pub mod queue;
pub mod slurm;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Name of the sentinel file written inside `job_dir` when a submission
/// is accepted. Retried submissions read it back instead of submitting a
/// second execution.
pub const SCHEDULER_HANDLE_FILE: &str = ".scheduler_handle";

/// State vocabulary shared by all schedulers. Nothing else leaks to the
/// orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Queued,
    Running,
    Ok,
    Error,
}

impl SchedulerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SchedulerState::Ok | SchedulerState::Error)
    }
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SchedulerState::Queued => "queued",
            SchedulerState::Running => "running",
            SchedulerState::Ok => "ok",
            SchedulerState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Optional resource hints attached to a submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    /// Wall-clock budget for the command.
    pub cpu_time: Option<Duration>,
    pub memory_mb: Option<u64>,
}

/// Everything a scheduler needs to run one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    /// Final rendered command line.
    pub command: String,
    /// Local absolute path of the job directory.
    pub job_dir: PathBuf,
    /// Where the job directory lives at the execution site, when the
    /// paired filesystem placed it somewhere other than `job_dir`.
    pub site_dir: Option<String>,
    #[serde(default)]
    pub resources: ResourceHints,
}

impl JobDescription {
    pub fn new(command: impl Into<String>, job_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            job_dir: job_dir.into(),
            site_dir: None,
            resources: ResourceHints::default(),
        }
    }

    /// The directory the scheduler should execute in.
    pub fn execution_dir(&self) -> String {
        self.site_dir
            .clone()
            .unwrap_or_else(|| self.job_dir.to_string_lossy().into_owned())
    }
}

/// Contract every scheduler back-end implements.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Submit a job for running and return a scheduler-native identifier.
    ///
    /// Must be idempotent with respect to crashes: implementations write
    /// the identifier to the [`SCHEDULER_HANDLE_FILE`] sentinel inside
    /// `job_dir` before returning, and a retry with an identical
    /// description reads the sentinel instead of submitting again.
    async fn submit(&self, description: &JobDescription) -> Result<String, SchedulerError>;

    /// Report the state of a previously submitted job.
    async fn state(&self, internal_id: &str) -> Result<SchedulerState, SchedulerError>;

    /// Report the states of several jobs. The default implementation asks
    /// one by one.
    async fn states(&self, internal_ids: &[String]) -> Result<Vec<SchedulerState>, SchedulerError> {
        let mut states = Vec::with_capacity(internal_ids.len());
        for id in internal_ids {
            states.push(self.state(id).await?);
        }
        Ok(states)
    }

    /// Best-effort, idempotent cancellation of a queued or running job.
    async fn cancel(&self, internal_id: &str) -> Result<(), SchedulerError>;

    /// Release pooled resources.
    async fn close(&self);

    /// Whether submitted jobs die with this process. The orchestrator
    /// marks such jobs `error(lost_to_restart)` at startup.
    fn lives_in_process(&self) -> bool {
        false
    }
}

/// Wrap a rendered command so it executes next to the uploaded files.
///
/// Archive contents live in the `input/` subdirectory of the job
/// directory; the command runs there so templates can reference uploads
/// by bare name, while scheduler artifacts (`stdout.txt`, `stderr.txt`,
/// `returncode`) stay at the job directory's top level.
pub fn command_in_input_dir(command: &str) -> String {
    format!("[ -d input ] && cd input; {command}")
}

/// Read the submission sentinel, if a previous attempt got far enough to
/// write it.
pub async fn read_handle_sentinel(job_dir: &Path) -> Option<String> {
    match tokio::fs::read_to_string(job_dir.join(SCHEDULER_HANDLE_FILE)).await {
        Ok(contents) => {
            let id = contents.trim();
            if id.is_empty() {
                None
            } else {
                Some(id.to_string())
            }
        }
        Err(_) => None,
    }
}

/// Record the scheduler handle for crash-safe retries. Called by every
/// back-end before `submit` returns.
pub async fn write_handle_sentinel(job_dir: &Path, internal_id: &str) -> Result<(), SchedulerError> {
    tokio::fs::write(job_dir.join(SCHEDULER_HANDLE_FILE), internal_id)
        .await
        .map_err(|e| {
            SchedulerError::Submit(format!(
                "failed to write scheduler handle sentinel in {}: {e}",
                job_dir.display()
            ))
        })
}
