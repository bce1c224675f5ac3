//! In-process scheduler.
//!
//! Jobs are queued on a local FIFO and executed by a bounded pool of
//! worker fibers (`slots` of them). State lives only in this process:
//! whatever was queued or running when the service stops is gone, which
//! the orchestrator reports as `error(lost_to_restart)` on the next
//! startup.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    read_handle_sentinel, write_handle_sentinel, JobDescription, Scheduler, SchedulerState,
};
use crate::error::SchedulerError;

/// Return code recorded when a job is killed by cancellation.
const KILLED_RETURN_CODE: i32 = 130;

#[derive(Debug, Clone)]
struct MemJob {
    description: JobDescription,
    state: SchedulerState,
    cancel: CancellationToken,
}

struct Inner {
    jobs: RwLock<HashMap<String, MemJob>>,
    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

pub struct MemoryScheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    slots: usize,
}

impl MemoryScheduler {
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            jobs: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
        });
        let mut workers = Vec::with_capacity(slots);
        for index in 0..slots {
            let inner = Arc::clone(&inner);
            workers.push(tokio::spawn(worker_loop(inner, index)));
        }
        Self {
            inner,
            workers: Mutex::new(workers),
            slots,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn submit(&self, description: &JobDescription) -> Result<String, SchedulerError> {
        // a crashed caller retries with the same description; the sentinel
        // keeps that from starting a second execution
        if let Some(existing) = read_handle_sentinel(&description.job_dir).await {
            if self.inner.jobs.read().await.contains_key(&existing) {
                return Ok(existing);
            }
        }
        let internal_id = Uuid::new_v4().to_string();
        let job = MemJob {
            description: description.clone(),
            state: SchedulerState::Queued,
            cancel: CancellationToken::new(),
        };
        self.inner
            .jobs
            .write()
            .await
            .insert(internal_id.clone(), job);
        write_handle_sentinel(&description.job_dir, &internal_id).await?;
        self.inner
            .queue_tx
            .send(internal_id.clone())
            .map_err(|_| SchedulerError::Submit("scheduler is closed".into()))?;
        Ok(internal_id)
    }

    async fn state(&self, internal_id: &str) -> Result<SchedulerState, SchedulerError> {
        self.inner
            .jobs
            .read()
            .await
            .get(internal_id)
            .map(|job| job.state)
            .ok_or_else(|| SchedulerError::State(format!("unknown job {internal_id}")))
    }

    async fn cancel(&self, internal_id: &str) -> Result<(), SchedulerError> {
        let mut jobs = self.inner.jobs.write().await;
        if let Some(job) = jobs.get_mut(internal_id) {
            match job.state {
                SchedulerState::Queued => {
                    job.cancel.cancel();
                    job.state = SchedulerState::Error;
                }
                SchedulerState::Running => {
                    job.cancel.cancel();
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn close(&self) {
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.abort();
        }
    }

    fn lives_in_process(&self) -> bool {
        true
    }
}

async fn worker_loop(inner: Arc<Inner>, worker_index: usize) {
    loop {
        let next = {
            let mut rx = inner.queue_rx.lock().await;
            rx.recv().await
        };
        let Some(internal_id) = next else {
            break;
        };
        let job = {
            let jobs = inner.jobs.read().await;
            jobs.get(&internal_id).cloned()
        };
        let Some(job) = job else { continue };
        if job.cancel.is_cancelled() {
            continue;
        }
        {
            let mut jobs = inner.jobs.write().await;
            if let Some(entry) = jobs.get_mut(&internal_id) {
                entry.state = SchedulerState::Running;
            }
        }
        tracing::debug!(internal_id = %internal_id, worker_index, "memory scheduler picked up job");
        let state = execute(&job.description, &job.cancel).await;
        let mut jobs = inner.jobs.write().await;
        if let Some(entry) = jobs.get_mut(&internal_id) {
            entry.state = state;
        }
    }
}

/// Run the command in the job directory, streaming output to
/// `stdout.txt`/`stderr.txt` and recording the exit code in `returncode`.
async fn execute(description: &JobDescription, cancel: &CancellationToken) -> SchedulerState {
    let job_dir = &description.job_dir;
    let open = |name: &str| -> std::io::Result<std::fs::File> {
        std::fs::File::create(job_dir.join(name))
    };
    let (stdout, stderr) = match (open("stdout.txt"), open("stderr.txt")) {
        (Ok(out), Ok(err)) => (out, err),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(job_dir = %job_dir.display(), error = %e, "failed to open output files");
            return SchedulerState::Error;
        }
    };

    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(super::command_in_input_dir(&description.command))
        .current_dir(job_dir)
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(job_dir = %job_dir.display(), error = %e, "failed to spawn job command");
            return SchedulerState::Error;
        }
    };

    let returncode = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                tracing::error!(error = %e, "failed waiting for job command");
                -1
            }
        },
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            KILLED_RETURN_CODE
        }
    };

    if let Err(e) = std::fs::write(job_dir.join("returncode"), returncode.to_string()) {
        tracing::error!(job_dir = %job_dir.display(), error = %e, "failed to write returncode");
    }
    if returncode == 0 {
        SchedulerState::Ok
    } else {
        SchedulerState::Error
    }
}

impl std::fmt::Debug for MemoryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryScheduler")
            .field("slots", &self.slots)
            .finish()
    }
}
