//! Redis-backed queue scheduler.
//!
//! The web service side only submits and observes: a submission pushes
//! the job id onto a named list and writes a job record hash; external
//! worker processes pop ids with `BRPOPLPUSH`, execute the command and
//! write the terminal state back into the record. [`run_worker`] is that
//! worker loop, exposed through the `perform` subcommand.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    read_handle_sentinel, write_handle_sentinel, JobDescription, Scheduler, SchedulerState,
};
use crate::error::SchedulerError;

/// Return code recorded when a job is cancelled or times out.
const KILLED_RETURN_CODE: i32 = 130;

/// How often a running command re-checks its cancel flag.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct QueueScheduler {
    redis_dsn: String,
    queue: String,
    max_jobs: usize,
    job_timeout: Duration,
    connection: Mutex<Option<ConnectionManager>>,
}

impl QueueScheduler {
    pub fn new(redis_dsn: String, queue: String, max_jobs: usize, job_timeout: u64) -> Self {
        Self {
            redis_dsn,
            queue,
            max_jobs,
            job_timeout: Duration::from_secs(job_timeout),
            connection: Mutex::new(None),
        }
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    fn record_key(queue: &str, internal_id: &str) -> String {
        format!("{queue}:job:{internal_id}")
    }

    async fn connection(&self) -> Result<ConnectionManager, SchedulerError> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            let client = redis::Client::open(self.redis_dsn.as_str())
                .map_err(|e| SchedulerError::Submit(format!("invalid redis dsn: {e}")))?;
            let manager = client
                .get_connection_manager()
                .await
                .map_err(|e| SchedulerError::Submit(format!("redis connect: {e}")))?;
            *guard = Some(manager);
        }
        Ok(guard.as_ref().expect("connection just created").clone())
    }
}

#[async_trait]
impl Scheduler for QueueScheduler {
    async fn submit(&self, description: &JobDescription) -> Result<String, SchedulerError> {
        if let Some(existing) = read_handle_sentinel(&description.job_dir).await {
            return Ok(existing);
        }
        let internal_id = Uuid::new_v4().to_string();
        let key = Self::record_key(&self.queue, &internal_id);
        let mut con = self.connection().await?;
        con.hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("state", "queued".to_string()),
                ("command", description.command.clone()),
                ("job_dir", description.execution_dir()),
                ("timeout_secs", self.job_timeout.as_secs().to_string()),
                ("cancelled", "0".to_string()),
            ],
        )
        .await
        .map_err(|e| SchedulerError::Submit(format!("redis hset: {e}")))?;
        con.lpush::<_, _, ()>(&self.queue, &internal_id)
            .await
            .map_err(|e| SchedulerError::Submit(format!("redis lpush: {e}")))?;
        write_handle_sentinel(&description.job_dir, &internal_id).await?;
        Ok(internal_id)
    }

    async fn state(&self, internal_id: &str) -> Result<SchedulerState, SchedulerError> {
        let key = Self::record_key(&self.queue, internal_id);
        let mut con = self.connection().await?;
        let state: Option<String> = con
            .hget(&key, "state")
            .await
            .map_err(|e| SchedulerError::State(format!("redis hget: {e}")))?;
        match state.as_deref() {
            Some("queued") => Ok(SchedulerState::Queued),
            Some("running") => Ok(SchedulerState::Running),
            Some("ok") => Ok(SchedulerState::Ok),
            Some("error") => Ok(SchedulerState::Error),
            Some(other) => Err(SchedulerError::State(format!(
                "job {internal_id} has unexpected state {other}"
            ))),
            None => Err(SchedulerError::State(format!(
                "job {internal_id} has no record"
            ))),
        }
    }

    async fn cancel(&self, internal_id: &str) -> Result<(), SchedulerError> {
        let key = Self::record_key(&self.queue, internal_id);
        let mut con = self.connection().await?;
        let state: Option<String> = con
            .hget(&key, "state")
            .await
            .map_err(|e| SchedulerError::State(format!("redis hget: {e}")))?;
        match state.as_deref() {
            Some("queued") => {
                // never picked up; terminal straight away
                con.hset_multiple::<_, _, _, ()>(&key, &[("cancelled", "1"), ("state", "error")])
                    .await
                    .map_err(|e| SchedulerError::State(format!("redis hset: {e}")))?;
            }
            Some("running") => {
                con.hset::<_, _, _, ()>(&key, "cancelled", "1")
                    .await
                    .map_err(|e| SchedulerError::State(format!("redis hset: {e}")))?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn close(&self) {
        let mut guard = self.connection.lock().await;
        *guard = None;
    }
}

impl std::fmt::Debug for QueueScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueScheduler")
            .field("queue", &self.queue)
            .field("max_jobs", &self.max_jobs)
            .finish()
    }
}

/// Worker loop draining a queue destination.
///
/// Pops job ids with `BRPOPLPUSH` into a processing list so an id is never
/// lost between pop and execution, runs up to `max_jobs` commands
/// concurrently, and writes terminal states back into the job records.
pub async fn run_worker(
    redis_dsn: &str,
    queue: &str,
    max_jobs: usize,
    job_timeout: u64,
    shutdown: CancellationToken,
) -> Result<(), SchedulerError> {
    let client = redis::Client::open(redis_dsn)
        .map_err(|e| SchedulerError::Submit(format!("invalid redis dsn: {e}")))?;
    let con = client
        .get_connection_manager()
        .await
        .map_err(|e| SchedulerError::Submit(format!("redis connect: {e}")))?;
    let processing = format!("{queue}:processing");
    let slots = Arc::new(Semaphore::new(max_jobs.max(1)));
    tracing::info!(queue, max_jobs, "queue worker started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let mut pop_con = con.clone();
        let popped: Option<String> = tokio::select! {
            result = async {
                redis::cmd("BRPOPLPUSH")
                    .arg(queue)
                    .arg(&processing)
                    .arg(1)
                    .query_async(&mut pop_con)
                    .await
            } => result.map_err(|e| SchedulerError::State(format!("redis brpoplpush: {e}")))?,
            _ = shutdown.cancelled() => break,
        };
        let Some(internal_id) = popped else { continue };

        let permit = Arc::clone(&slots)
            .acquire_owned()
            .await
            .expect("semaphore never closed");
        let con = con.clone();
        let queue = queue.to_string();
        let processing = processing.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) =
                execute_queued_job(con, &queue, &processing, &internal_id, job_timeout).await
            {
                tracing::error!(internal_id = %internal_id, error = %e, "queue job failed");
            }
        });
    }
    tracing::info!(queue, "queue worker stopped");
    Ok(())
}

async fn execute_queued_job(
    mut con: ConnectionManager,
    queue: &str,
    processing: &str,
    internal_id: &str,
    job_timeout: u64,
) -> Result<(), SchedulerError> {
    let key = QueueScheduler::record_key(queue, internal_id);
    let record: std::collections::HashMap<String, String> = con
        .hgetall(&key)
        .await
        .map_err(|e| SchedulerError::State(format!("redis hgetall: {e}")))?;

    let state = record.get("state").map(String::as_str).unwrap_or("");
    let cancelled = record.get("cancelled").map(String::as_str) == Some("1");
    if state != "queued" || cancelled {
        let _: Result<(), _> = con.lrem(processing, 1, internal_id).await;
        return Ok(());
    }
    let command = record.get("command").cloned().unwrap_or_default();
    let job_dir = std::path::PathBuf::from(record.get("job_dir").cloned().unwrap_or_default());
    if command.is_empty() || !job_dir.is_dir() {
        con.hset::<_, _, _, ()>(&key, "state", "error")
            .await
            .map_err(|e| SchedulerError::State(format!("redis hset: {e}")))?;
        let _: Result<(), _> = con.lrem(processing, 1, internal_id).await;
        return Ok(());
    }

    con.hset::<_, _, _, ()>(&key, "state", "running")
        .await
        .map_err(|e| SchedulerError::State(format!("redis hset: {e}")))?;

    let timeout = record
        .get("timeout_secs")
        .and_then(|t| t.parse::<u64>().ok())
        .unwrap_or(job_timeout);
    // re-read the cancel flag while the command runs so a cancellation of
    // a running job kills it instead of letting it finish
    let cancel_con = con.clone();
    let cancel_key = key.clone();
    let returncode = run_command_in_dir(
        &command,
        &job_dir,
        Duration::from_secs(timeout),
        move || {
            let mut con = cancel_con.clone();
            let key = cancel_key.clone();
            async move {
                let flag: Option<String> = con.hget(&key, "cancelled").await.unwrap_or(None);
                flag.as_deref() == Some("1")
            }
        },
    )
    .await;

    let final_state = if returncode == 0 { "ok" } else { "error" };
    con.hset_multiple::<_, _, _, ()>(
        &key,
        &[
            ("state", final_state.to_string()),
            ("returncode", returncode.to_string()),
        ],
    )
    .await
    .map_err(|e| SchedulerError::State(format!("redis hset: {e}")))?;
    let _: Result<(), _> = con.lrem(processing, 1, internal_id).await;
    tracing::info!(internal_id, state = final_state, returncode, "queue job finished");
    Ok(())
}

/// Run the command with output capture into the job directory, mirroring
/// what the memory scheduler's workers do. The command is killed and
/// recorded with the killed return code when the timeout elapses or when
/// `cancelled` reports true between poll intervals.
async fn run_command_in_dir<C, Fut>(
    command: &str,
    job_dir: &std::path::Path,
    timeout: Duration,
    mut cancelled: C,
) -> i32
where
    C: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let open = |name: &str| std::fs::File::create(job_dir.join(name));
    let (stdout, stderr) = match (open("stdout.txt"), open("stderr.txt")) {
        (Ok(out), Ok(err)) => (out, err),
        _ => return -1,
    };
    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(super::command_in_input_dir(command))
        .current_dir(job_dir)
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(_) => return -1,
    };
    let deadline = tokio::time::Instant::now() + timeout;
    let returncode = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(_) => -1,
                };
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = child.kill().await;
                break KILLED_RETURN_CODE;
            }
            _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {
                if cancelled().await {
                    let _ = child.kill().await;
                    break KILLED_RETURN_CODE;
                }
            }
        }
    };
    let _ = std::fs::write(job_dir.join("returncode"), returncode.to_string());
    returncode
}
