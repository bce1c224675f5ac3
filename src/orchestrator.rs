//! Drives jobs through their lifecycle across a destination.
//!
//! One orchestrator owns all in-flight jobs: `submit` runs as a
//! short-lived task per submission, a single supervised reconcile loop
//! polls schedulers with per-job backoff, and `startup` re-acquires the
//! scheduler handles of jobs that predate a restart. State transitions
//! for one job are linearised by a per-job lock; `JobStore` writes go
//! through its transactional API.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};

use crate::destination::Destination;
use crate::error::{ConfigError, FsError, RelayError, StoreError};
use crate::filesystem::RemoteHandle;
use crate::job::{Job, JobState, Principal};
use crate::picker::{DestinationPicker, PickContext};
use crate::registry::ApplicationRegistry;
use crate::scheduler::{JobDescription, SchedulerState};
use crate::shutdown::Shutdown;
use crate::staging::{self, StagedInput};
use crate::store::{JobStore, StateUpdate};

/// Poll backoff: starts at 1 s, grows by 1.5 up to 60 s, resets on any
/// observed state change.
const POLL_INITIAL: Duration = Duration::from_secs(1);
const POLL_FACTOR: f64 = 1.5;
const POLL_MAX: Duration = Duration::from_secs(60);

/// Retry ladder for transient staging failures; exceeding it fails the
/// job.
const STAGING_RETRY_DELAYS: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
    Duration::from_secs(40),
    Duration::from_secs(80),
];

/// Consecutive scheduler state errors tolerated before a job is marked
/// unreachable.
const MAX_STATE_ERRORS: u32 = 10;

/// Bound on concurrent scheduler polls.
const MAX_CONCURRENT_POLLS: usize = 32;

/// How long shutdown waits for in-flight staging before aborting it.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const RECONCILE_TICK: Duration = Duration::from_millis(500);

/// Exit code the schedulers record for killed commands.
const CANCELLED_RETURN_CODE: i32 = 130;

/// A submission, normalized by the HTTP boundary.
#[derive(Debug)]
pub struct SubmitRequest {
    pub application: String,
    pub name: String,
    pub principal: Principal,
    /// Non-file inputs, validated against the application schema.
    pub payload: serde_json::Value,
    /// Path of the uploaded zip archive on local disk.
    pub archive: PathBuf,
    /// Opaque bearer token delivered to the job via the meta file.
    pub token: String,
}

#[derive(Debug, Clone)]
struct PollState {
    next_poll: Instant,
    backoff: Duration,
    consecutive_errors: u32,
}

impl PollState {
    fn new() -> Self {
        Self {
            next_poll: Instant::now(),
            backoff: POLL_INITIAL,
            consecutive_errors: 0,
        }
    }

    fn bump(&mut self) {
        self.backoff = Duration::from_secs_f64(
            (self.backoff.as_secs_f64() * POLL_FACTOR).min(POLL_MAX.as_secs_f64()),
        );
        self.next_poll = Instant::now() + self.backoff;
    }

    fn reset(&mut self) {
        self.backoff = POLL_INITIAL;
        self.next_poll = Instant::now() + self.backoff;
        self.consecutive_errors = 0;
    }
}

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    registry: Arc<ApplicationRegistry>,
    destinations: Arc<BTreeMap<String, Destination>>,
    destination_names: Vec<String>,
    picker: Arc<dyn DestinationPicker>,
    job_root: PathBuf,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    polls: Mutex<HashMap<i64, PollState>>,
    poll_limit: Arc<Semaphore>,
    shutdown: Shutdown,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<ApplicationRegistry>,
        destinations: BTreeMap<String, Destination>,
        picker: Arc<dyn DestinationPicker>,
        job_root: PathBuf,
        shutdown: Shutdown,
    ) -> Self {
        let destination_names = destinations.keys().cloned().collect();
        Self {
            store,
            registry,
            destinations: Arc::new(destinations),
            destination_names,
            picker,
            job_root,
            locks: Mutex::new(HashMap::new()),
            polls: Mutex::new(HashMap::new()),
            poll_limit: Arc::new(Semaphore::new(MAX_CONCURRENT_POLLS)),
            shutdown,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn job_root(&self) -> &PathBuf {
        &self.job_root
    }

    async fn job_lock(&self, job_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(job_id).or_default())
    }

    fn destination(&self, name: &str) -> Result<&Destination, ConfigError> {
        self.destinations
            .get(name)
            .ok_or_else(|| ConfigError::UnknownDestination(name.to_string()))
    }

    /// Accept a submission: validate, pick a destination, create the job
    /// row, adopt the staged directory, and drive upload + scheduler
    /// submission in a background task.
    ///
    /// Validation and picker failures leave no job row behind.
    pub async fn submit(self: &Arc<Self>, request: SubmitRequest) -> Result<i64, RelayError> {
        let app = self.registry.application(&request.application)?;
        let command =
            self.registry
                .prepare_command(&request.application, &request.principal, &request.payload)?;
        let staged = StagedInput::unpack(&self.job_root, &request.archive, &app.config).await?;

        let application_names = self.registry.application_names();
        let ctx = PickContext {
            destination_names: &self.destination_names,
            application_names: &application_names,
        };
        let destination_name = self.picker.pick(
            staged.path(),
            &request.application,
            &request.principal,
            &ctx,
        )?;
        if !self.destinations.contains_key(&destination_name) {
            return Err(ConfigError::UnknownDestination(destination_name).into());
        }

        let job_id = self
            .store
            .create_job(
                &request.principal.user_id,
                &request.application,
                &destination_name,
                &request.name,
            )
            .await?;
        let job_dir = staged
            .into_job_dir(&self.job_root, job_id, &request.application, &request.token)
            .await?;

        tracing::info!(
            job_id,
            application = %request.application,
            destination = %destination_name,
            submitter = %request.principal.user_id,
            "job accepted"
        );

        let orchestrator = Arc::clone(self);
        self.shutdown.tracker().spawn(async move {
            orchestrator
                .drive_submission(job_id, command, job_dir, destination_name)
                .await;
        });
        Ok(job_id)
    }

    /// Upload the job directory and hand the job to the scheduler.
    async fn drive_submission(
        self: Arc<Self>,
        job_id: i64,
        command: String,
        job_dir: PathBuf,
        destination_name: String,
    ) {
        let lock = self.job_lock(job_id).await;
        let _guard = lock.lock().await;

        let destination = match self.destination(&destination_name) {
            Ok(destination) => destination,
            Err(e) => {
                self.fail_job(job_id, e.to_string()).await;
                return;
            }
        };

        if let Err(e) = self
            .store
            .set_state(job_id, JobState::StagingOut, StateUpdate::default())
            .await
        {
            // cancelled before we got going
            tracing::warn!(job_id, error = %e, "skipping submission");
            return;
        }

        let handle = match self
            .with_staging_retries(job_id, "upload", || {
                destination.filesystem.upload(&job_dir, job_id)
            })
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_job(job_id, format!("stage-out failed: {e}")).await;
                return;
            }
        };

        let mut description = JobDescription::new(command, job_dir.clone());
        if handle.location.as_str() != job_dir.to_string_lossy().as_ref() {
            description.site_dir = Some(handle.location.clone());
        }

        let internal_id = match destination.scheduler.submit(&description).await {
            Ok(internal_id) => internal_id,
            Err(e) => {
                destination.filesystem.teardown(&handle).await;
                self.fail_job(job_id, format!("submission failed: {e}")).await;
                return;
            }
        };

        match self
            .store
            .set_state(
                job_id,
                JobState::Queued,
                StateUpdate::with_internal_id(internal_id.clone()),
            )
            .await
        {
            Ok(()) => {
                tracing::info!(job_id, internal_id = %internal_id, "job queued");
                self.polls.lock().await.insert(job_id, PollState::new());
            }
            Err(e) => {
                // the job went terminal underneath us (cancel); undo
                tracing::warn!(job_id, error = %e, "job vanished during submission, cancelling");
                let _ = destination.scheduler.cancel(&internal_id).await;
                destination.filesystem.teardown(&handle).await;
            }
        }
    }

    /// Transient-failure retry ladder shared by stage-out and stage-in.
    async fn with_staging_retries<T, F, Fut>(
        &self,
        job_id: i64,
        what: &str,
        mut op: F,
    ) -> Result<T, FsError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, FsError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < STAGING_RETRY_DELAYS.len() => {
                    let delay = STAGING_RETRY_DELAYS[attempt];
                    attempt += 1;
                    tracing::warn!(
                        job_id,
                        what,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "transient staging failure, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One-time pass at process start: recover scheduler handles from
    /// sentinels, fail what cannot be recovered, and resume polling
    /// everything else.
    pub async fn startup(&self) -> Result<(), RelayError> {
        let jobs = self.store.list_non_terminal().await?;
        tracing::info!(count = jobs.len(), "reconciling non-terminal jobs after start");
        for job in jobs {
            self.recover_job(job).await;
        }
        Ok(())
    }

    async fn recover_job(&self, job: Job) {
        let destination = match self.destination(&job.destination) {
            Ok(destination) => destination,
            Err(_) => {
                self.fail_job(job.id, format!("unknown destination {}", job.destination))
                    .await;
                return;
            }
        };
        if destination.scheduler.lives_in_process() {
            // in-process queues did not survive the restart
            self.fail_job(job.id, "lost_to_restart".to_string()).await;
            return;
        }
        if job.internal_id.is_some() {
            self.polls.lock().await.insert(job.id, PollState::new());
            return;
        }
        // no recorded handle; the sentinel tells us whether the scheduler
        // accepted the job before the crash
        let job_dir = staging::job_dir(&self.job_root, job.id);
        match crate::scheduler::read_handle_sentinel(&job_dir).await {
            Some(internal_id) => {
                tracing::info!(job_id = job.id, internal_id = %internal_id, "recovered scheduler handle from sentinel");
                match self
                    .store
                    .set_state(
                        job.id,
                        JobState::Queued,
                        StateUpdate::with_internal_id(internal_id),
                    )
                    .await
                {
                    Ok(()) => {
                        self.polls.lock().await.insert(job.id, PollState::new());
                    }
                    Err(e) => {
                        tracing::error!(job_id = job.id, error = %e, "failed to adopt recovered handle");
                        self.fail_job(job.id, "failed to recover after restart".to_string())
                            .await;
                    }
                }
            }
            None => {
                self.fail_job(job.id, "submission lost at restart".to_string())
                    .await;
            }
        }
    }

    /// The supervised reconcile loop. Returns once shutdown is signalled
    /// and in-flight work has drained (or the drain window expired).
    pub async fn run(self: Arc<Self>) {
        tracing::info!("reconcile loop started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(RECONCILE_TICK) => {
                    if let Err(e) = self.reconcile_tick().await {
                        tracing::error!(error = %e, "reconcile pass failed");
                    }
                }
            }
        }
        tracing::info!("reconcile loop stopping, draining in-flight staging");
        if !self.shutdown.drain(DRAIN_TIMEOUT).await {
            tracing::warn!(
                "in-flight staging did not finish within {}s, aborting",
                DRAIN_TIMEOUT.as_secs()
            );
        }
    }

    /// Poll every non-terminal job whose backoff has elapsed.
    async fn reconcile_tick(self: &Arc<Self>) -> Result<(), RelayError> {
        let jobs = self.store.list_non_terminal().await?;
        let now = Instant::now();
        for job in jobs {
            if job.internal_id.is_none() {
                continue; // still being driven by a submission task
            }
            let due = {
                let mut polls = self.polls.lock().await;
                let entry = polls.entry(job.id).or_insert_with(PollState::new);
                if entry.next_poll <= now {
                    // push the next poll out before spawning so a slow
                    // poll is not scheduled twice
                    entry.bump();
                    true
                } else {
                    false
                }
            };
            if !due {
                continue;
            }
            let orchestrator = Arc::clone(self);
            let permit = Arc::clone(&self.poll_limit)
                .acquire_owned()
                .await
                .expect("poll semaphore never closed");
            self.shutdown.tracker().spawn(async move {
                let _permit = permit;
                orchestrator.poll_job(job).await;
            });
        }
        Ok(())
    }

    /// Query the scheduler for one job and apply whatever transition the
    /// observation implies.
    async fn poll_job(self: Arc<Self>, job: Job) {
        let lock = self.job_lock(job.id).await;
        let _guard = lock.lock().await;

        // state may have moved while we waited for the lock
        let job = match self.store.get_job(job.id).await {
            Ok(job) if !job.state.is_terminal() => job,
            _ => {
                self.polls.lock().await.remove(&job.id);
                return;
            }
        };
        let Some(internal_id) = job.internal_id.clone() else {
            return;
        };
        let destination = match self.destination(&job.destination) {
            Ok(destination) => destination,
            Err(_) => return,
        };

        let observed = match destination.scheduler.state(&internal_id).await {
            Ok(observed) => {
                if let Some(poll) = self.polls.lock().await.get_mut(&job.id) {
                    poll.consecutive_errors = 0;
                }
                observed
            }
            Err(e) => {
                let exhausted = {
                    let mut polls = self.polls.lock().await;
                    let poll = polls.entry(job.id).or_insert_with(PollState::new);
                    poll.consecutive_errors += 1;
                    poll.consecutive_errors > MAX_STATE_ERRORS
                };
                tracing::warn!(job_id = job.id, error = %e, "scheduler state query failed");
                if exhausted {
                    self.fail_job(job.id, "scheduler_unreachable".to_string()).await;
                    self.polls.lock().await.remove(&job.id);
                }
                return;
            }
        };

        match observed {
            SchedulerState::Queued => {}
            SchedulerState::Running => {
                if job.state == JobState::Queued {
                    if let Err(e) = self
                        .store
                        .set_state(job.id, JobState::Running, StateUpdate::default())
                        .await
                    {
                        tracing::error!(job_id = job.id, error = %e, "failed to record running state");
                    } else {
                        tracing::info!(job_id = job.id, "job running");
                        if let Some(poll) = self.polls.lock().await.get_mut(&job.id) {
                            poll.reset();
                        }
                    }
                }
            }
            SchedulerState::Ok | SchedulerState::Error => {
                self.stage_in(&job, observed).await;
                self.polls.lock().await.remove(&job.id);
            }
        }
    }

    /// Bring results back and finish the job in the observed terminal
    /// state.
    async fn stage_in(&self, job: &Job, observed: SchedulerState) {
        let destination = match self.destination(&job.destination) {
            Ok(destination) => destination,
            Err(e) => {
                self.fail_job(job.id, e.to_string()).await;
                return;
            }
        };
        if job.state != JobState::StagingIn {
            if let Err(e) = self
                .store
                .set_state(job.id, JobState::StagingIn, StateUpdate::default())
                .await
            {
                tracing::error!(job_id = job.id, error = %e, "failed to enter staging_in");
                return;
            }
        }

        let job_dir = staging::job_dir(&self.job_root, job.id);
        let handle: RemoteHandle = destination.filesystem.locate(&job_dir, job.id);
        if let Err(e) = self
            .with_staging_retries(job.id, "download", || {
                destination.filesystem.download(&handle, &job_dir)
            })
            .await
        {
            destination.filesystem.teardown(&handle).await;
            self.fail_job(job.id, format!("stage-in failed: {e}")).await;
            return;
        }
        destination.filesystem.teardown(&handle).await;

        let exit_code = staging::read_returncode(&job_dir).await;
        let (final_state, reason) = match observed {
            SchedulerState::Ok => (JobState::Ok, None),
            _ => {
                let reason = match exit_code {
                    Some(CANCELLED_RETURN_CODE) => "cancelled".to_string(),
                    Some(code) => format!("command exited with {code}"),
                    None => "scheduler reported error".to_string(),
                };
                (JobState::Error, Some(reason))
            }
        };
        let update = StateUpdate {
            internal_id: None,
            exit_code,
            reason: reason.clone(),
        };
        match self.store.set_state(job.id, final_state, update).await {
            Ok(()) => {
                tracing::info!(
                    job_id = job.id,
                    state = %final_state,
                    exit_code = ?exit_code,
                    reason = ?reason,
                    "job finished"
                );
            }
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "failed to record terminal state");
            }
        }
    }

    /// Cancel a job. A no-op returning success on terminal jobs; the
    /// terminal state otherwise arrives through normal polling.
    pub async fn cancel(&self, job_id: i64) -> Result<(), RelayError> {
        let job = self.store.get_job(job_id).await?;
        if job.state.is_terminal() {
            return Ok(());
        }
        match &job.internal_id {
            Some(internal_id) => {
                let destination = self.destination(&job.destination)?;
                destination
                    .scheduler
                    .cancel(internal_id)
                    .await
                    .map_err(RelayError::from)?;
                tracing::info!(job_id, "cancellation requested");
            }
            None => {
                // not yet with a scheduler; the submission task observes
                // the terminal state and unwinds
                self.fail_job(job_id, "cancelled".to_string()).await;
            }
        }
        Ok(())
    }

    /// Release remote connections held by every destination.
    pub async fn close_destinations(&self) {
        for destination in self.destinations.values() {
            destination.close().await;
        }
    }

    /// Terminal-error a job, tolerating it having finished meanwhile.
    async fn fail_job(&self, job_id: i64, reason: String) {
        tracing::warn!(job_id, reason = %reason, "job failed");
        match self
            .store
            .set_state(job_id, JobState::Error, StateUpdate::with_reason(reason))
            .await
        {
            Ok(()) => {}
            Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => {
                tracing::error!(job_id, error = %e, "failed to record job failure");
            }
        }
    }
}
