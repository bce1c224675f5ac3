//! Startup reconcile: jobs that predate a restart are re-acquired
//! through their recorded handle or the submit sentinel; in-process
//! scheduler jobs are lost and say so.

mod test_harness;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jobrelay::job::JobState;
use jobrelay::scheduler::SchedulerState;
use jobrelay::shutdown::Shutdown;
use jobrelay::store::{JobStore, MemoryJobStore, StateUpdate};

use test_harness::{fake_destination, orchestrator_with_destinations, FakeScheduler, TestService};

const FAKE_CONFIG: &str = r#"
job_root_dir: "{job_root}"
applications:
  echo:
    command_template: "echo done"
destinations:
  remote:
    scheduler: {type: slurm}
"#;

/// Seed a store row plus on-disk job directory the way a crashed process
/// would have left them.
async fn seed_job(
    store: &MemoryJobStore,
    job_root: &std::path::Path,
    internal_id: Option<&str>,
    sentinel: Option<&str>,
) -> i64 {
    let job_id = store.create_job("alice", "echo", "remote", "").await.unwrap();
    store
        .set_state(job_id, JobState::StagingOut, StateUpdate::default())
        .await
        .unwrap();
    if let Some(internal_id) = internal_id {
        store
            .set_state(
                job_id,
                JobState::Queued,
                StateUpdate::with_internal_id(internal_id),
            )
            .await
            .unwrap();
    }
    let job_dir = job_root.join(job_id.to_string());
    std::fs::create_dir_all(job_dir.join("input")).unwrap();
    std::fs::create_dir_all(job_dir.join("output")).unwrap();
    if let Some(sentinel) = sentinel {
        std::fs::write(job_dir.join(".scheduler_handle"), sentinel).unwrap();
    }
    job_id
}

#[tokio::test]
async fn resumes_polling_jobs_with_recorded_handles() {
    let root_guard = tempfile::tempdir().unwrap();
    let job_root = root_guard.path().to_path_buf();
    let store = Arc::new(MemoryJobStore::new());
    let job_id = seed_job(&store, &job_root, Some("fake-1"), Some("fake-1")).await;
    std::fs::write(job_root.join(job_id.to_string()).join("returncode"), "0").unwrap();

    let scheduler = Arc::new(FakeScheduler::new());
    scheduler.set_state("fake-1", SchedulerState::Running).await;
    let mut destinations = BTreeMap::new();
    let (name, destination) = fake_destination("remote", Arc::clone(&scheduler));
    destinations.insert(name, destination);

    let shutdown = Shutdown::new();
    let orchestrator = orchestrator_with_destinations(
        FAKE_CONFIG,
        &job_root,
        Arc::clone(&store),
        destinations,
        shutdown.clone(),
    );
    orchestrator.startup().await.unwrap();
    assert_eq!(store.list_non_terminal().await.unwrap().len(), 1);
    tokio::spawn(Arc::clone(&orchestrator).run());

    // within one poll interval the job matches the scheduler's view
    wait_for(&store, job_id, JobState::Running, Duration::from_secs(5)).await;

    scheduler.set_state("fake-1", SchedulerState::Ok).await;
    let job = wait_for(&store, job_id, JobState::Ok, Duration::from_secs(10)).await;
    assert_eq!(job.exit_code, Some(0));
    shutdown.cancel();
}

#[tokio::test]
async fn recovers_scheduler_handle_from_sentinel() {
    let root_guard = tempfile::tempdir().unwrap();
    let job_root = root_guard.path().to_path_buf();
    let store = Arc::new(MemoryJobStore::new());
    // crashed after Scheduler::submit wrote the sentinel but before the
    // store recorded the handle
    let job_id = seed_job(&store, &job_root, None, Some("fake-9")).await;
    std::fs::write(job_root.join(job_id.to_string()).join("returncode"), "0").unwrap();

    let scheduler = Arc::new(FakeScheduler::new());
    scheduler.set_state("fake-9", SchedulerState::Ok).await;
    let mut destinations = BTreeMap::new();
    let (name, destination) = fake_destination("remote", Arc::clone(&scheduler));
    destinations.insert(name, destination);

    let shutdown = Shutdown::new();
    let orchestrator = orchestrator_with_destinations(
        FAKE_CONFIG,
        &job_root,
        Arc::clone(&store),
        destinations,
        shutdown.clone(),
    );
    orchestrator.startup().await.unwrap();

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.internal_id.as_deref(), Some("fake-9"));

    tokio::spawn(Arc::clone(&orchestrator).run());
    wait_for(&store, job_id, JobState::Ok, Duration::from_secs(10)).await;
    shutdown.cancel();
}

#[tokio::test]
async fn fails_jobs_whose_submission_was_lost() {
    let root_guard = tempfile::tempdir().unwrap();
    let job_root = root_guard.path().to_path_buf();
    let store = Arc::new(MemoryJobStore::new());
    // crashed before the scheduler accepted anything: no sentinel
    let job_id = seed_job(&store, &job_root, None, None).await;

    let mut destinations = BTreeMap::new();
    let (name, destination) = fake_destination("remote", Arc::new(FakeScheduler::new()));
    destinations.insert(name, destination);

    let shutdown = Shutdown::new();
    let orchestrator = orchestrator_with_destinations(
        FAKE_CONFIG,
        &job_root,
        Arc::clone(&store),
        destinations,
        shutdown,
    );
    orchestrator.startup().await.unwrap();

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Error);
    assert_eq!(job.reason.as_deref(), Some("submission lost at restart"));
}

const MEMORY_CONFIG: &str = r#"
job_root_dir: "{job_root}"
applications:
  echo:
    command_template: "echo done"
destinations:
  local:
    scheduler: {type: memory, slots: 1}
"#;

#[tokio::test]
async fn memory_scheduled_jobs_are_lost_to_restart() {
    let service = TestService::from_yaml(MEMORY_CONFIG);
    // a queued row from a previous process; its scheduler state is gone
    let job_id = service
        .store
        .create_job("alice", "echo", "local", "")
        .await
        .unwrap();
    service
        .store
        .set_state(job_id, JobState::StagingOut, StateUpdate::default())
        .await
        .unwrap();
    service
        .store
        .set_state(
            job_id,
            JobState::Queued,
            StateUpdate::with_internal_id("dead-beef"),
        )
        .await
        .unwrap();

    service.orchestrator.startup().await.unwrap();
    let job = service.store.get_job(job_id).await.unwrap();
    assert_eq!(job.state, JobState::Error);
    assert_eq!(job.reason.as_deref(), Some("lost_to_restart"));
}

async fn wait_for(
    store: &MemoryJobStore,
    job_id: i64,
    expected: JobState,
    timeout: Duration,
) -> jobrelay::job::Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = store.get_job(job_id).await.unwrap();
        if job.state == expected {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            job_id,
            job.state,
            expected
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
