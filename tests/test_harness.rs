//! Shared helpers for integration tests: zip archives, configs, a stub
//! scheduler with scriptable states, and an orchestrator builder wired
//! to the in-memory job store.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use jobrelay::config::Config;
use jobrelay::destination::{build_destinations, Destination};
use jobrelay::error::SchedulerError;
use jobrelay::filesystem::local::LocalFs;
use jobrelay::job::{JobState, Principal};
use jobrelay::orchestrator::Orchestrator;
use jobrelay::picker::PickerRegistry;
use jobrelay::registry::ApplicationRegistry;
use jobrelay::scheduler::{
    read_handle_sentinel, write_handle_sentinel, JobDescription, Scheduler, SchedulerState,
};
use jobrelay::shutdown::Shutdown;
use jobrelay::store::{JobStore, MemoryJobStore};

/// Write a zip archive containing the given (name, contents) files.
pub fn make_archive(path: &Path, files: &[(&str, &str)]) {
    let file = std::fs::File::create(path).expect("create archive");
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in files {
        writer.start_file(*name, options).expect("start zip entry");
        writer
            .write_all(contents.as_bytes())
            .expect("write zip entry");
    }
    writer.finish().expect("finish archive");
}

pub fn alice() -> Principal {
    Principal::new("alice", vec!["user".to_string()], "tests")
}

/// Running orchestrator plus the pieces tests poke at.
pub struct TestService {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryJobStore>,
    pub job_root: PathBuf,
    pub shutdown: Shutdown,
    _job_root_guard: tempfile::TempDir,
}

impl TestService {
    /// Build a service from config YAML. `{job_root}` in the YAML is
    /// replaced with a fresh temporary directory.
    pub fn from_yaml(config_yaml: &str) -> Self {
        let job_root_guard = tempfile::tempdir().expect("job root");
        let job_root = job_root_guard.path().to_path_buf();
        let yaml = config_yaml.replace("{job_root}", &job_root.to_string_lossy());
        let mut config: Config = serde_yaml::from_str(&yaml).expect("parse config");
        config.validate().expect("validate config");

        let registry =
            Arc::new(ApplicationRegistry::from_config(&config).expect("build registry"));
        let destinations = build_destinations(&config.destinations).expect("build destinations");
        let picker = PickerRegistry::new()
            .build(&config.destination_picker)
            .expect("build picker");
        let store = Arc::new(MemoryJobStore::new());
        let shutdown = Shutdown::new();
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            registry,
            destinations,
            picker,
            job_root.clone(),
            shutdown.clone(),
        ));
        Self {
            orchestrator,
            store,
            job_root,
            shutdown,
            _job_root_guard: job_root_guard,
        }
    }

    /// Spawn the reconcile loop; it stops when the shutdown token fires.
    pub fn start_reconcile(&self) {
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(orchestrator.run());
    }

    /// Poll the store until the job reaches `expected` or the timeout
    /// expires.
    pub async fn wait_for_state(
        &self,
        job_id: i64,
        expected: JobState,
        timeout: Duration,
    ) -> jobrelay::job::Job {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.store.get_job(job_id).await.expect("job exists");
            if job.state == expected {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} stuck in state {} waiting for {}",
                job_id,
                job.state,
                expected
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn job_dir(&self, job_id: i64) -> PathBuf {
        self.job_root.join(job_id.to_string())
    }

    pub async fn read_job_file(&self, job_id: i64, name: &str) -> String {
        tokio::fs::read_to_string(self.job_dir(job_id).join(name))
            .await
            .unwrap_or_else(|e| panic!("read {name} of job {job_id}: {e}"))
    }
}

impl Drop for TestService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Scheduler stub whose per-job states tests control directly.
#[derive(Default)]
pub struct FakeScheduler {
    pub states: Arc<Mutex<HashMap<String, SchedulerState>>>,
    next_id: Mutex<u64>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_state(&self, internal_id: &str, state: SchedulerState) {
        self.states
            .lock()
            .await
            .insert(internal_id.to_string(), state);
    }
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn submit(&self, description: &JobDescription) -> Result<String, SchedulerError> {
        if let Some(existing) = read_handle_sentinel(&description.job_dir).await {
            return Ok(existing);
        }
        let mut next = self.next_id.lock().await;
        *next += 1;
        let internal_id = format!("fake-{}", *next);
        self.states
            .lock()
            .await
            .insert(internal_id.clone(), SchedulerState::Queued);
        write_handle_sentinel(&description.job_dir, &internal_id).await?;
        Ok(internal_id)
    }

    async fn state(&self, internal_id: &str) -> Result<SchedulerState, SchedulerError> {
        self.states
            .lock()
            .await
            .get(internal_id)
            .copied()
            .ok_or_else(|| SchedulerError::State(format!("unknown job {internal_id}")))
    }

    async fn cancel(&self, internal_id: &str) -> Result<(), SchedulerError> {
        self.states
            .lock()
            .await
            .insert(internal_id.to_string(), SchedulerState::Error);
        Ok(())
    }

    async fn close(&self) {}
}

/// A destination pairing the fake scheduler with the local filesystem.
pub fn fake_destination(name: &str, scheduler: Arc<FakeScheduler>) -> (String, Destination) {
    (
        name.to_string(),
        Destination {
            name: name.to_string(),
            scheduler,
            filesystem: Arc::new(LocalFs),
        },
    )
}

/// Build an orchestrator over hand-made destinations, sharing `store`.
pub fn orchestrator_with_destinations(
    config_yaml: &str,
    job_root: &Path,
    store: Arc<MemoryJobStore>,
    destinations: BTreeMap<String, Destination>,
    shutdown: Shutdown,
) -> Arc<Orchestrator> {
    let mut config: Config = serde_yaml::from_str(
        &config_yaml.replace("{job_root}", &job_root.to_string_lossy()),
    )
    .expect("parse config");
    config.validate().expect("validate config");
    let registry = Arc::new(ApplicationRegistry::from_config(&config).expect("build registry"));
    let picker = PickerRegistry::new()
        .build(&config.destination_picker)
        .expect("build picker");
    Arc::new(Orchestrator::new(
        store as Arc<dyn JobStore>,
        registry,
        destinations,
        picker,
        job_root.to_path_buf(),
        shutdown,
    ))
}
