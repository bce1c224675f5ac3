//! A destination pairs one scheduler with one filesystem under a name.
//! The orchestrator depends only on the two capability traits.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{DestinationConfig, FilesystemConfig, SchedulerConfig};
use crate::error::ConfigError;
use crate::filesystem::grid::GridFs;
use crate::filesystem::local::LocalFs;
use crate::filesystem::sftp::SftpFs;
use crate::filesystem::FileSystem;
use crate::scheduler::grid::GridScheduler;
use crate::scheduler::memory::MemoryScheduler;
use crate::scheduler::queue::QueueScheduler;
use crate::scheduler::slurm::SlurmScheduler;
use crate::scheduler::Scheduler;

pub struct Destination {
    pub name: String,
    pub scheduler: Arc<dyn Scheduler>,
    pub filesystem: Arc<dyn FileSystem>,
}

impl Destination {
    /// Release remote connections held by either half.
    pub async fn close(&self) {
        self.scheduler.close().await;
        self.filesystem.close();
    }
}

/// Construct all configured destinations.
pub fn build_destinations(
    configs: &BTreeMap<String, DestinationConfig>,
) -> Result<BTreeMap<String, Destination>, ConfigError> {
    let mut destinations = BTreeMap::new();
    for (name, config) in configs {
        destinations.insert(name.clone(), build_destination(name, config)?);
    }
    Ok(destinations)
}

fn build_destination(name: &str, config: &DestinationConfig) -> Result<Destination, ConfigError> {
    let scheduler: Arc<dyn Scheduler> = match &config.scheduler {
        SchedulerConfig::Memory { slots } => Arc::new(MemoryScheduler::new(*slots)),
        SchedulerConfig::Slurm {
            ssh_config,
            partition,
            time,
            extra_options,
        } => Arc::new(SlurmScheduler::new(
            ssh_config.clone(),
            partition.clone(),
            time.clone(),
            extra_options.clone(),
        )),
        SchedulerConfig::Arq {
            redis_dsn,
            queue,
            max_jobs,
            job_timeout,
        } => Arc::new(QueueScheduler::new(
            redis_dsn.clone(),
            queue.clone(),
            *max_jobs,
            *job_timeout,
        )),
        SchedulerConfig::Dirac {
            storage_element,
            proxy,
            apptainer_image,
        } => Arc::new(GridScheduler::new(
            storage_element.clone(),
            proxy.clone(),
            apptainer_image.clone(),
        )),
    };

    let filesystem: Arc<dyn FileSystem> = match &config.filesystem {
        FilesystemConfig::Local => Arc::new(LocalFs),
        FilesystemConfig::Sftp { ssh_config, entry } => {
            Arc::new(SftpFs::new(ssh_config.clone(), entry.clone()))
        }
        FilesystemConfig::Dirac {
            lfn_root,
            storage_element,
            proxy,
        } => Arc::new(GridFs::new(
            lfn_root.clone(),
            storage_element.clone(),
            proxy.clone(),
        )),
    };

    // an in-process scheduler cannot execute against a directory that
    // only exists on a remote filesystem
    if matches!(config.scheduler, SchedulerConfig::Memory { .. })
        && !matches!(config.filesystem, FilesystemConfig::Local)
    {
        return Err(ConfigError::Invalid(format!(
            "destination {name}: memory scheduler requires the local filesystem"
        )));
    }

    Ok(Destination {
        name: name.to_string(),
        scheduler,
        filesystem,
    })
}
