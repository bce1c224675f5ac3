//! Configuration surface of the service.
//!
//! Parsed from a YAML file into typed structs. Scheduler and filesystem
//! choices per destination are tagged unions; concrete instances are
//! constructed behind the `Scheduler` and `FileSystem` traits at startup.
//!
//! Example:
//!
//! ```yaml
//! job_root_dir: /var/lib/jobrelay/jobs
//! destination_picker: round
//! applications:
//!   wc:
//!     command_template: "wc {{ name|q }}"
//!     upload_needs: [README.md]
//!     input_schema:
//!       type: object
//!       properties:
//!         name: {type: string}
//!       required: [name]
//! destinations:
//!   cluster1:
//!     scheduler:
//!       type: slurm
//!       partition: short
//!       ssh_config: {hostname: headnode}
//!     filesystem:
//!       type: sftp
//!       entry: /scratch/jobs
//!       ssh_config: {hostname: headnode}
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ssh::SshConnectConfig;

/// Environment variable overriding `job_root_dir`.
pub const JOB_ROOT_DIR_ENV: &str = "JOB_ROOT_DIR";

const DEFAULT_INTERACTIVE_TIMEOUT: f64 = 30.0;

/// A named shell-command template with its validation schema, required
/// uploads and access control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub command_template: String,
    /// Filenames that must exist in the uploaded archive.
    #[serde(default)]
    pub upload_needs: Vec<String>,
    /// JSON-Schema (2020-12) object describing the non-file inputs. All
    /// top-level properties must be string, number or boolean typed.
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
    /// Roles allowed to submit. Empty means any authenticated user.
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A short follow-up command run in the directory of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveApplicationConfig {
    pub command_template: String,
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
    /// When set, restricts which submitted-job applications this may run
    /// on.
    #[serde(default)]
    pub job_application: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Wall-clock limit in seconds.
    #[serde(default = "default_interactive_timeout")]
    pub timeout: f64,
}

fn default_interactive_timeout() -> f64 {
    DEFAULT_INTERACTIVE_TIMEOUT
}

/// Scheduler choice for a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SchedulerConfig {
    /// In-process scheduler; jobs do not survive a restart.
    Memory {
        #[serde(default = "default_slots")]
        slots: usize,
    },
    /// Slurm batch cluster, reached locally or over SSH.
    Slurm {
        #[serde(default)]
        ssh_config: Option<SshConnectConfig>,
        #[serde(default)]
        partition: Option<String>,
        /// Limit on total run time, in `sbatch --time` syntax.
        #[serde(default)]
        time: Option<String>,
        /// Extra `#SBATCH` lines appended verbatim to the job script.
        #[serde(default)]
        extra_options: Vec<String>,
    },
    /// Redis-backed queue consumed by external workers.
    Arq {
        #[serde(default = "default_redis_dsn")]
        redis_dsn: String,
        #[serde(default = "default_queue_name")]
        queue: String,
        /// Jobs a single worker may run concurrently.
        #[serde(default = "default_max_jobs")]
        max_jobs: usize,
        /// Maximum job run time in seconds.
        #[serde(default = "default_job_timeout")]
        job_timeout: u64,
    },
    /// DIRAC grid workload management system.
    Dirac {
        storage_element: String,
        /// Path to the X509 proxy certificate used by the dirac tools.
        #[serde(default)]
        proxy: Option<PathBuf>,
        /// Apptainer image to wrap each job command in.
        #[serde(default)]
        apptainer_image: Option<PathBuf>,
    },
}

/// Filesystem choice for a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilesystemConfig {
    /// Jobs run against the service's own filesystem.
    Local,
    /// Remote filesystem reached over SFTP.
    Sftp {
        ssh_config: SshConnectConfig,
        /// Remote directory playing the role of the job root.
        entry: PathBuf,
    },
    /// DIRAC storage element.
    Dirac {
        /// Logical file name prefix under which job files are stored.
        lfn_root: String,
        storage_element: String,
        #[serde(default)]
        proxy: Option<PathBuf>,
    },
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        FilesystemConfig::Local
    }
}

/// A named pairing of one scheduler and one filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub filesystem: FilesystemConfig,
}

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub job_root_dir: PathBuf,
    /// Name of a registered destination picker.
    #[serde(default = "default_picker")]
    pub destination_picker: String,
    pub applications: BTreeMap<String, ApplicationConfig>,
    #[serde(default)]
    pub interactive_applications: BTreeMap<String, InteractiveApplicationConfig>,
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,
}

fn default_picker() -> String {
    "first".to_string()
}

fn default_slots() -> usize {
    1
}

fn default_redis_dsn() -> String {
    "redis://localhost:6379".to_string()
}

fn default_queue_name() -> String {
    "jobrelay:queue".to_string()
}

fn default_max_jobs() -> usize {
    10
}

fn default_job_timeout() -> u64 {
    3600
}

/// Fallback destination set when the config names none: a single-slot
/// in-process scheduler on the local filesystem.
pub fn default_destinations() -> BTreeMap<String, DestinationConfig> {
    let mut map = BTreeMap::new();
    map.insert(
        "local".to_string(),
        DestinationConfig {
            scheduler: SchedulerConfig::Memory { slots: 1 },
            filesystem: FilesystemConfig::Local,
        },
    );
    map
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = serde_yaml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply recognized process environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var(JOB_ROOT_DIR_ENV) {
            if !root.is_empty() {
                self.job_root_dir = PathBuf::from(root);
            }
        }
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.applications.is_empty() {
            return Err(ConfigError::Invalid(
                "config must define at least one application".into(),
            ));
        }
        if !self.job_root_dir.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "job_root_dir must be an absolute path, got {}",
                self.job_root_dir.display()
            )));
        }
        if self.destinations.is_empty() {
            self.destinations = default_destinations();
        }
        for (name, interactive) in &self.interactive_applications {
            if let Some(job_app) = &interactive.job_application {
                if !self.applications.contains_key(job_app) {
                    return Err(ConfigError::Invalid(format!(
                        "interactive application {name} references unknown application {job_app}"
                    )));
                }
            }
            if interactive.timeout <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "interactive application {name} has non-positive timeout"
                )));
            }
        }
        Ok(())
    }
}
