use std::path::PathBuf;

use thiserror::Error;

/// Raised at startup or admin-time for malformed configuration.
///
/// In a well-configured deployment this never surfaces during a user
/// request.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("application {application}: invalid input schema: {reason}")]
    InvalidSchema { application: String, reason: String },

    #[error("application {application}: template substitutes {variable} without the q filter")]
    UnquotedSubstitution {
        application: String,
        variable: String,
    },

    #[error("application {application}: template error: {reason}")]
    BadTemplate { application: String, reason: String },

    #[error("picker returned unknown destination {0}")]
    UnknownDestination(String),

    #[error("unknown destination picker {0}")]
    UnknownPicker(String),
}

/// Rejected user input. Propagated to the HTTP boundary as 4xx; no job row
/// is created when submission fails with one of these.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("application requires files {0:?} which were not found in the uploaded archive")]
    MissingUpload(Vec<String>),

    #[error("input does not match application schema: {0}")]
    InvalidPayload(String),

    #[error("user is not allowed to submit to application {0}")]
    RoleDenied(String),

    #[error("unknown application {0}")]
    UnknownApplication(String),

    #[error("unsupported archive content: {0}")]
    UnsupportedArchive(String),
}

/// Filesystem failures, split by whether the orchestrator should retry.
///
/// Authentication failures against a remote are always permanent.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("transient filesystem error: {0}")]
    Transient(String),

    #[error("permanent filesystem error: {0}")]
    Permanent(String),
}

impl FsError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FsError::Transient(_))
    }

    /// Classify a local I/O error. Interrupted and timed-out operations are
    /// worth retrying; everything else is permanent.
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                FsError::Transient(err.to_string())
            }
            _ => FsError::Permanent(err.to_string()),
        }
    }
}

/// Scheduler failures.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("job submission failed: {0}")]
    Submit(String),

    #[error("failed to query job state: {0}")]
    State(String),
}

/// Job store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(i64),

    #[error("invalid state transition {from} -> {to} for job {job_id}")]
    InvalidTransition {
        job_id: i64,
        from: crate::job::JobState,
        to: crate::job::JobState,
    },

    #[error("store error: {0}")]
    Internal(String),
}

/// Failures of the interactive runner.
///
/// A non-zero return code is not an error at this level; the captured
/// streams and return code are handed back as a normal result.
#[derive(Error, Debug)]
pub enum InteractiveError {
    #[error("command did not finish within {0} seconds")]
    Timeout(f64),

    #[error("command output exceeded the {0} byte cap")]
    OutputCapExceeded(usize),

    #[error("job {0} has no local directory; its files were never staged back")]
    MissingJobDir(i64),

    #[error("job {job_id} is in state {state}, interactive applications require ok")]
    NotCompleted {
        job_id: i64,
        state: crate::job::JobState,
    },

    #[error("interactive application {app} only runs on jobs of application {expected}")]
    WrongApplication { app: String, expected: String },

    #[error("unknown interactive application {0}")]
    UnknownApplication(String),

    #[error("input does not match schema: {0}")]
    InvalidPayload(String),

    #[error("failed to run command: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error for the service core.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Interactive(#[from] InteractiveError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
