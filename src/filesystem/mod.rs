//! Filesystem abstraction for staging job directories to and from the
//! execution site.
//!
//! Uploads must be atomic from the paired scheduler's viewpoint: a
//! scheduler never observes a partially transferred directory. Remote
//! back-ends achieve this by staging to a sibling path and renaming, or
//! by uploading into a per-job location that is only polled after the
//! upload returned success.

pub mod grid;
pub mod local;
pub mod sftp;

use std::path::Path;

use async_trait::async_trait;

use crate::error::FsError;

/// Where a job directory ended up at the execution site. Opaque outside
/// the filesystem that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHandle {
    pub location: String,
}

impl RemoteHandle {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }
}

impl std::fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.location)
    }
}

/// Contract every filesystem back-end implements.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Where `local_dir` lives (or will live) at the execution site.
    /// Pure; used to rebuild handles for jobs that predate a restart.
    fn locate(&self, local_dir: &Path, job_id: i64) -> RemoteHandle;

    /// Make `local_dir` visible at the execution site and return where it
    /// landed.
    async fn upload(&self, local_dir: &Path, job_id: i64) -> Result<RemoteHandle, FsError>;

    /// Bring results back into `local_dir`. Partial remote trees are
    /// tolerated; missing optional output files are not errors.
    async fn download(&self, handle: &RemoteHandle, local_dir: &Path) -> Result<(), FsError>;

    /// Best-effort cleanup of the remote side. Failures are logged, never
    /// propagated.
    async fn teardown(&self, handle: &RemoteHandle);

    /// Release pooled connections.
    fn close(&self) {}
}
