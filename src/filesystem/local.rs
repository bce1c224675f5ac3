//! Local filesystem: the execution site shares the service's disk, so
//! staging is a no-op.

use std::path::Path;

use async_trait::async_trait;

use super::{FileSystem, RemoteHandle};
use crate::error::FsError;

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

#[async_trait]
impl FileSystem for LocalFs {
    fn locate(&self, local_dir: &Path, _job_id: i64) -> RemoteHandle {
        RemoteHandle::new(local_dir.to_string_lossy())
    }

    async fn upload(&self, local_dir: &Path, job_id: i64) -> Result<RemoteHandle, FsError> {
        Ok(self.locate(local_dir, job_id))
    }

    async fn download(&self, _handle: &RemoteHandle, _local_dir: &Path) -> Result<(), FsError> {
        Ok(())
    }

    async fn teardown(&self, _handle: &RemoteHandle) {}
}
