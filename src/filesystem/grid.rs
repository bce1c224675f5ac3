//! DIRAC storage element filesystem, driven through the `dirac-dms-*`
//! command-line tools.
//!
//! Job directories travel as zip archives: the grid data layer flattens
//! nested paths when files are registered one by one, so the whole tree
//! is packed on this side and unpacked on the other. Stage-in restores
//! nested output paths (`output/result.txt` stays `output/result.txt`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{FileSystem, RemoteHandle};
use crate::archive::{pack_zip, unpack_zip};
use crate::error::FsError;
use crate::runner::CommandRunner;

/// Archive carrying the job directory to the grid node.
pub const INPUT_ARCHIVE: &str = "input.zip";
/// Archive carrying results back, produced by the job wrapper.
pub const OUTPUT_ARCHIVE: &str = "output.zip";

pub struct GridFs {
    lfn_root: String,
    storage_element: String,
    proxy: Option<PathBuf>,
    runner: CommandRunner,
}

impl GridFs {
    pub fn new(lfn_root: String, storage_element: String, proxy: Option<PathBuf>) -> Self {
        Self {
            lfn_root: lfn_root.trim_end_matches('/').to_string(),
            storage_element,
            proxy,
            runner: CommandRunner::Local,
        }
    }

    fn lfn_dir(&self, job_id: i64) -> String {
        format!("{}/{}", self.lfn_root, job_id)
    }

    async fn dirac(
        &self,
        tool: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<(i32, String, String), FsError> {
        let output = match &self.proxy {
            Some(proxy) => {
                let env_arg = format!("X509_USER_PROXY={}", proxy.display());
                let mut full: Vec<&str> = vec![env_arg.as_str(), tool];
                full.extend_from_slice(args);
                self.runner.run("env", &full, None, cwd).await?
            }
            None => self.runner.run(tool, args, None, cwd).await?,
        };
        Ok((output.status, output.stdout, output.stderr))
    }
}

#[async_trait]
impl FileSystem for GridFs {
    fn locate(&self, _local_dir: &Path, job_id: i64) -> RemoteHandle {
        RemoteHandle::new(self.lfn_dir(job_id))
    }

    async fn upload(&self, local_dir: &Path, job_id: i64) -> Result<RemoteHandle, FsError> {
        let lfn_dir = self.lfn_dir(job_id);
        let archive = std::env::temp_dir().join(format!("jobrelay-{job_id}-{INPUT_ARCHIVE}"));
        pack_zip(local_dir, &archive, &[INPUT_ARCHIVE, OUTPUT_ARCHIVE]).await?;

        let lfn = format!("{lfn_dir}/{INPUT_ARCHIVE}");
        let archive_str = archive.to_string_lossy().into_owned();
        let (status, _stdout, stderr) = self
            .dirac(
                "dirac-dms-add-file",
                &[&lfn, &archive_str, &self.storage_element],
                None,
            )
            .await?;
        let _ = tokio::fs::remove_file(&archive).await;
        if status != 0 {
            return Err(classify_dirac_failure(&stderr));
        }
        Ok(RemoteHandle::new(lfn_dir))
    }

    async fn download(&self, handle: &RemoteHandle, local_dir: &Path) -> Result<(), FsError> {
        let lfn = format!("{}/{OUTPUT_ARCHIVE}", handle.location);
        let scratch = tempfile::tempdir().map_err(FsError::from_io)?;
        let (status, _stdout, stderr) = self
            .dirac("dirac-dms-get-file", &[&lfn], Some(scratch.path()))
            .await?;
        if status != 0 {
            if stderr.contains("No such file") || stderr.contains("not found") {
                // the job produced no output archive; not an error
                tracing::warn!(lfn = %lfn, "no output archive on grid storage");
                return Ok(());
            }
            return Err(classify_dirac_failure(&stderr));
        }
        let archive = scratch.path().join(OUTPUT_ARCHIVE);
        unpack_zip(&archive, local_dir).await
    }

    async fn teardown(&self, handle: &RemoteHandle) {
        for name in [INPUT_ARCHIVE, OUTPUT_ARCHIVE] {
            let lfn = format!("{}/{name}", handle.location);
            match self.dirac("dirac-dms-remove-files", &[&lfn], None).await {
                Ok((0, _, _)) => {}
                Ok((status, _, stderr)) => {
                    tracing::warn!(lfn = %lfn, status, stderr = %stderr.trim(), "grid teardown failed");
                }
                Err(e) => {
                    tracing::warn!(lfn = %lfn, error = %e, "grid teardown failed");
                }
            }
        }
    }
}

/// Proxy and permission problems will not get better by retrying.
fn classify_dirac_failure(stderr: &str) -> FsError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("proxy") || lowered.contains("permission") || lowered.contains("credential")
    {
        FsError::Permanent(format!("grid authentication failure: {}", stderr.trim()))
    } else {
        FsError::Transient(format!("grid transfer failure: {}", stderr.trim()))
    }
}

impl std::fmt::Debug for GridFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridFs")
            .field("lfn_root", &self.lfn_root)
            .field("storage_element", &self.storage_element)
            .finish()
    }
}
