//! Assembly of the local job directory.
//!
//! Layout under the configured job root:
//!
//! ```text
//! <job_root>/<job_id>/
//!   input/            uploaded archive contents
//!   output/           produced by the command, staged back on completion
//!   meta              opaque token file; last line is the bearer token
//!   stdout.txt, stderr.txt, returncode
//!   .scheduler_handle submit idempotency sentinel
//! ```
//!
//! Archives are unpacked and validated against `upload_needs` in a
//! scratch directory first; nothing is recorded for submissions that
//! fail validation.

use std::path::{Path, PathBuf};

use crate::archive::unpack_zip;
use crate::config::ApplicationConfig;
use crate::error::{FsError, ValidationError};

pub const INPUT_DIR: &str = "input";
pub const OUTPUT_DIR: &str = "output";
pub const META_FILE: &str = "meta";

/// A validated, not yet adopted job directory. Lives in a scratch
/// location until a job id exists, then moves under the job root.
#[derive(Debug)]
pub struct StagedInput {
    scratch: tempfile::TempDir,
}

impl StagedInput {
    /// Unpack the uploaded archive into a scratch directory and verify
    /// the files the application requires are present.
    pub async fn unpack(
        job_root: &Path,
        archive_path: &Path,
        application: &ApplicationConfig,
    ) -> Result<Self, ValidationError> {
        let scratch = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(job_root)
            .map_err(|e| ValidationError::UnsupportedArchive(format!("staging dir: {e}")))?;
        let input_dir = scratch.path().join(INPUT_DIR);
        tokio::fs::create_dir(&input_dir)
            .await
            .map_err(|e| ValidationError::UnsupportedArchive(format!("staging dir: {e}")))?;
        unpack_zip(archive_path, &input_dir)
            .await
            .map_err(|e| ValidationError::UnsupportedArchive(e.to_string()))?;
        check_upload_needs(application, &input_dir)?;
        Ok(Self { scratch })
    }

    /// The scratch directory holding the unpacked input.
    pub fn path(&self) -> &Path {
        self.scratch.path()
    }

    /// Adopt the staged input as the directory of job `job_id`, creating
    /// the output directory and the meta token file.
    pub async fn into_job_dir(
        self,
        job_root: &Path,
        job_id: i64,
        application_name: &str,
        token: &str,
    ) -> Result<PathBuf, FsError> {
        let job_dir = job_root.join(job_id.to_string());
        let scratch = self.scratch.into_path();
        tokio::fs::rename(&scratch, &job_dir)
            .await
            .map_err(FsError::from_io)?;
        tokio::fs::create_dir_all(job_dir.join(OUTPUT_DIR))
            .await
            .map_err(FsError::from_io)?;
        let meta = format!("job_id: {job_id}\napplication: {application_name}\n{token}\n");
        tokio::fs::write(job_dir.join(META_FILE), meta)
            .await
            .map_err(FsError::from_io)?;
        Ok(job_dir)
    }
}

/// Check that every file the application requires exists in the unpacked
/// archive.
pub fn check_upload_needs(
    application: &ApplicationConfig,
    input_dir: &Path,
) -> Result<(), ValidationError> {
    let missing: Vec<String> = application
        .upload_needs
        .iter()
        .filter(|needed| !input_dir.join(needed).is_file())
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::MissingUpload(missing))
    }
}

/// Local job directory for a job id.
pub fn job_dir(job_root: &Path, job_id: i64) -> PathBuf {
    job_root.join(job_id.to_string())
}

/// Read the `returncode` file a finished job left behind.
pub async fn read_returncode(job_dir: &Path) -> Option<i32> {
    match tokio::fs::read_to_string(job_dir.join("returncode")).await {
        Ok(contents) => contents.trim().parse().ok(),
        Err(_) => None,
    }
}
