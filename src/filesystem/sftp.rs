//! Remote filesystem over SFTP.
//!
//! Transfers the whole job directory recursively over the destination's
//! pooled SSH connection. Uploads land in a `.part` sibling first and are
//! renamed into place, so the paired scheduler never sees a partial tree.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ssh2::Sftp;
use walkdir::WalkDir;

use super::{FileSystem, RemoteHandle};
use crate::error::FsError;
use crate::ssh::{SshConnectConfig, SshPool};

const COPY_BUF_SIZE: usize = 64 * 1024;

pub struct SftpFs {
    pool: SshPool,
    entry: PathBuf,
}

impl SftpFs {
    pub fn new(ssh_config: SshConnectConfig, entry: PathBuf) -> Self {
        Self {
            pool: SshPool::new(ssh_config),
            entry,
        }
    }

    /// Remote job directory for a given job id.
    fn remote_dir(&self, job_id: i64) -> PathBuf {
        self.entry.join(job_id.to_string())
    }
}

#[async_trait]
impl FileSystem for SftpFs {
    fn locate(&self, _local_dir: &Path, job_id: i64) -> RemoteHandle {
        RemoteHandle::new(self.remote_dir(job_id).to_string_lossy())
    }

    async fn upload(&self, local_dir: &Path, job_id: i64) -> Result<RemoteHandle, FsError> {
        let handle = self.locate(local_dir, job_id);
        let final_dir = self.remote_dir(job_id);
        let part_dir = PathBuf::from(format!("{}.part", final_dir.display()));
        let local_dir = local_dir.to_path_buf();
        self.pool
            .with_session(move |session| {
                let sftp = session
                    .sftp()
                    .map_err(|e| FsError::Transient(format!("sftp open: {e}")))?;
                // leftovers from a crashed previous attempt
                remove_tree(&sftp, &part_dir);
                put_tree(&sftp, &local_dir, &part_dir)?;
                remove_tree(&sftp, &final_dir);
                sftp.rename(&part_dir, &final_dir, None)
                    .map_err(|e| FsError::Transient(format!("sftp rename into place: {e}")))?;
                Ok(())
            })
            .await?;
        Ok(handle)
    }

    async fn download(&self, handle: &RemoteHandle, local_dir: &Path) -> Result<(), FsError> {
        let remote_dir = PathBuf::from(&handle.location);
        let local_dir = local_dir.to_path_buf();
        self.pool
            .with_session(move |session| {
                let sftp = session
                    .sftp()
                    .map_err(|e| FsError::Transient(format!("sftp open: {e}")))?;
                get_tree(&sftp, &remote_dir, &local_dir)
            })
            .await
    }

    async fn teardown(&self, handle: &RemoteHandle) {
        let remote_dir = PathBuf::from(&handle.location);
        let result = self
            .pool
            .with_session(move |session| {
                let sftp = session
                    .sftp()
                    .map_err(|e| FsError::Transient(format!("sftp open: {e}")))?;
                remove_tree(&sftp, &remote_dir);
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(location = %handle.location, error = %e, "sftp teardown failed");
        }
    }

    fn close(&self) {
        self.pool.close();
    }
}

/// Recursively copy a local tree to a remote path.
fn put_tree(sftp: &Sftp, local_root: &Path, remote_root: &Path) -> Result<(), FsError> {
    for entry in WalkDir::new(local_root) {
        let entry = entry.map_err(|e| FsError::Permanent(format!("walk {}: {e}", local_root.display())))?;
        let relative = entry
            .path()
            .strip_prefix(local_root)
            .map_err(|e| FsError::Permanent(format!("path prefix: {e}")))?;
        let remote_path = remote_root.join(relative);
        if entry.file_type().is_dir() {
            if let Err(e) = sftp.mkdir(&remote_path, 0o755) {
                // the root and re-visited directories may already exist
                if sftp.stat(&remote_path).is_err() {
                    return Err(FsError::Transient(format!(
                        "sftp mkdir {}: {e}",
                        remote_path.display()
                    )));
                }
            }
        } else if entry.file_type().is_file() {
            let mut local_file = std::fs::File::open(entry.path()).map_err(FsError::from_io)?;
            let mut remote_file = sftp
                .create(&remote_path)
                .map_err(|e| FsError::Transient(format!("sftp create {}: {e}", remote_path.display())))?;
            copy_stream(&mut local_file, &mut remote_file)?;
        }
    }
    Ok(())
}

/// Recursively copy a remote tree into a local directory. Entries that
/// vanish mid-walk are skipped; the remote side owns its files.
fn get_tree(sftp: &Sftp, remote_root: &Path, local_root: &Path) -> Result<(), FsError> {
    std::fs::create_dir_all(local_root).map_err(FsError::from_io)?;
    let entries = match sftp.readdir(remote_root) {
        Ok(entries) => entries,
        Err(e) => {
            return Err(FsError::Transient(format!(
                "sftp readdir {}: {e}",
                remote_root.display()
            )))
        }
    };
    for (remote_path, stat) in entries {
        let Some(name) = remote_path.file_name() else {
            continue;
        };
        let local_path = local_root.join(name);
        if stat.is_dir() {
            get_tree(sftp, &remote_path, &local_path)?;
        } else if stat.is_file() {
            let mut remote_file = match sftp.open(&remote_path) {
                Ok(file) => file,
                Err(_) => continue,
            };
            let mut local_file = std::fs::File::create(&local_path).map_err(FsError::from_io)?;
            copy_stream(&mut remote_file, &mut local_file)?;
        }
    }
    Ok(())
}

/// Best-effort recursive remote delete.
fn remove_tree(sftp: &Sftp, remote_root: &Path) {
    let Ok(entries) = sftp.readdir(remote_root) else {
        return;
    };
    for (remote_path, stat) in entries {
        if stat.is_dir() {
            remove_tree(sftp, &remote_path);
        } else {
            let _ = sftp.unlink(&remote_path);
        }
    }
    let _ = sftp.rmdir(remote_root);
}

fn copy_stream(reader: &mut impl Read, writer: &mut impl Write) -> Result<(), FsError> {
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| FsError::Transient(format!("transfer read: {e}")))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| FsError::Transient(format!("transfer write: {e}")))?;
    }
    Ok(())
}

impl std::fmt::Debug for SftpFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpFs")
            .field("entry", &self.entry)
            .finish()
    }
}
