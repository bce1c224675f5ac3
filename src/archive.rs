//! Zip packing and unpacking helpers shared by upload staging and the
//! grid filesystem.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::FsError;

/// Unpack a zip archive into a directory on the blocking pool.
///
/// `ZipArchive::extract` sanitises entry names, so hostile archives
/// cannot escape the target directory.
pub async fn unpack_zip(archive_path: &Path, target_dir: &Path) -> Result<(), FsError> {
    let archive_path = archive_path.to_path_buf();
    let target_dir = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&archive_path).map_err(FsError::from_io)?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| FsError::Permanent(format!("not a zip archive: {e}")))?;
        archive
            .extract(&target_dir)
            .map_err(|e| FsError::Permanent(format!("failed to unpack archive: {e}")))
    })
    .await
    .map_err(|e| FsError::Permanent(format!("unpack task panicked: {e}")))?
}

/// Pack a directory tree into a zip archive on the blocking pool,
/// skipping the given top-level names.
pub async fn pack_zip(
    source_dir: &Path,
    archive_path: &Path,
    skip_names: &[&str],
) -> Result<(), FsError> {
    let source_dir = source_dir.to_path_buf();
    let archive_path = archive_path.to_path_buf();
    let skip: Vec<String> = skip_names.iter().map(|s| s.to_string()).collect();
    tokio::task::spawn_blocking(move || pack_zip_blocking(&source_dir, &archive_path, &skip))
        .await
        .map_err(|e| FsError::Permanent(format!("pack task panicked: {e}")))?
}

fn pack_zip_blocking(
    source_dir: &Path,
    archive_path: &Path,
    skip: &[String],
) -> Result<(), FsError> {
    let file = std::fs::File::create(archive_path).map_err(FsError::from_io)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    for entry in WalkDir::new(source_dir).min_depth(1) {
        let entry =
            entry.map_err(|e| FsError::Permanent(format!("walk {}: {e}", source_dir.display())))?;
        let relative: PathBuf = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| FsError::Permanent(format!("path prefix: {e}")))?
            .to_path_buf();
        let first = relative
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .unwrap_or_default();
        if skip.iter().any(|s| *s == first) {
            continue;
        }
        let name = relative.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            writer
                .add_directory(format!("{name}/"), options)
                .map_err(|e| FsError::Permanent(format!("zip add dir: {e}")))?;
        } else if entry.file_type().is_file() {
            writer
                .start_file(name, options)
                .map_err(|e| FsError::Permanent(format!("zip start file: {e}")))?;
            let mut source = std::fs::File::open(entry.path()).map_err(FsError::from_io)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = source.read(&mut buf).map_err(FsError::from_io)?;
                if n == 0 {
                    break;
                }
                writer
                    .write_all(&buf[..n])
                    .map_err(|e| FsError::Permanent(format!("zip write: {e}")))?;
            }
        }
    }
    writer
        .finish()
        .map_err(|e| FsError::Permanent(format!("zip finish: {e}")))?;
    Ok(())
}
