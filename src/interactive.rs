//! Interactive applications: short follow-up commands executed in the
//! local directory of a completed job.
//!
//! The command renders from the interactive application's template and a
//! schema-validated JSON body, runs with a wall-clock timeout and capped
//! output streams, and whatever it writes into the job directory becomes
//! part of the job's artifacts. Properties declaring
//! `contentEncoding: base64` are decoded to temporary files whose paths
//! are substituted into the template; the files live exactly as long as
//! the command.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use base64::Engine as _;
use serde::Serialize;
use tokio::io::AsyncReadExt;

use crate::error::InteractiveError;
use crate::job::{Job, JobState};
use crate::registry::InteractiveApplication;
use crate::staging;
use crate::template::TemplateEngine;

/// Cap on each captured stream.
const OUTPUT_CAP: usize = 1024 * 1024;

/// Captured outcome of an interactive run. A non-zero return code is a
/// result, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct InteractiveResult {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run an interactive application against a completed job.
pub async fn run(
    job: &Job,
    app: &InteractiveApplication,
    payload: &serde_json::Value,
    engine: &TemplateEngine,
    job_root: &Path,
) -> Result<InteractiveResult, InteractiveError> {
    if job.state != JobState::Ok {
        return Err(InteractiveError::NotCompleted {
            job_id: job.id,
            state: job.state,
        });
    }
    if let Some(expected) = &app.config.job_application {
        if *expected != job.application {
            return Err(InteractiveError::WrongApplication {
                app: app.name.clone(),
                expected: expected.clone(),
            });
        }
    }
    let job_dir = staging::job_dir(job_root, job.id);
    if !job_dir.is_dir() {
        // the job may have lived only remotely and never staged back
        return Err(InteractiveError::MissingJobDir(job.id));
    }

    let mut params = app
        .validated_params(payload)
        .map_err(|e| InteractiveError::InvalidPayload(e.to_string()))?;

    // decoded media files live in this directory for the duration of the
    // command, then vanish with it
    let media_dir = tempfile::tempdir()?;
    for prop in app.base64_properties() {
        let Some(encoded) = payload.get(&prop).and_then(|v| v.as_str()) else {
            continue;
        };
        if encoded.is_empty() {
            continue;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| {
                InteractiveError::InvalidPayload(format!("property {prop} is not valid base64: {e}"))
            })?;
        let file_path = media_dir.path().join(&prop);
        tokio::fs::write(&file_path, decoded).await?;
        params.insert(
            prop,
            serde_json::Value::String(file_path.to_string_lossy().into_owned()),
        );
    }

    let command = engine
        .render(&app.config.command_template, &params)
        .map_err(|e| InteractiveError::InvalidPayload(format!("command rendering failed: {e}")))?;

    tracing::info!(
        job_id = job.id,
        application = %app.name,
        command = %command,
        "running interactive application"
    );
    shell(&job_dir, &command, app.config.timeout).await
}

/// Execute a shell command in the job directory with a timeout and
/// output caps.
async fn shell(
    job_dir: &Path,
    command: &str,
    timeout_secs: f64,
) -> Result<InteractiveResult, InteractiveError> {
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(job_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_reader = tokio::spawn(read_capped(stdout_pipe));
    let stderr_reader = tokio::spawn(read_capped(stderr_pipe));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = tokio::time::sleep(Duration::from_secs_f64(timeout_secs)) => {
            let _ = child.kill().await;
            return Err(InteractiveError::Timeout(timeout_secs));
        }
    };

    let (stdout, stdout_overflow) = stdout_reader
        .await
        .map_err(|e| InteractiveError::InvalidPayload(format!("reader task panicked: {e}")))??;
    let (stderr, stderr_overflow) = stderr_reader
        .await
        .map_err(|e| InteractiveError::InvalidPayload(format!("reader task panicked: {e}")))??;
    if stdout_overflow || stderr_overflow {
        return Err(InteractiveError::OutputCapExceeded(OUTPUT_CAP));
    }

    Ok(InteractiveResult {
        returncode: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
    })
}

/// Read a stream up to the cap. The boolean reports whether the stream
/// had more to give.
async fn read_capped(
    pipe: Option<impl tokio::io::AsyncRead + Unpin>,
) -> Result<(Vec<u8>, bool), std::io::Error> {
    let Some(mut pipe) = pipe else {
        return Ok((Vec::new(), false));
    };
    let mut collected = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            return Ok((collected, false));
        }
        if collected.len() + n > OUTPUT_CAP {
            let keep = OUTPUT_CAP - collected.len();
            collected.extend_from_slice(&buf[..keep]);
            // drain the rest so the child is not blocked on a full pipe
            while pipe.read(&mut buf).await? != 0 {}
            return Ok((collected, true));
        }
        collected.extend_from_slice(&buf[..n]);
    }
}
