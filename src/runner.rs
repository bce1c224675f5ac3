//! Running external commands, locally or over SSH.
//!
//! The slurm and grid back-ends drive their command-line tools
//! (`sbatch`, `sacct`, `dirac-wms-job-submit`, ...) through this runner so
//! they do not care where those tools live.

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::FsError;
use crate::ssh::SshPool;

/// Exit status plus captured streams of a finished command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command on the local host or on a remote one over a pooled SSH
/// connection.
#[derive(Debug, Clone)]
pub enum CommandRunner {
    Local,
    Ssh(SshPool),
}

impl CommandRunner {
    /// Execute `command` with `args`, optionally feeding `stdin` and
    /// changing into `cwd` first.
    ///
    /// Arguments are shell-quoted when the command line is assembled for
    /// the remote shell.
    pub async fn run(
        &self,
        command: &str,
        args: &[&str],
        stdin: Option<&str>,
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, FsError> {
        match self {
            CommandRunner::Local => run_local(command, args, stdin, cwd).await,
            CommandRunner::Ssh(pool) => {
                let line = remote_command_line(command, args, cwd);
                let (status, stdout, stderr) =
                    pool.run(line, stdin.map(|s| s.to_string())).await?;
                Ok(CommandOutput {
                    status,
                    stdout,
                    stderr,
                })
            }
        }
    }

    pub fn close(&self) {
        if let CommandRunner::Ssh(pool) = self {
            pool.close();
        }
    }
}

async fn run_local(
    command: &str,
    args: &[&str],
    stdin: Option<&str>,
    cwd: Option<&Path>,
) -> Result<CommandOutput, FsError> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let mut child = cmd
        .spawn()
        .map_err(|e| FsError::Permanent(format!("failed to spawn {command}: {e}")))?;
    if let Some(input) = stdin {
        let mut handle = child
            .stdin
            .take()
            .ok_or_else(|| FsError::Permanent("child stdin was not captured".into()))?;
        handle
            .write_all(input.as_bytes())
            .await
            .map_err(FsError::from_io)?;
        drop(handle);
    }
    let output = child.wait_with_output().await.map_err(FsError::from_io)?;
    Ok(CommandOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn remote_command_line(command: &str, args: &[&str], cwd: Option<&Path>) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(args.len() + 1);
    parts.push(command.to_string());
    for arg in args {
        parts.push(
            shlex::try_quote(arg)
                .map(|q| q.into_owned())
                .unwrap_or_else(|_| format!("'{}'", arg.replace('\'', ""))),
        );
    }
    let line = parts.join(" ");
    match cwd {
        Some(dir) => {
            let quoted_dir = shlex::try_quote(&dir.to_string_lossy())
                .map(|q| q.into_owned())
                .unwrap_or_else(|_| dir.to_string_lossy().into_owned());
            format!("cd {quoted_dir} && {line}")
        }
        None => line,
    }
}

/// Derive a runner from an optional SSH config: remote when present,
/// local otherwise.
pub fn runner_for(ssh_config: Option<&crate::ssh::SshConnectConfig>) -> CommandRunner {
    match ssh_config {
        Some(config) => CommandRunner::Ssh(SshPool::new(config.clone())),
        None => CommandRunner::Local,
    }
}
