//! Slurm batch scheduler, driven through `sbatch`, `squeue`, `sacct` and
//! `scancel` either locally or over SSH.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    read_handle_sentinel, write_handle_sentinel, JobDescription, Scheduler, SchedulerState,
};
use crate::error::SchedulerError;
use crate::runner::CommandRunner;
use crate::ssh::SshConnectConfig;

/// How long after submission a missing accounting record still reads as
/// `queued`, to tolerate sacct propagation delay.
const ACCOUNTING_GRACE: Duration = Duration::from_secs(60);

/// Map a Slurm job state code onto the shared vocabulary.
///
/// See <https://slurm.schedmd.com/squeue.html#SECTION_JOB-STATE-CODES>.
fn map_slurm_state(slurm_state: &str) -> SchedulerState {
    match slurm_state {
        "PENDING" | "CONFIGURING" => SchedulerState::Queued,
        "RUNNING" | "SUSPENDED" | "COMPLETING" | "STAGE_OUT" => SchedulerState::Running,
        "COMPLETED" => SchedulerState::Ok,
        // CANCELLED, FAILED, TIMEOUT, PREEMPTED, NODE_FAIL, SPECIAL_EXIT
        // and anything unmapped
        _ => SchedulerState::Error,
    }
}

pub struct SlurmScheduler {
    runner: CommandRunner,
    partition: Option<String>,
    time: Option<String>,
    extra_options: Vec<String>,
    /// Anchor instants for the accounting grace window: when a job was
    /// submitted, or when this process first found it without a record.
    /// The second case covers jobs recovered after a restart, which must
    /// get the same tolerance a live submission does.
    missing_since: Mutex<HashMap<String, Instant>>,
}

impl SlurmScheduler {
    pub fn new(
        ssh_config: Option<SshConnectConfig>,
        partition: Option<String>,
        time: Option<String>,
        extra_options: Vec<String>,
    ) -> Self {
        Self {
            runner: crate::runner::runner_for(ssh_config.as_ref()),
            partition,
            time,
            extra_options,
            missing_since: Mutex::new(HashMap::new()),
        }
    }

    fn submit_script(&self, description: &JobDescription) -> String {
        let mut lines = vec!["#!/bin/bash".to_string()];
        for extra in &self.extra_options {
            lines.push(format!("#SBATCH {extra}"));
        }
        if let Some(partition) = &self.partition {
            lines.push(format!("#SBATCH --partition={partition}"));
        }
        if let Some(time) = &self.time {
            lines.push(format!("#SBATCH --time={time}"));
        } else if let Some(cpu_time) = description.resources.cpu_time {
            let minutes = cpu_time.as_secs().div_ceil(60);
            lines.push(format!("#SBATCH --time={minutes}"));
        }
        if let Some(memory_mb) = description.resources.memory_mb {
            lines.push(format!("#SBATCH --mem={memory_mb}M"));
        }
        lines.push("#SBATCH --output=stdout.txt".to_string());
        lines.push("#SBATCH --error=stderr.txt".to_string());
        lines.push(format!("({})", super::command_in_input_dir(&description.command)));
        lines.push("echo -n $? > returncode".to_string());
        lines.push(String::new());
        lines.join("\n")
    }

    async fn state_from_accounting(&self, internal_id: &str) -> Result<String, SchedulerError> {
        let output = self
            .runner
            .run(
                "sacct",
                &["-j", internal_id, "--noheader", "--format=state"],
                None,
                None,
            )
            .await
            .map_err(|e| SchedulerError::State(e.to_string()))?;
        if output.status != 0 {
            return Err(SchedulerError::State(format!(
                "sacct exited with {}: {}",
                output.status, output.stderr
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Scheduler for SlurmScheduler {
    async fn submit(&self, description: &JobDescription) -> Result<String, SchedulerError> {
        if let Some(existing) = read_handle_sentinel(&description.job_dir).await {
            return Ok(existing);
        }
        let script = self.submit_script(description);
        let cwd = PathBuf::from(description.execution_dir());
        let output = self
            .runner
            .run("sbatch", &[], Some(&script), Some(&cwd))
            .await
            .map_err(|e| SchedulerError::Submit(e.to_string()))?;
        if output.status != 0 {
            return Err(SchedulerError::Submit(format!(
                "sbatch exited with {}: {}",
                output.status, output.stderr
            )));
        }
        // "Submitted batch job 42" -> "42"
        let internal_id = output
            .stdout
            .trim()
            .rsplit(' ')
            .next()
            .unwrap_or_default()
            .to_string();
        if internal_id.is_empty() || !internal_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(SchedulerError::Submit(format!(
                "could not parse job id from sbatch output: {}",
                output.stdout.trim()
            )));
        }
        write_handle_sentinel(&description.job_dir, &internal_id).await?;
        self.missing_since
            .lock()
            .await
            .insert(internal_id.clone(), Instant::now());
        Ok(internal_id)
    }

    async fn state(&self, internal_id: &str) -> Result<SchedulerState, SchedulerError> {
        let output = self
            .runner
            .run(
                "squeue",
                &["-j", internal_id, "--noheader", "--format=%T"],
                None,
                None,
            )
            .await
            .map_err(|e| SchedulerError::State(e.to_string()))?;
        let mut stdout = output.stdout;
        if output.status != 0 || stdout.trim().is_empty() {
            // finished jobs fall out of squeue; ask accounting
            stdout = self.state_from_accounting(internal_id).await?;
        }
        let code = stdout
            .lines()
            .find(|line| !line.trim().is_empty())
            .map(|line| {
                line.split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .trim_end_matches('+')
                    .to_string()
            })
            .unwrap_or_default();
        if code.is_empty() {
            // no record anywhere: freshly submitted jobs may not have
            // propagated into accounting yet. The window is anchored at
            // submission, or at the first missing observation for jobs
            // this process only knows from a recovered handle, so restart
            // recovery gets the full tolerance too.
            let first = {
                let mut missing = self.missing_since.lock().await;
                *missing
                    .entry(internal_id.to_string())
                    .or_insert_with(Instant::now)
            };
            if first.elapsed() < ACCOUNTING_GRACE {
                return Ok(SchedulerState::Queued);
            }
            return Err(SchedulerError::State(format!(
                "job {internal_id} has no squeue or sacct record"
            )));
        }
        self.missing_since.lock().await.remove(internal_id);
        Ok(map_slurm_state(&code))
    }

    async fn cancel(&self, internal_id: &str) -> Result<(), SchedulerError> {
        let output = self
            .runner
            .run("scancel", &[internal_id], None, None)
            .await
            .map_err(|e| SchedulerError::State(e.to_string()))?;
        if output.status != 0 {
            tracing::warn!(
                internal_id,
                stderr = %output.stderr.trim(),
                "scancel reported failure"
            );
        }
        Ok(())
    }

    async fn close(&self) {
        self.runner.close();
    }
}

impl std::fmt::Debug for SlurmScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlurmScheduler")
            .field("partition", &self.partition)
            .field("time", &self.time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_pending_states_to_queued() {
        assert_eq!(map_slurm_state("PENDING"), SchedulerState::Queued);
        assert_eq!(map_slurm_state("CONFIGURING"), SchedulerState::Queued);
    }

    #[test]
    fn maps_active_states_to_running() {
        for code in ["RUNNING", "SUSPENDED", "COMPLETING", "STAGE_OUT"] {
            assert_eq!(map_slurm_state(code), SchedulerState::Running);
        }
    }

    #[test]
    fn maps_terminal_states() {
        assert_eq!(map_slurm_state("COMPLETED"), SchedulerState::Ok);
        for code in ["CANCELLED", "FAILED", "TIMEOUT", "NODE_FAIL", "BOGUS"] {
            assert_eq!(map_slurm_state(code), SchedulerState::Error);
        }
    }

    #[test]
    fn script_contains_partition_and_redirects() {
        let scheduler = SlurmScheduler::new(
            None,
            Some("short".to_string()),
            Some("60".to_string()),
            vec!["--nodes 1".to_string()],
        );
        let description = JobDescription::new("wc README.md", "/tmp/jobs/1");
        let script = scheduler.submit_script(&description);
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("#SBATCH --partition=short"));
        assert!(script.contains("#SBATCH --time=60"));
        assert!(script.contains("#SBATCH --nodes 1"));
        assert!(script.contains("#SBATCH --output=stdout.txt"));
        assert!(script.contains("wc README.md"));
        assert!(script.contains("echo -n $? > returncode"));
    }
}
