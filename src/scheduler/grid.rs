//! Grid scheduler submitting to a DIRAC workload management system
//! through its command-line tools.
//!
//! The rendered command is materialised inside a `job.sh` wrapper placed
//! in the input sandbox. The output sandbox carries only the
//! scheduler-internal files (`stdout.txt`, `stderr.txt`, `returncode`);
//! user outputs travel through the paired grid filesystem, which the
//! wrapper feeds by archiving the `output/` tree after the command exits.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{
    read_handle_sentinel, write_handle_sentinel, JobDescription, Scheduler, SchedulerState,
};
use crate::error::SchedulerError;
use crate::filesystem::grid::{INPUT_ARCHIVE, OUTPUT_ARCHIVE};
use crate::runner::CommandRunner;

const WRAPPER_SCRIPT: &str = "job.sh";
const JDL_FILE: &str = "job.jdl";

/// Map a DIRAC major status onto the shared vocabulary.
fn map_dirac_status(status: &str) -> SchedulerState {
    match status {
        "Received" | "Checking" | "Waiting" | "Matched" | "Staging" => SchedulerState::Queued,
        "Running" | "Completing" => SchedulerState::Running,
        "Done" => SchedulerState::Ok,
        // Failed, Killed, Deleted, Stalled and anything unmapped
        _ => SchedulerState::Error,
    }
}

pub struct GridScheduler {
    runner: CommandRunner,
    storage_element: String,
    proxy: Option<PathBuf>,
    apptainer_image: Option<PathBuf>,
}

impl GridScheduler {
    pub fn new(
        storage_element: String,
        proxy: Option<PathBuf>,
        apptainer_image: Option<PathBuf>,
    ) -> Self {
        Self {
            runner: CommandRunner::Local,
            storage_element,
            proxy,
            apptainer_image,
        }
    }

    async fn dirac(&self, tool: &str, args: &[&str]) -> Result<(i32, String, String), SchedulerError> {
        let output = match &self.proxy {
            Some(proxy) => {
                let env_arg = format!("X509_USER_PROXY={}", proxy.display());
                let mut full: Vec<&str> = vec![env_arg.as_str(), tool];
                full.extend_from_slice(args);
                self.runner.run("env", &full, None, None).await
            }
            None => self.runner.run(tool, args, None, None).await,
        }
        .map_err(|e| SchedulerError::State(e.to_string()))?;
        Ok((output.status, output.stdout, output.stderr))
    }

    /// Wrapper executed on the grid node: fetch the input archive, run the
    /// command, record the exit code, ship the outputs back.
    fn wrapper_script(&self, description: &JobDescription) -> String {
        let lfn_dir = description.execution_dir();
        let command = match &self.apptainer_image {
            Some(image) => format!("apptainer run {} {}", image.display(), description.command),
            None => description.command.clone(),
        };
        let wrapped = super::command_in_input_dir(&command);
        format!(
            "#!/bin/bash\n\
             dirac-dms-get-file {lfn_dir}/{INPUT_ARCHIVE}\n\
             unzip -q -o {INPUT_ARCHIVE}\n\
             ({wrapped}) > stdout.txt 2> stderr.txt\n\
             echo -n $? > returncode\n\
             zip -q -r {OUTPUT_ARCHIVE} output stdout.txt stderr.txt returncode\n\
             dirac-dms-add-file {lfn_dir}/{OUTPUT_ARCHIVE} {OUTPUT_ARCHIVE} {se}\n",
            se = self.storage_element,
        )
    }

    fn jdl(&self, description: &JobDescription) -> String {
        let name = description
            .job_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_string());
        format!(
            "JobName = \"jobrelay-{name}\";\n\
             Executable = \"/bin/bash\";\n\
             Arguments = \"{WRAPPER_SCRIPT}\";\n\
             InputSandbox = {{\"{WRAPPER_SCRIPT}\"}};\n\
             StdOutput = \"wrapper.out\";\n\
             StdError = \"wrapper.err\";\n\
             OutputSandbox = {{\"stdout.txt\", \"stderr.txt\", \"returncode\"}};\n"
        )
    }
}

#[async_trait]
impl Scheduler for GridScheduler {
    async fn submit(&self, description: &JobDescription) -> Result<String, SchedulerError> {
        if let Some(existing) = read_handle_sentinel(&description.job_dir).await {
            return Ok(existing);
        }
        let wrapper = self.wrapper_script(description);
        let jdl = self.jdl(description);
        let job_dir = &description.job_dir;
        tokio::fs::write(job_dir.join(WRAPPER_SCRIPT), wrapper)
            .await
            .map_err(|e| SchedulerError::Submit(format!("failed to write wrapper script: {e}")))?;
        tokio::fs::write(job_dir.join(JDL_FILE), jdl)
            .await
            .map_err(|e| SchedulerError::Submit(format!("failed to write jdl: {e}")))?;

        let jdl_path = job_dir.join(JDL_FILE).to_string_lossy().into_owned();
        let (status, stdout, stderr) = self
            .dirac("dirac-wms-job-submit", &[jdl_path.as_str()])
            .await
            .map_err(|e| match e {
                SchedulerError::State(msg) => SchedulerError::Submit(msg),
                other => other,
            })?;
        if status != 0 {
            return Err(SchedulerError::Submit(format!(
                "dirac-wms-job-submit exited with {status}: {stderr}"
            )));
        }
        // "JobID = 123"
        let internal_id = stdout
            .split(|c: char| !c.is_ascii_digit())
            .find(|part| !part.is_empty())
            .unwrap_or_default()
            .to_string();
        if internal_id.is_empty() {
            return Err(SchedulerError::Submit(format!(
                "could not parse job id from dirac output: {}",
                stdout.trim()
            )));
        }
        write_handle_sentinel(job_dir, &internal_id).await?;
        Ok(internal_id)
    }

    async fn state(&self, internal_id: &str) -> Result<SchedulerState, SchedulerError> {
        let (status, stdout, stderr) = self.dirac("dirac-wms-job-status", &[internal_id]).await?;
        if status != 0 {
            return Err(SchedulerError::State(format!(
                "dirac-wms-job-status exited with {status}: {stderr}"
            )));
        }
        // "JobID=123 Status=Waiting; MinorStatus=...;"
        let dirac_status = stdout
            .split_whitespace()
            .find_map(|token| token.strip_prefix("Status="))
            .map(|status| status.trim_end_matches(';'))
            .ok_or_else(|| {
                SchedulerError::State(format!(
                    "no status in dirac output for job {internal_id}: {}",
                    stdout.trim()
                ))
            })?;
        Ok(map_dirac_status(dirac_status))
    }

    async fn cancel(&self, internal_id: &str) -> Result<(), SchedulerError> {
        let (status, _stdout, stderr) = self.dirac("dirac-wms-job-kill", &[internal_id]).await?;
        if status != 0 {
            tracing::warn!(internal_id, stderr = %stderr.trim(), "dirac-wms-job-kill reported failure");
        }
        Ok(())
    }

    async fn close(&self) {
        self.runner.close();
    }
}

impl std::fmt::Debug for GridScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridScheduler")
            .field("storage_element", &self.storage_element)
            .finish()
    }
}
