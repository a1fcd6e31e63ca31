//! Executor that runs a job's configured shell command.

use async_trait::async_trait;
use conveyor_core::executor::{BuildResult, ExecutionContext, JobExecutor};
use conveyor_core::job::JobDefinition;
use conveyor_core::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL: usize = 2048;

/// Runs `sh -c <command>` per job. Jobs without a command succeed
/// immediately.
pub struct ShellExecutor {
    commands: HashMap<String, String>,
    shell: String,
    work_dir: Option<PathBuf>,
}

impl ShellExecutor {
    pub fn new(commands: HashMap<String, String>) -> Self {
        Self {
            commands,
            shell: "sh".to_string(),
            work_dir: std::env::var("CONVEYOR_WORK_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn from_jobs(jobs: &[JobDefinition]) -> Self {
        Self::new(
            jobs.iter()
                .filter_map(|job| Some((job.id.clone(), job.command.clone()?)))
                .collect(),
        )
    }
}

#[async_trait]
impl JobExecutor for ShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<BuildResult> {
        let entry = &ctx.entry;
        let Some(command) = self.commands.get(&entry.job_id) else {
            info!(job_id = %entry.job_id, "No command configured, nothing to run");
            return Ok(BuildResult::success());
        };

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .env("CONVEYOR_JOB_ID", &entry.job_id)
            .env("CONVEYOR_QUEUE_ID", entry.id.to_string())
            .env("CONVEYOR_ATTEMPT", (entry.retry_count + 1).to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(branch) = &entry.metadata.branch {
            cmd.env("CONVEYOR_BRANCH", branch);
        }
        if let Some(commit) = &entry.metadata.commit_hash {
            cmd.env("CONVEYOR_COMMIT", commit);
        }
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }

        info!(job_id = %entry.job_id, queue_id = %entry.id, command = %command, "Running job command");
        let child = cmd
            .spawn()
            .map_err(|e| Error::Execution(format!("failed to spawn {}: {}", self.shell, e)))?;
        ctx.progress.set(10);

        // Dropping the output future kills the child.
        tokio::select! {
            output = child.wait_with_output() => {
                let output = output.map_err(|e| Error::Execution(e.to_string()))?;
                if output.status.success() {
                    Ok(BuildResult::success())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let start = stderr.len().saturating_sub(STDERR_TAIL);
                    let tail = stderr.get(start..).unwrap_or_default().trim();
                    warn!(job_id = %entry.job_id, status = %output.status, "Job command failed");
                    Ok(BuildResult::failure(format!("command exited with {}: {}", output.status, tail)))
                }
            }
            _ = ctx.cancellation.cancelled() => {
                info!(job_id = %entry.job_id, queue_id = %entry.id, "Job command cancelled");
                Ok(BuildResult::failure("cancelled"))
            }
        }
    }
}
