//! Shell executor.
//!
//! Runs the job command through `sh -c`, optionally prefixed with an interpreter
//! (`python3 script.py --day 2026-03-14`). The shell leads its own process group, and the
//! whole group is killed when the shell exits, when the execution is cancelled, or when
//! the execution is dropped. Output readers are bounded by a drain grace once the group
//! is gone.

use async_trait::async_trait;
use cadence_core::executor::{ExecutionContext, JobExecutor, TaskOutput};
use cadence_core::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ShellExecutor {
    interpreter: Option<String>,
    drain_grace: Duration,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            interpreter: None,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    /// Run commands as arguments of `interpreter`.
    pub fn with_interpreter(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: Some(interpreter.into()),
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    fn script(&self, command: &str) -> String {
        match &self.interpreter {
            Some(interpreter) => format!("{} {}", interpreter, command),
            None => command.to_string(),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Process group led by a spawned shell, killed on drop.
struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    fn new(leader: Option<u32>) -> Self {
        Self {
            pgid: leader
                .and_then(|pid| i32::try_from(pid).ok())
                .map(Pid::from_raw),
        }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => debug!(pgid = pgid.as_raw(), "Killed process group"),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid = pgid.as_raw(), error = %e, "Failed to kill process group"),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn spawn_reader<R>(reader: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            if let Err(e) = reader.read_to_end(&mut buf).await {
                debug!(error = %e, "Output read ended early");
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Wait for a reader until `grace` elapses, then give up on it.
async fn drain(mut reader: JoinHandle<String>, grace: Duration) -> String {
    match tokio::time::timeout(grace, &mut reader).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader failed");
            String::new()
        }
        Err(_) => {
            reader.abort();
            warn!("Output still open after the process exited; truncating");
            String::new()
        }
    }
}

#[async_trait]
impl JobExecutor for ShellExecutor {
    fn name(&self) -> &'static str {
        match self.interpreter {
            Some(_) => "interpreter",
            None => "shell",
        }
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<TaskOutput> {
        let script = self.script(&ctx.command);
        info!(
            job = %ctx.job_name,
            execution_id = %ctx.execution_id,
            command = %script,
            "Starting process"
        );

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .env("CADENCE_JOB_NAME", &ctx.job_name)
            .env("CADENCE_EXECUTION_ID", ctx.execution_id.to_string())
            .env("CADENCE_RETRY_COUNT", ctx.retry_count.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::PermanentFailure(format!("failed to start process: {}", e)))?;

        let pid = child.id();
        let mut group = ProcessGroup::new(pid);
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let status = tokio::select! {
            status = child.wait() => status
                .map_err(|e| Error::PermanentFailure(format!("failed to wait for process: {}", e)))?,
            _ = ctx.cancel.cancelled() => {
                warn!(execution_id = %ctx.execution_id, pid = ?pid, "Killing process group");
                group.kill();
                if let Err(e) = child.kill().await {
                    warn!(execution_id = %ctx.execution_id, error = %e, "Failed to kill process");
                }
                stdout.abort();
                stderr.abort();
                return Err(Error::ExecutionCancelled);
            }
        };

        // Background children would otherwise keep running and hold the pipes open
        group.kill();
        let stdout = drain(stdout, self.drain_grace).await;
        let stderr = drain(stderr, self.drain_grace).await;

        info!(
            execution_id = %ctx.execution_id,
            exit_code = ?status.code(),
            "Process exited"
        );

        Ok(TaskOutput {
            success: status.success(),
            exit_code: status.code(),
            stdout,
            stderr,
            process_id: pid,
            output_parameters: Default::default(),
        })
    }
}
