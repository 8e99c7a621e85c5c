use std::{process::Stdio, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{ChildStderr, ChildStdout},
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, timeout},
};
use uuid::Uuid;

use crate::error::Error;

use super::{ProcessOutput, ProcessRequest, ProcessStatus};

enum StdioPipes {
    Stdout(ChildStdout),
    Stderr(ChildStderr),
}

/// Runs external tools as local child processes, one call per invocation.
#[derive(Debug, Clone)]
pub struct LocalProcessRunner {
    id: Uuid,
}

impl Default for LocalProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalProcessRunner {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    /// Creates a task that captures stdout/stderr from a child process.
    /// ---
    /// The task reads the pipe line by line into a shared buffer
    /// and ends when the pipe closes.
    fn create_log_capture_task(
        input_pipe: StdioPipes,
        log_buffer: Arc<Mutex<Vec<String>>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            match input_pipe {
                StdioPipes::Stdout(pipe) => {
                    let mut lines = BufReader::new(pipe).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        log_buffer.lock().await.push(line);
                    }
                }
                StdioPipes::Stderr(pipe) => {
                    let mut lines = BufReader::new(pipe).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        log_buffer.lock().await.push(line);
                    }
                }
            };
        })
    }

    /// Runs a process to completion.
    /// ---
    /// A non-zero exit or a timeout is reported through `ProcessStatus`;
    /// only failing to spawn or wait on the process is an `Error`.
    pub async fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput, Error> {
        if request.program.is_empty() {
            return Err(Error::InvalidInput("No program specified".to_string()));
        }

        let mut command = tokio::process::Command::new(&request.program);
        command
            .args(&request.args)
            .envs(&request.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }

        let start_time = Instant::now();
        let mut child_proc = command.spawn().map_err(|err| {
            Error::ToolExecution(format!("Failed to spawn {}: {}", request.program, err))
        })?;

        let pid = child_proc.id().unwrap_or_default();

        let child_stdout = child_proc
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("Failed to get local process stdout".to_string()))?;

        let child_stderr = child_proc
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("Failed to get local process stderr".to_string()))?;

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task =
            Self::create_log_capture_task(StdioPipes::Stdout(child_stdout), stdout_buf.clone());
        let stderr_task =
            Self::create_log_capture_task(StdioPipes::Stderr(child_stderr), stderr_buf.clone());

        let status = match request.exec_timeout {
            Some(timeout_dur) => match timeout(timeout_dur, child_proc.wait()).await {
                Ok(exit_result) => Self::exit_status(exit_result, pid)?,
                Err(_elapsed) => {
                    warn!(
                        "ProcessRunner [{}]: {} (PID {}) timed out after {:?}, killing.",
                        self.id, request.program, pid, timeout_dur
                    );
                    if let Err(e) = child_proc.kill().await {
                        error!(
                            "ProcessRunner [{}]: Failed to kill PID {} after timeout: {}",
                            self.id, pid, e
                        );
                    }
                    ProcessStatus::TimedOut
                }
            },
            None => Self::exit_status(child_proc.wait().await, pid)?,
        };

        // Pipes close once the process is gone; bound the wait in case a
        // grandchild keeps them open.
        let log_collection_timeout = Duration::from_secs(2);
        if timeout(log_collection_timeout, stdout_task).await.is_err() {
            warn!(
                "ProcessRunner [{}]: Timeout waiting for stdout of PID {}.",
                self.id, pid
            );
        }
        if timeout(log_collection_timeout, stderr_task).await.is_err() {
            warn!(
                "ProcessRunner [{}]: Timeout waiting for stderr of PID {}.",
                self.id, pid
            );
        }

        let stdout = stdout_buf.lock().await.clone();
        let stderr = stderr_buf.lock().await.clone();

        debug!(
            "ProcessRunner [{}]: {} (PID {}) finished with {:?}.",
            self.id, request.program, pid, status
        );

        Ok(ProcessOutput {
            status,
            stdout,
            stderr,
            elapsed: start_time.elapsed(),
        })
    }

    fn exit_status(
        exit_result: std::io::Result<std::process::ExitStatus>,
        pid: u32,
    ) -> Result<ProcessStatus, Error> {
        let status = exit_result.map_err(|e| {
            Error::ToolExecution(format!("Error waiting for PID {} to exit: {}", pid, e))
        })?;

        if status.success() {
            Ok(ProcessStatus::Succeeded)
        } else {
            Ok(ProcessStatus::Failed(status.code()))
        }
    }
}
