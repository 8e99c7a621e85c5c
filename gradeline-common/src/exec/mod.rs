mod local_process;

pub use local_process::LocalProcessRunner;

use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub env_vars: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Processes still running after this long are killed.
    pub exec_timeout: Option<Duration>,
}

impl ProcessRequest {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, exec_timeout: Option<Duration>) -> Self {
        self.exec_timeout = exec_timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env_vars: HashMap<String, String>) -> Self {
        self.env_vars = env_vars;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    Succeeded,
    Failed(Option<i32>),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ProcessStatus,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub elapsed: Duration,
}

impl ProcessOutput {
    /// Stdout followed by stderr, one line per entry.
    pub fn combined(&self) -> String {
        self.stdout
            .iter()
            .chain(self.stderr.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
