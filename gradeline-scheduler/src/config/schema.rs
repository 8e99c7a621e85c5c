use std::{collections::HashMap, path::PathBuf, time::Duration};

use gradeline_common::{error::Error, tool::CommandTool};
use serde::Deserialize;

pub const DEFAULT_BROKER_URI: &str = "memory://local";
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 1024;
pub const DEFAULT_MAX_ORPHAN_FILES: usize = 1024;
pub const DEFAULT_ABANDON_AFTER_SECS: u64 = 3600;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GradelineConfig {
    pub broker: BrokerConfig,
    pub scheduler: SchedulerSection,
    pub tools: ToolsConfig,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub uri: String,
    pub rpc_timeout_secs: u64,
    pub prefetch_count: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_BROKER_URI.to_string(),
            rpc_timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
            prefetch_count: 1,
        }
    }
}

impl BrokerConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerSection {
    pub max_procs: usize,
    pub max_queue_depth: usize,
    pub max_orphan_files: usize,
    /// Seconds without events before an open submission is stopped;
    /// `null` disables it.
    pub abandon_after_secs: Option<u64>,
    pub scratch_dir: PathBuf,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_procs: default_max_procs(),
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            max_orphan_files: DEFAULT_MAX_ORPHAN_FILES,
            abandon_after_secs: Some(DEFAULT_ABANDON_AFTER_SECS),
            scratch_dir: std::env::temp_dir().join("gradeline"),
        }
    }
}

impl SchedulerSection {
    pub fn abandon_after(&self) -> Option<Duration> {
        self.abandon_after_secs.map(Duration::from_secs)
    }
}

/// One less than the available cores, leaving room for the broker
/// handlers, but never zero.
pub fn default_max_procs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ToolsConfig {
    pub compiler: Option<ToolConfig>,
    pub analyzers: Vec<ToolConfig>,
    /// Template run once per project test; `{test}` is the test's path.
    pub tests: Option<ToolConfig>,
    /// Runs test files submitted by the student.
    pub user_tests: Option<ToolConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolConfig {
    pub name: String,
    pub command: Vec<String>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ToolConfig {
    pub fn build(&self) -> Result<CommandTool, Error> {
        self.build_named(self.name.clone())
    }

    /// Builds the tool under another name.
    pub fn build_named(&self, name: impl Into<String>) -> Result<CommandTool, Error> {
        Ok(CommandTool::new(
            name,
            self.command.clone(),
            self.timeout_secs.map(Duration::from_secs),
        )?
        .with_env(self.env.clone()))
    }
}
