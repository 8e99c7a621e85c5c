use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;

use crate::{
    error::Error,
    exec::{LocalProcessRunner, ProcessRequest},
    submission::FileId,
};

use super::{Outcome, Target, Tool, ToolResult};

/// A tool backed by an external command line.
/// ---
/// Arguments may contain placeholders that are filled in per target:
/// `{file}` (absolute file path), `{dir}` (the file's directory),
/// `{src}` (source root), `{class}` (qualified name), `{package}`,
/// plus any extra variables given through [`CommandTool::with_var`].
#[derive(Debug, Clone)]
pub struct CommandTool {
    name: String,
    command: Vec<String>,
    env_vars: HashMap<String, String>,
    vars: HashMap<String, String>,
    exec_timeout: Option<Duration>,
    runner: LocalProcessRunner,
}

impl CommandTool {
    pub fn new(
        name: impl Into<String>,
        command: Vec<String>,
        exec_timeout: Option<Duration>,
    ) -> Result<Self, Error> {
        let name = name.into();
        if command.is_empty() {
            return Err(Error::Config(format!("Tool {} has an empty command", name)));
        }

        Ok(Self {
            name,
            command,
            env_vars: HashMap::new(),
            vars: HashMap::new(),
            exec_timeout,
            runner: LocalProcessRunner::new(),
        })
    }

    pub fn with_env(mut self, env_vars: HashMap<String, String>) -> Self {
        self.env_vars = env_vars;
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    fn expand(&self, arg: &str, target: &Target) -> String {
        let mut expanded = arg
            .replace("{file}", &target.file_path().to_string_lossy())
            .replace("{dir}", &target.dir().to_string_lossy())
            .replace("{src}", &target.src_dir.to_string_lossy())
            .replace("{class}", &target.qualified_name())
            .replace("{package}", &target.package);

        for (key, value) in &self.vars {
            expanded = expanded.replace(&format!("{{{}}}", key), value);
        }
        expanded
    }

    pub fn request_for(&self, target: &Target) -> ProcessRequest {
        let args = self.command[1..]
            .iter()
            .map(|arg| self.expand(arg, target))
            .collect();

        ProcessRequest::new(self.expand(&self.command[0], target), args)
            .with_env(self.env_vars.clone())
            .with_working_dir(target.src_dir.clone())
            .with_timeout(self.exec_timeout)
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, file_id: FileId, target: &Target) -> Result<ToolResult, Error> {
        let output = self.runner.run(&self.request_for(target)).await?;
        let outcome = Outcome::from(&output.status);

        Ok(ToolResult::new(file_id, &self.name, outcome, output.combined()))
    }
}
