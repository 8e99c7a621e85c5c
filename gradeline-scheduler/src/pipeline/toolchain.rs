use std::{fmt::Debug, path::Path, sync::Arc};

use async_trait::async_trait;
use gradeline_common::{
    error::Error,
    state::{DatabaseTrait, SubmissionDbTrait},
    submission::Submission,
    tool::{Target, Tool},
};
use tracing::{debug, warn};

use crate::config::{ToolConfig, ToolsConfig};

/// The ordered tools run against a submission's files.
#[derive(Debug, Default, Clone)]
pub struct Toolchain {
    pub compiler: Option<Arc<dyn Tool>>,
    /// One per test registered for the submission's project.
    pub tests: Vec<Arc<dyn Tool>>,
    pub analyzers: Vec<Arc<dyn Tool>>,
    pub user_test: Option<Arc<dyn Tool>>,
}

#[async_trait]
pub trait ToolchainSource: Send + Sync + Debug {
    /// Builds the tools for `submission`, writing any support files
    /// (such as project tests) below `tools_dir`.
    async fn toolchain(&self, submission: &Submission, tools_dir: &Path)
    -> Result<Toolchain, Error>;
}

/// Builds toolchains from the configured command templates.
#[derive(Debug)]
pub struct ToolchainProvider {
    config: ToolsConfig,
    db: Arc<dyn DatabaseTrait>,
}

impl ToolchainProvider {
    pub fn new(config: ToolsConfig, db: Arc<dyn DatabaseTrait>) -> Self {
        Self { config, db }
    }

    async fn project_tests(
        &self,
        submission: &Submission,
        tools_dir: &Path,
    ) -> Result<Vec<Arc<dyn Tool>>, Error> {
        let Some(template) = &self.config.tests else {
            return Ok(Vec::new());
        };

        let definitions = self.db.list_tests(submission.project_id).await?;
        let mut tests: Vec<Arc<dyn Tool>> = Vec::with_capacity(definitions.len());

        for definition in definitions {
            let target = Target::new(&definition.name, &definition.package, tools_dir);
            let path = target.file_path();
            tokio::fs::create_dir_all(target.dir()).await?;
            tokio::fs::write(&path, &definition.data).await?;

            match template.build_named(format!("{}:{}", template.name, definition.name)) {
                Ok(tool) => tests.push(Arc::new(
                    tool.with_var("test", path.to_string_lossy())
                        .with_var("test_class", target.qualified_name())
                        .with_var("tools", tools_dir.to_string_lossy()),
                )),
                Err(e) => warn!(
                    "ToolchainProvider: skipping test {} of project {}: {}",
                    definition.name, submission.project_id, e
                ),
            }
        }
        Ok(tests)
    }
}

fn build_optional(
    config: Option<&ToolConfig>,
    tools_dir: &Path,
) -> Option<Arc<dyn Tool>> {
    let config = config?;
    match config.build() {
        Ok(tool) => Some(Arc::new(tool.with_var("tools", tools_dir.to_string_lossy()))),
        Err(e) => {
            warn!("ToolchainProvider: leaving out {}: {}", config.name, e);
            None
        }
    }
}

#[async_trait]
impl ToolchainSource for ToolchainProvider {
    async fn toolchain(
        &self,
        submission: &Submission,
        tools_dir: &Path,
    ) -> Result<Toolchain, Error> {
        let analyzers = self
            .config
            .analyzers
            .iter()
            .filter_map(|config| build_optional(Some(config), tools_dir))
            .collect();

        let toolchain = Toolchain {
            compiler: build_optional(self.config.compiler.as_ref(), tools_dir),
            tests: self.project_tests(submission, tools_dir).await?,
            analyzers,
            user_test: build_optional(self.config.user_tests.as_ref(), tools_dir),
        };

        debug!(
            "ToolchainProvider: submission {} gets {} tests and {} analyzers",
            submission.id,
            toolchain.tests.len(),
            toolchain.analyzers.len()
        );
        Ok(toolchain)
    }
}
