mod file;
mod toolchain;

pub use file::{FilePipeline, FilePipelineFactory};
pub use toolchain::{Toolchain, ToolchainProvider, ToolchainSource};

use std::fmt::Debug;

use async_trait::async_trait;
use gradeline_common::{
    error::Error,
    submission::{FileId, SubmissionId},
};

/// Opens one pipeline per admitted submission.
#[async_trait]
pub trait PipelineFactory: Send + Sync + Debug {
    async fn open(&self, submission_id: SubmissionId)
    -> Result<Box<dyn SubmissionPipeline>, Error>;
}

/// Processes the files of one submission, one at a time.
/// ---
/// Errors returned from `process` are logged by the caller and do
/// not stop the remaining files. Tool failures are not errors: they
/// are stored as results.
#[async_trait]
pub trait SubmissionPipeline: Send {
    async fn process(&mut self, file_id: FileId) -> Result<(), Error>;

    /// Releases whatever the pipeline holds once the submission is done.
    async fn close(self: Box<Self>) -> Result<(), Error>;
}
