use async_trait::async_trait;
use std::fmt::Debug;

use crate::{
    error::Error,
    submission::{Project, ProjectId, Submission, SubmissionId, TestDefinition},
};

#[async_trait]
pub trait SubmissionDbTrait: Send + Sync + Debug + 'static {
    /// Gets a submission by `submission_id`
    async fn get_submission(&self, submission_id: SubmissionId)
    -> Result<Option<Submission>, Error>;

    async fn add_submission(&self, submission: &Submission) -> Result<(), Error>;

    async fn get_project(&self, project_id: ProjectId) -> Result<Option<Project>, Error>;

    async fn add_project(&self, project: &Project) -> Result<(), Error>;

    /// Lists the unit tests registered for a project
    /// ---
    /// Order is registration order.
    async fn list_tests(&self, project_id: ProjectId) -> Result<Vec<TestDefinition>, Error>;

    async fn add_test(&self, test: &TestDefinition) -> Result<(), Error>;
}
