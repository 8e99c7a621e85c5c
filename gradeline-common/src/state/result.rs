use async_trait::async_trait;

use crate::{
    error::Error,
    submission::{FileId, ResultId},
    tool::ToolResult,
};

use super::submission::SubmissionDbTrait;

#[async_trait]
pub trait ResultDbTrait: SubmissionDbTrait {
    /// Points a file's result index entry for `tool_name` at `result_id`
    /// ---
    /// Overwrites any previous entry for the same tool.
    async fn set_result_ref(
        &self,
        file_id: FileId,
        tool_name: &str,
        result_id: ResultId,
    ) -> Result<(), Error>;

    async fn insert_result(&self, result: &ToolResult) -> Result<(), Error>;

    async fn get_result(&self, result_id: ResultId) -> Result<Option<ToolResult>, Error>;

    /// Deletes a file's result for one tool, so that the tool runs again
    /// the next time the file is processed.
    async fn delete_result(&self, file_id: FileId, tool_name: &str) -> Result<(), Error>;
}
