use async_trait::async_trait;

use crate::{
    error::Error,
    submission::{FileId, StoredFile, SubmissionId},
};

use super::submission::SubmissionDbTrait;

#[async_trait]
pub trait FileDbTrait: SubmissionDbTrait {
    async fn get_file(&self, file_id: FileId) -> Result<Option<StoredFile>, Error>;

    /// Finds a submission's file by its sequence number
    /// ---
    /// Used to avoid storing archive members twice.
    async fn find_file_by_num(
        &self,
        submission_id: SubmissionId,
        num: u64,
    ) -> Result<Option<StoredFile>, Error>;

    /// Lists all files of a submission, ordered by sequence number
    async fn list_files(&self, submission_id: SubmissionId) -> Result<Vec<StoredFile>, Error>;

    async fn add_file(&self, file: &StoredFile) -> Result<(), Error>;

    async fn remove_file(&self, file_id: FileId) -> Result<(), Error>;
}
