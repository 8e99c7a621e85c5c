use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

// It is used by strum to convert the enum to a string
// but the compiler complains that it is unused
#[allow(unused_imports)]
use std::str::FromStr;

use crate::{
    error::Error,
    submission::{FileId, FileKind, StoredFile, SubmissionId},
};

#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    SubmissionStart,
    SubmissionStop,
    SrcAdd,
    ArchiveAdd,
    TestAdd,
    /// Emitted once a file has left its submission's pipeline.
    FileRemove,
}

impl RequestKind {
    pub fn is_file_add(&self) -> bool {
        matches!(
            self,
            RequestKind::SrcAdd | RequestKind::ArchiveAdd | RequestKind::TestAdd
        )
    }
}

/// An event describing work to be done or status to report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub submission_id: SubmissionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    pub kind: RequestKind,
}

impl Request {
    pub fn start_submission(submission_id: SubmissionId) -> Self {
        Self {
            submission_id,
            file_id: None,
            kind: RequestKind::SubmissionStart,
        }
    }

    pub fn stop_submission(submission_id: SubmissionId) -> Self {
        Self {
            submission_id,
            file_id: None,
            kind: RequestKind::SubmissionStop,
        }
    }

    pub fn add_file(submission_id: SubmissionId, file_id: FileId, kind: FileKind) -> Result<Self, Error> {
        let kind = match kind {
            FileKind::Source => RequestKind::SrcAdd,
            FileKind::Archive => RequestKind::ArchiveAdd,
            FileKind::Test => RequestKind::TestAdd,
            FileKind::Launch => {
                return Err(Error::InvalidInput(format!(
                    "File {} is a launch record and cannot be processed",
                    file_id
                )));
            }
        };

        Ok(Self {
            submission_id,
            file_id: Some(file_id),
            kind,
        })
    }

    pub fn for_file(file: &StoredFile) -> Result<Self, Error> {
        Self::add_file(file.submission_id, file.id, file.kind)
    }

    pub fn remove_file(submission_id: SubmissionId, file_id: FileId) -> Self {
        Self {
            submission_id,
            file_id: Some(file_id),
            kind: RequestKind::FileRemove,
        }
    }

    /// The file a file-level request refers to.
    pub fn required_file_id(&self) -> Result<FileId, Error> {
        self.file_id.ok_or_else(|| {
            Error::Protocol(format!(
                "{} request for submission {} carries no file id",
                self.kind, self.submission_id
            ))
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(data)?)
    }
}
