use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::{FileId, ResultId, SubmissionId};

#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Source,
    Archive,
    Test,
    Launch,
}

impl FileKind {
    /// Launch records are stored for display only and never queued.
    pub fn can_process(&self) -> bool {
        !matches!(self, FileKind::Launch)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredFile {
    pub id: FileId,
    pub submission_id: SubmissionId,
    pub name: String,
    pub package: String,
    pub kind: FileKind,
    /// Sequence number within the submission.
    pub num: u64,
    pub data: Vec<u8>,
    /// Tool name -> id of the latest result that tool produced for this file.
    #[serde(default)]
    pub results: HashMap<String, ResultId>,
}

impl StoredFile {
    pub fn new(
        submission_id: SubmissionId,
        name: impl Into<String>,
        package: impl Into<String>,
        kind: FileKind,
        num: u64,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id: FileId::new(),
            submission_id,
            name: name.into(),
            package: package.into(),
            kind,
            num,
            data,
            results: HashMap::new(),
        }
    }

    pub fn has_result(&self, tool_name: &str) -> bool {
        self.results.contains_key(tool_name)
    }
}
