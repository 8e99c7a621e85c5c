use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    exec::ProcessStatus,
    submission::{FileId, ResultId},
};

#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Outcome {
    Passed,
    Failed,
    TimedOut,
}

impl From<&ProcessStatus> for Outcome {
    fn from(status: &ProcessStatus) -> Self {
        match status {
            ProcessStatus::Succeeded => Outcome::Passed,
            ProcessStatus::Failed(_) => Outcome::Failed,
            ProcessStatus::TimedOut => Outcome::TimedOut,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: ResultId,
    pub file_id: FileId,
    pub name: String,
    pub outcome: Outcome,
    pub output: String,
    pub created_at: DateTime<Utc>,
}

impl ToolResult {
    pub fn new(file_id: FileId, name: impl Into<String>, outcome: Outcome, output: impl Into<String>) -> Self {
        Self {
            id: ResultId::new(),
            file_id,
            name: name.into(),
            outcome,
            output: output.into(),
            created_at: Utc::now(),
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }
}
