mod archive;
mod file;
mod naming;

pub use archive::unzip_members;
pub use file::*;
pub use naming::*;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_type!(
    /// Identifies a single student submission.
    SubmissionId
);
id_type!(
    /// Identifies a stored file belonging to a submission.
    FileId
);
id_type!(ProjectId);
id_type!(
    /// Identifies a stored tool result.
    ResultId
);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub project_id: ProjectId,
    pub user: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub lang: String,
}

/// A unit test registered against a project.
/// ---
/// Every source file of every submission to the project is run
/// against each of these once it compiles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestDefinition {
    pub id: Uuid,
    pub project_id: ProjectId,
    pub name: String,
    pub package: String,
    pub data: Vec<u8>,
}
