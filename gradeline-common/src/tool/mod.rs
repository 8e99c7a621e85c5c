mod command;
mod result;

pub use command::CommandTool;
pub use result::{Outcome, ToolResult};

use std::{
    fmt::Debug,
    path::{Path, PathBuf},
};

use async_trait::async_trait;

use crate::{error::Error, submission::FileId};

/// Where a file lives once it has been extracted for analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// File name including its extension, e.g. `Triangle.java`.
    pub name: String,
    /// Dot separated package, possibly empty.
    pub package: String,
    /// Root that package directories are created under.
    pub src_dir: PathBuf,
}

impl Target {
    pub fn new(name: impl Into<String>, package: impl Into<String>, src_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            package: package.into(),
            src_dir: src_dir.into(),
        }
    }

    pub fn package_path(&self) -> PathBuf {
        self.package.split('.').filter(|p| !p.is_empty()).collect()
    }

    /// Directory holding the file.
    pub fn dir(&self) -> PathBuf {
        self.src_dir.join(self.package_path())
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir().join(&self.name)
    }

    /// File name without its extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.name)
    }

    /// Fully qualified name, e.g. `za.ac.Triangle`.
    pub fn qualified_name(&self) -> String {
        if self.package.is_empty() {
            self.stem().to_string()
        } else {
            format!("{}.{}", self.package, self.stem())
        }
    }
}

/// A single analysis capability: a compiler, a test runner or a static analyser.
/// ---
/// A tool that ran but found problems returns `Ok` with a failed `Outcome`;
/// `Err` is reserved for tools that could not run at all.
#[async_trait]
pub trait Tool: Send + Sync + Debug {
    /// Key the tool's result is stored under in a file's result index.
    fn name(&self) -> &str;

    async fn run(&self, file_id: FileId, target: &Target) -> Result<ToolResult, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_paths() {
        let target = Target::new("Triangle.java", "za.ac.sun", "/tmp/work/src");
        assert_eq!(target.dir(), PathBuf::from("/tmp/work/src/za/ac/sun"));
        assert_eq!(
            target.file_path(),
            PathBuf::from("/tmp/work/src/za/ac/sun/Triangle.java")
        );
        assert_eq!(target.qualified_name(), "za.ac.sun.Triangle");
    }

    #[test]
    fn test_target_without_package() {
        let target = Target::new("Main.java", "", "/w");
        assert_eq!(target.dir(), PathBuf::from("/w"));
        assert_eq!(target.qualified_name(), "Main");
    }
}
