use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::Error,
    submission::{
        FileId, Project, ProjectId, ResultId, StoredFile, Submission, SubmissionId,
        TestDefinition,
    },
    tool::ToolResult,
};

use super::{FileDbTrait, ResultDbTrait, SubmissionDbTrait};

#[derive(Debug, Default)]
struct Tables {
    submissions: HashMap<SubmissionId, Submission>,
    projects: HashMap<ProjectId, Project>,
    tests: Vec<TestDefinition>,
    files: HashMap<FileId, StoredFile>,
    results: HashMap<ResultId, ToolResult>,
}

/// In-process storage backend.
/// ---
/// Used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryDb {
    id: Uuid,
    tables: RwLock<Tables>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            tables: RwLock::new(Tables::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn result_count(&self) -> usize {
        self.tables.read().await.results.len()
    }
}

#[async_trait]
impl SubmissionDbTrait for MemoryDb {
    async fn get_submission(
        &self,
        submission_id: SubmissionId,
    ) -> Result<Option<Submission>, Error> {
        Ok(self.tables.read().await.submissions.get(&submission_id).cloned())
    }

    async fn add_submission(&self, submission: &Submission) -> Result<(), Error> {
        self.tables
            .write()
            .await
            .submissions
            .insert(submission.id, submission.clone());
        Ok(())
    }

    async fn get_project(&self, project_id: ProjectId) -> Result<Option<Project>, Error> {
        Ok(self.tables.read().await.projects.get(&project_id).cloned())
    }

    async fn add_project(&self, project: &Project) -> Result<(), Error> {
        self.tables
            .write()
            .await
            .projects
            .insert(project.id, project.clone());
        Ok(())
    }

    async fn list_tests(&self, project_id: ProjectId) -> Result<Vec<TestDefinition>, Error> {
        Ok(self
            .tables
            .read()
            .await
            .tests
            .iter()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn add_test(&self, test: &TestDefinition) -> Result<(), Error> {
        self.tables.write().await.tests.push(test.clone());
        Ok(())
    }
}

#[async_trait]
impl FileDbTrait for MemoryDb {
    async fn get_file(&self, file_id: FileId) -> Result<Option<StoredFile>, Error> {
        Ok(self.tables.read().await.files.get(&file_id).cloned())
    }

    async fn find_file_by_num(
        &self,
        submission_id: SubmissionId,
        num: u64,
    ) -> Result<Option<StoredFile>, Error> {
        Ok(self
            .tables
            .read()
            .await
            .files
            .values()
            .find(|f| f.submission_id == submission_id && f.num == num)
            .cloned())
    }

    async fn list_files(&self, submission_id: SubmissionId) -> Result<Vec<StoredFile>, Error> {
        let mut files: Vec<StoredFile> = self
            .tables
            .read()
            .await
            .files
            .values()
            .filter(|f| f.submission_id == submission_id)
            .cloned()
            .collect();
        files.sort_by_key(|f| f.num);
        Ok(files)
    }

    async fn add_file(&self, file: &StoredFile) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        if tables.files.contains_key(&file.id) {
            return Err(Error::Storage(format!("File {} already stored", file.id)));
        }
        tables.files.insert(file.id, file.clone());
        Ok(())
    }

    async fn remove_file(&self, file_id: FileId) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        match tables.files.remove(&file_id) {
            Some(file) => {
                let ids: Vec<ResultId> = file.results.values().copied().collect();
                for id in ids {
                    tables.results.remove(&id);
                }
                Ok(())
            }
            None => Err(Error::not_found("File", file_id)),
        }
    }
}

#[async_trait]
impl ResultDbTrait for MemoryDb {
    async fn set_result_ref(
        &self,
        file_id: FileId,
        tool_name: &str,
        result_id: ResultId,
    ) -> Result<(), Error> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let file = tables
            .files
            .get_mut(&file_id)
            .ok_or_else(|| Error::not_found("File", file_id))?;

        if let Some(previous) = file.results.insert(tool_name.to_string(), result_id) {
            if previous != result_id {
                tables.results.remove(&previous);
            }
        }
        Ok(())
    }

    async fn insert_result(&self, result: &ToolResult) -> Result<(), Error> {
        self.tables
            .write()
            .await
            .results
            .insert(result.id, result.clone());
        Ok(())
    }

    async fn get_result(&self, result_id: ResultId) -> Result<Option<ToolResult>, Error> {
        Ok(self.tables.read().await.results.get(&result_id).cloned())
    }

    async fn delete_result(&self, file_id: FileId, tool_name: &str) -> Result<(), Error> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let file = tables
            .files
            .get_mut(&file_id)
            .ok_or_else(|| Error::not_found("File", file_id))?;

        if let Some(result_id) = file.results.remove(tool_name) {
            tables.results.remove(&result_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{submission::FileKind, tool::Outcome};

    #[tokio::test]
    async fn test_result_upsert_replaces_previous() {
        let db = MemoryDb::new();
        let file = StoredFile::new(SubmissionId::new(), "A.java", "", FileKind::Source, 1, vec![]);
        db.add_file(&file).await.unwrap();

        let first = ToolResult::new(file.id, "pmd", Outcome::Passed, "");
        db.set_result_ref(file.id, "pmd", first.id).await.unwrap();
        db.insert_result(&first).await.unwrap();

        let second = ToolResult::new(file.id, "pmd", Outcome::Failed, "x");
        db.set_result_ref(file.id, "pmd", second.id).await.unwrap();
        db.insert_result(&second).await.unwrap();

        let stored = db.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.results.len(), 1);
        assert_eq!(stored.results["pmd"], second.id);
        assert_eq!(db.result_count().await, 1);
    }

    #[tokio::test]
    async fn test_find_by_num_is_scoped_to_submission() {
        let db = MemoryDb::new();
        let sid = SubmissionId::new();
        let file = StoredFile::new(sid, "A.java", "", FileKind::Source, 7, vec![]);
        db.add_file(&file).await.unwrap();

        assert!(db.find_file_by_num(sid, 7).await.unwrap().is_some());
        assert!(db.find_file_by_num(SubmissionId::new(), 7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_missing_file() {
        let db = MemoryDb::new();
        let res = db.remove_file(FileId::new()).await;
        assert!(matches!(res, Err(Error::NotFound { .. })));
    }
}
