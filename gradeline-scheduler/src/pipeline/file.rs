use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use gradeline_common::{
    error::Error,
    state::{DatabaseTrait, FileDbTrait, ResultDbTrait, SubmissionDbTrait},
    submission::{
        FileId, FileKind, StoredFile, Submission, SubmissionId, parse_member_name, unzip_members,
    },
    tool::{Target, Tool, ToolResult},
};
use tracing::{debug, error, info, warn};

use super::{PipelineFactory, SubmissionPipeline, Toolchain, ToolchainSource};

const SRC_DIR: &str = "src";
const TOOLS_DIR: &str = "tools";

/// Opens a [`FilePipeline`] with its own scratch directory per submission.
#[derive(Debug)]
pub struct FilePipelineFactory {
    db: Arc<dyn DatabaseTrait>,
    toolchains: Arc<dyn ToolchainSource>,
    scratch_dir: PathBuf,
}

impl FilePipelineFactory {
    pub fn new(
        db: Arc<dyn DatabaseTrait>,
        toolchains: Arc<dyn ToolchainSource>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            toolchains,
            scratch_dir: scratch_dir.into(),
        }
    }
}

#[async_trait]
impl PipelineFactory for FilePipelineFactory {
    async fn open(
        &self,
        submission_id: SubmissionId,
    ) -> Result<Box<dyn SubmissionPipeline>, Error> {
        let submission = self
            .db
            .get_submission(submission_id)
            .await?
            .ok_or_else(|| Error::not_found("Submission", submission_id))?;

        let root = self.scratch_dir.join(submission_id.to_string());
        let src_dir = root.join(SRC_DIR);
        let tools_dir = root.join(TOOLS_DIR);
        tokio::fs::create_dir_all(&src_dir).await?;
        tokio::fs::create_dir_all(&tools_dir).await?;

        let toolchain = match self.toolchains.toolchain(&submission, &tools_dir).await {
            Ok(toolchain) => toolchain,
            Err(e) => {
                remove_scratch(&root).await;
                return Err(e);
            }
        };

        info!(
            "FilePipeline [{}]: opened in {}",
            submission_id,
            root.display()
        );
        Ok(Box::new(FilePipeline {
            submission,
            db: self.db.clone(),
            toolchain,
            root,
            src_dir,
        }))
    }
}

async fn remove_scratch(root: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(root).await {
        warn!("FilePipeline: failed to remove {}: {}", root.display(), e);
    }
}

/// Expands, compiles, tests and analyses the files of one submission.
#[derive(Debug)]
pub struct FilePipeline {
    submission: Submission,
    db: Arc<dyn DatabaseTrait>,
    toolchain: Toolchain,
    root: PathBuf,
    src_dir: PathBuf,
}

impl FilePipeline {
    fn target(&self, file: &StoredFile) -> Target {
        Target::new(&file.name, &file.package, &self.src_dir)
    }

    async fn extract(&self, file: &StoredFile) -> Result<Target, Error> {
        let target = self.target(file);
        tokio::fs::create_dir_all(target.dir()).await?;
        tokio::fs::write(target.file_path(), &file.data).await?;
        Ok(target)
    }

    /// Stores `result` as the file's latest result for its tool.
    async fn record(&self, file: &mut StoredFile, result: ToolResult) -> Result<(), Error> {
        self.db
            .set_result_ref(file.id, &result.name, result.id)
            .await?;
        self.db.insert_result(&result).await?;
        file.results.insert(result.name.clone(), result.id);
        Ok(())
    }

    /// Runs `tool` and records its result, unless one already exists.
    /// ---
    /// Returns whether the tool passed. Tools that cannot run at all
    /// are logged and count as not passed.
    async fn run_tool(
        &self,
        file: &mut StoredFile,
        tool: &Arc<dyn Tool>,
        target: &Target,
        skip_existing: bool,
    ) -> bool {
        if skip_existing && file.has_result(tool.name()) {
            debug!(
                "FilePipeline [{}]: {} already ran on {}",
                self.submission.id,
                tool.name(),
                file.name
            );
            return true;
        }

        let result = match tool.run(file.id, target).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "FilePipeline [{}]: {} failed to run on {}: {}",
                    self.submission.id,
                    tool.name(),
                    file.name,
                    e
                );
                return false;
            }
        };

        let passed = result.passed();
        if let Err(e) = self.record(file, result).await {
            error!(
                "FilePipeline [{}]: failed to store {} result for {}: {}",
                self.submission.id,
                tool.name(),
                file.name,
                e
            );
        }
        passed
    }

    /// Compiles the file; returns whether later steps may run.
    async fn compile(&self, file: &mut StoredFile, target: &Target) -> bool {
        match self.toolchain.compiler.clone() {
            Some(compiler) => {
                let compiled = self.run_tool(file, &compiler, target, false).await;
                if !compiled {
                    info!(
                        "FilePipeline [{}]: {} does not compile, skipping its tests and analyzers",
                        self.submission.id, file.name
                    );
                }
                compiled
            }
            None => true,
        }
    }

    async fn process_source(&self, mut file: StoredFile) -> Result<(), Error> {
        let target = self.extract(&file).await?;
        if !self.compile(&mut file, &target).await {
            return Ok(());
        }

        for test in &self.toolchain.tests {
            self.run_tool(&mut file, test, &target, true).await;
        }
        for analyzer in &self.toolchain.analyzers {
            self.run_tool(&mut file, analyzer, &target, true).await;
        }
        Ok(())
    }

    /// Compiles a test file written by the student, then runs it.
    async fn process_test(&self, mut file: StoredFile) -> Result<(), Error> {
        let target = self.extract(&file).await?;
        if !self.compile(&mut file, &target).await {
            return Ok(());
        }

        if let Some(user_test) = self.toolchain.user_test.clone() {
            self.run_tool(&mut file, &user_test, &target, true).await;
        }
        Ok(())
    }

    /// Stores the archive's members, processes them, then drops the archive.
    /// ---
    /// Members already stored under the same number are reused. Member
    /// names never decode to archives, so expansion does not nest.
    async fn process_archive(&self, archive: StoredFile) -> Result<(), Error> {
        let members = unzip_members(&archive.data)?;
        info!(
            "FilePipeline [{}]: expanding {} with {} members",
            self.submission.id,
            archive.name,
            members.len()
        );

        for (encoded, data) in members {
            let member = match parse_member_name(&encoded) {
                Ok(member) => member,
                Err(e) => {
                    warn!(
                        "FilePipeline [{}]: skipping archive member {}: {}",
                        self.submission.id, encoded, e
                    );
                    continue;
                }
            };

            let stored = match self
                .db
                .find_file_by_num(self.submission.id, member.num)
                .await?
            {
                Some(existing) => existing,
                None => {
                    let file = StoredFile::new(
                        self.submission.id,
                        member.name,
                        member.package,
                        member.kind,
                        member.num,
                        data,
                    );
                    self.db.add_file(&file).await?;
                    file
                }
            };

            if let Err(e) = self.process_member(stored).await {
                error!(
                    "FilePipeline [{}]: failed to process member {}: {}",
                    self.submission.id, encoded, e
                );
            }
        }

        self.db.remove_file(archive.id).await
    }

    async fn process_member(&self, file: StoredFile) -> Result<(), Error> {
        match file.kind {
            FileKind::Source => self.process_source(file).await,
            FileKind::Test => self.process_test(file).await,
            FileKind::Archive | FileKind::Launch => {
                debug!(
                    "FilePipeline [{}]: not processing {} member {}",
                    self.submission.id, file.kind, file.name
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl SubmissionPipeline for FilePipeline {
    async fn process(&mut self, file_id: FileId) -> Result<(), Error> {
        let file = self
            .db
            .get_file(file_id)
            .await?
            .ok_or_else(|| Error::not_found("File", file_id))?;

        if file.submission_id != self.submission.id {
            return Err(Error::InvalidInput(format!(
                "File {} belongs to submission {}, not {}",
                file_id, file.submission_id, self.submission.id
            )));
        }

        debug!(
            "FilePipeline [{}]: processing {} file {}",
            self.submission.id, file.kind, file.name
        );
        match file.kind {
            FileKind::Archive => self.process_archive(file).await,
            _ => self.process_member(file).await,
        }
    }

    async fn close(self: Box<Self>) -> Result<(), Error> {
        remove_scratch(&self.root).await;
        info!("FilePipeline [{}]: closed", self.submission.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Cursor, Write},
        sync::Mutex,
    };

    use gradeline_common::{
        state::MemoryDb,
        submission::ProjectId,
        tool::Outcome,
    };
    use zip::write::SimpleFileOptions;

    use super::*;

    /// Records every run and passes unless told otherwise.
    #[derive(Debug)]
    struct FakeTool {
        name: String,
        outcome: Outcome,
        runs: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, file_id: FileId, target: &Target) -> Result<ToolResult, Error> {
            assert!(target.file_path().exists());
            self.runs
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, target.name));
            Ok(ToolResult::new(file_id, &self.name, self.outcome, ""))
        }
    }

    #[derive(Debug)]
    struct FixedToolchain(Toolchain);

    #[async_trait]
    impl ToolchainSource for FixedToolchain {
        async fn toolchain(&self, _: &Submission, _: &Path) -> Result<Toolchain, Error> {
            Ok(self.0.clone())
        }
    }

    struct Fixture {
        db: Arc<MemoryDb>,
        runs: Arc<Mutex<Vec<String>>>,
        factory: FilePipelineFactory,
        submission: Submission,
        scratch: tempfile::TempDir,
    }

    async fn fixture(compiles: bool) -> Fixture {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let tool = |name: &str, outcome: Outcome| -> Arc<dyn Tool> {
            Arc::new(FakeTool {
                name: name.to_string(),
                outcome,
                runs: runs.clone(),
            })
        };

        let compile_outcome = if compiles { Outcome::Passed } else { Outcome::Failed };
        let toolchain = Toolchain {
            compiler: Some(tool("javac", compile_outcome)),
            tests: vec![tool("junit:AllTests", Outcome::Failed)],
            analyzers: vec![tool("pmd", Outcome::Passed), tool("checkstyle", Outcome::Passed)],
            user_test: Some(tool("user_junit", Outcome::Passed)),
        };

        let db = Arc::new(MemoryDb::new());
        let submission = Submission {
            id: SubmissionId::new(),
            project_id: ProjectId::new(),
            user: "student".to_string(),
        };
        db.add_submission(&submission).await.unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let factory = FilePipelineFactory::new(
            db.clone(),
            Arc::new(FixedToolchain(toolchain)),
            scratch.path(),
        );

        Fixture {
            db,
            runs,
            factory,
            submission,
            scratch,
        }
    }

    impl Fixture {
        async fn store(&self, name: &str, kind: FileKind, num: u64, data: Vec<u8>) -> StoredFile {
            let file = StoredFile::new(self.submission.id, name, "za.ac", kind, num, data);
            self.db.add_file(&file).await.unwrap();
            file
        }

        fn runs(&self) -> Vec<String> {
            self.runs.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_source_runs_compile_tests_then_analyzers() {
        let fx = fixture(true).await;
        let file = fx.store("Triangle.java", FileKind::Source, 1, b"class T {}".to_vec()).await;

        let mut pipeline = fx.factory.open(fx.submission.id).await.unwrap();
        pipeline.process(file.id).await.unwrap();

        assert_eq!(
            fx.runs(),
            vec![
                "javac:Triangle.java",
                "junit:AllTests:Triangle.java",
                "pmd:Triangle.java",
                "checkstyle:Triangle.java",
            ]
        );
        let stored = fx.db.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.results.len(), 4);
        pipeline.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_compile_failure_short_circuits() {
        let fx = fixture(false).await;
        let file = fx.store("Broken.java", FileKind::Source, 1, b"class {".to_vec()).await;

        let mut pipeline = fx.factory.open(fx.submission.id).await.unwrap();
        pipeline.process(file.id).await.unwrap();

        assert_eq!(fx.runs(), vec!["javac:Broken.java"]);
        let stored = fx.db.get_file(file.id).await.unwrap().unwrap();
        let result_id = stored.results["javac"];
        let result = fx.db.get_result(result_id).await.unwrap().unwrap();
        assert_eq!(result.outcome, Outcome::Failed);
    }

    #[tokio::test]
    async fn test_rerun_skips_existing_results() {
        let fx = fixture(true).await;
        let file = fx.store("Triangle.java", FileKind::Source, 1, b"class T {}".to_vec()).await;

        let mut pipeline = fx.factory.open(fx.submission.id).await.unwrap();
        pipeline.process(file.id).await.unwrap();
        let results_after_first = fx.db.result_count().await;

        pipeline.process(file.id).await.unwrap();
        assert_eq!(fx.db.result_count().await, results_after_first);
        // Only the compiler runs again; its result is replaced, not added.
        assert_eq!(fx.runs().len(), 5);
        assert_eq!(fx.runs()[4], "javac:Triangle.java");

        // Deleting one result makes just that tool run again.
        fx.db.delete_result(file.id, "pmd").await.unwrap();
        pipeline.process(file.id).await.unwrap();
        assert_eq!(fx.runs()[5..], ["javac:Triangle.java", "pmd:Triangle.java"]);
        assert_eq!(fx.db.result_count().await, results_after_first);
    }

    #[tokio::test]
    async fn test_archive_members_are_stored_and_processed() {
        let fx = fixture(true).await;

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in [
            ("src_za_ac_Triangle.java_1_c", b"class T {}".as_slice()),
            ("src_za_ac_Triangle.java_2_c", b"class T { int a; }".as_slice()),
            ("src_za_ac_Triangle.java_3_l", b"".as_slice()),
            ("garbage", b"?".as_slice()),
        ] {
            writer.start_file(name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        let data = writer.finish().unwrap().into_inner();

        // Member 1 was already stored by an earlier upload.
        let existing = fx.store("Triangle.java", FileKind::Source, 1, b"class T {}".to_vec()).await;
        let archive = fx.store("upload.zip", FileKind::Archive, 0, data).await;

        let mut pipeline = fx.factory.open(fx.submission.id).await.unwrap();
        pipeline.process(archive.id).await.unwrap();

        let files = fx.db.list_files(fx.submission.id).await.unwrap();
        let nums: Vec<u64> = files.iter().map(|f| f.num).collect();
        assert_eq!(nums, vec![1, 2, 3]);
        assert_eq!(files[0].id, existing.id);
        assert_eq!(files[2].kind, FileKind::Launch);
        assert!(fx.db.get_file(archive.id).await.unwrap().is_none());

        // Two source members, each compiled, tested and analysed.
        assert_eq!(fx.runs().iter().filter(|r| r.starts_with("javac")).count(), 2);
    }

    #[tokio::test]
    async fn test_user_test_file_is_compiled_then_run() {
        let fx = fixture(true).await;
        let file = fx.store("MyTest.java", FileKind::Test, 4, b"class MyTest {}".to_vec()).await;

        let mut pipeline = fx.factory.open(fx.submission.id).await.unwrap();
        pipeline.process(file.id).await.unwrap();
        assert_eq!(fx.runs(), vec!["javac:MyTest.java", "user_junit:MyTest.java"]);
    }

    #[tokio::test]
    async fn test_close_removes_scratch_dir() {
        let fx = fixture(true).await;
        let pipeline = fx.factory.open(fx.submission.id).await.unwrap();
        let root = fx.scratch.path().join(fx.submission.id.to_string());
        assert!(root.join("src").exists());

        pipeline.close().await.unwrap();
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_unknown_submission() {
        let fx = fixture(true).await;
        let res = fx.factory.open(SubmissionId::new()).await;
        assert!(matches!(res, Err(Error::NotFound { .. })));
    }
}
