use std::{collections::HashMap, sync::Arc, time::Duration};

use gradeline_common::{
    error::Error,
    request::Request,
    submission::{StoredFile, SubmissionId},
};
use gradeline_mq::ProducerRegistry;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::server::StartReply;

/// Ingestion client used by front-ends to hand submissions to the workers.
/// ---
/// A START is answered by whichever worker picks it up. Every later
/// event of that submission is routed to the same worker through the
/// file key it replied with.
#[derive(Debug)]
pub struct Submitter {
    registry: Arc<ProducerRegistry>,
    rpc_timeout: Duration,
    file_keys: RwLock<HashMap<SubmissionId, String>>,
}

impl Submitter {
    pub fn new(registry: Arc<ProducerRegistry>, rpc_timeout: Duration) -> Self {
        Self {
            registry,
            rpc_timeout,
            file_keys: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a submission with some worker, returning that worker's file key.
    /// ---
    /// On a timeout the worker may still have accepted the START; it stops
    /// the submission itself once `abandon_after` passes without events.
    pub async fn start_submission(&self, submission_id: SubmissionId) -> Result<String, Error> {
        let starter = self.registry.submission_starter().await?;
        let body = Request::start_submission(submission_id).to_bytes()?;
        let reply = starter
            .receive_produce_timeout(&body, self.rpc_timeout)
            .await?;

        match serde_json::from_slice::<StartReply>(&reply)? {
            StartReply::Accepted { file_key } => {
                info!(
                    "Submitter: submission {} routed to {}",
                    submission_id, file_key
                );
                self.file_keys
                    .write()
                    .await
                    .insert(submission_id, file_key.clone());
                Ok(file_key)
            }
            StartReply::Rejected { reason } => Err(Error::Protocol(format!(
                "Submission {} was not started: {}",
                submission_id, reason
            ))),
        }
    }

    /// Queues a stored file; launch records are not processed and are skipped.
    pub async fn add_file(&self, file: &StoredFile) -> Result<(), Error> {
        if !file.kind.can_process() {
            debug!("Submitter: not queueing {} file {}", file.kind, file.id);
            return Ok(());
        }
        self.send(file.submission_id, Request::for_file(file)?).await
    }

    pub async fn end_submission(&self, submission_id: SubmissionId) -> Result<(), Error> {
        self.send(submission_id, Request::stop_submission(submission_id))
            .await?;
        self.file_keys.write().await.remove(&submission_id);
        Ok(())
    }

    /// Asks any worker to process a stored submission again.
    pub async fn redo_submission(&self, submission_id: SubmissionId) -> Result<(), Error> {
        let redoer = self.registry.submission_redoer().await?;
        redoer.produce(&serde_json::to_vec(&submission_id)?).await
    }

    async fn send(&self, submission_id: SubmissionId, request: Request) -> Result<(), Error> {
        let file_key = self
            .file_keys
            .read()
            .await
            .get(&submission_id)
            .cloned()
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "Submission {} has not been started by this client",
                    submission_id
                ))
            })?;

        let submitter = self.registry.file_submitter().await?;
        submitter.produce_to(&file_key, &request.to_bytes()?).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use gradeline_common::{
        state::{FileDbTrait, MemoryDb, SubmissionDbTrait},
        submission::{FileId, FileKind, ProjectId, Submission},
    };
    use gradeline_mq::MemoryBroker;
    use gradeline_status::ChangeNotifier;

    use super::*;
    use crate::{
        pipeline::{PipelineFactory, SubmissionPipeline},
        scheduler::{SchedulerConfig, SchedulerHandle, default::Scheduler},
        server::Worker,
    };

    type Processed = Arc<Mutex<Vec<FileId>>>;

    #[derive(Debug)]
    struct Recording(Processed);

    struct RecordingPipeline(Processed);

    #[async_trait]
    impl PipelineFactory for Recording {
        async fn open(&self, _: SubmissionId) -> Result<Box<dyn SubmissionPipeline>, Error> {
            Ok(Box::new(RecordingPipeline(self.0.clone())))
        }
    }

    #[async_trait]
    impl SubmissionPipeline for RecordingPipeline {
        async fn process(&mut self, file_id: FileId) -> Result<(), Error> {
            self.0.lock().unwrap().push(file_id);
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<(), Error> {
            Ok(())
        }
    }

    struct Deployment {
        submitter: Submitter,
        worker: Worker,
        scheduler: SchedulerHandle,
        db: Arc<MemoryDb>,
        processed: Processed,
    }

    async fn deploy() -> Deployment {
        let broker = MemoryBroker::new();
        let registry = Arc::new(ProducerRegistry::new(Arc::new(broker.clone()), 1));
        let processed: Processed = Arc::new(Mutex::new(Vec::new()));
        let db = Arc::new(MemoryDb::new());

        let scheduler = Scheduler::start(
            SchedulerConfig {
                max_procs: 2,
                max_queue_depth: 16,
                max_orphan_files: 16,
                abandon_after: None,
            },
            Arc::new(Recording(processed.clone())),
            ChangeNotifier::new(&registry).await.unwrap(),
        );
        let worker = Worker::start("test-worker", &broker, 1, scheduler.clone(), db.clone())
            .await
            .unwrap();

        Deployment {
            submitter: Submitter::new(registry, Duration::from_secs(5)),
            worker,
            scheduler,
            db,
            processed,
        }
    }

    impl Deployment {
        async fn wait_processed(&self, count: usize) -> Vec<FileId> {
            for _ in 0..200 {
                let processed = self.processed.lock().unwrap().clone();
                if processed.len() >= count {
                    return processed;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("only {:?} were processed", self.processed.lock().unwrap());
        }

        async fn teardown(self) {
            self.worker.stop().await.unwrap();
            self.scheduler.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_files_follow_their_start() {
        let d = deploy().await;
        let sid = SubmissionId::new();

        let file_key = d.submitter.start_submission(sid).await.unwrap();
        assert_eq!(file_key, d.worker.file_key());

        let src = StoredFile::new(sid, "A.java", "", FileKind::Source, 1, vec![]);
        let launch = StoredFile::new(sid, "A.java", "", FileKind::Launch, 2, vec![]);
        d.submitter.add_file(&src).await.unwrap();
        d.submitter.add_file(&launch).await.unwrap();
        d.submitter.end_submission(sid).await.unwrap();

        assert_eq!(d.wait_processed(1).await, vec![src.id]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(d.processed.lock().unwrap().len(), 1);
        d.teardown().await;
    }

    #[tokio::test]
    async fn test_file_without_start_is_rejected() {
        let d = deploy().await;
        let file = StoredFile::new(SubmissionId::new(), "A.java", "", FileKind::Source, 1, vec![]);
        let res = d.submitter.add_file(&file).await;
        assert!(matches!(res, Err(Error::Protocol(_))));
        d.teardown().await;
    }

    #[tokio::test]
    async fn test_duplicate_start_is_rejected() {
        let d = deploy().await;
        let sid = SubmissionId::new();
        d.submitter.start_submission(sid).await.unwrap();

        let res = d.submitter.start_submission(sid).await;
        assert!(matches!(res, Err(Error::Protocol(_))));

        d.submitter.end_submission(sid).await.unwrap();
        d.teardown().await;
    }

    #[tokio::test]
    async fn test_redo_replays_stored_files_with_tests_last() {
        let d = deploy().await;
        let submission = Submission {
            id: SubmissionId::new(),
            project_id: ProjectId::new(),
            user: "student".to_string(),
        };
        d.db.add_submission(&submission).await.unwrap();

        let test = StoredFile::new(submission.id, "ATest.java", "", FileKind::Test, 1, vec![]);
        let src = StoredFile::new(submission.id, "A.java", "", FileKind::Source, 2, vec![]);
        let launch = StoredFile::new(submission.id, "A.java", "", FileKind::Launch, 3, vec![]);
        for file in [&test, &src, &launch] {
            d.db.add_file(file).await.unwrap();
        }

        d.submitter.redo_submission(submission.id).await.unwrap();
        assert_eq!(d.wait_processed(2).await, vec![src.id, test.id]);
        d.teardown().await;
    }
}
