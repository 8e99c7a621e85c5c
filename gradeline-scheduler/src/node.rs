use std::sync::Arc;

use gradeline_common::{error::Error, state::DatabaseTrait};
use gradeline_mq::{Connector, ProducerRegistry};
use gradeline_status::{ChangeNotifier, StatusService};
use tracing::{info, warn};

use crate::{
    config::GradelineConfig,
    pipeline::{FilePipelineFactory, ToolchainProvider},
    scheduler::{SchedulerConfig, SchedulerHandle, default::Scheduler},
    server::{Worker, worker_id},
};

/// Everything one worker process runs, wired together.
pub struct Node {
    registry: Arc<ProducerRegistry>,
    status: StatusService,
    scheduler: SchedulerHandle,
    worker: Worker,
}

impl Node {
    /// Starts the status aggregator, the scheduler and the broker consumers.
    /// ---
    /// Any failure here is fatal; whatever was already started is torn down.
    pub async fn start(
        config: &GradelineConfig,
        connector: Arc<dyn Connector>,
        db: Arc<dyn DatabaseTrait>,
    ) -> Result<Self, Error> {
        let prefetch_count = config.broker.prefetch_count;
        let registry = Arc::new(ProducerRegistry::new(connector.clone(), prefetch_count));

        let status = StatusService::new(connector.clone(), prefetch_count);
        let monitor_id = status.monitor_status().await?;
        info!("Node: status monitor {} running", monitor_id);

        let notifier = match ChangeNotifier::new(&registry).await {
            Ok(notifier) => notifier,
            Err(e) => {
                Self::abort(&status, &registry).await;
                return Err(e);
            }
        };

        let toolchains = ToolchainProvider::new(config.tools.clone(), db.clone());
        let pipelines = FilePipelineFactory::new(
            db.clone(),
            Arc::new(toolchains),
            config.scheduler.scratch_dir.clone(),
        );
        let scheduler = Scheduler::start(
            SchedulerConfig {
                max_procs: config.scheduler.max_procs,
                max_queue_depth: config.scheduler.max_queue_depth,
                max_orphan_files: config.scheduler.max_orphan_files,
                abandon_after: config.scheduler.abandon_after(),
            },
            Arc::new(pipelines),
            notifier,
        );

        let worker = match Worker::start(
            worker_id(),
            connector.as_ref(),
            prefetch_count,
            scheduler.clone(),
            db,
        )
        .await
        {
            Ok(worker) => worker,
            Err(e) => {
                if let Err(stop_err) = scheduler.shutdown().await {
                    warn!("Node: failed to stop scheduler: {}", stop_err);
                }
                Self::abort(&status, &registry).await;
                return Err(e);
            }
        };

        info!("Node: worker {} ready", worker.id());
        Ok(Self {
            registry,
            status,
            scheduler,
            worker,
        })
    }

    async fn abort(status: &StatusService, registry: &ProducerRegistry) {
        if let Err(e) = status.stop().await {
            warn!("Node: failed to stop status monitor: {}", e);
        }
        if let Err(e) = registry.stop_all().await {
            warn!("Node: failed to stop producers: {}", e);
        }
    }

    pub fn registry(&self) -> Arc<ProducerRegistry> {
        self.registry.clone()
    }

    pub fn scheduler(&self) -> SchedulerHandle {
        self.scheduler.clone()
    }

    pub fn worker_id(&self) -> &str {
        self.worker.id()
    }

    /// Stops consuming, drains the scheduler, then closes broker resources.
    pub async fn shutdown(self) -> Result<(), Error> {
        info!("Node: shutting down worker {}", self.worker.id());
        let mut first_err = None;

        if let Err(e) = self.worker.stop().await {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.scheduler.shutdown().await {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.status.stop().await {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.registry.stop_all().await {
            first_err.get_or_insert(e);
        }

        info!("Node: shut down");
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gradeline_common::{
        state::{FileDbTrait, MemoryDb, SubmissionDbTrait},
        submission::{FileKind, ProjectId, StoredFile, Submission, SubmissionId},
    };
    use gradeline_mq::MemoryBroker;
    use gradeline_status::{get_status, wait_idle};

    use super::*;
    use crate::submitter::Submitter;

    #[tokio::test]
    async fn test_submission_flows_through_a_node() {
        let scratch = tempfile::tempdir().unwrap();
        let mut config = GradelineConfig::default();
        config.scheduler.max_procs = 1;
        config.scheduler.scratch_dir = scratch.path().to_path_buf();

        let broker = MemoryBroker::new();
        let db = Arc::new(MemoryDb::new());
        let node = Node::start(&config, Arc::new(broker.clone()), db.clone())
            .await
            .unwrap();

        let submission = Submission {
            id: SubmissionId::new(),
            project_id: ProjectId::new(),
            user: "student".to_string(),
        };
        db.add_submission(&submission).await.unwrap();
        let file = StoredFile::new(submission.id, "A.java", "za.ac", FileKind::Source, 1, b"class A {}".to_vec());
        db.add_file(&file).await.unwrap();

        let submitter = Submitter::new(node.registry(), Duration::from_secs(5));
        submitter.start_submission(submission.id).await.unwrap();
        submitter.add_file(&file).await.unwrap();
        submitter.end_submission(submission.id).await.unwrap();

        // Wait until the aggregator has seen the submission, then until it drains.
        for _ in 0..100 {
            let status = get_status(&node.registry(), Duration::from_secs(5)).await.unwrap();
            if !status.submissions.is_empty() || status.file_count > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let idle = wait_idle(&node.registry(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(idle.is_idle());

        node.shutdown().await.unwrap();
        assert!(!scratch.path().join(submission.id.to_string()).exists());
    }
}
