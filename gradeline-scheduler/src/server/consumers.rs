use std::sync::Arc;

use async_trait::async_trait;
use gradeline_common::{
    error::Error,
    request::{Request, RequestKind},
    state::{DatabaseTrait, FileDbTrait, SubmissionDbTrait},
    submission::{FileKind, SubmissionId},
};
use gradeline_mq::{Delivery, MessageConsumer, Replier};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scheduler::SchedulerHandle;

/// Answer to a START handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StartReply {
    /// Route the submission's file events and STOP to `file_key`.
    Accepted { file_key: String },
    Rejected { reason: String },
}

/// Registers submissions with the local scheduler and tells the
/// caller which key reaches this worker.
pub(super) struct StartConsumer {
    pub(super) scheduler: SchedulerHandle,
    pub(super) file_key: String,
}

#[async_trait]
impl MessageConsumer for StartConsumer {
    async fn consume(&mut self, delivery: &Delivery, replier: &Replier) -> Result<(), Error> {
        let reply = match Request::from_bytes(delivery.body()) {
            Ok(request) if request.kind == RequestKind::SubmissionStart => {
                match self.scheduler.submit(request.clone()).await {
                    Ok(()) => StartReply::Accepted {
                        file_key: self.file_key.clone(),
                    },
                    Err(e) => StartReply::Rejected {
                        reason: e.to_string(),
                    },
                }
            }
            Ok(request) => StartReply::Rejected {
                reason: format!("Expected SUBMISSION_START, got {}", request.kind),
            },
            Err(e) => StartReply::Rejected {
                reason: e.to_string(),
            },
        };

        if let StartReply::Rejected { reason } = &reply {
            warn!("StartConsumer: rejected start: {}", reason);
        }
        replier.reply(delivery, serde_json::to_vec(&reply)?).await
    }
}

/// Feeds file events and STOPs routed to this worker into the scheduler.
pub(super) struct FileConsumer {
    pub(super) scheduler: SchedulerHandle,
}

#[async_trait]
impl MessageConsumer for FileConsumer {
    async fn consume(&mut self, delivery: &Delivery, _replier: &Replier) -> Result<(), Error> {
        let request = Request::from_bytes(delivery.body())?;
        debug!(
            "FileConsumer: {} for submission {}",
            request.kind, request.submission_id
        );
        self.scheduler.submit(request).await
    }
}

/// Re-runs a stored submission through the local scheduler.
pub(super) struct RedoConsumer {
    pub(super) scheduler: SchedulerHandle,
    pub(super) db: Arc<dyn DatabaseTrait>,
}

impl RedoConsumer {
    async fn redo(&self, submission_id: SubmissionId) -> Result<(), Error> {
        self.db
            .get_submission(submission_id)
            .await?
            .ok_or_else(|| Error::not_found("Submission", submission_id))?;

        let files = self.db.list_files(submission_id).await?;
        let (tests, others): (Vec<_>, Vec<_>) = files
            .into_iter()
            .filter(|file| file.kind.can_process())
            .partition(|file| file.kind == FileKind::Test);

        info!(
            "RedoConsumer: redoing submission {} with {} files and {} tests",
            submission_id,
            others.len(),
            tests.len()
        );

        self.scheduler
            .submit(Request::start_submission(submission_id))
            .await?;
        for file in others.iter().chain(tests.iter()) {
            if let Err(e) = self.scheduler.submit(Request::for_file(file)?).await {
                warn!(
                    "RedoConsumer: failed to queue file {} of submission {}: {}",
                    file.id, submission_id, e
                );
            }
        }
        self.scheduler
            .submit(Request::stop_submission(submission_id))
            .await
    }
}

#[async_trait]
impl MessageConsumer for RedoConsumer {
    async fn consume(&mut self, delivery: &Delivery, _replier: &Replier) -> Result<(), Error> {
        let submission_id: SubmissionId = serde_json::from_slice(delivery.body())?;
        self.redo(submission_id).await
    }
}
