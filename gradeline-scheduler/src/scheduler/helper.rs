use std::{collections::VecDeque, sync::Arc};

use gradeline_common::{
    error::Error,
    request::{Request, RequestKind},
    submission::{FileId, SubmissionId},
};
use gradeline_status::ChangeNotifier;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::pipeline::{PipelineFactory, SubmissionPipeline};

use super::{HelperInput, SchedulerEvent, SubmissionState, Transition};

/// Runs one admitted submission's files through its pipeline.
/// ---
/// Files are processed one at a time. Test files wait until STOP has
/// arrived and every source and archive file has been processed.
pub(super) struct Helper {
    submission_id: SubmissionId,
    state: SubmissionState,
    done: bool,
    file_queue: VecDeque<FileId>,
    test_queue: VecDeque<FileId>,
    inbox: mpsc::UnboundedReceiver<HelperInput>,
    pipelines: Arc<dyn PipelineFactory>,
    notifier: ChangeNotifier,
    event_tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl Helper {
    pub(super) fn new(
        submission_id: SubmissionId,
        inbox: mpsc::UnboundedReceiver<HelperInput>,
        pipelines: Arc<dyn PipelineFactory>,
        notifier: ChangeNotifier,
        event_tx: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        Self {
            submission_id,
            state: SubmissionState::Running,
            done: false,
            file_queue: VecDeque::new(),
            test_queue: VecDeque::new(),
            inbox,
            pipelines,
            notifier,
            event_tx,
        }
    }

    fn settle(&mut self, transition: Transition) -> Result<(), Error> {
        let next = self.state.next(transition)?;
        if next != self.state {
            debug!(
                "Helper [{}]: {} -> {} on {}",
                self.submission_id, self.state, next, transition
            );
        }
        self.state = next;
        Ok(())
    }

    fn enqueue(&mut self, input: HelperInput) -> Result<(), Error> {
        match input {
            HelperInput::File { file_id, kind } => {
                if kind == RequestKind::TestAdd {
                    self.test_queue.push_back(file_id);
                } else {
                    self.file_queue.push_back(file_id);
                }
                self.settle(Transition::FileAdded)
            }
            HelperInput::Done => {
                self.done = true;
                self.settle(Transition::Stop)
            }
        }
    }

    fn next_file(&mut self) -> Option<FileId> {
        if let Some(file_id) = self.file_queue.pop_front() {
            return Some(file_id);
        }
        if self.done {
            return self.test_queue.pop_front();
        }
        None
    }

    pub(super) async fn run(mut self) -> Result<(), Error> {
        let mut pipeline = match self.pipelines.open(self.submission_id).await {
            Ok(pipeline) => Some(pipeline),
            Err(e) => {
                error!(
                    "Helper [{}]: failed to open pipeline, its files will be dropped: {}",
                    self.submission_id, e
                );
                None
            }
        };

        let result = self.run_loop(pipeline.as_deref_mut()).await;

        if let Some(pipeline) = pipeline {
            if let Err(e) = pipeline.close().await {
                warn!(
                    "Helper [{}]: failed to close pipeline: {}",
                    self.submission_id, e
                );
            }
        }

        if result.is_ok() {
            info!("Helper [{}]: submission finished", self.submission_id);
        }
        result
    }

    async fn run_loop(
        &mut self,
        mut pipeline: Option<&mut (dyn SubmissionPipeline + 'static)>,
    ) -> Result<(), Error> {
        loop {
            while let Ok(input) = self.inbox.try_recv() {
                self.enqueue(input)?;
            }

            if let Some(file_id) = self.next_file() {
                self.process(pipeline.as_deref_mut(), file_id).await;
                continue;
            }

            if self.state == SubmissionState::Running {
                self.settle(Transition::QueueEmpty)?;
            }

            if self.done {
                return self.settle(Transition::Finish);
            }

            match self.inbox.recv().await {
                Some(input) => self.enqueue(input)?,
                None => {
                    // The scheduler went away without sending STOP.
                    warn!(
                        "Helper [{}]: inbox closed before STOP, finishing",
                        self.submission_id
                    );
                    self.done = true;
                    self.settle(Transition::Stop)?;
                }
            }
        }
    }

    async fn process(
        &mut self,
        pipeline: Option<&mut (dyn SubmissionPipeline + 'static)>,
        file_id: FileId,
    ) {
        match pipeline {
            Some(pipeline) => {
                if let Err(e) = pipeline.process(file_id).await {
                    error!(
                        "Helper [{}]: failed to process file {}: {}",
                        self.submission_id, file_id, e
                    );
                }
            }
            None => debug!(
                "Helper [{}]: dropping file {} without a pipeline",
                self.submission_id, file_id
            ),
        }

        self.notifier
            .notify(&Request::remove_file(self.submission_id, file_id))
            .await;

        let event = SchedulerEvent::FileProcessed {
            submission_id: self.submission_id,
            file_id,
        };
        if self.event_tx.send(event).is_err() {
            debug!(
                "Helper [{}]: scheduler gone, not reporting file {}",
                self.submission_id, file_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use gradeline_mq::{MemoryBroker, ProducerRegistry};

    use super::*;

    #[derive(Debug, Default)]
    struct Counting {
        processed: Arc<Mutex<Vec<FileId>>>,
    }

    struct CountingPipeline {
        processed: Arc<Mutex<Vec<FileId>>>,
    }

    #[async_trait]
    impl PipelineFactory for Counting {
        async fn open(&self, _: SubmissionId) -> Result<Box<dyn SubmissionPipeline>, Error> {
            Ok(Box::new(CountingPipeline {
                processed: self.processed.clone(),
            }))
        }
    }

    #[async_trait]
    impl SubmissionPipeline for CountingPipeline {
        async fn process(&mut self, file_id: FileId) -> Result<(), Error> {
            self.processed.lock().unwrap().push(file_id);
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_finishes_after_scheduler_is_gone() {
        let registry = ProducerRegistry::new(Arc::new(MemoryBroker::new()), 1);
        let notifier = ChangeNotifier::new(&registry).await.unwrap();
        let factory = Counting::default();
        let processed = factory.processed.clone();

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        drop(event_rx);

        let files = [FileId::new(), FileId::new()];
        for file_id in files {
            inbox_tx
                .send(HelperInput::File {
                    file_id,
                    kind: RequestKind::SrcAdd,
                })
                .unwrap();
        }
        inbox_tx.send(HelperInput::Done).unwrap();

        let helper = Helper::new(
            SubmissionId::new(),
            inbox_rx,
            Arc::new(factory),
            notifier,
            event_tx,
        );
        helper.run().await.unwrap();
        assert_eq!(*processed.lock().unwrap(), files.to_vec());
    }
}
