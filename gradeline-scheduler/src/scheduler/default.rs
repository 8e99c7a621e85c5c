use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use futures::{StreamExt, stream::FuturesUnordered};
use gradeline_common::{
    error::Error,
    request::{Request, RequestKind},
    submission::{FileId, SubmissionId},
};
use gradeline_status::ChangeNotifier;
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pipeline::PipelineFactory;

use super::{
    COMMAND_BUFFER, HelperInput, MonitoredHelper, SchedulerCommand, SchedulerConfig,
    SchedulerEvent, SchedulerHandle, SubmissionState, Transition, helper::Helper,
};

/// The scheduler's bookkeeping for one registered submission.
struct ManagedSubmission {
    state: SubmissionState,
    /// STOP has been accepted; no more files may be added.
    done: bool,
    /// Files forwarded to the helper and not yet processed.
    outstanding: HashSet<FileId>,
    inbox_tx: mpsc::UnboundedSender<HelperInput>,
    /// Handed to the helper on admission.
    inbox_rx: Option<mpsc::UnboundedReceiver<HelperInput>>,
    last_event: Instant,
}

impl ManagedSubmission {
    fn new() -> Result<Self, Error> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Ok(Self {
            state: SubmissionState::Unregistered.next(Transition::Start)?,
            done: false,
            outstanding: HashSet::new(),
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            last_event: Instant::now(),
        })
    }

    fn forward(&self, input: HelperInput) -> Result<(), Error> {
        self.inbox_tx
            .send(input)
            .map_err(|_| Error::ChannelComm("Submission helper has exited".to_string()))
    }
}

/// Admits submissions in FIFO order and routes their files to helpers.
/// ---
/// All bookkeeping lives inside the event loop; the outside world talks
/// to it through a [`SchedulerHandle`]. At most `max_procs` helpers run
/// at once, and a freed slot goes to the oldest queued submission.
pub struct Scheduler {
    pub id: Uuid,
    config: SchedulerConfig,
    pipelines: Arc<dyn PipelineFactory>,
    notifier: ChangeNotifier,
    submissions: HashMap<SubmissionId, ManagedSubmission>,
    admission_queue: VecDeque<SubmissionId>,
    orphans: HashMap<SubmissionId, Vec<Request>>,
    orphan_count: usize,
    active_helper_tasks: FuturesUnordered<MonitoredHelper>,
    event_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    event_tx_template: mpsc::UnboundedSender<SchedulerEvent>, // Cloned for each helper
    command_rx: mpsc::Receiver<SchedulerCommand>,
    commands_closed: bool,
    draining: bool,
    shutdown_acks: Vec<oneshot::Sender<()>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        pipelines: Arc<dyn PipelineFactory>,
        notifier: ChangeNotifier,
    ) -> (Self, SchedulerHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let scheduler = Self {
            id: Uuid::new_v4(),
            config,
            pipelines,
            notifier,
            submissions: HashMap::new(),
            admission_queue: VecDeque::new(),
            orphans: HashMap::new(),
            orphan_count: 0,
            active_helper_tasks: FuturesUnordered::new(),
            event_rx,
            event_tx_template: event_tx,
            command_rx,
            commands_closed: false,
            draining: false,
            shutdown_acks: Vec::new(),
        };
        (scheduler, SchedulerHandle::new(command_tx))
    }

    /// Spawns the event loop, returning the handle to drive it.
    pub fn start(
        config: SchedulerConfig,
        pipelines: Arc<dyn PipelineFactory>,
        notifier: ChangeNotifier,
    ) -> SchedulerHandle {
        let (mut scheduler, handle) = Self::new(config, pipelines, notifier);
        tokio::spawn(async move {
            if let Err(e) = scheduler.run_main_loop().await {
                error!("Scheduler [{}]: main loop failed: {}", scheduler.id, e);
            }
        });
        handle
    }

    pub fn running(&self) -> usize {
        self.active_helper_tasks.len()
    }

    pub async fn run_main_loop(&mut self) -> Result<(), Error> {
        info!(
            "Scheduler [{}]: running with max_procs {}",
            self.id, self.config.max_procs
        );

        let mut reap_tick = tokio::time::interval(reap_period(self.config.abandon_after));
        reap_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.draining && self.is_drained() {
                info!("Scheduler [{}]: drained, exiting", self.id);
                for ack in self.shutdown_acks.drain(..) {
                    let _ = ack.send(());
                }
                return Ok(());
            }

            tokio::select! {
                biased;

                Some(event) = self.event_rx.recv() => self.on_event(event),

                Some((submission_id, join_outcome)) = self.active_helper_tasks.next(), if !self.active_helper_tasks.is_empty() => {
                    let failed = match join_outcome {
                        Ok(Ok(())) => false,
                        Ok(Err(e)) => {
                            error!(
                                "Scheduler [{}]: helper for submission {} failed: {}",
                                self.id, submission_id, e
                            );
                            true
                        }
                        Err(join_error) => {
                            error!(
                                "Scheduler [{}]: helper for submission {} panicked: {:?}",
                                self.id, submission_id, join_error
                            );
                            true
                        }
                    };
                    self.on_helper_finished(submission_id, failed).await;
                    self.admit();
                },

                _ = reap_tick.tick(), if self.config.abandon_after.is_some() && !self.draining => {
                    self.reap_abandoned().await;
                },

                maybe_command = self.command_rx.recv(), if !self.commands_closed => {
                    match maybe_command {
                        Some(SchedulerCommand::Submit { request, response_oneshot }) => {
                            let result = self.handle_request(request).await;
                            let _ = response_oneshot.send(result);
                        }
                        Some(SchedulerCommand::Shutdown { ack }) => {
                            self.shutdown_acks.push(ack);
                            self.begin_drain().await;
                        }
                        None => {
                            warn!("Scheduler [{}]: every handle was dropped, draining", self.id);
                            self.commands_closed = true;
                            self.begin_drain().await;
                        }
                    }
                }
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.active_helper_tasks.is_empty() && self.admission_queue.is_empty()
    }

    async fn handle_request(&mut self, request: Request) -> Result<(), Error> {
        let result = match request.kind {
            RequestKind::SubmissionStart => self.start_submission(request).await,
            RequestKind::SubmissionStop => self.stop_submission(request).await,
            RequestKind::SrcAdd | RequestKind::ArchiveAdd | RequestKind::TestAdd => {
                self.add_file(request).await
            }
            RequestKind::FileRemove => Err(Error::Protocol(format!(
                "{} is emitted by the scheduler, not accepted by it",
                request.kind
            ))),
        };

        if let Err(e) = &result {
            warn!("Scheduler [{}]: dropped request: {}", self.id, e);
        }
        result
    }

    async fn start_submission(&mut self, request: Request) -> Result<(), Error> {
        let submission_id = request.submission_id;
        if self.draining {
            return Err(Error::Protocol(format!(
                "Scheduler is shutting down, not starting submission {}",
                submission_id
            )));
        }
        if self.submissions.contains_key(&submission_id) {
            return Err(Error::Protocol(format!(
                "Submission {} has already started",
                submission_id
            )));
        }

        self.submissions
            .insert(submission_id, ManagedSubmission::new()?);
        self.notifier.notify(&request).await;
        self.admission_queue.push_back(submission_id);
        debug!(
            "Scheduler [{}]: queued submission {} behind {} others",
            self.id,
            submission_id,
            self.admission_queue.len() - 1
        );

        if let Some(parked) = self.orphans.remove(&submission_id) {
            self.orphan_count -= parked.len();
            info!(
                "Scheduler [{}]: replaying {} early file events for submission {}",
                self.id,
                parked.len(),
                submission_id
            );
            for early in parked {
                if let Err(e) = self.add_file(early).await {
                    warn!(
                        "Scheduler [{}]: dropped early file event for submission {}: {}",
                        self.id, submission_id, e
                    );
                }
            }
        }

        self.admit();
        Ok(())
    }

    async fn add_file(&mut self, request: Request) -> Result<(), Error> {
        let submission_id = request.submission_id;
        let file_id = request.required_file_id()?;

        let Some(submission) = self.submissions.get_mut(&submission_id) else {
            return self.park(request);
        };

        if submission.done {
            return Err(Error::Protocol(format!(
                "Submission {} has stopped, not adding file {}",
                submission_id, file_id
            )));
        }
        if submission.outstanding.len() >= self.config.max_queue_depth {
            return Err(Error::QueueFull {
                submission_id,
                limit: self.config.max_queue_depth,
            });
        }

        submission.state = submission.state.next(Transition::FileAdded)?;
        submission.outstanding.insert(file_id);
        submission.last_event = Instant::now();
        // The aggregator must see the add before the helper's remove.
        self.notifier.notify(&request).await;

        if let Some(submission) = self.submissions.get(&submission_id) {
            submission.forward(HelperInput::File {
                file_id,
                kind: request.kind,
            })?;
        }
        Ok(())
    }

    /// Holds a file event whose submission has not started yet.
    fn park(&mut self, request: Request) -> Result<(), Error> {
        if self.orphan_count >= self.config.max_orphan_files {
            return Err(Error::QueueFull {
                submission_id: request.submission_id,
                limit: self.config.max_orphan_files,
            });
        }

        debug!(
            "Scheduler [{}]: parking {} for unknown submission {}",
            self.id, request.kind, request.submission_id
        );
        self.orphan_count += 1;
        self.orphans
            .entry(request.submission_id)
            .or_default()
            .push(request);
        Ok(())
    }

    async fn stop_submission(&mut self, request: Request) -> Result<(), Error> {
        let submission_id = request.submission_id;
        let submission = self
            .submissions
            .get_mut(&submission_id)
            .ok_or_else(|| Error::Protocol(format!("Unknown submission {}", submission_id)))?;

        if submission.done {
            return Err(Error::Protocol(format!(
                "Submission {} has already stopped",
                submission_id
            )));
        }

        submission.state = submission.state.next(Transition::Stop)?;
        submission.done = true;
        submission.forward(HelperInput::Done)?;
        self.notifier.notify(&request).await;
        Ok(())
    }

    /// Stops open submissions that have gone quiet.
    /// ---
    /// Covers clients that lost the START reply and never send STOP,
    /// which would otherwise hold a slot forever.
    async fn reap_abandoned(&mut self) {
        let Some(limit) = self.config.abandon_after else {
            return;
        };

        let stale: Vec<SubmissionId> = self
            .submissions
            .iter()
            .filter(|(_, submission)| !submission.done && submission.last_event.elapsed() >= limit)
            .map(|(submission_id, _)| *submission_id)
            .collect();

        for submission_id in stale {
            warn!(
                "Scheduler [{}]: no events for submission {} in {:?}, stopping it",
                self.id, submission_id, limit
            );
            if let Err(e) = self
                .stop_submission(Request::stop_submission(submission_id))
                .await
            {
                warn!(
                    "Scheduler [{}]: failed to stop abandoned submission {}: {}",
                    self.id, submission_id, e
                );
            }
        }
    }

    /// Stops new STARTs and marks every submission done.
    async fn begin_drain(&mut self) {
        if !self.draining {
            info!(
                "Scheduler [{}]: draining {} running and {} queued submissions",
                self.id,
                self.running(),
                self.admission_queue.len()
            );
        }
        self.draining = true;

        if self.orphan_count > 0 {
            warn!(
                "Scheduler [{}]: discarding {} file events of submissions that never started",
                self.id, self.orphan_count
            );
            self.orphans.clear();
            self.orphan_count = 0;
        }

        let open: Vec<SubmissionId> = self
            .submissions
            .iter()
            .filter(|(_, submission)| !submission.done)
            .map(|(id, _)| *id)
            .collect();
        for submission_id in open {
            if let Err(e) = self
                .stop_submission(Request::stop_submission(submission_id))
                .await
            {
                warn!(
                    "Scheduler [{}]: failed to stop submission {}: {}",
                    self.id, submission_id, e
                );
            }
        }
    }

    fn on_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::FileProcessed {
                submission_id,
                file_id,
            } => {
                debug!(
                    "Scheduler [{}]: submission {} processed file {}",
                    self.id, submission_id, file_id
                );
                if let Some(submission) = self.submissions.get_mut(&submission_id) {
                    submission.outstanding.remove(&file_id);
                }
            }
        }
    }

    /// Forgets a finished submission.
    /// ---
    /// A helper that failed leaves files the aggregator still counts;
    /// their removals (and a STOP, if none was sent) are published here.
    async fn on_helper_finished(&mut self, submission_id: SubmissionId, failed: bool) {
        match self.submissions.remove(&submission_id) {
            Some(submission) => {
                if !submission.outstanding.is_empty() {
                    warn!(
                        "Scheduler [{}]: submission {} left {} files unprocessed",
                        self.id,
                        submission_id,
                        submission.outstanding.len()
                    );
                }
                for file_id in &submission.outstanding {
                    self.notifier
                        .notify(&Request::remove_file(submission_id, *file_id))
                        .await;
                }
                if failed && !submission.done {
                    self.notifier
                        .notify(&Request::stop_submission(submission_id))
                        .await;
                }

                let state = submission
                    .state
                    .next(Transition::Finish)
                    .unwrap_or(SubmissionState::Closed);
                info!(
                    "Scheduler [{}]: submission {} is {}, {} still running",
                    self.id,
                    submission_id,
                    state,
                    self.running()
                );
            }
            None => warn!(
                "Scheduler [{}]: finished helper for unknown submission {}",
                self.id, submission_id
            ),
        }
    }

    /// Starts queued submissions while there are free slots.
    fn admit(&mut self) {
        while self.running() < self.config.max_procs {
            let Some(submission_id) = self.admission_queue.pop_front() else {
                return;
            };
            let Some(submission) = self.submissions.get_mut(&submission_id) else {
                continue;
            };
            let Some(inbox_rx) = submission.inbox_rx.take() else {
                error!(
                    "Scheduler [{}]: submission {} was admitted twice",
                    self.id, submission_id
                );
                continue;
            };

            match submission.state.next(Transition::Admit) {
                Ok(state) => submission.state = state,
                Err(e) => {
                    error!("Scheduler [{}]: cannot admit {}: {}", self.id, submission_id, e);
                    continue;
                }
            }

            let helper = Helper::new(
                submission_id,
                inbox_rx,
                Arc::clone(&self.pipelines),
                self.notifier.clone(),
                self.event_tx_template.clone(),
            );
            let handle = tokio::spawn(helper.run());
            self.active_helper_tasks.push(MonitoredHelper {
                submission_id,
                handle,
            });

            info!(
                "Scheduler [{}]: admitted submission {} ({}/{} running)",
                self.id,
                submission_id,
                self.running(),
                self.config.max_procs
            );
        }
    }
}

/// How often to look for abandoned submissions.
fn reap_period(abandon_after: Option<Duration>) -> Duration {
    abandon_after
        .map(|limit| limit / 2)
        .unwrap_or(Duration::from_secs(60))
        .max(Duration::from_millis(10))
}
