use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use gradeline_common::{
    error::Error,
    request::{Request, RequestKind},
    submission::{FileId, SubmissionId},
};
use strum_macros::Display;
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinError, JoinHandle},
};

pub mod default;
mod helper;

pub const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Submissions allowed to run at once.
    pub max_procs: usize,
    /// Files a single submission may have queued or in flight.
    pub max_queue_depth: usize,
    /// File events parked while their submission has not started.
    pub max_orphan_files: usize,
    /// An open submission with no new events for this long is stopped.
    /// `None` keeps submissions open until STOP.
    pub abandon_after: Option<Duration>,
}

/// Lifecycle of one submission inside the scheduler.
/// ---
/// The scheduler moves a submission from `Unregistered` to `Running`.
/// From then on its helper owns the state until `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SubmissionState {
    Unregistered,
    Queued,
    Running,
    /// No file is queued and STOP has not arrived yet.
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Transition {
    Start,
    Admit,
    FileAdded,
    Stop,
    QueueEmpty,
    Finish,
}

impl SubmissionState {
    pub fn next(self, transition: Transition) -> Result<Self, Error> {
        use SubmissionState::*;
        use Transition::*;

        let next = match (self, transition) {
            (Unregistered, Start) => Queued,
            (Queued, Admit) => Running,
            (Queued, FileAdded | Stop) => Queued,
            (Running, FileAdded | Stop) => Running,
            (Running, QueueEmpty) => Draining,
            (Draining, FileAdded) => Running,
            (Draining, Stop) => Draining,
            (Running | Draining, Finish) => Closed,
            (state, transition) => {
                return Err(Error::StateTransition(format!(
                    "{} is not allowed while {}",
                    transition, state
                )));
            }
        };
        Ok(next)
    }
}

pub enum SchedulerCommand {
    Submit {
        request: Request,
        /// Send `Ok` once the request is accepted, or the reason it was dropped
        response_oneshot: oneshot::Sender<Result<(), Error>>,
    },
    /// Stop accepting submissions and acknowledge once all have finished
    Shutdown { ack: oneshot::Sender<()> },
}

#[derive(Debug)]
pub enum SchedulerEvent {
    FileProcessed {
        submission_id: SubmissionId,
        file_id: FileId,
    },
}

/// What the scheduler forwards to a submission's helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperInput {
    File { file_id: FileId, kind: RequestKind },
    /// No more files will arrive.
    Done,
}

/// Cloneable entry point into a running [`default::Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub(crate) fn new(command_tx: mpsc::Sender<SchedulerCommand>) -> Self {
        Self { command_tx }
    }

    /// Hands a request to the scheduler and waits until it is accepted or rejected.
    pub async fn submit(&self, request: Request) -> Result<(), Error> {
        let (response_oneshot, response_rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::Submit {
                request,
                response_oneshot,
            })
            .await
            .map_err(|_| Error::ChannelComm("Scheduler is no longer running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::ChannelComm("Scheduler dropped the request".to_string()))?
    }

    /// Drains the scheduler: no new submissions, running and queued ones finish.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let (ack, ack_rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::Shutdown { ack })
            .await
            .map_err(|_| Error::ChannelComm("Scheduler is no longer running".to_string()))?;

        ack_rx
            .await
            .map_err(|_| Error::ChannelComm("Scheduler exited before acknowledging".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

pub struct MonitoredHelper {
    submission_id: SubmissionId,
    handle: JoinHandle<Result<(), Error>>,
}

impl Future for MonitoredHelper {
    type Output = (SubmissionId, Result<Result<(), Error>, JoinError>);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(join_result) => Poll::Ready((self.submission_id, join_result)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = SubmissionState::Unregistered;
        for transition in [
            Transition::Start,
            Transition::FileAdded,
            Transition::Admit,
            Transition::QueueEmpty,
            Transition::FileAdded,
            Transition::QueueEmpty,
            Transition::Stop,
            Transition::Finish,
        ] {
            state = state.next(transition).unwrap();
        }
        assert_eq!(state, SubmissionState::Closed);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(matches!(
            SubmissionState::Unregistered.next(Transition::Stop),
            Err(Error::StateTransition(_))
        ));
        assert!(SubmissionState::Queued.next(Transition::Start).is_err());
        assert!(SubmissionState::Queued.next(Transition::Finish).is_err());
        assert!(SubmissionState::Closed.next(Transition::FileAdded).is_err());
        assert!(SubmissionState::Running.next(Transition::Admit).is_err());
    }
}
