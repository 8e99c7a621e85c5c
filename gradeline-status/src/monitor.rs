use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{StreamExt, stream::FuturesUnordered};
use gradeline_common::{error::Error, request::Request, status::Status};
use gradeline_mq::{
    Connection, Connector, Delivery, HandlerControl, MessageConsumer, MessageHandler,
    QueueBinding, Replier,
};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::{JoinError, JoinHandle},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMMAND_BUFFER: usize = 256;

pub enum MonitorCommand {
    Apply(Request),
    Load {
        /// Receives the status at the time the command is handled
        response_oneshot: oneshot::Sender<Status>,
    },
    WaitIdle {
        /// Receives the status once `file_count` drops to zero
        response_oneshot: oneshot::Sender<Status>,
    },
}

/// Owns the status and serves every role from one event loop.
struct StatusLoop {
    monitor_id: Uuid,
    status: Status,
    waiters: Vec<oneshot::Sender<Status>>,
    command_rx: mpsc::Receiver<MonitorCommand>,
}

impl StatusLoop {
    async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            match command {
                MonitorCommand::Apply(request) => {
                    if let Err(e) = self.status.apply(&request) {
                        warn!("Monitor [{}]: ignoring change event: {}", self.monitor_id, e);
                        continue;
                    }
                    debug_assert!(self.status.is_consistent());
                    self.release_waiters();
                }
                MonitorCommand::Load { response_oneshot } => {
                    let _ = response_oneshot.send(self.status.clone());
                }
                MonitorCommand::WaitIdle { response_oneshot } => {
                    self.waiters.push(response_oneshot);
                    self.release_waiters();
                }
            }
        }

        if !self.waiters.is_empty() {
            warn!(
                "Monitor [{}]: dropping {} pending idle waits",
                self.monitor_id,
                self.waiters.len()
            );
        }
        info!("Monitor [{}]: status loop stopped", self.monitor_id);
    }

    fn release_waiters(&mut self) {
        if !self.status.is_idle() {
            return;
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(self.status.clone());
        }
    }
}

/// Folds broadcast change events into the status.
struct Changer {
    command_tx: mpsc::Sender<MonitorCommand>,
}

#[async_trait]
impl MessageConsumer for Changer {
    async fn consume(&mut self, delivery: &Delivery, _replier: &Replier) -> Result<(), Error> {
        let request = Request::from_bytes(delivery.body())?;
        self.command_tx
            .send(MonitorCommand::Apply(request))
            .await
            .map_err(|e| Error::ChannelComm(e.to_string()))
    }
}

/// Answers status queries with the current snapshot.
struct Loader {
    command_tx: mpsc::Sender<MonitorCommand>,
}

#[async_trait]
impl MessageConsumer for Loader {
    async fn consume(&mut self, delivery: &Delivery, replier: &Replier) -> Result<(), Error> {
        let (response_oneshot, response_rx) = oneshot::channel();
        self.command_tx
            .send(MonitorCommand::Load { response_oneshot })
            .await
            .map_err(|e| Error::ChannelComm(e.to_string()))?;

        let status = response_rx
            .await
            .map_err(|e| Error::ChannelComm(e.to_string()))?;
        replier.reply(delivery, serde_json::to_vec(&status)?).await
    }
}

/// Answers idle waits once nothing is queued or in flight.
/// ---
/// Each wait is answered from its own task so a long wait does
/// not hold up the ones queued behind it.
struct Waiter {
    command_tx: mpsc::Sender<MonitorCommand>,
}

#[async_trait]
impl MessageConsumer for Waiter {
    async fn consume(&mut self, delivery: &Delivery, replier: &Replier) -> Result<(), Error> {
        let pending = replier.reply_later(delivery)?;
        let (response_oneshot, response_rx) = oneshot::channel();
        self.command_tx
            .send(MonitorCommand::WaitIdle { response_oneshot })
            .await
            .map_err(|e| Error::ChannelComm(e.to_string()))?;

        tokio::spawn(async move {
            let Ok(status) = response_rx.await else {
                debug!("Waiter: monitor stopped before becoming idle");
                return;
            };

            let sent = match serde_json::to_vec(&status) {
                Ok(body) => pending.send(body).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = sent {
                warn!("Waiter: failed to answer idle wait: {}", e);
            }
        });
        Ok(())
    }
}

struct MonitoredRole {
    role: &'static str,
    handle: JoinHandle<Result<(), Error>>,
}

impl Future for MonitoredRole {
    type Output = (&'static str, Result<Result<(), Error>, JoinError>);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(join_result) => Poll::Ready((self.role, join_result)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One running status aggregator.
/// ---
/// The changer, loader and waiter roles share one broker connection
/// and feed a single event loop. If any role's subscription ends on
/// its own the whole monitor is torn down.
#[derive(Debug)]
pub struct Monitor {
    id: Uuid,
    controls: Vec<HandlerControl>,
    supervisor: JoinHandle<()>,
    event_loop: JoinHandle<()>,
    stopping: Arc<AtomicBool>,
}

impl Monitor {
    pub async fn start(connector: &dyn Connector, prefetch_count: u16) -> Result<Self, Error> {
        let id = Uuid::new_v4();
        let conn = connector.connect().await?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let handlers = match Self::subscribe(&conn, command_tx, prefetch_count).await {
            Ok(handlers) => handlers,
            Err(e) => {
                error!("Monitor [{}]: failed to subscribe: {}", id, e);
                if let Err(close_err) = conn.close().await {
                    warn!("Monitor [{}]: failed to close connection: {}", id, close_err);
                }
                return Err(e);
            }
        };

        let event_loop = tokio::spawn(
            StatusLoop {
                monitor_id: id,
                status: Status::new(),
                waiters: Vec::new(),
                command_rx,
            }
            .run(),
        );

        let controls: Vec<HandlerControl> = handlers.iter().map(|(_, h)| h.control()).collect();
        let roles: FuturesUnordered<MonitoredRole> = handlers
            .into_iter()
            .map(|(role, handler)| MonitoredRole {
                role,
                handle: tokio::spawn(handler.handle()),
            })
            .collect();

        let stopping = Arc::new(AtomicBool::new(false));
        let supervisor = tokio::spawn(Self::supervise(
            id,
            conn,
            roles,
            controls.clone(),
            stopping.clone(),
        ));

        info!("Monitor [{}]: started", id);
        Ok(Self {
            id,
            controls,
            supervisor,
            event_loop,
            stopping,
        })
    }

    async fn subscribe(
        conn: &Arc<dyn Connection>,
        command_tx: mpsc::Sender<MonitorCommand>,
        prefetch_count: u16,
    ) -> Result<Vec<(&'static str, MessageHandler)>, Error> {
        let mut handlers = Vec::with_capacity(3);
        let roles: [(&'static str, QueueBinding, Box<dyn MessageConsumer>); 3] = [
            (
                "changer",
                QueueBinding::change(),
                Box::new(Changer {
                    command_tx: command_tx.clone(),
                }),
            ),
            (
                "loader",
                QueueBinding::status_request(),
                Box::new(Loader {
                    command_tx: command_tx.clone(),
                }),
            ),
            ("waiter", QueueBinding::wait_request(), Box::new(Waiter { command_tx })),
        ];

        for (role, binding, consumer) in roles {
            let binding = binding.with_prefetch(prefetch_count);
            match MessageHandler::on_connection(role, conn, binding, consumer).await {
                Ok(handler) => handlers.push((role, handler)),
                Err(e) => {
                    for (_, created) in &handlers {
                        let _ = created.control().shutdown().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(handlers)
    }

    async fn supervise(
        id: Uuid,
        conn: Arc<dyn Connection>,
        mut roles: FuturesUnordered<MonitoredRole>,
        controls: Vec<HandlerControl>,
        stopping: Arc<AtomicBool>,
    ) {
        if let Some((role, outcome)) = roles.next().await {
            if !stopping.load(Ordering::Acquire) {
                error!(
                    "Monitor [{}]: {} role ended unexpectedly ({:?}), tearing down",
                    id,
                    role,
                    outcome.map(|res| res.err().map(|e| e.to_string()))
                );
                for control in &controls {
                    if let Err(e) = control.shutdown().await {
                        warn!("Monitor [{}]: failed to stop {}: {}", id, control.name(), e);
                    }
                }
            }
        }

        while let Some((role, outcome)) = roles.next().await {
            match outcome {
                Ok(Ok(())) => debug!("Monitor [{}]: {} role stopped", id, role),
                Ok(Err(e)) => warn!("Monitor [{}]: {} role failed: {}", id, role, e),
                Err(e) => error!("Monitor [{}]: {} role panicked: {:?}", id, role, e),
            }
        }

        if let Err(e) = conn.close().await {
            warn!("Monitor [{}]: failed to close connection: {}", id, e);
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_running(&self) -> bool {
        !self.supervisor.is_finished()
    }

    /// Stops all roles and waits for the event loop to finish.
    pub async fn stop(self) -> Result<(), Error> {
        self.stopping.store(true, Ordering::Release);
        info!("Monitor [{}]: stopping", self.id);

        let mut first_err = None;
        for control in &self.controls {
            if let Err(e) = control.shutdown().await {
                first_err.get_or_insert(e);
            }
        }

        self.supervisor
            .await
            .map_err(|e| Error::Internal(format!("Monitor supervisor panicked: {}", e)))?;
        self.event_loop
            .await
            .map_err(|e| Error::Internal(format!("Monitor status loop panicked: {}", e)))?;

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Holds at most one running [`Monitor`] for a process.
#[derive(Debug)]
pub struct StatusService {
    connector: Arc<dyn Connector>,
    prefetch_count: u16,
    current: Mutex<Option<Monitor>>,
}

impl StatusService {
    pub fn new(connector: Arc<dyn Connector>, prefetch_count: u16) -> Self {
        Self {
            connector,
            prefetch_count,
            current: Mutex::new(None),
        }
    }

    /// Starts a fresh monitor, stopping the previous one first.
    pub async fn monitor_status(&self) -> Result<Uuid, Error> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            let previous_id = previous.id();
            if let Err(e) = previous.stop().await {
                warn!("StatusService: previous monitor {} stopped uncleanly: {}", previous_id, e);
            }
        }

        let monitor = Monitor::start(self.connector.as_ref(), self.prefetch_count).await?;
        let id = monitor.id();
        *current = Some(monitor);
        Ok(id)
    }

    pub async fn is_running(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .map(Monitor::is_running)
            .unwrap_or(false)
    }

    pub async fn stop(&self) -> Result<(), Error> {
        match self.current.lock().await.take() {
            Some(monitor) => monitor.stop().await,
            None => Ok(()),
        }
    }
}
