use std::sync::Arc;

use gradeline_common::{error::Error, state::DatabaseTrait};
use gradeline_mq::{
    Connection, Connector, HandlerControl, MessageHandler, QueueBinding, topology::worker_file_key,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::scheduler::SchedulerHandle;

mod consumers;

pub use consumers::StartReply;
use consumers::{FileConsumer, RedoConsumer, StartConsumer};

/// A name for this process that other workers will not share.
pub fn worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "worker".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

/// The broker-facing side of one scheduler process.
/// ---
/// Consumes the shared start and redo queues plus this worker's own
/// file queue, all over one connection.
pub struct Worker {
    id: String,
    conn: Arc<dyn Connection>,
    controls: Vec<HandlerControl>,
    tasks: Vec<JoinHandle<Result<(), Error>>>,
}

impl Worker {
    pub async fn start(
        id: impl Into<String>,
        connector: &dyn Connector,
        prefetch_count: u16,
        scheduler: SchedulerHandle,
        db: Arc<dyn DatabaseTrait>,
    ) -> Result<Self, Error> {
        let id = id.into();
        let conn = connector.connect().await?;
        let mut worker = Self {
            id,
            conn,
            controls: Vec::new(),
            tasks: Vec::new(),
        };

        if let Err(e) = worker.subscribe(prefetch_count, scheduler, db).await {
            error!("Worker [{}]: failed to subscribe: {}", worker.id, e);
            if let Err(stop_err) = worker.stop().await {
                warn!("Worker: failed to clean up: {}", stop_err);
            }
            return Err(e);
        }

        info!("Worker [{}]: consuming submissions", worker.id);
        Ok(worker)
    }

    async fn subscribe(
        &mut self,
        prefetch_count: u16,
        scheduler: SchedulerHandle,
        db: Arc<dyn DatabaseTrait>,
    ) -> Result<(), Error> {
        // The file queue must exist before any START is answered with its key.
        let files = MessageHandler::on_connection(
            format!("files-{}", self.id),
            &self.conn,
            QueueBinding::worker_files(&self.id).with_prefetch(prefetch_count),
            Box::new(FileConsumer {
                scheduler: scheduler.clone(),
            }),
        )
        .await?;
        self.launch(files);

        let start = MessageHandler::on_connection(
            format!("start-{}", self.id),
            &self.conn,
            QueueBinding::start().with_prefetch(prefetch_count),
            Box::new(StartConsumer {
                scheduler: scheduler.clone(),
                file_key: worker_file_key(&self.id),
            }),
        )
        .await?;
        self.launch(start);

        let redo = MessageHandler::on_connection(
            format!("redo-{}", self.id),
            &self.conn,
            QueueBinding::redo().with_prefetch(prefetch_count),
            Box::new(RedoConsumer { scheduler, db }),
        )
        .await?;
        self.launch(redo);
        Ok(())
    }

    fn launch(&mut self, handler: MessageHandler) {
        let (control, task) = handler.spawn();
        self.controls.push(control);
        self.tasks.push(task);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_key(&self) -> String {
        worker_file_key(&self.id)
    }

    /// Stops consuming; deliveries already handed over finish first.
    pub async fn stop(self) -> Result<(), Error> {
        let mut first_err = None;
        for control in &self.controls {
            if let Err(e) = control.shutdown().await {
                warn!("Worker [{}]: failed to stop {}: {}", self.id, control.name(), e);
                first_err.get_or_insert(e);
            }
        }

        for task in self.tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Worker [{}]: handler ended with: {}", self.id, e),
                Err(e) => warn!("Worker [{}]: handler panicked: {:?}", self.id, e),
            }
        }

        if let Err(e) = self.conn.close().await {
            first_err.get_or_insert(e);
        }
        info!("Worker [{}]: stopped", self.id);
        first_err.map_or(Ok(()), Err)
    }
}
