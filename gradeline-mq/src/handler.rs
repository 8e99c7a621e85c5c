use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use gradeline_common::error::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    broker::{Channel, Connection, Connector, Delivery, Message, Subscription},
    topology::QueueBinding,
};

/// Server-side callback invoked once per delivery.
#[async_trait]
pub trait MessageConsumer: Send {
    async fn consume(&mut self, delivery: &Delivery, replier: &Replier) -> Result<(), Error>;
}

/// Publishes replies to RPC requests on the handler's exchange.
#[derive(Debug, Clone)]
pub struct Replier {
    channel: Arc<dyn Channel>,
    exchange: String,
}

impl Replier {
    /// Sends `body` to the request's reply-to key, echoing its correlation id.
    pub async fn reply(&self, request: &Delivery, body: Vec<u8>) -> Result<(), Error> {
        self.reply_later(request)?.send(body).await
    }

    /// Captures what is needed to answer `request` after it has been acked.
    pub fn reply_later(&self, request: &Delivery) -> Result<PendingReply, Error> {
        let reply_to = request
            .reply_to()
            .ok_or_else(|| Error::Protocol("Request carries no reply-to key".to_string()))?;

        Ok(PendingReply {
            replier: self.clone(),
            reply_to: reply_to.to_string(),
            correlation_id: request.correlation_id().map(str::to_string),
        })
    }
}

/// A reply that can be sent from another task.
#[derive(Debug)]
pub struct PendingReply {
    replier: Replier,
    reply_to: String,
    correlation_id: Option<String>,
}

impl PendingReply {
    pub async fn send(self, body: Vec<u8>) -> Result<(), Error> {
        let mut message = Message::new(body);
        if let Some(correlation_id) = self.correlation_id {
            message = message.with_correlation_id(correlation_id);
        }
        self.replier
            .channel
            .basic_publish(&self.replier.exchange, &self.reply_to, message)
            .await
    }
}

/// Stops a running [`MessageHandler`] from another task.
#[derive(Debug, Clone)]
pub struct HandlerControl {
    name: String,
    tag: String,
    /// Set when the handler opened the connection itself.
    owned_conn: Option<Arc<dyn Connection>>,
    channel: Arc<dyn Channel>,
    stopped: Arc<AtomicBool>,
}

impl HandlerControl {
    /// Cancels the consumer and closes channel and connection.
    /// ---
    /// The handler loop ends once deliveries already handed over
    /// have been processed.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!("MessageHandler [{}]: shutting down", self.name);
        if let Err(e) = self.channel.basic_cancel(&self.tag).await {
            warn!("MessageHandler [{}]: failed to cancel consumer: {}", self.name, e);
        }
        let closed = self.channel.close().await;
        if let Some(conn) = &self.owned_conn {
            conn.close().await?;
        }
        closed
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Consumes one queue and feeds every delivery to a [`MessageConsumer`].
/// ---
/// Deliveries are acknowledged after the consumer returns, whether it
/// succeeded or not. Consumer errors are logged and do not stop the loop.
pub struct MessageHandler {
    name: String,
    queue: String,
    control: HandlerControl,
    subscription: Subscription,
    replier: Replier,
    consumer: Box<dyn MessageConsumer>,
}

impl MessageHandler {
    /// Opens a dedicated connection and subscribes on it.
    pub async fn new(
        name: impl Into<String>,
        connector: &dyn Connector,
        binding: QueueBinding,
        consumer: Box<dyn MessageConsumer>,
    ) -> Result<Self, Error> {
        let name = name.into();
        let conn = connector.connect().await?;

        match Self::build(name.clone(), &conn, binding, consumer, true).await {
            Ok(handler) => Ok(handler),
            Err(e) => {
                if let Err(close_err) = conn.close().await {
                    warn!("MessageHandler [{}]: failed to close connection: {}", name, close_err);
                }
                Err(e)
            }
        }
    }

    /// Subscribes on a new channel of a connection the caller owns.
    pub async fn on_connection(
        name: impl Into<String>,
        conn: &Arc<dyn Connection>,
        binding: QueueBinding,
        consumer: Box<dyn MessageConsumer>,
    ) -> Result<Self, Error> {
        Self::build(name.into(), conn, binding, consumer, false).await
    }

    async fn build(
        name: String,
        conn: &Arc<dyn Connection>,
        binding: QueueBinding,
        consumer: Box<dyn MessageConsumer>,
        owns_conn: bool,
    ) -> Result<Self, Error> {
        let (channel, queue, tag, subscription) = Self::subscribe(&name, conn, &binding).await?;
        info!(
            "MessageHandler [{}]: consuming {} bound to {} with key {}",
            name, queue, binding.route.exchange, binding.route.key
        );

        Ok(Self {
            control: HandlerControl {
                name: name.clone(),
                tag,
                owned_conn: owns_conn.then(|| conn.clone()),
                channel: channel.clone(),
                stopped: Arc::new(AtomicBool::new(false)),
            },
            replier: Replier {
                channel,
                exchange: binding.route.exchange,
            },
            name,
            queue,
            subscription,
            consumer,
        })
    }

    async fn subscribe(
        name: &str,
        conn: &Arc<dyn Connection>,
        binding: &QueueBinding,
    ) -> Result<(Arc<dyn Channel>, String, String, Subscription), Error> {
        let channel = conn.create_channel().await?;
        channel
            .exchange_declare(&binding.route.exchange, binding.route.kind)
            .await?;
        let queue = channel
            .queue_declare(&binding.queue, binding.options.clone())
            .await?;
        channel.basic_qos(binding.prefetch_count).await?;
        channel
            .queue_bind(&queue, &binding.route.exchange, &binding.route.key)
            .await?;

        let tag = format!("{}-{}", name, Uuid::new_v4());
        let subscription = channel.basic_consume(&queue, &tag).await?;
        Ok((channel, queue, tag, subscription))
    }

    pub fn control(&self) -> HandlerControl {
        self.control.clone()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Runs the consume loop until the handler is shut down.
    pub async fn handle(mut self) -> Result<(), Error> {
        while let Some(delivery) = self.subscription.next().await {
            if let Err(e) = self.consumer.consume(&delivery, &self.replier).await {
                error!("MessageHandler [{}]: failed to handle delivery: {}", self.name, e);
            }

            if let Err(e) = delivery.ack().await {
                warn!("MessageHandler [{}]: failed to ack delivery: {}", self.name, e);
            }
        }

        info!("MessageHandler [{}]: consumer closed", self.name);
        Ok(())
    }

    /// Runs [`MessageHandler::handle`] on a new task.
    pub fn spawn(self) -> (HandlerControl, JoinHandle<Result<(), Error>>) {
        let control = self.control();
        (control, tokio::spawn(self.handle()))
    }
}
