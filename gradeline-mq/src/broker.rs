use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use gradeline_common::error::Error;
use strum_macros::{Display, EnumString};
use tokio::sync::mpsc;

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ExchangeKind {
    /// Routes to every queue bound with exactly the publish key.
    Direct,
    /// Copies every message to all bound queues.
    Fanout,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// Only the declaring connection may use the queue, and it is
    /// deleted when that connection closes.
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: String,
    pub persistent: bool,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            correlation_id: None,
            reply_to: None,
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), Error>;
}

/// A message handed to a consumer, acknowledged through its broker.
pub struct Delivery {
    pub message: Message,
    acker: Box<dyn Acker>,
}

impl Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acker>) -> Self {
        Self { message, acker }
    }

    pub async fn ack(&self) -> Result<(), Error> {
        self.acker.ack().await
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.message.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.message.reply_to.as_deref()
    }

    pub fn body(&self) -> &[u8] {
        &self.message.body
    }
}

/// The stream of deliveries for one consumer tag.
/// ---
/// Yields `None` once the consumer is cancelled or its channel closes.
#[derive(Debug)]
pub struct Subscription {
    tag: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(tag: impl Into<String>, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            tag: tag.into(),
            rx,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// One multiplexed session on a broker connection.
#[async_trait]
pub trait Channel: Send + Sync + Debug {
    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<(), Error>;

    /// Declares a queue and returns its name.
    /// ---
    /// An empty name asks the broker to generate one.
    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<String, Error>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str)
    -> Result<(), Error>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), Error>;

    /// Returns once the broker has accepted the message,
    /// not once anything has consumed it.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), Error>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<Subscription, Error>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait Connection: Send + Sync + Debug {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// Opens connections to one broker.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    async fn connect(&self) -> Result<Arc<dyn Connection>, Error>;
}
