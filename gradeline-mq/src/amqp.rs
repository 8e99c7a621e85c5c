use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use gradeline_common::error::Error;
use lapin::{
    BasicProperties, ConnectionProperties,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broker::{
    Acker, Channel, Connection, Connector, Delivery, ExchangeKind, Message, QueueOptions,
    Subscription,
};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

fn broker_err(e: lapin::Error) -> Error {
    Error::Broker(e.to_string())
}

/// Connects to an AMQP 0-9-1 broker such as RabbitMQ.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: String,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn Connection>, Error> {
        let conn = lapin::Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(broker_err)?;
        Ok(Arc::new(AmqpConnection { inner: conn }))
    }
}

pub struct AmqpConnection {
    inner: lapin::Connection,
}

impl std::fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnection").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, Error> {
        let channel = self.inner.create_channel().await.map_err(broker_err)?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(broker_err)
    }
}

pub struct AmqpChannel {
    inner: lapin::Channel,
}

impl std::fmt::Debug for AmqpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpChannel")
            .field("id", &self.inner.id())
            .finish()
    }
}

struct AmqpAcker {
    inner: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), Error> {
        self.inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(broker_err)
    }
}

fn to_properties(message: &Message) -> BasicProperties {
    let mut properties =
        BasicProperties::default().with_content_type(message.content_type.as_str().into());
    if message.persistent {
        properties = properties.with_delivery_mode(PERSISTENT);
    }
    if let Some(correlation_id) = &message.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &message.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }
    properties
}

fn from_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let message = Message {
        body: delivery.data.clone(),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|r| r.as_str().to_string()),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|c| c.as_str().to_string())
            .unwrap_or_default(),
        persistent: properties.delivery_mode() == &Some(PERSISTENT),
    };

    Delivery::new(
        message,
        Box::new(AmqpAcker {
            inner: delivery.acker,
        }),
    )
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<(), Error> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };

        self.inner
            .exchange_declare(
                exchange,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)
    }

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<String, Error> {
        let declared = self
            .inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;
        Ok(declared.name().as_str().to_string())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), Error> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(broker_err)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), Error> {
        let properties = to_properties(&message);
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(broker_err)?
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<Subscription, Error> {
        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(broker_err)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let tag = consumer_tag.to_string();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        if tx.send(from_delivery(delivery)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("AmqpChannel: consumer {} failed: {}", tag, e);
                        break;
                    }
                }
            }
            debug!("AmqpChannel: consumer {} finished", tag);
        });

        Ok(Subscription::new(consumer_tag, rx))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), Error> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(broker_err)
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(broker_err)
    }
}
