use std::{sync::Arc, time::Duration};

use gradeline_common::error::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    broker::{Channel, Connection, Connector, Message, QueueOptions, Subscription},
    topology::Route,
};

#[derive(Debug)]
struct Handles {
    conn: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
}

/// Publishes messages to one exchange over its own connection.
/// ---
/// Publishing returns once the broker accepts the message; there is
/// no confirmation that anything consumed it.
#[derive(Debug)]
pub struct Producer {
    name: String,
    route: Route,
    handles: Mutex<Option<Handles>>,
}

impl Producer {
    pub async fn new(
        name: impl Into<String>,
        connector: &dyn Connector,
        route: Route,
    ) -> Result<Self, Error> {
        let name = name.into();
        let conn = connector.connect().await?;

        let channel = match Self::open_channel(&conn, &route).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = conn.close().await {
                    warn!("Producer [{}]: failed to close connection: {}", name, close_err);
                }
                return Err(e);
            }
        };

        info!(
            "Producer [{}]: publishing to {} ({}) with key {}",
            name, route.exchange, route.kind, route.key
        );

        Ok(Self {
            name,
            route,
            handles: Mutex::new(Some(Handles { conn, channel })),
        })
    }

    async fn open_channel(
        conn: &Arc<dyn Connection>,
        route: &Route,
    ) -> Result<Arc<dyn Channel>, Error> {
        let channel = conn.create_channel().await?;
        channel.exchange_declare(&route.exchange, route.kind).await?;
        Ok(channel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub(crate) async fn channel(&self) -> Result<Arc<dyn Channel>, Error> {
        self.handles
            .lock()
            .await
            .as_ref()
            .map(|h| h.channel.clone())
            .ok_or_else(|| Error::Broker(format!("Producer {} is shut down", self.name)))
    }

    /// Publishes `data` with the producer's own routing key.
    pub async fn produce(&self, data: &[u8]) -> Result<(), Error> {
        self.produce_to(&self.route.key, data).await
    }

    /// Publishes `data` on the producer's exchange with another key.
    pub async fn produce_to(&self, routing_key: &str, data: &[u8]) -> Result<(), Error> {
        self.publish(routing_key, Message::new(data)).await
    }

    pub async fn publish(&self, routing_key: &str, message: Message) -> Result<(), Error> {
        let channel = self.channel().await?;
        channel
            .basic_publish(&self.route.exchange, routing_key, message)
            .await
    }

    /// Closes the channel, then the connection.
    /// ---
    /// Calling it again once the handles are gone does nothing.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let Some(handles) = self.handles.lock().await.take() else {
            return Ok(());
        };

        debug!("Producer [{}]: shutting down", self.name);
        let closed = handles.channel.close().await;
        handles.conn.close().await?;
        closed
    }
}

/// A producer that waits for a correlated reply.
/// ---
/// Replies arrive on a private exclusive queue bound to `reply_key`.
/// Several clients may share one reply key: every reply is copied to
/// each of their queues and the correlation id picks out the one a
/// call is waiting for. Calls on one instance run one at a time.
#[derive(Debug)]
pub struct ReceiveProducer {
    producer: Producer,
    queue: String,
    reply_key: String,
    consumer_tag: String,
    call_lock: Mutex<()>,
}

impl ReceiveProducer {
    pub async fn new(
        name: impl Into<String>,
        connector: &dyn Connector,
        route: Route,
        reply_key: impl Into<String>,
        prefetch_count: u16,
    ) -> Result<Self, Error> {
        let name = name.into();
        let reply_key = reply_key.into();
        let producer = Producer::new(name.clone(), connector, route).await?;

        let queue = match Self::bind_reply_queue(&producer, &reply_key, prefetch_count).await {
            Ok(queue) => queue,
            Err(e) => {
                if let Err(close_err) = producer.shutdown().await {
                    warn!("ReceiveProducer [{}]: failed to shut down: {}", name, close_err);
                }
                return Err(e);
            }
        };

        debug!(
            "ReceiveProducer [{}]: awaiting replies on {} via key {}",
            name, queue, reply_key
        );

        Ok(Self {
            consumer_tag: format!("{}-{}", name, Uuid::new_v4()),
            producer,
            queue,
            reply_key,
            call_lock: Mutex::new(()),
        })
    }

    async fn bind_reply_queue(
        producer: &Producer,
        reply_key: &str,
        prefetch_count: u16,
    ) -> Result<String, Error> {
        let channel = producer.channel().await?;
        let queue = channel.queue_declare("", QueueOptions::exclusive()).await?;
        channel.basic_qos(prefetch_count).await?;
        channel
            .queue_bind(&queue, &producer.route().exchange, reply_key)
            .await?;
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        self.producer.name()
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    /// Publishes `data` and blocks until the matching reply arrives.
    pub async fn receive_produce(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.call(data, None).await
    }

    /// Like [`ReceiveProducer::receive_produce`], giving up after `timeout`.
    pub async fn receive_produce_timeout(
        &self,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        self.call(data, Some(timeout)).await
    }

    async fn call(&self, data: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
        let _guard = self.call_lock.lock().await;
        let channel = self.producer.channel().await?;
        let correlation_id = Uuid::new_v4().to_string();

        // Consume before publishing so a fast reply cannot be missed.
        let mut subscription = channel
            .basic_consume(&self.queue, &self.consumer_tag)
            .await?;

        let message = Message::new(data)
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(self.reply_key.clone());
        let exchange = self.producer.route().exchange.clone();
        let key = self.producer.route().key.clone();

        let exchange_reply = async {
            channel.basic_publish(&exchange, &key, message).await?;
            self.await_reply(&mut subscription, &correlation_id).await
        };

        let res = match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange_reply)
                .await
                .unwrap_or(Err(Error::Timeout(limit))),
            None => exchange_reply.await,
        };

        if let Err(e) = channel.basic_cancel(&self.consumer_tag).await {
            warn!(
                "ReceiveProducer [{}]: failed to cancel reply consumer: {}",
                self.name(),
                e
            );
        }
        res
    }

    async fn await_reply(
        &self,
        subscription: &mut Subscription,
        correlation_id: &str,
    ) -> Result<Vec<u8>, Error> {
        while let Some(delivery) = subscription.next().await {
            if let Err(e) = delivery.ack().await {
                warn!("ReceiveProducer [{}]: failed to ack reply: {}", self.name(), e);
            }

            if delivery.correlation_id() == Some(correlation_id) {
                return Ok(delivery.message.body);
            }
            debug!(
                "ReceiveProducer [{}]: discarding reply for {:?}",
                self.name(),
                delivery.correlation_id()
            );
        }

        Err(Error::Broker(format!(
            "Reply consumer of {} closed before a reply arrived",
            self.name()
        )))
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        self.producer.shutdown().await
    }
}
