use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use gradeline_common::error::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::broker::{
    Acker, Channel, Connection, Connector, Delivery, ExchangeKind, Message, QueueOptions,
    Subscription,
};

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    /// `(queue, routing_key)` pairs.
    bindings: Vec<(String, String)>,
}

#[derive(Debug)]
struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug, Default)]
struct QueueState {
    buffered: VecDeque<Message>,
    consumers: VecDeque<ConsumerSlot>,
    owner: Option<u64>,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str, message: Message) -> Result<(), Error> {
        let state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| Error::not_found("Exchange", exchange))?;

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(_, key)| state.kind == ExchangeKind::Fanout || key == routing_key)
            .map(|(queue, _)| queue.clone())
            .collect();
        targets.dedup();

        if targets.is_empty() {
            debug!(
                "MemoryBroker: dropping unroutable message on {} with key {}",
                exchange, routing_key
            );
        }

        for queue in targets {
            if let Some(queue) = self.queues.get_mut(&queue) {
                queue.dispatch(message.clone());
            }
        }
        Ok(())
    }

    fn drop_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
    }
}

impl QueueState {
    /// Hands the message to the next live consumer, or buffers it.
    fn dispatch(&mut self, message: Message) {
        let mut message = message;
        while let Some(slot) = self.consumers.pop_front() {
            match slot.tx.send(Delivery::new(message, Box::new(NoopAcker))) {
                Ok(()) => {
                    self.consumers.push_back(slot);
                    return;
                }
                Err(mpsc::error::SendError(returned)) => message = returned.message,
            }
        }
        self.buffered.push_back(message);
    }
}

/// Deliveries leave the queue as soon as they are dispatched.
struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// An in-process broker with AMQP-like routing.
/// ---
/// Supports direct and fanout exchanges, durable and exclusive queues,
/// round-robin delivery among a queue's consumers, and buffering while
/// a queue has no consumer. Cloning shares the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    ids: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of messages waiting in a queue with no consumer to take them.
    pub async fn buffered(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.buffered.len())
            .unwrap_or(0)
    }

    pub async fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().await.queues.contains_key(queue)
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Connection>, Error> {
        Ok(Arc::new(MemoryConnection {
            id: self.next_id(),
            broker: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            channels: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    closed: Arc<AtomicBool>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Broker(format!("Connection {} is closed", self.id)));
        }

        let channel = Arc::new(MemoryChannel {
            id: self.broker.next_id(),
            connection_id: self.id,
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
            connection_closed: self.closed.clone(),
        });
        self.channels.lock().await.push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for channel in self.channels.lock().await.drain(..) {
            channel.close().await?;
        }

        let mut state = self.broker.state.lock().await;
        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(self.id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            state.drop_queue(&name);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    connection_id: u64,
    broker: MemoryBroker,
    closed: AtomicBool,
    connection_closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) || self.connection_closed.load(Ordering::Acquire) {
            return Err(Error::Broker(format!("Channel {} is closed", self.id)));
        }
        Ok(())
    }

    fn check_access(&self, queue: &QueueState, name: &str) -> Result<(), Error> {
        match queue.owner {
            Some(owner) if owner != self.connection_id => Err(Error::Broker(format!(
                "Queue {} is exclusive to another connection",
                name
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<(), Error> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        match state.exchanges.get(exchange) {
            Some(existing) if existing.kind != kind => Err(Error::Broker(format!(
                "Exchange {} already declared as {}",
                exchange, existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    exchange.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<String, Error> {
        self.ensure_open()?;
        let name = if queue.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            queue.to_string()
        };

        let mut state = self.broker.state.lock().await;
        match state.queues.get(&name) {
            Some(existing) => self.check_access(existing, &name)?,
            None => {
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        owner: options.exclusive.then_some(self.connection_id),
                        ..Default::default()
                    },
                );
            }
        }
        Ok(name)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;

        let target = state
            .queues
            .get(queue)
            .ok_or_else(|| Error::not_found("Queue", queue))?;
        self.check_access(target, queue)?;

        let exchange = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::not_found("Exchange", exchange))?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_qos(&self, _prefetch_count: u16) -> Result<(), Error> {
        self.ensure_open()
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker
            .state
            .lock()
            .await
            .route(exchange, routing_key, message)
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<Subscription, Error> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::not_found("Queue", queue))?;
        self.check_access(target, queue)?;

        target.consumers.retain(|slot| !slot.tx.is_closed());
        if target.consumers.iter().any(|slot| slot.tag == consumer_tag) {
            return Err(Error::Broker(format!(
                "Consumer tag {} already in use on {}",
                consumer_tag, queue
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let slot = ConsumerSlot {
            tag: consumer_tag.to_string(),
            channel_id: self.id,
            tx,
        };
        target.consumers.push_back(slot);
        for message in std::mem::take(&mut target.buffered) {
            target.dispatch(message);
        }

        Ok(Subscription::new(consumer_tag, rx))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), Error> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|slot| !(slot.channel_id == self.id && slot.tag == consumer_tag));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut state = self.broker.state.lock().await;
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|slot| slot.channel_id != self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(broker: &MemoryBroker) -> (Arc<dyn Connection>, Arc<dyn Channel>) {
        let conn = broker.connect().await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        (conn, channel)
    }

    #[tokio::test]
    async fn test_direct_routing_by_key() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = open(&broker).await;

        ch.exchange_declare("ex", ExchangeKind::Direct).await.unwrap();
        ch.queue_declare("a", QueueOptions::durable()).await.unwrap();
        ch.queue_declare("b", QueueOptions::durable()).await.unwrap();
        ch.queue_bind("a", "ex", "key_a").await.unwrap();
        ch.queue_bind("b", "ex", "key_b").await.unwrap();

        ch.basic_publish("ex", "key_a", Message::new("1")).await.unwrap();
        ch.basic_publish("ex", "key_a", Message::new("2")).await.unwrap();
        ch.basic_publish("ex", "key_b", Message::new("3")).await.unwrap();

        assert_eq!(broker.buffered("a").await, 2);
        assert_eq!(broker.buffered("b").await, 1);

        let mut sub = ch.basic_consume("a", "c1").await.unwrap();
        assert_eq!(sub.next().await.unwrap().body(), b"1");
        assert_eq!(sub.next().await.unwrap().body(), b"2");
        assert_eq!(broker.buffered("a").await, 0);
    }

    #[tokio::test]
    async fn test_fanout_copies_to_every_queue() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = open(&broker).await;

        ch.exchange_declare("fan", ExchangeKind::Fanout).await.unwrap();
        let q1 = ch.queue_declare("", QueueOptions::exclusive()).await.unwrap();
        let q2 = ch.queue_declare("", QueueOptions::exclusive()).await.unwrap();
        assert_ne!(q1, q2);
        ch.queue_bind(&q1, "fan", "").await.unwrap();
        ch.queue_bind(&q2, "fan", "").await.unwrap();

        ch.basic_publish("fan", "ignored", Message::new("x")).await.unwrap();
        assert_eq!(broker.buffered(&q1).await, 1);
        assert_eq!(broker.buffered(&q2).await, 1);
    }

    #[tokio::test]
    async fn test_round_robin_between_consumers() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = open(&broker).await;

        ch.exchange_declare("ex", ExchangeKind::Direct).await.unwrap();
        ch.queue_declare("work", QueueOptions::durable()).await.unwrap();
        ch.queue_bind("work", "ex", "k").await.unwrap();
        let mut first = ch.basic_consume("work", "c1").await.unwrap();
        let mut second = ch.basic_consume("work", "c2").await.unwrap();

        ch.basic_publish("ex", "k", Message::new("1")).await.unwrap();
        ch.basic_publish("ex", "k", Message::new("2")).await.unwrap();

        assert_eq!(first.next().await.unwrap().body(), b"1");
        assert_eq!(second.next().await.unwrap().body(), b"2");
    }

    #[tokio::test]
    async fn test_exclusive_queue_dies_with_connection() {
        let broker = MemoryBroker::new();
        let (conn, ch) = open(&broker).await;
        let (_other_conn, other) = open(&broker).await;

        let queue = ch.queue_declare("", QueueOptions::exclusive()).await.unwrap();
        assert!(matches!(
            other.basic_consume(&queue, "spy").await,
            Err(Error::Broker(_))
        ));

        conn.close().await.unwrap();
        assert!(!broker.has_queue(&queue).await);
        assert!(ch.basic_publish("ex", "k", Message::new("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_ends_subscription() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        ch.queue_declare("q", QueueOptions::durable()).await.unwrap();

        let mut sub = ch.basic_consume("q", "tag").await.unwrap();
        ch.basic_cancel("tag").await.unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange() {
        let broker = MemoryBroker::new();
        let (_conn, ch) = open(&broker).await;
        let res = ch.basic_publish("missing", "k", Message::new("x")).await;
        assert!(matches!(res, Err(Error::NotFound { .. })));
    }
}
