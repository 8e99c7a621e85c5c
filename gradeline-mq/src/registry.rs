use std::{collections::HashMap, sync::Arc};

use gradeline_common::error::Error;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::{
    broker::Connector,
    producer::{Producer, ReceiveProducer},
    topology::{Route, START_RESPONSE_KEY, STATUS_RESPONSE_KEY, WAIT_RESPONSE_KEY},
};

pub const STATUS_CHANGER: &str = "status_changer";
pub const STATUS_RETRIEVER: &str = "status_retriever";
pub const IDLE_WAITER: &str = "idle_waiter";
pub const SUBMISSION_STARTER: &str = "submission_starter";
pub const FILE_SUBMITTER: &str = "file_submitter";
pub const SUBMISSION_REDOER: &str = "submission_redoer";

#[derive(Debug, Default)]
struct Producers {
    plain: HashMap<String, Arc<Producer>>,
    receiving: HashMap<String, Arc<ReceiveProducer>>,
}

/// Named producers shared by the components of one process.
/// ---
/// Each producer is created on first use and reused afterwards.
/// Creation holds the registry lock so concurrent first calls for
/// the same name build a single producer.
#[derive(Debug)]
pub struct ProducerRegistry {
    connector: Arc<dyn Connector>,
    prefetch_count: u16,
    producers: Mutex<Producers>,
}

impl ProducerRegistry {
    pub fn new(connector: Arc<dyn Connector>, prefetch_count: u16) -> Self {
        Self {
            connector,
            prefetch_count,
            producers: Mutex::new(Producers::default()),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    pub async fn producer(&self, name: &str, route: Route) -> Result<Arc<Producer>, Error> {
        let mut producers = self.producers.lock().await;
        if let Some(existing) = producers.plain.get(name) {
            return Ok(existing.clone());
        }

        let producer = Arc::new(Producer::new(name, self.connector.as_ref(), route).await?);
        producers.plain.insert(name.to_string(), producer.clone());
        Ok(producer)
    }

    pub async fn receive_producer(
        &self,
        name: &str,
        route: Route,
        reply_key: &str,
    ) -> Result<Arc<ReceiveProducer>, Error> {
        let mut producers = self.producers.lock().await;
        if let Some(existing) = producers.receiving.get(name) {
            return Ok(existing.clone());
        }

        let producer = Arc::new(
            ReceiveProducer::new(
                name,
                self.connector.as_ref(),
                route,
                reply_key,
                self.prefetch_count,
            )
            .await?,
        );
        producers.receiving.insert(name.to_string(), producer.clone());
        Ok(producer)
    }

    /// Publishes submission change events to every status aggregator.
    pub async fn status_changer(&self) -> Result<Arc<Producer>, Error> {
        self.producer(STATUS_CHANGER, Route::change()).await
    }

    pub async fn status_retriever(&self) -> Result<Arc<ReceiveProducer>, Error> {
        self.receive_producer(STATUS_RETRIEVER, Route::status_request(), STATUS_RESPONSE_KEY)
            .await
    }

    pub async fn idle_waiter(&self) -> Result<Arc<ReceiveProducer>, Error> {
        self.receive_producer(IDLE_WAITER, Route::wait_request(), WAIT_RESPONSE_KEY)
            .await
    }

    pub async fn submission_starter(&self) -> Result<Arc<ReceiveProducer>, Error> {
        self.receive_producer(SUBMISSION_STARTER, Route::start(), START_RESPONSE_KEY)
            .await
    }

    /// Publishes file and stop events; callers pick the worker key.
    pub async fn file_submitter(&self) -> Result<Arc<Producer>, Error> {
        self.producer(FILE_SUBMITTER, Route::start()).await
    }

    pub async fn submission_redoer(&self) -> Result<Arc<Producer>, Error> {
        self.producer(SUBMISSION_REDOER, Route::redo()).await
    }

    /// Shuts down every producer created so far and forgets them.
    /// ---
    /// Keeps going past failures and reports the first one.
    pub async fn stop_all(&self) -> Result<(), Error> {
        let Producers { plain, receiving } = std::mem::take(&mut *self.producers.lock().await);
        info!(
            "ProducerRegistry: stopping {} producers",
            plain.len() + receiving.len()
        );

        let mut first_err = None;
        let results = futures::future::join_all(
            plain
                .values()
                .map(|p| p.shutdown())
                .chain(receiving.values().map(|p| p.producer().shutdown())),
        )
        .await;

        for res in results {
            if let Err(e) = res {
                error!("ProducerRegistry: failed to stop producer: {}", e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn len(&self) -> usize {
        let producers = self.producers.lock().await;
        producers.plain.len() + producers.receiving.len()
    }
}
