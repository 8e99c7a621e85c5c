use std::sync::Arc;

use gradeline_common::{error::Error, request::Request};
use gradeline_mq::{Producer, ProducerRegistry};
use tracing::{debug, warn};

/// Broadcasts accepted requests to every status aggregator.
/// ---
/// All publishes go through one producer so the events of a
/// submission leave this process in the order they were accepted.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    producer: Arc<Producer>,
}

impl ChangeNotifier {
    pub async fn new(registry: &ProducerRegistry) -> Result<Self, Error> {
        Ok(Self {
            producer: registry.status_changer().await?,
        })
    }

    pub fn from_producer(producer: Arc<Producer>) -> Self {
        Self { producer }
    }

    pub async fn try_notify(&self, request: &Request) -> Result<(), Error> {
        self.producer.produce(&request.to_bytes()?).await
    }

    /// Publishes a change, logging instead of failing.
    /// ---
    /// A lost broadcast only degrades the cluster-wide status view,
    /// the pipeline itself is unaffected.
    pub async fn notify(&self, request: &Request) {
        match self.try_notify(request).await {
            Ok(()) => debug!(
                "ChangeNotifier: published {} for submission {}",
                request.kind, request.submission_id
            ),
            Err(e) => warn!(
                "ChangeNotifier: failed to publish {} for submission {}: {}",
                request.kind, request.submission_id, e
            ),
        }
    }
}
