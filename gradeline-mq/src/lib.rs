use std::sync::Arc;

use gradeline_common::error::Error;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod broker;
pub mod handler;
pub mod memory;
pub mod producer;
pub mod registry;
pub mod topology;

pub use broker::{Channel, Connection, Connector, Delivery, ExchangeKind, Message, QueueOptions};
pub use handler::{HandlerControl, MessageConsumer, MessageHandler, PendingReply, Replier};
pub use memory::MemoryBroker;
pub use producer::{Producer, ReceiveProducer};
pub use registry::ProducerRegistry;
pub use topology::{QueueBinding, Route};

pub const MEMORY_SCHEME: &str = "memory://";

/// Picks a broker implementation from its URI.
/// ---
/// `memory://` yields a fresh in-process broker. `amqp://` and
/// `amqps://` need the `amqp` feature.
pub fn connector_for(uri: &str) -> Result<Arc<dyn Connector>, Error> {
    if uri.starts_with(MEMORY_SCHEME) {
        return Ok(Arc::new(MemoryBroker::new()));
    }

    if uri.starts_with("amqp://") || uri.starts_with("amqps://") {
        #[cfg(feature = "amqp")]
        return Ok(Arc::new(amqp::AmqpConnector::new(uri)));

        #[cfg(not(feature = "amqp"))]
        return Err(Error::Config(format!(
            "Broker URI {} needs the amqp feature",
            uri
        )));
    }

    Err(Error::Config(format!("Unsupported broker URI: {}", uri)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_for_memory() {
        assert!(connector_for("memory://local").is_ok());
    }

    #[test]
    fn test_connector_for_unknown_scheme() {
        assert!(matches!(
            connector_for("nats://localhost"),
            Err(Error::Config(_))
        ));
    }
}
