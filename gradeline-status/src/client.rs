use std::time::Duration;

use gradeline_common::{error::Error, status::Status};
use gradeline_mq::ProducerRegistry;
use tracing::debug;

/// Body of a status or idle query; the aggregator ignores its content.
const QUERY: &[u8] = b"{}";

/// Asks any running aggregator for its current status.
pub async fn get_status(registry: &ProducerRegistry, timeout: Duration) -> Result<Status, Error> {
    let retriever = registry.status_retriever().await?;
    let reply = retriever.receive_produce_timeout(QUERY, timeout).await?;
    let status: Status = serde_json::from_slice(&reply)?;

    debug!(
        "get_status: {} files across {} submissions",
        status.file_count,
        status.submission_count()
    );
    Ok(status)
}

/// Blocks until an aggregator reports that no files are queued or in flight.
/// ---
/// Waits indefinitely when `timeout` is `None`.
pub async fn wait_idle(
    registry: &ProducerRegistry,
    timeout: Option<Duration>,
) -> Result<Status, Error> {
    let waiter = registry.idle_waiter().await?;
    let reply = match timeout {
        Some(limit) => waiter.receive_produce_timeout(QUERY, limit).await?,
        None => waiter.receive_produce(QUERY).await?,
    };
    Ok(serde_json::from_slice(&reply)?)
}
