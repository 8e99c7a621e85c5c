//! Exchange, queue and routing key names shared by every process.

use crate::broker::{ExchangeKind, QueueOptions};

pub const SUBMISSION_EXCHANGE: &str = "submission_exchange";
pub const START_KEY: &str = "submission_start_key";
pub const START_QUEUE: &str = "submission_start_queue";
pub const START_RESPONSE_KEY: &str = "submission_start_response_key";
pub const REDO_KEY: &str = "redo_key";
pub const REDO_QUEUE: &str = "redo_queue";

pub const CHANGE_EXCHANGE: &str = "change_exchange";
pub const CHANGE_KEY: &str = "change_key";

pub const STATUS_EXCHANGE: &str = "status_exchange";
pub const STATUS_REQUEST_KEY: &str = "status_request_key";
pub const STATUS_RESPONSE_KEY: &str = "status_response_key";
pub const STATUS_QUEUE: &str = "status_request_queue";

pub const WAIT_EXCHANGE: &str = "wait_exchange";
pub const WAIT_REQUEST_KEY: &str = "wait_request_key";
pub const WAIT_RESPONSE_KEY: &str = "wait_response_key";
pub const WAIT_QUEUE: &str = "wait_request_queue";

/// Where a producer publishes by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub key: String,
}

impl Route {
    pub fn new(exchange: impl Into<String>, kind: ExchangeKind, key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            kind,
            key: key.into(),
        }
    }

    pub fn start() -> Self {
        Self::new(SUBMISSION_EXCHANGE, ExchangeKind::Direct, START_KEY)
    }

    pub fn redo() -> Self {
        Self::new(SUBMISSION_EXCHANGE, ExchangeKind::Direct, REDO_KEY)
    }

    /// The file route of one worker, named after its id.
    pub fn worker_files(worker_id: &str) -> Self {
        Self::new(
            SUBMISSION_EXCHANGE,
            ExchangeKind::Direct,
            worker_file_key(worker_id),
        )
    }

    pub fn change() -> Self {
        Self::new(CHANGE_EXCHANGE, ExchangeKind::Fanout, CHANGE_KEY)
    }

    pub fn status_request() -> Self {
        Self::new(STATUS_EXCHANGE, ExchangeKind::Direct, STATUS_REQUEST_KEY)
    }

    pub fn wait_request() -> Self {
        Self::new(WAIT_EXCHANGE, ExchangeKind::Direct, WAIT_REQUEST_KEY)
    }
}

pub fn worker_file_key(worker_id: &str) -> String {
    format!("submission_file_key_{}", worker_id)
}

pub fn worker_file_queue(worker_id: &str) -> String {
    format!("submission_file_queue_{}", worker_id)
}

/// The queue a handler consumes from and how it is bound.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub route: Route,
    /// Empty for a broker-named queue.
    pub queue: String,
    pub options: QueueOptions,
    pub prefetch_count: u16,
}

impl QueueBinding {
    pub fn new(route: Route, queue: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            route,
            queue: queue.into(),
            options,
            prefetch_count: 1,
        }
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Shared by every worker; each START goes to exactly one.
    pub fn start() -> Self {
        Self::new(Route::start(), START_QUEUE, QueueOptions::durable())
    }

    pub fn redo() -> Self {
        Self::new(Route::redo(), REDO_QUEUE, QueueOptions::durable())
    }

    pub fn worker_files(worker_id: &str) -> Self {
        Self::new(
            Route::worker_files(worker_id),
            worker_file_queue(worker_id),
            QueueOptions {
                auto_delete: true,
                ..Default::default()
            },
        )
    }

    /// Every subscriber gets its own copy of each change.
    pub fn change() -> Self {
        Self::new(Route::change(), "", QueueOptions::exclusive())
    }

    pub fn status_request() -> Self {
        Self::new(Route::status_request(), STATUS_QUEUE, QueueOptions::durable())
    }

    pub fn wait_request() -> Self {
        Self::new(Route::wait_request(), WAIT_QUEUE, QueueOptions::durable())
    }
}
