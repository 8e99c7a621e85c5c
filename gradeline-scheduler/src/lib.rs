pub mod config;
pub mod node;
pub mod pipeline;
pub mod scheduler;
pub mod server;
pub mod submitter;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use node::Node;
pub use scheduler::{SchedulerConfig, SchedulerHandle, default::Scheduler};
pub use submitter::Submitter;

pub const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

/// Installs the global subscriber; `RUST_LOG` wins over `level`.
pub fn init_tracing(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .try_init();
}
