use std::{path::Path, sync::Arc, time::Duration};

use clap::{Arg, ArgAction, Command};
use gradeline_common::{error::Error, state::MemoryDb};
use gradeline_scheduler::{DEFAULT_CONFIG_PATH, Node, config, init_tracing};
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Error> {
    let matches = Command::new("gradeline-scheduler")
        .about("Gradeline submission scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("serve")
                .about("Starts a worker that processes submissions")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .help("Path to the configuration file")
                        .default_value(DEFAULT_CONFIG_PATH)
                        .action(ArgAction::Set),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("serve", sub_matches)) => {
            let config_path = sub_matches
                .get_one::<String>("config")
                .map(String::as_str)
                .unwrap_or(DEFAULT_CONFIG_PATH);

            let config = config::load(Path::new(config_path))?;
            init_tracing(config.log_level.as_deref());
            info!("Loaded configuration from {}", config_path);

            serve(config).await
        }
        _ => Err(Error::InvalidInput("Unknown subcommand".to_string())),
    }
}

async fn serve(config: config::GradelineConfig) -> Result<(), Error> {
    let connector = gradeline_mq::connector_for(&config.broker.uri)?;
    // Results are kept in process; a persistent store plugs in through DatabaseTrait.
    let db = Arc::new(MemoryDb::new());

    let node = Node::start(&config, connector, db).await?;
    info!(
        "Worker {} serving on {} with max_procs {}",
        node.worker_id(),
        config.broker.uri,
        config.scheduler.max_procs
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, draining submissions");

    tokio::select! {
        biased;

        res = node.shutdown() => {
            if let Err(e) = &res {
                error!("Shutdown finished with an error: {}", e);
            }
            res
        }

        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
            warn!("Timed out draining after {:?}, exiting", SHUTDOWN_TIMEOUT);
            Err(Error::Timeout(SHUTDOWN_TIMEOUT))
        }

        _ = tokio::signal::ctrl_c() => {
            warn!("Second Ctrl+C received, exiting immediately");
            Ok(())
        }
    }
}
