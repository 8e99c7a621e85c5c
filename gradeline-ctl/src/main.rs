use std::{path::Path, sync::Arc, time::Duration};

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use gradeline_common::{error::Error, submission::SubmissionId};
use gradeline_mq::{MEMORY_SCHEME, ProducerRegistry};
use gradeline_scheduler::{DEFAULT_CONFIG_PATH, Submitter, config, init_tracing};
use gradeline_status::{get_status, wait_idle};
use tracing::{info, warn};

fn cli() -> Command {
    Command::new("gradeline-ctl")
        .about("Operational tooling for a gradeline cluster")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the configuration file")
                .default_value(DEFAULT_CONFIG_PATH)
                .global(true)
                .action(ArgAction::Set),
        )
        .subcommand(Command::new("status").about("Prints the cluster's current status"))
        .subcommand(
            Command::new("wait-idle")
                .about("Blocks until no files are queued or in flight")
                .arg(
                    Arg::new("timeout")
                        .short('t')
                        .long("timeout")
                        .help("Give up after this many seconds")
                        .value_parser(value_parser!(u64))
                        .action(ArgAction::Set),
                ),
        )
        .subcommand(
            Command::new("redo")
                .about("Processes a stored submission again")
                .arg(
                    Arg::new("submission")
                        .help("Id of the submission")
                        .required(true)
                        .action(ArgAction::Set),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let matches = cli().get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let config = config::load(Path::new(config_path))?;
    init_tracing(config.log_level.as_deref().or(Some("warn")));

    if config.broker.uri.starts_with(MEMORY_SCHEME) {
        warn!("Broker {} is in-process, no workers can be reached", config.broker.uri);
    }

    let connector = gradeline_mq::connector_for(&config.broker.uri)?;
    let registry = Arc::new(ProducerRegistry::new(connector, config.broker.prefetch_count));

    let result = run(&matches, &config, registry.clone()).await;
    if let Err(e) = registry.stop_all().await {
        warn!("Failed to close broker resources: {}", e);
    }
    result
}

async fn run(
    matches: &ArgMatches,
    config: &config::GradelineConfig,
    registry: Arc<ProducerRegistry>,
) -> Result<(), Error> {
    match matches.subcommand() {
        Some(("status", _)) => {
            let status = get_status(&registry, config.broker.rpc_timeout()).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Some(("wait-idle", sub_matches)) => {
            let timeout = sub_matches
                .get_one::<u64>("timeout")
                .map(|secs| Duration::from_secs(*secs));
            info!("Waiting for the cluster to become idle");
            let status = wait_idle(&registry, timeout).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Some(("redo", sub_matches)) => {
            let raw = sub_matches
                .get_one::<String>("submission")
                .ok_or_else(|| Error::InvalidInput("Missing submission id".to_string()))?;
            let submission_id: SubmissionId = raw
                .parse()
                .map_err(|e| Error::InvalidInput(format!("Invalid submission id {}: {}", raw, e)))?;

            Submitter::new(registry, config.broker.rpc_timeout())
                .redo_submission(submission_id)
                .await?;
            println!("Queued submission {} for redo", submission_id);
        }
        _ => return Err(Error::InvalidInput("Unknown subcommand".to_string())),
    }
    Ok(())
}
