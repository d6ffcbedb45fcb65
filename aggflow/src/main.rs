use std::error::Error;
use std::path::PathBuf;

use aggflow_core::config::PipelineConfig;
use aggflow_core::pipeline::PipelineBuilder;
use clap::ArgMatches;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod cmdline;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    match matches.subcommand() {
        Some(("run", args)) => {
            let config = load_config(args)?;
            if args.get_flag("drain") {
                let report = PipelineBuilder::from_config(config)?
                    .build()?
                    .drain_to_end()
                    .await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            let cln_token = CancellationToken::new();
            let shutdown_token = cln_token.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown_token.cancel();
            });
            aggflow_core::run(config, cln_token)
                .await
                .map_err(|e| format!("Error running pipeline: {e:?}"))?;
        }
        Some(("validate-config", args)) => {
            let config = load_config(args)?;
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        _ => unreachable!("clap requires a subcommand"),
    }
    Ok(())
}

fn load_config(args: &ArgMatches) -> aggflow_core::Result<PipelineConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => PipelineConfig::from_file(path),
        None => PipelineConfig::from_env(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install the terminate handler");
                std::future::pending::<()>().await
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
