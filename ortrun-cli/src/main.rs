mod cli;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::Cli;
use ortrun::Config;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    init_tracing(&args);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "ortrun stopped");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins over the verbosity flags when set.
fn init_tracing(args: &Cli) {
    let filter = EnvFilter::builder()
        .with_default_directive(args.verbosity.tracing_level_filter().into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(args: Cli) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }

    info!(
        mode = %config.mode,
        job_api = %config.job_api_url,
        worker = %config.worker,
        job_type = config.job_type(),
        "starting"
    );
    let scheduler = ortrun::scheduler_from_config(&config)?;

    if args.once {
        match scheduler.run_once().await {
            Some(outcome) => info!(?outcome, "job processed"),
            None => info!("no job processed"),
        }
        return Ok(());
    }

    scheduler.run_until(shutdown_signal()).await;
    info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
}
