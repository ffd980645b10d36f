use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tlsinterop::cli::{Cli, Config};
use tlsinterop::matrix::{enumerate, run_matrix};
use tlsinterop::port_manager::PortManager;
use tlsinterop::scenario::ScenarioDriver;
use tlsinterop::Result;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    info!("tlsinterop starting");

    let ports = Arc::new(PortManager::new(config.ports.clone())?);
    let scenarios = enumerate(&config.catalog, &config.suites, &config.providers);
    let driver = Arc::new(ScenarioDriver::new(
        config.driver.clone(),
        Arc::new(config.catalog),
        ports,
    ));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted, stopping the run");
                ctrl_c.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let summary = run_matrix(driver, scenarios, config.matrix, cancel).await;

    for failure in &summary.failures {
        error!("FAILED {}", failure.id);
    }
    if summary.success() {
        info!("tlsinterop finished, all scenarios passed");
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
