//! shell-relay binary entry point.

use std::process::ExitCode;
use std::sync::Arc;

use shell_relay::adapter::AdapterRegistry;
use shell_relay::api::{self, AppState};
use shell_relay::cli::{self, Args};
use shell_relay::{logging, Config, Database, SessionOrchestrator};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Run 'shell-relay --help' for usage.");
            return ExitCode::from(2);
        }
    };

    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };

    logging::init_with_filter(Some(config.log_filter()));

    match run(config, &args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    info!("shell-relay v{}", env!("CARGO_PKG_VERSION"));
    if let Some(ref path) = args.config {
        info!(path = %path.display(), "Loaded configuration file");
    }

    let server_config = config.to_server_config()?;
    let db = Arc::new(Database::open(&config.storage.database)?);
    info!(path = %config.storage.database.display(), "Event store opened");

    let registry = AdapterRegistry::with_defaults(config.pty_config(), config.agent_config());
    info!(kinds = ?registry.kinds(), "Adapters registered");

    let orchestrator = Arc::new(SessionOrchestrator::with_database(
        db,
        registry,
        config.orchestrator_config(),
    ));

    let recovered = orchestrator.recover_orphans()?;
    if !recovered.is_empty() {
        warn!(count = recovered.len(), "Marked orphaned sessions as errored");
    }

    api::serve(server_config, AppState::new(Arc::clone(&orchestrator)), shutdown_signal()).await?;

    info!("Server stopped, closing sessions");
    orchestrator.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
