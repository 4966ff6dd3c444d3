//! BLE Modbus polling service binary

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use errors::{ServiceError, ServiceResult};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use blesrv::bootstrap::{self, Args};
use blesrv::{AppConfig, Coordinator, LogSink};

#[tokio::main]
async fn main() -> ExitCode {
    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("blesrv: {}", e);
            ExitCode::from(e.exit_code())
        },
    }
}

async fn run(args: Args) -> ServiceResult<()> {
    let mut config = AppConfig::read(&args.config).map_err(ServiceError::from)?;
    bootstrap::initialize_logging(&args, &config)?;
    config.validate().map_err(ServiceError::from)?;

    info!(
        "{} {} loaded {} ({} device(s), {} adapter(s))",
        config.service.name,
        env!("CARGO_PKG_VERSION"),
        args.config.display(),
        config.devices.len(),
        config.adapters.len()
    );

    if args.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    let transport = bootstrap::create_transport(&args, &config).await?;
    let cancel = CancellationToken::new();
    let signal_watcher = common::cancel_on_shutdown(cancel.clone());

    let (handle, coordinator) =
        Coordinator::spawn(&config, transport, Arc::new(LogSink), cancel.clone())?;

    if let Err(e) = coordinator.await {
        error!("Coordinator task failed: {}", e);
        return Err(ServiceError::Internal(e.to_string()));
    }
    handle.shutdown();
    signal_watcher.abort();

    info!("Shutdown complete");
    Ok(())
}
