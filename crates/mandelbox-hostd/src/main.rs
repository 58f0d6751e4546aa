//! mandelbox-hostd entry point.
//!
//! Starts the host service and its HTTP intake, then waits for Ctrl-C, a
//! drain request or a fatal runtime error. Every mandelbox is torn down
//! before the process exits.

use mandelbox_hostd::{http, HostService, HostdConfig};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing - logs go to stderr
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("mandelbox_hostd=info".parse()?)
                .add_directive("mandelbox_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting mandelbox host service");

    // Load configuration from environment
    let config = HostdConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // Validate configuration (warn-only to support development hosts)
    config.validate_warn();

    // Build the host and start the orchestrator loop
    let mut service = HostService::start(&config).await?;

    // HTTP intake, stopped by the root cancellation token
    let http_state = service.app_state();
    let http_token = service.host().root_token().clone();
    let http_addr = config.http_addr;
    let http_handle = tokio::spawn(async move {
        let shutdown = async move { http_token.cancelled().await };
        if let Err(e) = http::serve(http_state, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(http_addr = %config.http_addr, "Host service ready");

    // Wait for Ctrl-C, a drain request or a fatal runtime error
    let outcome = tokio::select! {
        result = signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, cleaning up...");
            result.map_err(anyhow::Error::from)
        }
        result = service.wait() => {
            match &result {
                Ok(()) => tracing::info!("Orchestrator stopped, cleaning up..."),
                Err(e) => tracing::error!(error = %e, "Orchestrator failed, cleaning up..."),
            }
            result.map_err(anyhow::Error::from)
        }
    };

    // Tear down every mandelbox, then wait for the HTTP server to stop
    let shutdown = service.shutdown().await;
    if let Err(e) = http_handle.await {
        tracing::error!(error = %e, "HTTP server task failed");
    }

    outcome?;
    shutdown?;
    tracing::info!("Host service shutdown complete");
    Ok(())
}
