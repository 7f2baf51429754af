//! Main entry point for the resumable-batch CLI

use clap::Parser;
use resumable_batch::cli::{Cli, Commands};
use resumable_batch::processor::{ProcessorControl, SharedControl};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("resumable_batch=info"));

    // Logs go to stderr so stdout carries only results
    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Ctrl+C stops the run at the next unit boundary; on Unix SIGUSR1 pauses
/// and SIGUSR2 resumes.
fn install_signal_handlers(control: &SharedControl) {
    tokio::spawn({
        let control = control.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl+C received - saving progress...");
                control.request_stop();
            }
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, pause) in [
            (SignalKind::user_defined1(), true),
            (SignalKind::user_defined2(), false),
        ] {
            let control = control.clone();
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        while stream.recv().await.is_some() {
                            if pause {
                                warn!("SIGUSR1 received - pausing after the current unit");
                                control.request_pause();
                            } else {
                                warn!("SIGUSR2 received - resuming");
                                control.request_resume();
                            }
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to install pause/resume signal handler"),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    if let Some(addr) = cli.metrics_addr {
        if let Err(e) = resumable_batch::metrics::init_metrics(addr).await {
            warn!(error = %e, "Metrics exporter unavailable, continuing without it");
        }
    }

    let control = ProcessorControl::shared();
    install_signal_handlers(&control);

    let result = match cli.command {
        Commands::Run(ref args) => args
            .execute(&cli, control.clone())
            .await
            .map_err(|e| anyhow::anyhow!(e)),
        Commands::Status(ref args) => args.execute(&cli).await.map_err(|e| anyhow::anyhow!(e)),
        Commands::Discard(ref args) => args.execute(&cli).await.map_err(|e| anyhow::anyhow!(e)),
        Commands::Verify(ref args) => args.execute(&cli).await.map_err(|e| anyhow::anyhow!(e)),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }
}
