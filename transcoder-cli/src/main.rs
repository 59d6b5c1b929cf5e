mod cli;
mod config;
mod logging;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use transcoder_engine::Transcoder;

use crate::cli::Args;

/// Conventional exit status for a run interrupted by a signal.
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.verbose, args.quiet, args.log_format);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_cancelled(&e) => {
            warn!("Transcode cancelled");
            ExitCode::from(EXIT_CANCELLED)
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = config::load(args.config.as_deref())?;
    args.apply_to(&mut config);

    let request = args.to_request().context("Invalid transcode request")?;
    let transcoder = Transcoder::new(config).context("Invalid configuration")?;

    let engine = transcoder.engine().clone();
    let version = tokio::task::spawn_blocking(move || engine.detect_version())
        .await
        .context("Engine check panicked")?
        .with_context(|| {
            format!(
                "ffmpeg is not available at `{}`; install it or set --ffmpeg / FFMPEG_PATH",
                transcoder.engine().binary_path()
            )
        })?;
    info!(%version, "Found engine");

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let summary = transcoder.run(&request, &cancel).await?;
    info!(
        output = %summary.output.display(),
        attempts = summary.attempts,
        elapsed_secs = summary.elapsed.as_secs(),
        segments = ?summary.segments,
        "Transcode completed"
    );
    Ok(())
}

fn is_cancelled(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<transcoder_engine::Error>()
        .is_some_and(transcoder_engine::Error::is_cancelled)
}

async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping transcode");
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_maps_through_context() {
        let err = anyhow::Error::new(transcoder_engine::Error::Cancelled).context("while transcoding");
        assert!(is_cancelled(&err));

        let other = anyhow::Error::new(transcoder_engine::Error::Other("boom".to_string()));
        assert!(!is_cancelled(&other));
    }
}
