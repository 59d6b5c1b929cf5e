//! Reconnecting transcode orchestrator.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::args;
use crate::config::TranscoderConfig;
use crate::engine::Engine;
use crate::health::StreamHealthChecker;
use crate::monitor::{ProcessMonitor, SupervisionReport};
use crate::request::TranscodeRequest;
use crate::retry::retry_with_backoff;
use crate::segment;
use crate::{Error, Result};

/// Outcome of a successful [`Transcoder::run`].
#[derive(Debug, Clone)]
pub struct TranscodeSummary {
    pub output: PathBuf,
    /// Engine launches attempted, including the successful one.
    pub attempts: u32,
    pub elapsed: Duration,
    /// Supervision report of the successful run.
    pub report: SupervisionReport,
    /// Number of segments joined, in segmentation mode.
    pub segments: Option<usize>,
}

/// Runs transcode requests against one engine with reconnection.
#[derive(Debug, Clone)]
pub struct Transcoder {
    config: TranscoderConfig,
    engine: Engine,
    checker: StreamHealthChecker,
}

impl Transcoder {
    pub fn new(config: TranscoderConfig) -> Result<Self> {
        config.validate()?;
        let checker = StreamHealthChecker::new(&config.health)?;
        let engine = Engine::new(&config.engine);
        Ok(Self {
            config,
            engine,
            checker,
        })
    }

    pub fn config(&self) -> &TranscoderConfig {
        &self.config
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Transcode `request`, reconnecting on recoverable failures.
    ///
    /// HTTP(S) HLS sources are probed before the first launch and again
    /// before every retried launch. Arguments are compiled once and reused
    /// for every attempt; in segmentation mode the segment directory is
    /// cleared before each launch so only the successful attempt is joined.
    pub async fn run(
        &self,
        request: &TranscodeRequest,
        cancel: &CancellationToken,
    ) -> Result<TranscodeSummary> {
        request.validate()?;
        let started = Instant::now();
        let kind = request.source_kind();
        let probeable = request.is_probeable();

        if probeable && self.config.health.preflight {
            self.preflight(request, cancel).await?;
        }

        let output = PathBuf::from(request.output());
        let segmentation = request
            .segment_duration_secs
            .map(|secs| (secs, segment::segment_dir_for(&output)));
        let args = match &segmentation {
            Some((secs, dir)) => args::compile_segmented(request, dir, *secs),
            None => args::compile(request),
        };
        let segment_dir = segmentation.as_ref().map(|(_, dir)| dir.as_path());

        let monitor = ProcessMonitor::new(self.config.monitor.clone(), request.source());
        let monitor = if probeable {
            monitor.with_health_poll(self.checker.clone(), request.headers.clone())
        } else {
            monitor
        };
        let verify_before_retry = probeable && self.config.health.verify_before_retry;

        info!(
            source = request.source(),
            output = %output.display(),
            ?kind,
            "Starting transcode"
        );

        let args = &args;
        let monitor = &monitor;
        let (report, attempts) = retry_with_backoff(
            &self.config.retry,
            cancel,
            "transcode",
            Error::is_recoverable,
            move |attempt| async move {
                if attempt > 0 && verify_before_retry {
                    self.check_source(request, cancel).await?;
                }
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                // Each attempt restarts numbering at segment_000.
                if let Some(dir) = segment_dir {
                    segment::prepare_dir(dir).await?;
                }
                info!(attempt = attempt + 1, binary = self.engine.binary_path(), "Launching engine");
                let child = self.engine.spawn(args)?;
                monitor.supervise(child, kind, cancel).await
            },
        )
        .await
        .map_err(|e| e.into_error("transcode"))?;

        let segments = match &segmentation {
            Some((_, dir)) => Some(self.join_segments(dir, &output, cancel).await?),
            None => None,
        };

        let elapsed = started.elapsed();
        info!(
            output = %output.display(),
            attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "Transcode finished"
        );
        Ok(TranscodeSummary {
            output,
            attempts,
            elapsed,
            report,
            segments,
        })
    }

    /// Retry the health probe under the policy until the source answers.
    async fn preflight(&self, request: &TranscodeRequest, cancel: &CancellationToken) -> Result<()> {
        info!(url = request.source(), "Checking stream health");
        retry_with_backoff(
            &self.config.retry,
            cancel,
            "health check",
            Error::is_recoverable,
            |_| self.check_source(request, cancel),
        )
        .await
        .map(|((), attempts)| {
            if attempts > 1 {
                info!(attempts, "Stream became reachable");
            }
        })
        .map_err(|e| e.into_error("health check"))
    }

    /// One cancellable health probe of the request source.
    async fn check_source(&self, request: &TranscodeRequest, cancel: &CancellationToken) -> Result<()> {
        let timeout = self.config.retry.health_check_timeout();
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.checker.check(request.source(), &request.headers, timeout) => {
                result.map_err(|e| {
                    warn!(url = request.source(), error = %e, "Stream health check failed");
                    Error::from(e)
                })
            }
        }
    }

    async fn join_segments(
        &self,
        dir: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let segments = segment::collect_segments(dir).await?;
        let list = segment::write_file_list(dir, &segments).await?;
        self.engine.concat(&list, output, cancel).await?;
        Ok(segments.len())
    }
}
