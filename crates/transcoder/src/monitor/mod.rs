//! Engine process monitor.
//!
//! One supervision runs a small fixed set of workers against a running engine:
//!
//! - a stdout reader refreshing progress;
//! - a stderr reader classifying diagnostics;
//! - a stall checker that kills the engine when progress stops;
//! - an optional health poller re-probing HLS sources.
//!
//! All of them share one [`ProcessObservation`] behind a single lock. The
//! outcome is decided from one snapshot taken after every worker has been
//! joined.

mod observation;
mod parser;
mod reader;

pub use observation::{ObservationSnapshot, ProcessObservation};
pub use parser::{Diagnostic, TranscodeProgress, is_progress_marker, parse_progress, parse_time};
pub use reader::RecordReader;

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::health::StreamHealthChecker;
use crate::request::{RequestHeaders, SourceKind};
use crate::{Error, Result};

type SharedObservation = Arc<Mutex<ProcessObservation>>;

/// Monitor timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between stall checks in milliseconds.
    pub check_interval_ms: u64,
    /// Stall threshold for HLS sources in milliseconds.
    pub hls_stall_timeout_ms: u64,
    /// Stall threshold for file sources in milliseconds.
    pub file_stall_timeout_ms: u64,
    /// Interval of the in-run health poll for HLS sources; 0 disables it.
    pub health_poll_interval_ms: u64,
    /// Timeout of each in-run health probe in milliseconds.
    pub health_probe_timeout_ms: u64,
    /// How long readers may keep draining output after the engine exits.
    pub drain_grace_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5_000,
            hls_stall_timeout_ms: 45_000,
            file_stall_timeout_ms: 90_000,
            health_poll_interval_ms: 30_000,
            health_probe_timeout_ms: 5_000,
            drain_grace_ms: 2_000,
        }
    }
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    /// Stall threshold for a source kind. Live manifests refresh every few
    /// seconds, so HLS gets the shorter one.
    pub fn stall_threshold(&self, kind: SourceKind) -> Duration {
        match kind {
            SourceKind::Hls => Duration::from_millis(self.hls_stall_timeout_ms),
            SourceKind::File => Duration::from_millis(self.file_stall_timeout_ms),
        }
    }

    pub fn health_poll_interval(&self) -> Option<Duration> {
        (self.health_poll_interval_ms > 0).then(|| Duration::from_millis(self.health_poll_interval_ms))
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

/// Successful supervision of one engine run.
#[derive(Debug, Clone)]
pub struct SupervisionReport {
    pub status: ExitStatus,
    pub elapsed: Duration,
    /// Last record that counted as progress.
    pub last_progress: Option<String>,
    /// Last parsed stats line.
    pub progress: Option<TranscodeProgress>,
}

#[derive(Debug, Clone)]
struct HealthPoll {
    checker: StreamHealthChecker,
    headers: RequestHeaders,
    interval: Duration,
    timeout: Duration,
}

/// Supervises engine processes for one source.
#[derive(Debug, Clone)]
pub struct ProcessMonitor {
    config: MonitorConfig,
    source_url: String,
    health: Option<HealthPoll>,
}

impl ProcessMonitor {
    pub fn new(config: MonitorConfig, source_url: impl Into<String>) -> Self {
        Self {
            config,
            source_url: source_url.into(),
            health: None,
        }
    }

    /// Enable the in-run health poll for HLS sources, if the configuration
    /// has a poll interval.
    pub fn with_health_poll(mut self, checker: StreamHealthChecker, headers: RequestHeaders) -> Self {
        self.health = self.config.health_poll_interval().map(|interval| HealthPoll {
            checker,
            headers,
            interval,
            timeout: self.config.health_probe_timeout(),
        });
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Supervise `child` until it exits and classify the run.
    ///
    /// Cancelling `cancel` kills the engine and yields [`Error::Cancelled`].
    /// Otherwise flags are inspected in priority order: stall timeout, then
    /// connection failure (including an HLS run that never logged a
    /// connection attempt), then stream disconnect, then the exit status.
    pub async fn supervise(
        &self,
        mut child: Child,
        kind: SourceKind,
        cancel: &CancellationToken,
    ) -> Result<SupervisionReport> {
        let started = Instant::now();
        let threshold = self.config.stall_threshold(kind);
        let observation: SharedObservation = Arc::new(Mutex::new(ProcessObservation::new(kind)));

        // Fired by external cancellation or by a worker that wants the engine gone.
        let kill = cancel.child_token();
        // Stops periodic workers once the engine has exited.
        let timers = CancellationToken::new();
        // Stops readers that are still draining after the grace period.
        let readers = CancellationToken::new();

        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(4);
        if let Some(stdout) = child.stdout.take() {
            workers.push(tokio::spawn(read_progress(
                stdout,
                observation.clone(),
                readers.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            workers.push(tokio::spawn(read_diagnostics(
                stderr,
                observation.clone(),
                readers.clone(),
            )));
        }
        workers.push(tokio::spawn(check_stalls(
            observation.clone(),
            self.config.check_interval(),
            threshold,
            kill.clone(),
            timers.clone(),
        )));
        if let (SourceKind::Hls, Some(poll)) = (kind, self.health.clone()) {
            workers.push(tokio::spawn(poll_health(
                observation.clone(),
                self.source_url.clone(),
                poll,
                kill.clone(),
                timers.clone(),
            )));
        }

        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill.cancelled() => {
                debug!(pid = ?child.id(), "Stopping engine process");
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "Failed to kill engine process");
                }
                child.wait().await
            }
        };
        timers.cancel();

        let deadline = tokio::time::Instant::now() + self.config.drain_grace();
        for worker in &mut workers {
            let joined = match tokio::time::timeout_at(deadline, &mut *worker).await {
                Ok(joined) => joined,
                Err(_) => {
                    readers.cancel();
                    worker.await
                }
            };
            if let Err(e) = joined {
                warn!(error = %e, "Monitor worker failed");
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let snapshot = observation.lock().snapshot();
        let elapsed = started.elapsed();

        if let Some(stalled_for) = snapshot.timed_out {
            return Err(Error::Timeout {
                stalled_for,
                threshold,
            });
        }
        if let Some(reason) = snapshot.connection_failure {
            return Err(Error::ConnectionFailed {
                source_url: self.source_url.clone(),
                reason,
            });
        }
        if kind.is_hls() && !snapshot.connection_attempted {
            return Err(Error::ConnectionFailed {
                source_url: self.source_url.clone(),
                reason: "engine never logged a connection attempt".to_string(),
            });
        }
        if let Some(line) = snapshot.disconnect {
            return Err(Error::StreamDisconnected {
                source_url: self.source_url.clone(),
                line,
            });
        }

        let status = status.map_err(|e| Error::Other(format!("failed to wait for engine: {e}")))?;
        if !status.success() {
            return Err(Error::ExecutionFailed {
                status: status.to_string(),
                detail: snapshot.failure_detail(),
            });
        }

        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            progress = ?snapshot.progress,
            "Engine finished"
        );
        Ok(SupervisionReport {
            status,
            elapsed,
            last_progress: snapshot.last_progress,
            progress: snapshot.progress,
        })
    }
}

async fn read_progress<R>(stream: R, observation: SharedObservation, stop: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut reader = RecordReader::new(stream);
    loop {
        let record = tokio::select! {
            _ = stop.cancelled() => break,
            record = reader.next_record() => record,
        };
        match record {
            Ok(Some(line)) => {
                trace!(target: "transcoder_engine::engine::stdout", "{line}");
                if is_progress_marker(&line) {
                    let parsed = parse_progress(&line);
                    observation
                        .lock()
                        .record_progress(Instant::now(), &line, parsed);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Engine stdout closed with error");
                break;
            }
        }
    }
}

async fn read_diagnostics<R>(stream: R, observation: SharedObservation, stop: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut reader = RecordReader::new(stream);
    loop {
        let record = tokio::select! {
            _ = stop.cancelled() => break,
            record = reader.next_record() => record,
        };
        let line = match record {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Engine stderr closed with error");
                break;
            }
        };

        let diagnostic = Diagnostic::classify(&line);
        let parsed = parse_progress(&line);
        if diagnostic.is_error || diagnostic.disconnected {
            debug!(target: "transcoder_engine::engine::stderr", "{line}");
        } else {
            trace!(target: "transcoder_engine::engine::stderr", "{line}");
        }

        let mut observation = observation.lock();
        observation.record_diagnostic(&line, diagnostic);
        if parsed.is_some() {
            observation.record_progress(Instant::now(), &line, parsed);
        } else if diagnostic.stream_detected {
            observation.record_progress(Instant::now(), "stream detected", None);
        }
    }
}

async fn check_stalls(
    observation: SharedObservation,
    interval: Duration,
    threshold: Duration,
    kill: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = kill.cancelled() => break,
            _ = ticker.tick() => {
                let stalled = observation.lock().check_stall(Instant::now(), threshold);
                if let Some(stalled_for) = stalled {
                    warn!(
                        stalled_ms = stalled_for.as_millis() as u64,
                        threshold_ms = threshold.as_millis() as u64,
                        "No progress from engine, stopping it"
                    );
                    kill.cancel();
                    break;
                }
            }
        }
    }
}

async fn poll_health(
    observation: SharedObservation,
    url: String,
    poll: HealthPoll,
    kill: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = kill.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = stop.cancelled() => break,
            _ = kill.cancelled() => break,
            result = poll.checker.check(&url, &poll.headers, poll.timeout) => result,
        };
        if let Err(e) = result {
            warn!(url = %url, error = %e, "Health probe failed during transcode");
            observation
                .lock()
                .record_connection_failure(format!("health probe failed: {e}"));
            kill.cancel();
            break;
        }
        trace!(url = %url, "Health probe passed");
    }
}
