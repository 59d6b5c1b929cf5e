//! End-to-end supervision tests against scripted fake engines.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use transcoder_engine::{
    EngineConfig, Error, HealthCheckError, HealthConfig, MonitorConfig, RetryPolicy,
    TranscodeRequest, Transcoder, TranscoderConfig,
};

/// Scratch directory holding a fake engine and its invocation counter.
struct FakeEngine {
    dir: TempDir,
}

impl FakeEngine {
    /// `body` runs after `$n` has been set to the 1-based invocation number.
    fn new(body: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("invocations");
        let script = format!(
            "#!/bin/sh\nn=$(cat '{counter}' 2>/dev/null || echo 0)\nn=$((n + 1))\necho $n > '{counter}'\n{body}\n",
            counter = counter.display()
        );
        let path = dir.path().join("fake-ffmpeg");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    fn path(&self) -> PathBuf {
        self.dir.path().join("fake-ffmpeg")
    }

    fn invocations(&self) -> u32 {
        std::fs::read_to_string(self.dir.path().join("invocations"))
            .map(|s| s.trim().parse().unwrap())
            .unwrap_or(0)
    }
}

fn config(engine: &Path, max_retries: u32) -> TranscoderConfig {
    TranscoderConfig {
        engine: EngineConfig {
            binary_path: engine.to_string_lossy().into_owned(),
        },
        retry: RetryPolicy {
            max_retries,
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
            health_check_timeout_ms: 2_000,
            use_jitter: false,
        },
        monitor: MonitorConfig {
            check_interval_ms: 50,
            hls_stall_timeout_ms: 5_000,
            file_stall_timeout_ms: 5_000,
            health_poll_interval_ms: 0,
            health_probe_timeout_ms: 1_000,
            drain_grace_ms: 500,
        },
        health: HealthConfig::default(),
    }
}

#[derive(Clone)]
struct Manifest {
    hits: Arc<AtomicU32>,
    healthy_hits: u32,
}

async fn manifest(State(manifest): State<Manifest>) -> Response {
    let hit = manifest.hits.fetch_add(1, Ordering::SeqCst) + 1;
    if hit <= manifest.healthy_hits {
        (
            [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
            "#EXTM3U\n#EXT-X-TARGETDURATION:4\n",
        )
            .into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// Serve `/live.m3u8`, healthy for the first `healthy_hits` requests.
async fn serve_manifest(healthy_hits: u32) -> (String, Arc<AtomicU32>) {
    let hits = Arc::new(AtomicU32::new(0));
    let state = Manifest {
        hits: hits.clone(),
        healthy_hits,
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/live.m3u8", get(manifest))
        .with_state(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/live.m3u8"), hits)
}

const STATS_LINE: &str = "echo 'frame=   25 fps=25 size=      64kB time=00:00:01.00 bitrate= 524.3kbits/s speed=1.0x' >&2";
const OPENING_LINE: &str = "echo \"[hls @ 0x1] Opening 'http://127.0.0.1/live.m3u8' for reading\" >&2";

#[tokio::test]
async fn recoverable_failure_is_retried_until_success() {
    let engine = FakeEngine::new(&format!(
        "if [ \"$n\" -eq 1 ]; then echo 'Error: Connection reset by peer' >&2; exit 1; fi\n{STATS_LINE}\nexit 0"
    ));
    let transcoder = Transcoder::new(config(&engine.path(), 3)).unwrap();
    let request = TranscodeRequest::new("/media/input.mp4", "/media/output.mp4").unwrap();

    let summary = transcoder
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.attempts, 2);
    assert_eq!(engine.invocations(), 2);
    assert_eq!(summary.report.progress.map(|p| p.time_secs), Some(1.0));
    assert_eq!(summary.segments, None);
}

#[tokio::test]
async fn fatal_input_error_is_not_retried() {
    let engine = FakeEngine::new(
        "echo 'Error opening input file /media/missing.mp4: No such file or directory' >&2\nexit 1",
    );
    let transcoder = Transcoder::new(config(&engine.path(), 5)).unwrap();
    let request = TranscodeRequest::new("/media/missing.mp4", "/media/output.mp4").unwrap();

    let err = transcoder
        .run(&request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(engine.invocations(), 1);
    match err {
        Error::Aborted {
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(attempts, 1);
            assert!(matches!(*last_error, Error::ExecutionFailed { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn bare_missing_input_line_is_not_retried() {
    let engine = FakeEngine::new("echo 'missing.mp4: No such file or directory' >&2\nexit 1");
    let transcoder = Transcoder::new(config(&engine.path(), 5)).unwrap();
    let request = TranscodeRequest::new("missing.mp4", "/media/output.mp4").unwrap();

    let err = transcoder
        .run(&request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(engine.invocations(), 1);
    assert!(matches!(err, Error::Aborted { attempts: 1, .. }), "{err:?}");
    assert!(err.to_string().contains("No such file or directory"));
}

#[tokio::test]
async fn bare_invalid_data_line_is_not_retried() {
    let engine =
        FakeEngine::new("echo 'input.ts: Invalid data found when processing input' >&2\nexit 1");
    let transcoder = Transcoder::new(config(&engine.path(), 5)).unwrap();
    let request = TranscodeRequest::new("input.ts", "/media/output.mp4").unwrap();

    let err = transcoder
        .run(&request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(engine.invocations(), 1);
    assert!(matches!(err, Error::Aborted { .. }), "{err:?}");
}

#[tokio::test]
async fn exhausted_retries_report_attempt_count() {
    let engine = FakeEngine::new("echo 'Error: network is unreachable' >&2\nexit 1");
    let transcoder = Transcoder::new(config(&engine.path(), 2)).unwrap();
    let request = TranscodeRequest::new("/media/input.mp4", "/media/output.mp4").unwrap();

    let err = transcoder
        .run(&request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(engine.invocations(), 3);
    assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
    assert!(err.to_string().contains("after 3 attempts"));
}

#[tokio::test]
async fn hls_source_is_reverified_before_each_retry() {
    let (url, hits) = serve_manifest(u32::MAX).await;
    let engine = FakeEngine::new(&format!(
        "{OPENING_LINE}\nif [ \"$n\" -eq 1 ]; then echo 'Connection timed out, error' >&2; exit 1; fi\n{STATS_LINE}\nexit 0"
    ));
    let transcoder = Transcoder::new(config(&engine.path(), 3)).unwrap();
    let request = TranscodeRequest::new(&url, "/tmp/live.mp4").unwrap();

    let summary = transcoder
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.attempts, 2);
    assert_eq!(engine.invocations(), 2);
    // One pre-flight check plus one before the retried launch.
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dead_source_skips_engine_launches() {
    let (url, hits) = serve_manifest(1).await;
    let engine = FakeEngine::new(&format!(
        "{OPENING_LINE}\necho 'Connection timed out, error' >&2\nexit 1"
    ));
    let transcoder = Transcoder::new(config(&engine.path(), 2)).unwrap();
    let request = TranscodeRequest::new(&url, "/tmp/live.mp4").unwrap();

    let err = transcoder
        .run(&request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(engine.invocations(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    match err {
        Error::RetriesExhausted {
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(attempts, 3);
            assert!(matches!(
                *last_error,
                Error::HealthCheck(HealthCheckError::BadStatus { .. })
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn manifest_going_away_mid_run_stops_engine() {
    // Healthy for the pre-flight and the first in-run poll only.
    let (url, hits) = serve_manifest(2).await;
    let engine = FakeEngine::new(&format!(
        "{OPENING_LINE}\nwhile true; do {STATS_LINE}; sleep 0.05; done"
    ));
    let mut config = config(&engine.path(), 0);
    config.monitor.health_poll_interval_ms = 100;
    let transcoder = Transcoder::new(config).unwrap();
    let request = TranscodeRequest::new(&url, "/tmp/live.mp4").unwrap();

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        transcoder.run(&request, &CancellationToken::new()),
    )
    .await
    .expect("engine was not stopped")
    .unwrap_err();

    assert_eq!(engine.invocations(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    match err {
        Error::RetriesExhausted { last_error, .. } => match *last_error {
            Error::ConnectionFailed { reason, .. } => {
                assert!(reason.contains("stream returned HTTP 404"), "{reason}");
            }
            other => panic!("unexpected last error: {other:?}"),
        },
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_preflight_never_launches_engine() {
    let (url, _hits) = serve_manifest(0).await;
    let engine = FakeEngine::new("exit 0");
    let transcoder = Transcoder::new(config(&engine.path(), 1)).unwrap();
    let request = TranscodeRequest::new(&url, "/tmp/live.mp4").unwrap();

    let err = transcoder
        .run(&request, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(engine.invocations(), 0);
    assert!(
        matches!(err, Error::RetriesExhausted { operation: "health check", attempts: 2, .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn cancellation_during_backoff_stops_the_run() {
    let engine = FakeEngine::new("echo 'Error: Connection refused' >&2\nexit 1");
    let mut config = config(&engine.path(), 5);
    config.retry.initial_delay_ms = 60_000;
    config.retry.max_delay_ms = 60_000;
    let transcoder = Transcoder::new(config).unwrap();
    let request = TranscodeRequest::new("/media/input.mp4", "/media/output.mp4").unwrap();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let err = tokio::time::timeout(Duration::from_secs(10), transcoder.run(&request, &cancel))
        .await
        .expect("run did not observe cancellation")
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(engine.invocations(), 1);
}

/// Fake engine for segmentation mode. Encoding runs write `$SEGMENTS`
/// segments into the directory of the output pattern; concat runs write
/// `joined` to their output.
fn segmenting_engine(encode: &str) -> FakeEngine {
    FakeEngine::new(&format!(
        r#"for last; do :; done
case "$*" in
  *"-f concat"*) echo joined > "$last"; exit 0 ;;
esac
d=$(dirname "$last")
write_segments() {{ i=0; while [ $i -lt "$1" ]; do printf x > "$d/segment_$(printf %03d $i).ts"; i=$((i + 1)); done; }}
{STATS_LINE}
{encode}"#
    ))
}

fn read_list(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("filelist.txt"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn segmented_run_is_concatenated() {
    let engine = segmenting_engine("write_segments 2\nexit 0");
    let out_dir = TempDir::new().unwrap();
    let output = out_dir.path().join("show.mp4");
    let transcoder = Transcoder::new(config(&engine.path(), 0)).unwrap();
    let request = TranscodeRequest::new("/media/input.mp4", output.to_string_lossy())
        .unwrap()
        .with_segments(600);

    let summary = transcoder
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.segments, Some(2));
    assert_eq!(engine.invocations(), 2);
    assert_eq!(std::fs::read_to_string(&output).unwrap().trim(), "joined");

    let list = read_list(&out_dir.path().join("show_segments"));
    assert_eq!(list.len(), 2);
    assert!(list[0].ends_with("segment_000.ts'"));
}

#[tokio::test]
async fn stale_segments_from_an_earlier_run_are_not_joined() {
    let engine = segmenting_engine("write_segments 2\nexit 0");
    let out_dir = TempDir::new().unwrap();
    let segment_dir = out_dir.path().join("show_segments");
    std::fs::create_dir_all(&segment_dir).unwrap();
    std::fs::write(segment_dir.join("segment_007.ts"), b"old").unwrap();

    let output = out_dir.path().join("show.mp4");
    let transcoder = Transcoder::new(config(&engine.path(), 0)).unwrap();
    let request = TranscodeRequest::new("/media/input.mp4", output.to_string_lossy())
        .unwrap()
        .with_segments(600);

    let summary = transcoder
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.segments, Some(2));
    assert!(!segment_dir.join("segment_007.ts").exists());
    assert!(read_list(&segment_dir).iter().all(|line| !line.contains("segment_007")));
}

#[tokio::test]
async fn failed_attempt_segments_are_discarded_on_retry() {
    let engine = segmenting_engine(
        "if [ \"$n\" -eq 1 ]; then write_segments 3; echo 'Error: Connection reset by peer' >&2; exit 1; fi\nwrite_segments 2\nexit 0",
    );
    let out_dir = TempDir::new().unwrap();
    let output = out_dir.path().join("show.mp4");
    let transcoder = Transcoder::new(config(&engine.path(), 2)).unwrap();
    let request = TranscodeRequest::new("/media/input.mp4", output.to_string_lossy())
        .unwrap()
        .with_segments(600);

    let summary = transcoder
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.attempts, 2);
    assert_eq!(summary.segments, Some(2));
    assert_eq!(engine.invocations(), 3);
    assert!(!out_dir.path().join("show_segments").join("segment_002.ts").exists());
}

#[tokio::test]
async fn extensionless_output_keeps_segments_apart() {
    let engine = segmenting_engine("write_segments 1\nexit 0");
    let out_dir = TempDir::new().unwrap();
    let output = out_dir.path().join("recording");
    let transcoder = Transcoder::new(config(&engine.path(), 0)).unwrap();
    let request = TranscodeRequest::new("/media/input.mp4", output.to_string_lossy())
        .unwrap()
        .with_segments(600);

    let summary = transcoder
        .run(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.segments, Some(1));
    assert!(output.is_file());
    assert!(out_dir.path().join("recording_segments").is_dir());
}
