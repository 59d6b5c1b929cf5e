//! Resilient ffmpeg transcoding supervisor.
//!
//! The crate compiles a [`TranscodeRequest`] into engine arguments, launches
//! the engine, watches its output for progress and failure signals, and
//! reconnects with exponential backoff when the source misbehaves.
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use transcoder_engine::{TranscodeRequest, Transcoder, TranscoderConfig};
//!
//! # async fn example() -> transcoder_engine::Result<()> {
//! let transcoder = Transcoder::new(TranscoderConfig::default())?;
//! let request = TranscodeRequest::new("https://cdn.example/live.m3u8", "live.mp4")?
//!     .with_video_codec("hevc");
//! let summary = transcoder.run(&request, &CancellationToken::new()).await?;
//! println!("done after {} attempts", summary.attempts);
//! # Ok(())
//! # }
//! ```

pub mod args;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod monitor;
pub mod request;
pub mod retry;
pub mod segment;
pub mod transcoder;

pub use config::TranscoderConfig;
pub use engine::{Engine, EngineConfig};
pub use error::{Error, HealthCheckError, Result};
pub use health::{HealthConfig, StreamHealthChecker};
pub use monitor::{MonitorConfig, ProcessMonitor, SupervisionReport};
pub use request::{HwAccel, QualityOverrides, RequestHeaders, SourceKind, TranscodeRequest};
pub use retry::{RetryError, RetryPolicy, retry_with_backoff};
pub use transcoder::{TranscodeSummary, Transcoder};
