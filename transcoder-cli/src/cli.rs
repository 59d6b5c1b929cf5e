use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use transcoder_engine::{
    HwAccel, QualityOverrides, RequestHeaders, TranscodeRequest, TranscoderConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Transcode a file or live HLS stream through ffmpeg, reconnecting when the
/// source drops.
#[derive(Parser, Debug)]
#[command(name = "transcoder", author, version, about, long_about = None)]
pub struct Args {
    /// Source URL or file path
    pub source: String,

    /// Output file path
    pub output: String,

    /// Hardware decoder family (nvidia, amd, intel, apple)
    #[arg(long, value_name = "VENDOR")]
    pub gpu: Option<String>,

    /// Video encoder (h264, hevc, av1, hevc_videotoolbox, ...); omitted means default
    #[arg(long)]
    pub video_codec: Option<String>,

    /// Audio encoder; omitted means stream copy
    #[arg(long)]
    pub audio_codec: Option<String>,

    /// Encoder preset, translated to each encoder's own scale
    #[arg(long)]
    pub preset: Option<String>,

    /// Drop the audio track
    #[arg(long)]
    pub no_audio: bool,

    /// Target bitrate for hardware encoders, e.g. 4500k or 6M
    #[arg(long, value_name = "RATE")]
    pub target_bitrate: Option<String>,

    /// Prefer 10-bit pixel formats where the encoder supports them
    #[arg(long)]
    pub prefer_10bit: bool,

    /// Round odd frame dimensions down to even values
    #[arg(long)]
    pub even_size: bool,

    /// Original page link, stored as output metadata
    #[arg(long)]
    pub link: Option<String>,

    /// Write fixed-length segments and join them at the end
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u32).range(1..))]
    pub segment_secs: Option<u32>,

    /// VideoToolbox quality (-q:v)
    #[arg(long, value_name = "Q")]
    pub vt_quality: Option<String>,

    /// libx265 CRF
    #[arg(long, value_name = "CRF")]
    pub x265_crf: Option<String>,

    /// SVT-AV1 CRF
    #[arg(long, value_name = "CRF")]
    pub svt_crf: Option<String>,

    /// libaom-av1 CRF
    #[arg(long, value_name = "CRF")]
    pub aom_crf: Option<String>,

    /// Origin header sent to the source
    #[arg(long)]
    pub origin: Option<String>,

    /// Referer header sent to the source
    #[arg(long)]
    pub referer: Option<String>,

    /// User-Agent header sent to the source
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Path to the ffmpeg binary
    #[arg(long, env = "FFMPEG_PATH", value_name = "PATH")]
    pub ffmpeg: Option<String>,

    /// Retries after the first attempt
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Delay before the first retry
    #[arg(long, value_name = "MS")]
    pub initial_delay_ms: Option<u64>,

    /// Upper bound for the retry delay
    #[arg(long, value_name = "MS")]
    pub max_delay_ms: Option<u64>,

    /// Backoff multiplier applied per attempt
    #[arg(long, value_name = "FACTOR")]
    pub backoff: Option<f64>,

    /// Timeout for one stream health probe
    #[arg(long, value_name = "MS")]
    pub health_timeout_ms: Option<u64>,

    /// Skip the health probe before the first launch
    #[arg(long)]
    pub no_preflight: bool,

    /// Disable periodic health probes while the engine runs
    #[arg(long)]
    pub no_health_poll: bool,

    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Args {
    /// Apply flag overrides on top of the loaded configuration.
    pub fn apply_to(&self, config: &mut TranscoderConfig) {
        if let Some(ffmpeg) = &self.ffmpeg {
            config.engine.binary_path = ffmpeg.clone();
        }
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries = max_retries;
        }
        if let Some(initial) = self.initial_delay_ms {
            config.retry.initial_delay_ms = initial;
        }
        if let Some(max) = self.max_delay_ms {
            config.retry.max_delay_ms = max;
        }
        if let Some(backoff) = self.backoff {
            config.retry.backoff_multiplier = backoff;
        }
        if let Some(timeout) = self.health_timeout_ms {
            config.retry.health_check_timeout_ms = timeout;
        }
        if self.no_preflight {
            config.health.preflight = false;
        }
        if self.no_health_poll {
            config.monitor.health_poll_interval_ms = 0;
        }
    }

    pub fn to_request(&self) -> transcoder_engine::Result<TranscodeRequest> {
        let mut request = TranscodeRequest::new(&self.source, &self.output)?
            .with_audio(!self.no_audio)
            .with_prefer_10bit(self.prefer_10bit)
            .with_even_size(self.even_size)
            .with_headers(RequestHeaders {
                origin: self.origin.clone(),
                referer: self.referer.clone(),
                user_agent: self.user_agent.clone(),
            })
            .with_quality(QualityOverrides {
                videotoolbox_q: self.vt_quality.clone(),
                x265_crf: self.x265_crf.clone(),
                svt_crf: self.svt_crf.clone(),
                aom_crf: self.aom_crf.clone(),
            });

        if let Some(gpu) = &self.gpu {
            request = request.with_hw_accel(HwAccel::from_name(gpu));
        }
        if let Some(codec) = &self.video_codec {
            request = request.with_video_codec(codec);
        }
        if let Some(codec) = &self.audio_codec {
            request = request.with_audio_codec(codec);
        }
        if let Some(preset) = &self.preset {
            request = request.with_preset(preset);
        }
        if let Some(bitrate) = &self.target_bitrate {
            request = request.with_target_bitrate(bitrate);
        }
        if let Some(link) = &self.link {
            request = request.with_original_link(link);
        }
        if let Some(secs) = self.segment_secs {
            request = request.with_segments(secs);
        }

        request.validate()?;
        Ok(request)
    }
}
