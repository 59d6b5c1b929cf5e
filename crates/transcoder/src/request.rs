//! Transcode request model.

use std::fmt;

use crate::{Error, Result};

/// Hardware acceleration class used for decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HwAccel {
    /// Software decoding.
    #[default]
    None,
    Nvidia,
    Amd,
    Intel,
    Apple,
}

impl HwAccel {
    /// Resolve a vendor name. Unknown or empty names mean no acceleration.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "nvidia" => Self::Nvidia,
            "amd" => Self::Amd,
            "intel" => Self::Intel,
            "apple" => Self::Apple,
            _ => Self::None,
        }
    }

    /// Engine decoding backend for this class.
    pub fn backend(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Nvidia => Some("cuda"),
            Self::Amd => Some("dxva2"),
            Self::Intel => Some("qsv"),
            Self::Apple => Some("videotoolbox"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Nvidia => "nvidia",
            Self::Amd => "amd",
            Self::Intel => "intel",
            Self::Apple => "apple",
        }
    }
}

impl fmt::Display for HwAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional HTTP headers forwarded to the source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders {
    pub origin: Option<String>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestHeaders {
    pub fn origin(&self) -> Option<&str> {
        non_empty(self.origin.as_deref())
    }

    pub fn referer(&self) -> Option<&str> {
        non_empty(self.referer.as_deref())
    }

    pub fn user_agent(&self) -> Option<&str> {
        non_empty(self.user_agent.as_deref())
    }

    /// `Name: value` lines for every non-empty header, in origin, referer,
    /// user-agent order.
    pub fn lines(&self) -> Vec<String> {
        [
            ("Origin", self.origin()),
            ("Referer", self.referer()),
            ("User-Agent", self.user_agent()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| format!("{name}: {v}")))
        .collect()
    }
}

/// Per-family quality values. Empty fields fall back to the canonical defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualityOverrides {
    /// VideoToolbox `-q:v` value.
    pub videotoolbox_q: Option<String>,
    /// libx265 CRF.
    pub x265_crf: Option<String>,
    /// SVT-AV1 CRF.
    pub svt_crf: Option<String>,
    /// libaom-av1 CRF.
    pub aom_crf: Option<String>,
}

/// A single transcode job.
///
/// Built once per invocation and treated as read-only afterwards.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    /// Source URL or file path.
    pub source: String,
    /// Output file path.
    pub output: String,
    pub hw_accel: HwAccel,
    /// Video encoder selector (empty means stream copy).
    pub video_codec: String,
    /// Audio encoder selector (empty means stream copy).
    pub audio_codec: String,
    /// Preset name; translated per codec.
    pub preset: String,
    pub include_audio: bool,
    pub headers: RequestHeaders,
    /// Emit 10-bit pixel formats where the resolved codec supports them.
    pub prefer_10bit: bool,
    /// Round odd frame dimensions down to even values.
    pub ensure_even_size: bool,
    /// Target bitrate (e.g. `4500k`, `4M`) for hardware encoders.
    pub target_bitrate: Option<String>,
    pub quality: QualityOverrides,
    /// Link to the original page, recorded as output metadata.
    pub original_link: Option<String>,
    /// Segment length in seconds; enables segment-then-concatenate mode.
    pub segment_duration_secs: Option<u32>,
}

impl TranscodeRequest {
    /// Create a request with the required locators and default options.
    pub fn new(source: impl Into<String>, output: impl Into<String>) -> Result<Self> {
        let request = Self {
            source: source.into(),
            output: output.into(),
            hw_accel: HwAccel::None,
            video_codec: String::new(),
            audio_codec: String::new(),
            preset: String::new(),
            include_audio: true,
            headers: RequestHeaders::default(),
            prefer_10bit: false,
            ensure_even_size: false,
            target_bitrate: None,
            quality: QualityOverrides::default(),
            original_link: None,
            segment_duration_secs: None,
        };
        request.validate()?;
        Ok(request)
    }

    /// Check the locator invariants.
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(Error::invalid_request("source must not be empty"));
        }
        if self.output.trim().is_empty() {
            return Err(Error::invalid_request("output must not be empty"));
        }
        if self.segment_duration_secs == Some(0) {
            return Err(Error::invalid_request(
                "segment duration must be at least one second",
            ));
        }
        Ok(())
    }

    pub fn with_hw_accel(mut self, hw_accel: HwAccel) -> Self {
        self.hw_accel = hw_accel;
        self
    }

    pub fn with_video_codec(mut self, codec: impl Into<String>) -> Self {
        self.video_codec = codec.into();
        self
    }

    pub fn with_audio_codec(mut self, codec: impl Into<String>) -> Self {
        self.audio_codec = codec.into();
        self
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }

    pub fn with_audio(mut self, include: bool) -> Self {
        self.include_audio = include;
        self
    }

    pub fn with_headers(mut self, headers: RequestHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_prefer_10bit(mut self, prefer: bool) -> Self {
        self.prefer_10bit = prefer;
        self
    }

    pub fn with_even_size(mut self, ensure: bool) -> Self {
        self.ensure_even_size = ensure;
        self
    }

    pub fn with_target_bitrate(mut self, bitrate: impl Into<String>) -> Self {
        self.target_bitrate = Some(bitrate.into());
        self
    }

    pub fn with_quality(mut self, quality: QualityOverrides) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_original_link(mut self, link: impl Into<String>) -> Self {
        self.original_link = Some(link.into());
        self
    }

    pub fn with_segments(mut self, secs: u32) -> Self {
        self.segment_duration_secs = Some(secs);
        self
    }

    /// Trimmed source locator.
    pub fn source(&self) -> &str {
        self.source.trim()
    }

    /// Trimmed output locator.
    pub fn output(&self) -> &str {
        self.output.trim()
    }

    pub fn source_kind(&self) -> SourceKind {
        SourceKind::detect(self.source())
    }

    /// Whether the source can be probed over HTTP before launching the engine.
    pub fn is_probeable(&self) -> bool {
        let source = self.source().to_lowercase();
        self.source_kind() == SourceKind::Hls
            && (source.starts_with("http://") || source.starts_with("https://"))
    }
}

/// Kind of source, which decides stall thresholds and connection checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Hls,
    File,
}

impl SourceKind {
    /// A source is treated as HLS when it names an `.m3u8` manifest or
    /// mentions `hls` anywhere in its locator.
    pub fn detect(source: &str) -> Self {
        if source.contains(".m3u8") || source.to_lowercase().contains("hls") {
            Self::Hls
        } else {
            Self::File
        }
    }

    pub fn is_hls(&self) -> bool {
        matches!(self, Self::Hls)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
