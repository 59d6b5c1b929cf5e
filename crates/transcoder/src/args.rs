//! Engine argument compiler.
//!
//! Turns a [`TranscodeRequest`] into the ordered token list handed to the
//! engine. Compilation is pure: unrecognized inputs resolve to safe defaults
//! instead of failing.

use std::path::Path;

use crate::request::TranscodeRequest;

/// Safe fallback encoder for unrecognized codec selectors.
pub const DEFAULT_VIDEO_ENCODER: VideoEncoder = VideoEncoder::H264VideoToolbox;

const X265_PARAMS: &str = "aq-mode=3:aq-strength=1.0:qcomp=0.72:rd=4:psy-rd=2.0:psy-rdoq=1.0:deblock=-1,-1:strong-intra-smoothing=0:sao=0";

const DEFAULT_VT_QUALITY: &str = "17";
const DEFAULT_X265_CRF: &str = "18";
const DEFAULT_SVT_CRF: &str = "24";
const DEFAULT_AOM_CRF: &str = "30";

const SEGMENT_PATTERN: &str = "segment_%03d.ts";
pub(crate) const SEGMENT_PLAYLIST: &str = "playlist.m3u8";

/// Video encoder resolved from a codec selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEncoder {
    Copy,
    H264VideoToolbox,
    HevcVideoToolbox,
    Av1VideoToolbox,
    X265,
    SvtAv1,
    AomAv1,
}

impl VideoEncoder {
    /// Resolve a selector through the alias table.
    pub fn resolve(selector: &str) -> Self {
        match selector.trim().to_lowercase().as_str() {
            "" | "copy" => Self::Copy,
            "libx264" | "avc1" | "h264" => Self::H264VideoToolbox,
            "hevc" => Self::HevcVideoToolbox,
            "libx265" | "x265" => Self::X265,
            "av1" | "av1_videotoolbox" => Self::Av1VideoToolbox,
            "libaom" | "libaom-av1" | "aom" => Self::AomAv1,
            "svt" | "libsvtav1" => Self::SvtAv1,
            _ => DEFAULT_VIDEO_ENCODER,
        }
    }

    /// Engine encoder name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::H264VideoToolbox => "h264_videotoolbox",
            Self::HevcVideoToolbox => "hevc_videotoolbox",
            Self::Av1VideoToolbox => "av1_videotoolbox",
            Self::X265 => "libx265",
            Self::SvtAv1 => "libsvtav1",
            Self::AomAv1 => "libaom-av1",
        }
    }

    /// Container tag required for player compatibility.
    pub fn container_tag(&self) -> Option<&'static str> {
        match self {
            Self::HevcVideoToolbox | Self::X265 => Some("hvc1"),
            Self::Av1VideoToolbox | Self::SvtAv1 | Self::AomAv1 => Some("av01"),
            _ => None,
        }
    }

    /// Pixel format, 10-bit only where the encoder supports it.
    pub fn pixel_format(&self, prefer_10bit: bool) -> &'static str {
        match (self, prefer_10bit) {
            (Self::HevcVideoToolbox, true) => "p010le",
            (Self::X265 | Self::SvtAv1 | Self::AomAv1, true) => "yuv420p10le",
            _ => "yuv420p",
        }
    }

    pub fn is_software(&self) -> bool {
        matches!(self, Self::X265 | Self::SvtAv1 | Self::AomAv1)
    }

    pub fn is_videotoolbox(&self) -> bool {
        matches!(
            self,
            Self::H264VideoToolbox | Self::HevcVideoToolbox | Self::Av1VideoToolbox
        )
    }
}

/// Compile the full argument list for a single-output run.
pub fn compile(request: &TranscodeRequest) -> Vec<String> {
    let mut args = encoding_args(request);
    args.extend(["-y".to_string(), request.output().to_string()]);
    args
}

/// Compile a run that writes numbered MPEG-TS segments into `dir`.
pub fn compile_segmented(request: &TranscodeRequest, dir: &Path, segment_secs: u32) -> Vec<String> {
    let mut args = encoding_args(request);
    args.extend([
        "-f".to_string(),
        "segment".to_string(),
        "-segment_time".to_string(),
        segment_secs.to_string(),
        "-segment_format".to_string(),
        "mpegts".to_string(),
        "-reset_timestamps".to_string(),
        "1".to_string(),
        "-segment_list".to_string(),
        dir.join(SEGMENT_PLAYLIST).to_string_lossy().into_owned(),
        "-segment_list_type".to_string(),
        "m3u8".to_string(),
        "-y".to_string(),
        dir.join(SEGMENT_PATTERN).to_string_lossy().into_owned(),
    ]);
    args
}

/// Compile the concat invocation joining the segments named in `list`.
pub fn compile_concat(list: &Path, output: &Path) -> Vec<String> {
    vec![
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        list.to_string_lossy().into_owned(),
        "-c".to_string(),
        "copy".to_string(),
        "-y".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Everything up to, but not including, the output tokens.
fn encoding_args(request: &TranscodeRequest) -> Vec<String> {
    let mut args = Vec::new();

    // 1. Decoder acceleration
    if let Some(backend) = request.hw_accel.backend() {
        args.extend(["-hwaccel".to_string(), backend.to_string()]);
    }

    // 2. Request headers as one CRLF-joined block
    let headers = request.headers.lines();
    if !headers.is_empty() {
        args.extend(["-headers".to_string(), headers.join("\r\n")]);
    }

    // 3. Input
    args.extend(["-i".to_string(), request.source().to_string()]);
    if let Some(link) = request
        .original_link
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
    {
        args.extend(["-metadata".to_string(), format!("url=\"{link}\"")]);
    }

    // 4. Video encoder
    let encoder = VideoEncoder::resolve(&request.video_codec);
    args.extend(["-c:v".to_string(), encoder.as_str().to_string()]);

    // 5. Compatibility and rate control, only when re-encoding
    if encoder != VideoEncoder::Copy {
        if let Some(tag) = encoder.container_tag() {
            args.extend(["-tag:v".to_string(), tag.to_string()]);
        }
        args.extend([
            "-pix_fmt".to_string(),
            encoder.pixel_format(request.prefer_10bit).to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
        ]);
        if request.ensure_even_size {
            args.extend([
                "-vf".to_string(),
                "scale=trunc(iw/2)*2:trunc(ih/2)*2".to_string(),
            ]);
        }
        args.extend(rate_control_args(encoder, request));
    }

    // 6. Audio
    args.extend(audio_args(request));

    args
}

fn rate_control_args(encoder: VideoEncoder, request: &TranscodeRequest) -> Vec<String> {
    let quality = &request.quality;
    let preset = native_preset(encoder, &request.preset);

    match encoder {
        VideoEncoder::X265 => strings(&[
            "-crf",
            or_default(quality.x265_crf.as_deref(), DEFAULT_X265_CRF),
            "-preset",
            &preset,
            "-tune",
            "grain",
            "-x265-params",
            X265_PARAMS,
            "-g",
            "250",
        ]),
        VideoEncoder::SvtAv1 => strings(&[
            "-crf",
            or_default(quality.svt_crf.as_deref(), DEFAULT_SVT_CRF),
            "-preset",
            &preset,
            "-g",
            "300",
            "-svtav1-params",
            "tune=0:scd=1",
        ]),
        VideoEncoder::AomAv1 => strings(&[
            "-crf",
            or_default(quality.aom_crf.as_deref(), DEFAULT_AOM_CRF),
            "-cpu-used",
            &preset,
            "-row-mt",
            "1",
            "-tile-columns",
            "1",
            "-tile-rows",
            "0",
            "-aq-mode",
            "1",
            "-g",
            "300",
        ]),
        VideoEncoder::H264VideoToolbox
        | VideoEncoder::HevcVideoToolbox
        | VideoEncoder::Av1VideoToolbox => {
            let target = request
                .target_bitrate
                .as_deref()
                .map(str::trim)
                .filter(|b| !b.is_empty());

            let mut args = match target {
                Some(rate) => {
                    let mut args = strings(&["-b:v", rate, "-maxrate", rate]);
                    if let Some(bufsize) = double_rate(rate) {
                        args.extend(["-bufsize".to_string(), bufsize]);
                    }
                    args
                }
                None => strings(&[
                    "-b:v",
                    "0",
                    "-q:v",
                    or_default(quality.videotoolbox_q.as_deref(), DEFAULT_VT_QUALITY),
                ]),
            };
            args.extend(["-g".to_string(), "300".to_string()]);
            args
        }
        VideoEncoder::Copy => Vec::new(),
    }
}

fn audio_args(request: &TranscodeRequest) -> Vec<String> {
    if !request.include_audio {
        return vec!["-an".to_string()];
    }
    match request.audio_codec.trim().to_lowercase().as_str() {
        "" | "copy" => strings(&["-c:a", "copy"]),
        _ => vec!["-c:a".to_string(), request.audio_codec.trim().to_string()],
    }
}

/// Translate a preset name into the encoder's native scale.
///
/// Slower presets map to lower values. Numeric presets pass through and
/// unknown names take the encoder default.
pub fn native_preset(encoder: VideoEncoder, preset: &str) -> String {
    let preset = preset.trim().to_lowercase();
    if !preset.is_empty() && preset.chars().all(|c| c.is_ascii_digit()) {
        return preset;
    }

    let mapped = match encoder {
        VideoEncoder::SvtAv1 => match preset.as_str() {
            "placebo" | "veryslow" => "3",
            "slower" => "4",
            "slow" => "5",
            "fast" => "7",
            "faster" => "8",
            "veryfast" => "9",
            "superfast" => "10",
            "ultrafast" => "12",
            _ => "6",
        },
        VideoEncoder::AomAv1 => match preset.as_str() {
            "placebo" | "veryslow" => "1",
            "slower" => "2",
            "slow" => "3",
            "fast" => "5",
            "faster" => "6",
            "veryfast" => "7",
            "superfast" | "ultrafast" => "8",
            _ => "4",
        },
        VideoEncoder::X265 => match preset.as_str() {
            "ultrafast" | "superfast" | "veryfast" | "faster" | "fast" | "medium" | "slow"
            | "slower" | "veryslow" | "placebo" => return preset,
            _ => "slow",
        },
        _ => return preset,
    };
    mapped.to_string()
}

/// Double a bitrate like `4500k` or `4M`, keeping its unit.
pub fn double_rate(rate: &str) -> Option<String> {
    let rate = rate.trim().to_lowercase();
    let (value, unit) = if let Some(value) = rate.strip_suffix('k') {
        (value, "k")
    } else if let Some(value) = rate.strip_suffix('m') {
        (value, "M")
    } else {
        return None;
    };

    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => n.checked_mul(2).map(|doubled| format!("{doubled}{unit}")),
        _ => None,
    }
}

fn or_default<'a>(value: Option<&'a str>, default: &'a str) -> &'a str {
    value.map(str::trim).filter(|v| !v.is_empty()).unwrap_or(default)
}

fn strings(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}
