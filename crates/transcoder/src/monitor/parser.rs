//! Text protocol of the engine's output streams.
//!
//! Two kinds of record matter: ffmpeg stats lines
//! (`frame=… fps=… size=…kB time=HH:MM:SS.ms bitrate=…kbits/s speed=…x`),
//! which prove the run is moving, and diagnostic lines, which carry
//! connection and failure evidence.

use std::fmt;

use crate::error::message_is_recoverable;

/// Fragments that mark a connection attempt.
const CONNECT_MARKERS: &[&str] = &["opening", "connection"];
/// Fragments that mark a failure line.
const ERROR_MARKERS: &[&str] = &["error", "failed"];
/// Fragments that turn a failure line into a connection failure.
const NETWORK_MARKERS: &[&str] = &["connection", "network", "timeout", "unreachable"];
/// Fragments that mark the source going away mid-run.
const DISCONNECT_MARKERS: &[&str] = &["eof", "broken pipe", "connection lost", "stream ended"];

/// Progress parsed from one stats line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscodeProgress {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    /// Output size in bytes.
    pub size_bytes: Option<u64>,
    /// Media time written so far, in seconds.
    pub time_secs: f64,
    pub bitrate_kbps: Option<f64>,
    /// Encoding speed relative to realtime.
    pub speed: Option<f64>,
}

impl fmt::Display for TranscodeProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "time={:.2}s", self.time_secs)?;
        if let Some(frame) = self.frame {
            write!(f, " frame={frame}")?;
        }
        if let Some(size) = self.size_bytes {
            write!(f, " size={}kB", size / 1024)?;
        }
        if let Some(speed) = self.speed {
            write!(f, " speed={speed:.2}x")?;
        }
        Ok(())
    }
}

/// Signals carried by one diagnostic record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostic {
    pub connection_attempted: bool,
    pub is_error: bool,
    pub connection_failed: bool,
    pub disconnected: bool,
    /// A stream description such as `Stream #0:0: Video: h264`.
    pub stream_detected: bool,
    /// Names a problem with the input or invocation that a retry cannot fix,
    /// e.g. `in.mp4: No such file or directory`.
    pub structural: bool,
    /// An ffmpeg stats line.
    pub is_stats: bool,
}

impl Diagnostic {
    /// Classify one diagnostic record, case-insensitively.
    pub fn classify(line: &str) -> Self {
        let lower = line.to_lowercase();
        let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

        let is_error = has(ERROR_MARKERS);
        Self {
            connection_attempted: has(CONNECT_MARKERS),
            is_error,
            connection_failed: is_error && has(NETWORK_MARKERS),
            disconnected: has(DISCONNECT_MARKERS),
            stream_detected: lower.contains("stream")
                && (lower.contains("video") || lower.contains("audio")),
            structural: !message_is_recoverable(&lower),
            is_stats: is_stats_line(line),
        }
    }
}

/// Whether a stdout record shows forward progress.
pub fn is_progress_marker(line: &str) -> bool {
    line.contains("time=") || line.contains("size=")
}

fn is_stats_line(line: &str) -> bool {
    line.contains("time=") && (line.contains("frame=") || line.contains("size="))
}

/// Parse a stats line. `time=` plus either `frame=` or `size=` is required
/// so unrelated lines are not mistaken for progress.
pub fn parse_progress(line: &str) -> Option<TranscodeProgress> {
    if !is_stats_line(line) {
        return None;
    }

    Some(TranscodeProgress {
        frame: field(line, "frame=").and_then(|v| v.parse().ok()),
        fps: field(line, "fps=").and_then(|v| v.parse().ok()),
        size_bytes: parse_size(line),
        time_secs: field(line, "time=").and_then(parse_time).unwrap_or(0.0),
        bitrate_kbps: field(line, "bitrate=")
            .and_then(|v| v.strip_suffix("kbits/s"))
            .and_then(|v| v.parse().ok()),
        speed: field(line, "speed=")
            .and_then(|v| v.strip_suffix('x'))
            .and_then(|v| v.parse().ok()),
    })
}

/// Parse `HH:MM:SS.ms` into seconds.
pub fn parse_time(time: &str) -> Option<f64> {
    let mut parts = time.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// `size=` in bytes. ffmpeg reports kibibytes (`kB` or `KiB`).
fn parse_size(line: &str) -> Option<u64> {
    let value = field(line, "size=")?;
    let end = value.find(['k', 'K'])?;
    let kib: u64 = value[..end].parse().ok()?;
    Some(kib * 1024)
}

/// Value following `key`, with ffmpeg's column padding skipped.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let value = &rest[..end];
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("00:00:10.50"), Some(10.5));
        assert_eq!(parse_time("01:30:00.00"), Some(5400.0));
        assert_eq!(parse_time("00:00"), None);
        assert_eq!(parse_time("00:00:00:00"), None);
        assert_eq!(parse_time("N/A"), None);
    }

    #[test]
    fn test_parse_progress_complete() {
        let line = "frame=  100 fps= 25 q=-1.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.00x";
        let progress = parse_progress(line).unwrap();

        assert_eq!(progress.frame, Some(100));
        assert_eq!(progress.fps, Some(25.0));
        assert_eq!(progress.size_bytes, Some(1024 * 1024));
        assert_eq!(progress.time_secs, 4.0);
        assert_eq!(progress.bitrate_kbps, Some(2097.2));
        assert_eq!(progress.speed, Some(1.0));
        assert_eq!(progress.to_string(), "time=4.00s frame=100 size=1024kB speed=1.00x");
    }

    #[test]
    fn test_parse_progress_requires_companion_marker() {
        assert!(parse_progress("time=00:00:10.00").is_none());
        assert!(parse_progress("frame=100 fps=25 q=-1.0").is_none());

        let partial = parse_progress("size=512KiB time=00:00:10.00 bitrate=N/A").unwrap();
        assert_eq!(partial.size_bytes, Some(512 * 1024));
        assert_eq!(partial.time_secs, 10.0);
        assert_eq!(partial.bitrate_kbps, None);
        assert_eq!(partial.frame, None);
    }

    #[test]
    fn test_progress_marker() {
        assert!(is_progress_marker("out_time=00:00:01.000000"));
        assert!(is_progress_marker("total_size=1024"));
        assert!(!is_progress_marker("progress=continue"));
    }

    #[test]
    fn test_classify_connection_attempt() {
        let d = Diagnostic::classify("[hls @ 0x1] Opening 'https://cdn/seg1.ts' for reading");
        assert!(d.connection_attempted);
        assert!(!d.is_error);
        assert!(!d.connection_failed);
    }

    #[test]
    fn test_classify_connection_failure() {
        let d = Diagnostic::classify("[tcp @ 0x2] Connection to tcp://cdn:443 failed: Connection refused");
        assert!(d.connection_attempted);
        assert!(d.is_error);
        assert!(d.connection_failed);

        let plain = Diagnostic::classify("Error while decoding stream #0:1");
        assert!(plain.is_error);
        assert!(!plain.connection_failed);
    }

    #[test]
    fn test_classify_disconnect() {
        assert!(Diagnostic::classify("av_interleaved_write_frame(): Broken pipe").disconnected);
        assert!(Diagnostic::classify("[hls] Stream ended").disconnected);
        assert!(Diagnostic::classify("https://cdn/seg9.ts: End of file (EOF)").disconnected);
        assert!(!Diagnostic::classify("Press [q] to stop").disconnected);
    }

    #[test]
    fn test_classify_stream_detection() {
        assert!(Diagnostic::classify("  Stream #0:0: Video: h264 (High), yuv420p").stream_detected);
        assert!(Diagnostic::classify("  Stream #0:1: Audio: aac (LC), 48000 Hz").stream_detected);
        assert!(!Diagnostic::classify("Stream mapping:").stream_detected);
    }

    #[test]
    fn test_classify_structural_failure() {
        let missing = Diagnostic::classify("missing.mp4: No such file or directory");
        assert!(missing.structural);
        assert!(!missing.is_error);
        assert!(Diagnostic::classify("in.ts: Invalid data found when processing input").structural);
        assert!(!Diagnostic::classify("Connection refused: invalid argument").structural);
        assert!(!Diagnostic::classify("Press [q] to stop").structural);
    }

    #[test]
    fn test_classify_stats_line() {
        assert!(Diagnostic::classify("frame=  10 fps=25 size=64kB time=00:00:01.00").is_stats);
        assert!(!Diagnostic::classify("Duration: 00:10:00.00, start: 0.000000").is_stats);
    }
}
