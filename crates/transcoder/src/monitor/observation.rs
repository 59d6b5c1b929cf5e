//! Shared observation record for one engine run.

use std::time::{Duration, Instant};

use crate::request::SourceKind;

use super::parser::{Diagnostic, TranscodeProgress};

/// Everything the monitor workers learn about one engine process.
///
/// Owned by a single supervision and shared between its workers behind one
/// lock. Outcome decisions read a [`ObservationSnapshot`] taken after every
/// worker has finished.
#[derive(Debug)]
pub struct ProcessObservation {
    kind: SourceKind,
    last_progress_at: Instant,
    last_progress: Option<String>,
    progress: Option<TranscodeProgress>,
    timed_out: Option<Duration>,
    connection_attempted: bool,
    connection_failure: Option<String>,
    disconnect: Option<String>,
    last_error: Option<String>,
    structural_error: Option<String>,
    last_line: Option<String>,
}

/// Point-in-time copy of a [`ProcessObservation`].
#[derive(Debug, Clone)]
pub struct ObservationSnapshot {
    pub kind: SourceKind,
    pub last_progress_at: Instant,
    pub last_progress: Option<String>,
    pub progress: Option<TranscodeProgress>,
    /// Stall length that tripped the timeout, if it fired.
    pub timed_out: Option<Duration>,
    pub connection_attempted: bool,
    pub connection_failure: Option<String>,
    pub disconnect: Option<String>,
    pub last_error: Option<String>,
    /// First record naming an unfixable input or invocation problem.
    pub structural_error: Option<String>,
    /// Last diagnostic record that was not a stats line.
    pub last_line: Option<String>,
}

impl ObservationSnapshot {
    /// Best description of why the engine exited unsuccessfully.
    ///
    /// The last error line wins, falling back to the last diagnostic line.
    /// A structural line seen earlier is appended so recoverability is judged
    /// on it too.
    pub fn failure_detail(&self) -> Option<String> {
        let last = self.last_error.as_ref().or(self.last_line.as_ref());
        match (last, self.structural_error.as_ref()) {
            (Some(last), Some(structural)) if !last.contains(structural.as_str()) => {
                Some(format!("{last}; {structural}"))
            }
            (Some(last), _) => Some(last.clone()),
            (None, structural) => structural.cloned(),
        }
    }
}

impl ProcessObservation {
    pub fn new(kind: SourceKind) -> Self {
        Self::started_at(kind, Instant::now())
    }

    /// Observation whose progress clock starts at `now`.
    pub fn started_at(kind: SourceKind, now: Instant) -> Self {
        Self {
            kind,
            last_progress_at: now,
            last_progress: None,
            progress: None,
            timed_out: None,
            connection_attempted: false,
            connection_failure: None,
            disconnect: None,
            last_error: None,
            structural_error: None,
            last_line: None,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Refresh the progress clock.
    pub fn record_progress(&mut self, now: Instant, text: &str, parsed: Option<TranscodeProgress>) {
        self.last_progress_at = now;
        self.last_progress = Some(text.to_string());
        if parsed.is_some() {
            self.progress = parsed;
        }
    }

    /// Fold one classified diagnostic record into the flags.
    pub fn record_diagnostic(&mut self, line: &str, diagnostic: Diagnostic) {
        if diagnostic.connection_attempted {
            self.connection_attempted = true;
        }
        if diagnostic.is_error {
            self.last_error = Some(line.to_string());
        }
        if diagnostic.connection_failed && self.connection_failure.is_none() {
            self.connection_failure = Some(line.to_string());
        }
        if diagnostic.disconnected && self.disconnect.is_none() {
            self.disconnect = Some(line.to_string());
        }
        if diagnostic.structural && self.structural_error.is_none() {
            self.structural_error = Some(line.to_string());
        }
        if !diagnostic.is_stats {
            self.last_line = Some(line.to_string());
        }
    }

    /// Flag an out-of-band connection failure, such as a failed health probe.
    pub fn record_connection_failure(&mut self, reason: impl Into<String>) {
        if self.connection_failure.is_none() {
            self.connection_failure = Some(reason.into());
        }
    }

    /// Compare the progress clock against `threshold`.
    ///
    /// Returns the stall length and sets the timed-out flag once it is
    /// exceeded. The flag is sticky.
    pub fn check_stall(&mut self, now: Instant, threshold: Duration) -> Option<Duration> {
        let stalled_for = now.saturating_duration_since(self.last_progress_at);
        if stalled_for > threshold {
            if self.timed_out.is_none() {
                self.timed_out = Some(stalled_for);
            }
            return Some(stalled_for);
        }
        None
    }

    pub fn snapshot(&self) -> ObservationSnapshot {
        ObservationSnapshot {
            kind: self.kind,
            last_progress_at: self.last_progress_at,
            last_progress: self.last_progress.clone(),
            progress: self.progress.clone(),
            timed_out: self.timed_out,
            connection_attempted: self.connection_attempted,
            connection_failure: self.connection_failure.clone(),
            disconnect: self.disconnect.clone(),
            last_error: self.last_error.clone(),
            structural_error: self.structural_error.clone(),
            last_line: self.last_line.clone(),
        }
    }
}
