//! Engine binary launcher.

use std::path::Path;

use process_utils::{probe_command, supervised_command};
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::args;
use crate::{Error, Result};

/// Engine binary configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the ffmpeg binary. A bare name is resolved through `PATH`.
    pub binary_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
        }
    }
}

/// Launches engine processes from one configured binary.
#[derive(Debug, Clone)]
pub struct Engine {
    binary_path: String,
}

impl Engine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            binary_path: config.binary_path.clone(),
        }
    }

    pub fn binary_path(&self) -> &str {
        &self.binary_path
    }

    /// First line of `-version` output, e.g. `ffmpeg version 7.1 ...`.
    ///
    /// Blocking; intended for startup checks.
    pub fn detect_version(&self) -> Result<String> {
        let output = probe_command(&self.binary_path)
            .arg("-version")
            .output()
            .map_err(|source| self.spawn_error(source))?;

        if !output.status.success() {
            return Err(Error::ExecutionFailed {
                status: output.status.to_string(),
                detail: last_line(&output.stderr),
            });
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .ok_or_else(|| Error::Other(format!("`{}` printed no version", self.binary_path)))
    }

    /// Start the engine with piped output streams.
    pub fn spawn(&self, args: &[String]) -> Result<Child> {
        debug!(binary = %self.binary_path, ?args, "Spawning engine");
        supervised_command(&self.binary_path, args)
            .spawn()
            .map_err(|source| self.spawn_error(source))
    }

    /// Join the segments named in `list` into `output` with stream copy.
    pub async fn concat(&self, list: &Path, output: &Path, cancel: &CancellationToken) -> Result<()> {
        let args = args::compile_concat(list, output);
        let child = self.spawn(&args)?;

        let output_result = tokio::select! {
            result = child.wait_with_output() => result,
            // Dropping the child kills it.
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let result = output_result
            .map_err(|e| Error::Other(format!("failed to wait for concat: {e}")))?;

        if !result.status.success() {
            return Err(Error::Concat {
                status: result.status.to_string(),
                output: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        info!(output = %output.display(), "Concatenated segments");
        Ok(())
    }

    fn spawn_error(&self, source: std::io::Error) -> Error {
        Error::Spawn {
            program: self.binary_path.clone(),
            source,
        }
    }
}

fn last_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> EngineConfig {
        let path = dir.path().join("fake-ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        EngineConfig {
            binary_path: path.to_string_lossy().into_owned(),
        }
    }

    #[test]
    fn detects_version_line() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(&script(&dir, "echo 'ffmpeg version 7.1 Copyright'; echo more"));
        assert_eq!(engine.detect_version().unwrap(), "ffmpeg version 7.1 Copyright");
    }

    #[test]
    fn missing_binary_is_fatal_spawn_error() {
        let engine = Engine::new(&EngineConfig {
            binary_path: "/nonexistent/ffmpeg".to_string(),
        });
        let err = engine.detect_version().unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn concat_failure_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(&script(&dir, "echo 'filelist.txt: Invalid data' >&2; exit 1"));
        let err = engine
            .concat(
                &dir.path().join("filelist.txt"),
                &dir.path().join("out.mp4"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            Error::Concat { output, .. } => assert_eq!(output, "filelist.txt: Invalid data"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
