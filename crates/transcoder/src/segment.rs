//! Segment-then-concatenate post-processing.
//!
//! In segmentation mode the engine writes numbered MPEG-TS segments into a
//! directory next to the output file. Once the run succeeds the segments are
//! listed in index order and joined with the concat demuxer.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::args::SEGMENT_PLAYLIST;
use crate::{Error, Result};

/// Name of the concat list written next to the segments.
pub const FILE_LIST_NAME: &str = "filelist.txt";

const SEGMENT_EXTENSION: &str = "ts";
const SEGMENT_DIR_SUFFIX: &str = "_segments";

/// Segment directory for an output: `<dir>/<stem>_segments`.
///
/// The suffix keeps the directory distinct from the output even when the
/// output has no extension.
pub fn segment_dir_for(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!("{stem}{SEGMENT_DIR_SUFFIX}"))
}

/// Create the segment directory and clear what an earlier run or attempt
/// left in it.
///
/// Stale segments would otherwise be joined into the final output.
pub async fn prepare_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::io_path("creating segment directory", dir, e))?;

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::io_path("reading segment directory", dir, e))?;
    let mut removed = 0usize;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io_path("reading segment directory", dir, e))?
    {
        let path = entry.path();
        if !is_segment_artifact(&path) {
            continue;
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| Error::io_path("removing stale segment", &path, e))?;
        removed += 1;
    }

    if removed > 0 {
        debug!(dir = %dir.display(), removed, "Cleared stale segment files");
    }
    Ok(())
}

fn is_segment_artifact(path: &Path) -> bool {
    is_segment(path)
        || path
            .file_name()
            .is_some_and(|name| name == FILE_LIST_NAME || name == SEGMENT_PLAYLIST)
}

fn is_segment(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION)
}

/// Trailing number of a segment file stem, e.g. `1000` for `segment_1000.ts`.
fn segment_index(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let digits = stem.len() - stem.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    stem[stem.len() - digits..].parse().ok()
}

/// All `*.ts` files in `dir`, sorted by segment index. Files without an
/// index come last, by name. An empty directory is an error.
pub async fn collect_segments(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::io_path("reading segment directory", dir, e))?;

    let mut segments = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io_path("reading segment directory", dir, e))?
    {
        let path = entry.path();
        if is_segment(&path) {
            segments.push(path);
        }
    }

    if segments.is_empty() {
        return Err(Error::Segmentation(format!(
            "no segments found in {}",
            dir.display()
        )));
    }

    segments.sort_by_cached_key(|path| (segment_index(path).unwrap_or(u64::MAX), path.clone()));
    debug!(dir = %dir.display(), count = segments.len(), "Collected segments");
    Ok(segments)
}

/// Write the concat list for `segments` into `dir` and return its path.
pub async fn write_file_list(dir: &Path, segments: &[PathBuf]) -> Result<PathBuf> {
    let list = dir.join(FILE_LIST_NAME);
    let contents: String = segments
        .iter()
        .map(|segment| format!("file '{}'\n", quote(segment)))
        .collect();

    tokio::fs::write(&list, contents)
        .await
        .map_err(|e| Error::io_path("writing file list", &list, e))?;
    Ok(list)
}

/// Escape a path for a single-quoted concat list entry.
fn quote(path: &Path) -> String {
    path.to_string_lossy().replace('\'', r"'\''")
}
