//! Intermediate file naming and cleanup, plus moving the muxed result into place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::job::Job;

/// `<dir>/<base>.<suffix>`, e.g. `movie.demuxed.video.mkv`.
pub fn artifact_path(dir: &Path, base: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{}.{}", base, suffix))
}

/// File name without the last extension, keeping the directory.
pub fn strip_extension(path: &Path) -> PathBuf {
    path.with_extension("")
}

/// `a/movie.demuxed.audio.ac3` + `encoded.ac3` -> `a/movie.demuxed.audio.encoded.ac3`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = strip_extension(path);
    PathBuf::from(format!("{}.{}", stem.to_string_lossy(), suffix))
}

/// Deletes every registered intermediate file of the job. Input and output are
/// never touched. Returns the number of entries removed; failures are logged and
/// the paths stay registered.
pub fn cleanup_job(job: &mut Job) -> usize {
    let mut removed = 0;
    let mut kept = Vec::new();
    for path in std::mem::take(&mut job.temp_files) {
        if path == job.input_file || path == job.output_file {
            continue;
        }
        match remove_path(&path) {
            Ok(true) => {
                removed += 1;
                log::debug!(target: "vidconvert::temp", "Deleted {}", path.display());
            }
            Ok(false) => {}
            Err(e) => {
                log::warn!(
                    target: "vidconvert::temp",
                    "Could not delete {}: {}",
                    path.display(),
                    e
                );
                kept.push(path);
            }
        }
    }
    job.temp_files = kept;
    removed
}

fn remove_path(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map(|_| true),
        Ok(_) => fs::remove_file(path).map(|_| true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_cross_device_rename_error(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(18) // EXDEV
    }
    #[cfg(windows)]
    {
        e.raw_os_error() == Some(17) // ERROR_NOT_SAME_DEVICE
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = e;
        false
    }
}

/// Moves the muxed file to its final location, replacing an existing file.
pub fn move_output(source: &Path, dest: &Path) -> Result<(), AppError> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(e) => {
            if is_cross_device_rename_error(&e) {
                fs::copy(source, dest)?;
                fs::remove_file(source)?;
                return Ok(());
            }
            Err(e.into())
        }
    }
}
