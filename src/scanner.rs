//! Pattern-based directory listing.
//!
//! Patterns are glob expressions matched against the path relative to the
//! scanned root, with `/` required to be matched literally: `*.txt` only sees
//! top-level files, `**/*.txt` sees every depth.

use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use glob::{MatchOptions, Pattern};
use tracing::{debug, error};
use walkdir::WalkDir;
use crate::core::{Result, TransferError, UploadRequest};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// List files for a request's folder and pattern
pub fn scan(request: &UploadRequest) -> Vec<PathBuf> {
    scan_folder(request.source_folder(), request.pattern())
}

/// List regular files under `folder` matching `pattern`.
///
/// Never fails: a missing folder or a broken pattern is logged and yields nothing.
pub fn scan_folder(folder: &Path, pattern: &str) -> Vec<PathBuf> {
    match list_matching(folder, pattern) {
        Ok(files) => files,
        Err(err) => {
            error!(folder = %folder.display(), pattern, %err, "Error scanning folder");
            Vec::new()
        }
    }
}

/// Strict variant of [`scan_folder`] for callers that need to tell "empty" from "failed"
pub fn list_matching(folder: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    if !folder.is_dir() {
        return Err(TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Folder does not exist: {}", folder.display()),
        )));
    }

    let matcher = Pattern::new(pattern)
        .map_err(|err| TransferError::invalid(format!("Invalid pattern '{}': {}", pattern, err)))?;

    let mut walker = WalkDir::new(folder).min_depth(1).follow_links(false);
    if !is_recursive(pattern) {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(folder = %folder.display(), %err, "Skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(folder) else {
            continue;
        };

        if matcher.matches_path_with(relative, MATCH_OPTIONS) {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

fn is_recursive(pattern: &str) -> bool {
    pattern.contains('/') || pattern.contains("**") || pattern.contains(std::path::MAIN_SEPARATOR)
}

/// Path of `file_path` relative to `base_path`.
///
/// A path outside the base is logged and handed back unchanged.
pub fn relative_path(file_path: &Path, base_path: &Path) -> PathBuf {
    match file_path.strip_prefix(base_path) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => {
            error!(
                file = %file_path.display(),
                base = %base_path.display(),
                "File is not relative to base"
            );
            file_path.to_path_buf()
        }
    }
}

/// Object key for a file: its `/`-joined path relative to `root`, or its bare name when outside it
pub fn object_key(file_path: &Path, root: &Path) -> String {
    let relative = match file_path.strip_prefix(root) {
        Ok(relative) => relative,
        Err(_) => {
            return file_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_path.to_string_lossy().into_owned());
        }
    };

    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Modification time of a file in seconds since the UNIX epoch
pub fn modified_secs(path: &Path) -> std::io::Result<f64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(system_time_secs(modified))
}

pub(crate) fn system_time_secs(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs_f64(),
        Err(before) => -before.duration().as_secs_f64(),
    }
}
