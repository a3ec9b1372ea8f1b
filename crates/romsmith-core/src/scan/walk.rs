use glob::Pattern;
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, warn};

/// Parallel directory traversal. Collects every regular file under the given
/// roots (a root may itself be a file), filtered by glob ignore patterns.
/// Symlinks are skipped. The result is sorted so runs are repeatable.
pub fn collect_input_files(roots: &[PathBuf], ignore_globs: &[String]) -> io::Result<Vec<PathBuf>> {
    let found: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

    let ignore_patterns: Vec<Pattern> = ignore_globs
        .iter()
        .filter_map(|glob| match Pattern::new(glob) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("Invalid glob pattern '{}': {}", glob, e);
                None
            }
        })
        .collect();

    roots.par_iter().try_for_each(|root| {
        let metadata = match fs::symlink_metadata(root) {
            Ok(m) => m,
            Err(e) => {
                warn!("Skipping input {}: {}", root.display(), e);
                return Ok(());
            }
        };
        if metadata.is_file() {
            if !is_ignored(root, &ignore_patterns) {
                push(&found, root.clone());
            }
            Ok(())
        } else {
            visit_dirs(root, &found, &ignore_patterns)
        }
    })?;

    let mut files = found.into_inner().unwrap_or_else(|e| e.into_inner());
    files.sort();
    files.dedup();
    Ok(files)
}

fn push(found: &Mutex<Vec<PathBuf>>, path: PathBuf) {
    found.lock().unwrap_or_else(|e| e.into_inner()).push(path);
}

fn is_ignored(path: &Path, ignore_patterns: &[Pattern]) -> bool {
    ignore_patterns
        .iter()
        .any(|pattern| pattern.matches_path(path))
}

fn visit_dirs(dir: &Path, found: &Mutex<Vec<PathBuf>>, ignore_patterns: &[Pattern]) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    if is_ignored(dir, ignore_patterns) {
        return Ok(());
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() == io::ErrorKind::PermissionDenied {
                error!(
                    "Access denied reading directory {}: {}",
                    dir.display(),
                    err
                );
                return Ok(());
            } else {
                return Err(io::Error::new(
                    err.kind(),
                    format!("Error reading directory {}: {}", dir.display(), err),
                ));
            }
        }
    };

    entries.par_bridge().try_for_each(|entry_result| {
        let entry = match entry_result {
            Ok(entry) => entry,
            Err(err) => {
                return Err(io::Error::new(
                    err.kind(),
                    format!(
                        "Error reading entry in directory {}: {}",
                        dir.display(),
                        err
                    ),
                ));
            }
        };

        let path = entry.path();
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) => {
                return Err(io::Error::new(
                    err.kind(),
                    format!(
                        "Error getting metadata for {}: {}",
                        path.display(),
                        err
                    ),
                ));
            }
        };

        if metadata.is_dir() {
            visit_dirs(&path, found, ignore_patterns)?;
        } else if metadata.is_file() && !is_ignored(&path, ignore_patterns) {
            push(found, path);
        }
        Ok(())
    })?;

    Ok(())
}
