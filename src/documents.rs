//! External documents for `rapport index-docs`.
//!
//! Walks a directory, keeps files matching `[documents] include_globs`
//! and not matching `exclude_globs` (plus `.git`, `target`, and
//! `node_modules`), and reads them as UTF-8 text.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::config::DocumentsConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Path relative to the scanned root, with `/` separators.
    pub path: String,
    pub text: String,
    /// Modification time in microseconds.
    pub modified_ts: i64,
}

/// Documents under `root`, sorted by path. Files that are not valid
/// UTF-8 are skipped.
pub fn scan_documents(root: &Path, config: &DocumentsConfig) -> Result<Vec<Document>> {
    if !root.is_dir() {
        bail!("Document root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut docs = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel = relative.to_string_lossy().replace('\\', "/");
        if exclude_set.is_match(&rel) || !include_set.is_match(&rel) {
            continue;
        }

        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(path = %rel, "skipping unreadable document: {}", e);
                continue;
            }
        };
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        docs.push(Document {
            path: rel,
            text,
            modified_ts: micros_since_epoch(modified),
        });
    }

    docs.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(docs)
}

fn micros_since_epoch(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
