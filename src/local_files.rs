//! Local file discovery for `ragnote ingest`.
//!
//! Accepts a mix of files and directories. Directories are walked
//! recursively; `.git`, `target`, and `node_modules` are always skipped, and
//! only files with a supported extension are kept.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::extract::content_type_for_filename;

const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];

#[derive(Debug, Clone)]
pub struct LocalFile {
    pub path: PathBuf,
    /// Canonical absolute path, used as the document's source id.
    pub source_id: String,
    pub content_type: &'static str,
    pub modified: DateTime<Utc>,
}

/// Resolve `paths` into the supported files they name. `include` globs are
/// matched against paths relative to each walked directory; an empty list
/// includes everything.
pub fn collect_files(paths: &[PathBuf], include: &[String]) -> Result<Vec<LocalFile>> {
    let include_set = if include.is_empty() {
        None
    } else {
        Some(build_globset(include)?)
    };
    let exclude_set = build_globset(&DEFAULT_EXCLUDES.map(String::from))?;

    let mut files = Vec::new();

    for root in paths {
        if !root.exists() {
            bail!("Path does not exist: {}", root.display());
        }

        if root.is_file() {
            match to_local_file(root)? {
                Some(file) => files.push(file),
                None => tracing::warn!(path = %root.display(), "unsupported file type, skipping"),
            }
            continue;
        }

        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if exclude_set.is_match(&rel_str) {
                continue;
            }
            if let Some(ref set) = include_set {
                if !set.is_match(&rel_str) {
                    continue;
                }
            }

            if let Some(file) = to_local_file(path)? {
                files.push(file);
            }
        }
    }

    files.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    files.dedup_by(|a, b| a.source_id == b.source_id);
    Ok(files)
}

fn to_local_file(path: &Path) -> Result<Option<LocalFile>> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let Some(content_type) = content_type_for_filename(&name) else {
        return Ok(None);
    };

    let canonical = std::fs::canonicalize(path)?;
    let modified = std::fs::metadata(path)?
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(Some(LocalFile {
        path: canonical.clone(),
        source_id: canonical.to_string_lossy().to_string(),
        content_type,
        modified,
    }))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
