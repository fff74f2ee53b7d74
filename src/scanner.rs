//! Directory scanning and change detection.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::Result;
use crate::offsets::FileProgress;

/// A matching file and what the filesystem says about it right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub len: u64,
}

impl Candidate {
    /// A file is worth opening when it was never recorded or was modified
    /// after the recorded time.
    pub fn is_changed(&self, progress: Option<&FileProgress>) -> bool {
        progress.is_none_or(|p| self.modified > p.last_modified)
    }
}

#[derive(Debug, Clone)]
pub struct FileScanner {
    root: PathBuf,
    pattern: Regex,
}

impl FileScanner {
    pub fn new(root: impl Into<PathBuf>, pattern: Regex) -> Self {
        Self {
            root: root.into(),
            pattern,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pattern(&self) -> &Regex {
        &self.pattern
    }

    /// Walks the root recursively and returns every regular file whose path
    /// matches the pattern, in path order. Symlinks below the root are not
    /// followed. Only an unreadable root fails the scan; anything below it
    /// that cannot be read is logged and skipped.
    pub fn scan(&self) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable path");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if !self.pattern.is_match(&entry.path().to_string_lossy()) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Skipping file without metadata");
                    continue;
                }
            };
            let modified = match metadata.modified() {
                Ok(modified) => modified,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Skipping file without mtime");
                    continue;
                }
            };
            candidates.push(Candidate {
                path: entry.into_path(),
                modified: DateTime::<Utc>::from(modified),
                len: metadata.len(),
            });
        }
        Ok(candidates)
    }
}
