//! Durable deduplicated store of working share links
//!
//! The backing file is a newline-delimited UTF-8 list without header. Every
//! mutation reads the file fresh and rewrites it whole via a temp file and
//! rename, so concurrent readers never observe a partial write.

use crate::error::StoreError;
use std::collections::BTreeSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Set union of two URI lists, sorted and deduplicated
pub fn merge_uris<I, J>(existing: I, new_working: J) -> Vec<String>
where
    I: IntoIterator<Item = String>,
    J: IntoIterator<Item = String>,
{
    existing
        .into_iter()
        .chain(new_working)
        .map(|uri| uri.trim().to_string())
        .filter(|uri| !uri.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Result store backed by a flat text file
#[derive(Debug, Clone)]
pub struct ResultStore {
    path: PathBuf,
}

impl ResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted URIs; a missing file is an empty store
    pub fn load(&self) -> Result<Vec<String>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut seen = std::collections::HashSet::new();
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && seen.insert(*line))
            .map(str::to_string)
            .collect())
    }

    /// Union fresh file contents with `new_working` and rewrite the file sorted
    pub fn merge(&self, new_working: &[String]) -> Result<Vec<String>, StoreError> {
        let existing = self.load()?;
        let before = existing.len();
        let merged = merge_uris(existing, new_working.iter().cloned());
        if merged.is_empty() && !self.path.exists() {
            return Ok(merged);
        }
        self.write_all(&merged)?;
        info!(
            path = %self.path.display(),
            added = merged.len().saturating_sub(before),
            total = merged.len(),
            "result store merged"
        );
        Ok(merged)
    }

    /// Rewrite the file without `uris`; returns the remaining entries
    pub fn remove(&self, uris: &[String]) -> Result<Vec<String>, StoreError> {
        let doomed: BTreeSet<&str> = uris.iter().map(|u| u.trim()).collect();
        let remaining: Vec<String> = self
            .load()?
            .into_iter()
            .filter(|uri| !doomed.contains(uri.as_str()))
            .collect();
        self.write_all(&remaining)?;
        debug!(path = %self.path.display(), remaining = remaining.len(), "entries removed");
        Ok(remaining)
    }

    fn write_all(&self, uris: &[String]) -> Result<(), StoreError> {
        let write_err = |source: std::io::Error| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(write_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        for uri in uris {
            writeln!(tmp, "{}", uri).map_err(write_err)?;
        }
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}
