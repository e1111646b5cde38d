//! Pool State document: load, atomic save, and startup rotation.
//!
//! The document lives at `<state_dir>/pool-state.json`. Each startup copies
//! the previous document to `archive/pool-state.1.json`, shifting older
//! archives up and dropping the oldest beyond `max_archives`, and appends a
//! one-line summary to `archive/summary.jsonl`, which keeps as many lines as
//! there are archives.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, info_span, warn};

use crate::models::claim::Claim;
use crate::models::intervention::FiredIntervention;
use crate::models::progress::ProgressRecord;
use crate::models::session::Session;
use crate::models::warning::Warning;
use crate::pool::counters::Counters;
use crate::{AppError, Result};

/// Current document format version.
pub const STATE_VERSION: u32 = 1;

const SUMMARY_FILE: &str = "summary.jsonl";

/// The persisted pool snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolState {
    /// Document format version.
    pub version: u32,
    /// When this document was written.
    pub saved_at: Option<DateTime<Utc>>,
    /// Registered sessions.
    pub sessions: Vec<Session>,
    /// Live claims at save time. Informational; the lock directory is
    /// authoritative.
    pub claims: Vec<Claim>,
    /// Progress records keyed by holder; a claim maps to its record through
    /// the holder.
    pub progress: BTreeMap<String, ProgressRecord>,
    /// Bounded warning list, oldest first.
    pub warnings: Vec<Warning>,
    /// Interventions whose condition has not cleared.
    pub interventions: Vec<FiredIntervention>,
    /// Monotonic counters.
    pub counters: Counters,
}

/// One line of `archive/summary.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RotationSummary {
    /// When rotation happened.
    pub rotated_at: DateTime<Utc>,
    /// When the archived document was saved.
    pub saved_at: Option<DateTime<Utc>>,
    /// Sessions in the archived document.
    pub sessions: usize,
    /// Claims in the archived document.
    pub claims: usize,
    /// Progress records in the archived document.
    pub progress: usize,
    /// Warnings in the archived document.
    pub warnings: usize,
    /// Counters at archive time.
    pub counters: Counters,
}

/// Result of reading the document at startup.
#[derive(Debug)]
pub enum Loaded {
    /// No document on disk.
    Fresh,
    /// Document parsed.
    Restored(Box<PoolState>),
    /// Document unreadable; moved aside to the given path.
    Corrupt(PathBuf),
}

/// Reads and writes the Pool State document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    archive_dir: PathBuf,
    max_archives: usize,
}

impl StateStore {
    /// Store for `path`, archiving into `archive_dir`.
    #[must_use]
    pub fn new(path: PathBuf, archive_dir: PathBuf, max_archives: usize) -> Self {
        Self {
            path,
            archive_dir,
            max_archives: max_archives.max(1),
        }
    }

    /// Document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of archive number `n` (1 is the newest).
    #[must_use]
    pub fn archive_path(&self, n: usize) -> PathBuf {
        self.archive_dir.join(format!("pool-state.{n}.json"))
    }

    /// Read the document. An unparseable document is moved aside so the
    /// daemon can start fresh without losing it.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the file exists but cannot be read or
    /// moved.
    pub fn load(&self) -> Result<Loaded> {
        let _span = info_span!("load_state", path = %self.path.display()).entered();
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Fresh),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice::<PoolState>(&raw) {
            Ok(state) => {
                info!(
                    sessions = state.sessions.len(),
                    progress = state.progress.len(),
                    "pool state loaded"
                );
                Ok(Loaded::Restored(Box::new(state)))
            }
            Err(err) => {
                let aside = self.path.with_extension(format!(
                    "corrupt-{}.json",
                    Utc::now().format("%Y%m%dT%H%M%S")
                ));
                fs::rename(&self.path, &aside)?;
                warn!(%err, moved_to = %aside.display(), "pool state unreadable, starting fresh");
                Ok(Loaded::Corrupt(aside))
            }
        }
    }

    /// Write `state` atomically: a temp file in the same directory renamed
    /// over the document.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] on write or rename failure.
    pub fn save(&self, state: &PoolState) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::with_prefix_in(".pool-state-", dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), state)?;
        tmp.as_file_mut().write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|err| AppError::Io(format!("persist {}: {}", self.path.display(), err.error)))?;
        Ok(())
    }

    /// Archive the current document, if any, and record a summary of
    /// `previous`. Returns the archive path written.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if archives cannot be shifted.
    pub fn rotate(&self, previous: Option<&PoolState>) -> Result<Option<PathBuf>> {
        let _span = info_span!("rotate_state").entered();
        if !self.path.exists() {
            return Ok(None);
        }
        fs::create_dir_all(&self.archive_dir)?;

        let oldest = self.archive_path(self.max_archives);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.max_archives).rev() {
            let from = self.archive_path(n);
            if from.exists() {
                fs::rename(&from, self.archive_path(n + 1))?;
            }
        }
        let newest = self.archive_path(1);
        fs::copy(&self.path, &newest)?;

        if let Some(state) = previous {
            let summary = RotationSummary {
                rotated_at: Utc::now(),
                saved_at: state.saved_at,
                sessions: state.sessions.len(),
                claims: state.claims.len(),
                progress: state.progress.len(),
                warnings: state.warnings.len(),
                counters: state.counters,
            };
            self.append_summary(&summary)?;
        }
        info!(archive = %newest.display(), "pool state rotated");
        Ok(Some(newest))
    }

    fn append_summary(&self, summary: &RotationSummary) -> Result<()> {
        let path = self.archive_dir.join(SUMMARY_FILE);
        let existing = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        let line = serde_json::to_string(summary)?;
        let mut lines: Vec<&str> = existing.lines().filter(|l| !l.trim().is_empty()).collect();
        lines.push(&line);
        let keep = lines.len().saturating_sub(self.max_archives);

        let mut tmp = NamedTempFile::with_prefix_in(".summary-", &self.archive_dir)?;
        for line in &lines[keep..] {
            writeln!(tmp.as_file_mut(), "{line}")?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .map_err(|err| AppError::Io(format!("persist {}: {}", path.display(), err.error)))?;
        Ok(())
    }

    /// Every archived document path that exists, newest first.
    #[must_use]
    pub fn archives(&self) -> Vec<PathBuf> {
        (1..=self.max_archives)
            .map(|n| self.archive_path(n))
            .filter(|p| p.exists())
            .collect()
    }
}
