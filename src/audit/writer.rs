//! JSONL audit writer with daily file rotation.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDate;
use tracing::warn;

use super::{AuditEntry, AuditLogger};
use crate::{AppError, Result};

struct OpenFile {
    date: NaiveDate,
    writer: BufWriter<File>,
}

/// Appends entries to `<log_dir>/audit-YYYY-MM-DD.jsonl`, choosing the file
/// from each entry's own timestamp.
pub struct JsonlAuditWriter {
    log_dir: PathBuf,
    current: Mutex<Option<OpenFile>>,
}

impl JsonlAuditWriter {
    /// Writer storing files in `log_dir`, which is created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&log_dir).map_err(|e| {
            AppError::Io(format!(
                "failed to create audit directory {}: {e}",
                log_dir.display()
            ))
        })?;
        Ok(Self {
            log_dir,
            current: Mutex::new(None),
        })
    }

    /// Path of the file holding entries for `date`.
    #[must_use]
    pub fn path_for(log_dir: &Path, date: NaiveDate) -> PathBuf {
        log_dir.join(format!("audit-{date}.jsonl"))
    }

    fn open(&self, date: NaiveDate) -> Result<BufWriter<File>> {
        let path = Self::path_for(&self.log_dir, date);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AppError::Io(format!("failed to open {}: {e}", path.display())))?;
        Ok(BufWriter::new(file))
    }
}

impl AuditLogger for JsonlAuditWriter {
    fn log_entry(&self, entry: AuditEntry) -> Result<()> {
        let date = entry.timestamp.date_naive();
        let line = serde_json::to_string(&entry)?;

        let mut current = self
            .current
            .lock()
            .map_err(|_| AppError::Io("audit writer mutex poisoned".into()))?;

        if current.as_ref().is_none_or(|open| open.date != date) {
            *current = Some(OpenFile {
                date,
                writer: self.open(date)?,
            });
        }

        if let Some(open) = current.as_mut() {
            if let Err(e) = writeln!(open.writer, "{line}").and_then(|()| open.writer.flush()) {
                warn!(%e, "audit write failed");
                return Err(AppError::Io(format!("audit write failed: {e}")));
            }
        }
        Ok(())
    }
}
