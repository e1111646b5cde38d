//! Directory of exclusively-created lock files.
//!
//! [`LockStore`] is the only primitive the claim coordinator relies on for
//! mutual exclusion. The [`LockDir`] implementation publishes a fully
//! written temp file under its final name with a no-clobber link, so a
//! record either exists with complete contents or does not exist at all,
//! and two processes racing on one name cannot both succeed.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::warn;

use crate::{AppError, Result};

/// Atomic create-if-absent storage for small named records.
///
/// Implementations must guarantee that `try_create` is atomic across
/// independent OS processes, not just across threads.
pub trait LockStore: Send + Sync {
    /// Create `name` with `contents` if nothing exists under that name.
    /// Returns `false` when the name is already taken.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on any failure other than the name being taken.
    fn try_create(&self, name: &str, contents: &[u8]) -> Result<bool>;

    /// Atomically overwrite `name` with `contents`. The old record stays
    /// visible until the new one takes its place.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the record cannot be written.
    fn replace(&self, name: &str, contents: &[u8]) -> Result<()>;

    /// Read the record stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the record exists but cannot be read.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Delete `name`. Returns `false` if it was already gone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the record exists but cannot be removed.
    fn remove(&self, name: &str) -> Result<bool>;

    /// Delete `name` only if it still holds exactly `expected`. Returns
    /// `false` if it was gone or held other contents, which are left in
    /// place.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the record cannot be moved, read, or
    /// removed.
    fn remove_if(&self, name: &str, expected: &[u8]) -> Result<bool>;

    /// Names of all records ending in `suffix`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the store cannot be listed.
    fn names(&self, suffix: &str) -> Result<Vec<String>>;
}

/// [`LockStore`] backed by a plain directory.
#[derive(Debug, Clone)]
pub struct LockDir {
    dir: PathBuf,
}

impl LockDir {
    /// Open (and create if needed) the lock directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::Io(format!(
                "failed to create lock directory {}: {err}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    /// Directory backing this store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn entry(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn stage(&self, name: &str) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(".pending-")
            .tempfile_in(&self.dir)
            .map_err(|err| AppError::Io(format!("failed to stage lock {name}: {err}")))
    }
}

impl LockStore for LockDir {
    fn try_create(&self, name: &str, contents: &[u8]) -> Result<bool> {
        let mut tmp = self.stage(name)?;
        write_all_synced(&mut tmp, contents)
            .map_err(|err| AppError::Io(format!("failed to write lock {name}: {err}")))?;

        match tmp.persist_noclobber(self.entry(name)) {
            Ok(_) => Ok(true),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(AppError::Io(format!(
                "failed to publish lock {name}: {}",
                err.error
            ))),
        }
    }

    fn replace(&self, name: &str, contents: &[u8]) -> Result<()> {
        let mut tmp = self.stage(name)?;
        write_all_synced(&mut tmp, contents)
            .map_err(|err| AppError::Io(format!("failed to write lock {name}: {err}")))?;
        tmp.persist(self.entry(name))
            .map_err(|err| AppError::Io(format!("failed to replace lock {name}: {}", err.error)))?;
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.entry(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::Io(format!("failed to read lock {name}: {err}"))),
        }
    }

    fn remove(&self, name: &str) -> Result<bool> {
        match fs::remove_file(self.entry(name)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(AppError::Io(format!("failed to remove lock {name}: {err}"))),
        }
    }

    fn remove_if(&self, name: &str, expected: &[u8]) -> Result<bool> {
        // Move the record aside first so the bytes compared are the bytes
        // deleted; the tombstone is removed when `tomb` drops.
        let tomb = tempfile::Builder::new()
            .prefix(".tomb-")
            .tempfile_in(&self.dir)
            .map_err(|err| AppError::Io(format!("failed to stage removal of {name}: {err}")))?
            .into_temp_path();
        match fs::rename(self.entry(name), &tomb) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(AppError::Io(format!("failed to remove lock {name}: {err}"))),
        }
        let taken = fs::read(&tomb)
            .map_err(|err| AppError::Io(format!("failed to read lock {name}: {err}")))?;
        if taken == expected {
            return Ok(true);
        }

        match fs::hard_link(&tomb, self.entry(name)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                warn!(lock = %name, "lock replaced while being restored; newer record kept");
            }
            Err(err) => {
                return Err(AppError::Io(format!("failed to restore lock {name}: {err}")));
            }
        }
        Ok(false)
    }

    fn names(&self, suffix: &str) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            AppError::Io(format!(
                "failed to list lock directory {}: {err}",
                self.dir.display()
            ))
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(suffix) && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

fn write_all_synced(tmp: &mut NamedTempFile, contents: &[u8]) -> std::io::Result<()> {
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()
}
