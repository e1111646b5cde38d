//! Claim coordinator: leased, exclusive ownership of work items.
//!
//! Every claim is one record in a [`LockStore`]. Granting a claim is a
//! single atomic create-if-absent; the in-process per-item mutex only
//! spares threads of the same process from racing each other on the
//! filesystem and is never the source of truth.
//!
//! Removing a record (release, expiry reap, recovery) is serialized per
//! item through a second exclusively-created guard record. Under the guard
//! nobody else can delete the claim record, so nobody can re-create it
//! either, which makes read-compare-delete safe without a compare-and-swap
//! primitive.

pub mod lock_dir;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, info_span, warn};

use crate::models::claim::Claim;
use crate::{AppError, Result};

pub use lock_dir::{LockDir, LockStore};

const RECORD_SUFFIX: &str = ".claim";
const GUARD_SUFFIX: &str = ".guard";
/// A guard older than this belongs to a process that died mid-removal.
const GUARD_STALE: Duration = Duration::from_secs(30);
const GUARD_WAIT: Duration = Duration::from_secs(5);
const GUARD_POLL: Duration = Duration::from_millis(10);
const GRANT_ATTEMPTS: usize = 4;
const SLUG_LEN: usize = 48;

/// Result of [`ClaimCoordinator::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimStatus {
    /// No live claim exists for the item.
    Unclaimed,
    /// The item is held.
    Held(Claim),
}

/// A record as found on disk. `claim` is `None` when the bytes do not
/// parse; such records are treated as expired.
struct Stored {
    raw: Vec<u8>,
    claim: Option<Claim>,
}

impl Stored {
    fn live(&self, now: DateTime<Utc>) -> Option<&Claim> {
        self.claim.as_ref().filter(|c| !c.is_expired(now))
    }
}

#[derive(Serialize, Deserialize)]
struct GuardRecord {
    pid: u32,
    at: DateTime<Utc>,
}

/// Removes the per-item guard record on drop.
struct RemovalGuard<'a> {
    store: &'a dyn LockStore,
    name: String,
}

impl Drop for RemovalGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.store.remove(&self.name) {
            warn!(guard = %self.name, %err, "failed to drop claim removal guard");
        }
    }
}

/// Grants, checks, renews, and releases claims.
pub struct ClaimCoordinator {
    store: Arc<dyn LockStore>,
    item_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ClaimCoordinator {
    /// Build a coordinator over an arbitrary lock store.
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            item_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Build a coordinator over a lock directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(LockDir::open(dir)?)))
    }

    /// Atomically claim `item_id` for `holder` for `ttl`.
    ///
    /// An expired record for the same item is reaped and the grant retried.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyClaimed` naming the current holder when a
    /// live claim exists, `AppError::Protocol` for empty identifiers, and
    /// `AppError::Io` on storage failure.
    pub fn claim(&self, item_id: &str, holder: &str, ttl: Duration) -> Result<Claim> {
        validate_ids(item_id, Some(holder))?;
        if ttl.is_zero() {
            return Err(AppError::Protocol("ttl must be greater than zero".into()));
        }
        let _span = info_span!("claim", item_id, holder).entered();
        let lock = self.item_lock(item_id)?;
        let _held = lock
            .lock()
            .map_err(|_| AppError::Io("claim item lock poisoned".into()))?;

        let name = record_name(item_id);
        for _ in 0..GRANT_ATTEMPTS {
            let now = Utc::now();
            let claim = Claim::new(item_id.to_owned(), holder.to_owned(), ttl, now);
            let bytes = serde_json::to_vec_pretty(&claim)?;
            if self.store.try_create(&name, &bytes)? {
                info!(ttl_seconds = claim.ttl_seconds, "claim granted");
                return Ok(claim);
            }

            match self.load(&name)? {
                None => {}
                Some(stored) => {
                    if let Some(existing) = stored.live(now) {
                        debug!(current_holder = %existing.holder, "claim contested");
                        return Err(AppError::AlreadyClaimed {
                            item_id: item_id.to_owned(),
                            holder: existing.holder.clone(),
                            expires_at: existing.expires_at,
                        });
                    }
                    if self.reap(&name, &stored.raw)? {
                        info!("expired claim reaped before grant");
                    }
                }
            }
        }

        Err(AppError::StaleState(format!(
            "claim record for {item_id} changed on every attempt"
        )))
    }

    /// Extend a live claim held by `holder` to `now + ttl`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotHolder` if another holder owns the item,
    /// `AppError::StaleState` if the caller's claim has already lapsed or is
    /// missing, and `AppError::Io` on storage failure.
    pub fn renew(&self, item_id: &str, holder: &str, ttl: Duration) -> Result<Claim> {
        validate_ids(item_id, Some(holder))?;
        let _span = info_span!("renew_claim", item_id, holder).entered();
        let lock = self.item_lock(item_id)?;
        let _held = lock
            .lock()
            .map_err(|_| AppError::Io("claim item lock poisoned".into()))?;
        let name = record_name(item_id);
        let _guard = self.lock_removal(&name)?;

        let now = Utc::now();
        let Some(current) = self.load(&name)?.and_then(|s| s.live(now).cloned()) else {
            return Err(AppError::StaleState(format!(
                "no live claim on {item_id} to renew"
            )));
        };
        if current.holder != holder {
            return Err(AppError::NotHolder {
                item_id: item_id.to_owned(),
                holder: current.holder,
            });
        }

        let mut renewed = Claim::new(item_id.to_owned(), holder.to_owned(), ttl, now);
        renewed.created_at = current.created_at;
        // Atomic overwrite: the record never disappears, so a concurrent
        // grant cannot slip in between.
        self.store
            .replace(&name, &serde_json::to_vec_pretty(&renewed)?)?;
        info!(ttl_seconds = renewed.ttl_seconds, "claim renewed");
        Ok(renewed)
    }

    /// Release `item_id` if `holder` owns it.
    ///
    /// Returns `true` if a record was removed. Releasing an unclaimed item,
    /// or one whose claim has lapsed, is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotHolder` if a different holder owns a live claim.
    pub fn release(&self, item_id: &str, holder: &str) -> Result<bool> {
        validate_ids(item_id, Some(holder))?;
        let _span = info_span!("release_claim", item_id, holder).entered();
        let lock = self.item_lock(item_id)?;
        let _held = lock
            .lock()
            .map_err(|_| AppError::Io("claim item lock poisoned".into()))?;
        let name = record_name(item_id);
        let _guard = self.lock_removal(&name)?;

        let Some(stored) = self.load(&name)? else {
            debug!("release of unclaimed item is a no-op");
            return Ok(false);
        };
        let now = Utc::now();
        match stored.live(now) {
            Some(current) if current.holder != holder => Err(AppError::NotHolder {
                item_id: item_id.to_owned(),
                holder: current.holder.clone(),
            }),
            Some(_) => {
                let removed = self.store.remove_if(&name, &stored.raw)?;
                info!(removed, "claim released");
                Ok(removed)
            }
            None => {
                self.store.remove_if(&name, &stored.raw)?;
                debug!("lapsed claim removed on release");
                Ok(false)
            }
        }
    }

    /// Remove the claim on `item_id` only if it is still the grant
    /// identified by `nonce`. Used by orphan recovery so a fresh claim made
    /// after the reconciliation snapshot is never touched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on storage failure.
    pub fn release_if(&self, item_id: &str, nonce: &str) -> Result<Option<Claim>> {
        validate_ids(item_id, None)?;
        let lock = self.item_lock(item_id)?;
        let _held = lock
            .lock()
            .map_err(|_| AppError::Io("claim item lock poisoned".into()))?;
        let name = record_name(item_id);
        let _guard = self.lock_removal(&name)?;

        let Some(Stored {
            raw,
            claim: Some(claim),
        }) = self.load(&name)?
        else {
            return Ok(None);
        };
        if claim.nonce != nonce || !self.store.remove_if(&name, &raw)? {
            return Ok(None);
        }
        info!(item_id, holder = %claim.holder, "claim force-released");
        Ok(Some(claim))
    }

    /// Current holder and expiry of `item_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on storage failure.
    pub fn check(&self, item_id: &str) -> Result<ClaimStatus> {
        validate_ids(item_id, None)?;
        let now = Utc::now();
        Ok(
            match self
                .load(&record_name(item_id))?
                .and_then(|s| s.live(now).cloned())
            {
                Some(claim) => ClaimStatus::Held(claim),
                None => ClaimStatus::Unclaimed,
            },
        )
    }

    /// All live claims, ordered by item id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the store cannot be listed.
    pub fn list(&self) -> Result<Vec<Claim>> {
        let now = Utc::now();
        let mut claims: Vec<Claim> = self
            .records()?
            .into_iter()
            .filter_map(|(_, stored)| stored.live(now).cloned())
            .collect();
        claims.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        Ok(claims)
    }

    /// Physically remove every lapsed or unreadable record. Returns the
    /// lapsed claims that were removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the store cannot be listed.
    pub fn sweep(&self) -> Result<Vec<Claim>> {
        let now = Utc::now();
        let mut reaped = Vec::new();
        for (name, stored) in self.records()? {
            if stored.live(now).is_some() {
                continue;
            }
            match self.reap(&name, &stored.raw) {
                Ok(true) => {
                    if let Some(claim) = stored.claim {
                        debug!(item_id = %claim.item_id, holder = %claim.holder, "expired claim swept");
                        reaped.push(claim);
                    } else {
                        warn!(record = %name, "unreadable claim record swept");
                    }
                }
                Ok(false) => {}
                Err(err) => warn!(record = %name, %err, "failed to sweep claim record"),
            }
        }
        Ok(reaped)
    }

    fn records(&self) -> Result<Vec<(String, Stored)>> {
        let mut out = Vec::new();
        for name in self.store.names(RECORD_SUFFIX)? {
            if let Some(stored) = self.load(&name)? {
                out.push((name, stored));
            }
        }
        Ok(out)
    }

    fn load(&self, name: &str) -> Result<Option<Stored>> {
        let Some(raw) = self.store.read(name)? else {
            return Ok(None);
        };
        let claim = match serde_json::from_slice::<Claim>(&raw) {
            Ok(claim) => Some(claim),
            Err(err) => {
                warn!(record = %name, %err, "unreadable claim record treated as expired");
                None
            }
        };
        Ok(Some(Stored { raw, claim }))
    }

    /// Delete `name` only if it still holds exactly `expected`.
    fn reap(&self, name: &str, expected: &[u8]) -> Result<bool> {
        let _guard = self.lock_removal(name)?;
        self.store.remove_if(name, expected)
    }

    fn lock_removal(&self, record: &str) -> Result<RemovalGuard<'_>> {
        let name = format!("{}{GUARD_SUFFIX}", record.trim_end_matches(RECORD_SUFFIX));
        let contents = serde_json::to_vec(&GuardRecord {
            pid: std::process::id(),
            at: Utc::now(),
        })?;
        let started = std::time::Instant::now();

        loop {
            if self.store.try_create(&name, &contents)? {
                return Ok(RemovalGuard {
                    store: self.store.as_ref(),
                    name,
                });
            }

            let Some(raw) = self.store.read(&name)? else {
                // Dropped between the create and the read.
                continue;
            };
            // Only the exact stale guard that was read is ever broken.
            if guard_is_stale(&raw, Utc::now()) && self.store.remove_if(&name, &raw)? {
                warn!(guard = %name, "broke stale claim removal guard");
                continue;
            }

            if started.elapsed() > GUARD_WAIT {
                return Err(AppError::Io(format!(
                    "timed out waiting for claim removal guard {name}"
                )));
            }
            std::thread::sleep(GUARD_POLL);
        }
    }

    fn item_lock(&self, item_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .item_locks
            .lock()
            .map_err(|_| AppError::Io("claim lock table poisoned".into()))?;
        Ok(Arc::clone(locks.entry(item_id.to_owned()).or_default()))
    }
}

/// Guards are published whole, so one that does not parse was not written
/// by a live coordinator.
fn guard_is_stale(raw: &[u8], now: DateTime<Utc>) -> bool {
    serde_json::from_slice::<GuardRecord>(raw)
        .ok()
        .is_none_or(|guard| {
            (now - guard.at)
                .to_std()
                .is_ok_and(|age| age > GUARD_STALE)
        })
}

fn validate_ids(item_id: &str, holder: Option<&str>) -> Result<()> {
    if item_id.trim().is_empty() {
        return Err(AppError::Protocol("item id must not be empty".into()));
    }
    if holder.is_some_and(|h| h.trim().is_empty()) {
        return Err(AppError::Protocol("holder must not be empty".into()));
    }
    Ok(())
}

/// File name of the lock record for `item_id`: a readable slug plus a
/// digest of the exact id, so distinct ids never share a record.
#[must_use]
pub fn record_name(item_id: &str) -> String {
    let slug: String = item_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(SLUG_LEN)
        .collect();
    let digest = Sha256::digest(item_id.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        let _ = write!(hex, "{byte:02x}");
    }
    format!("{slug}-{hex}{RECORD_SUFFIX}")
}
