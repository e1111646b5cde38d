//! Shared daemon state and the operations the IPC surface exposes.
//!
//! [`AppState`] owns every component. Handlers and background passes go
//! through it so admission control (refusing new work while draining),
//! counters, audit, and persistence happen in one place.

pub mod counters;
pub mod progress;
pub mod warnings;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::audit::{AuditEntry, AuditEventType, AuditLogger};
use crate::backend::SessionBackend;
use crate::backlog::Backlog;
use crate::claims::{ClaimCoordinator, ClaimStatus};
use crate::config::GlobalConfig;
use crate::models::claim::Claim;
use crate::models::intervention::FiredIntervention;
use crate::models::progress::{AgentStatus, MilestoneKind, ProgressRecord};
use crate::models::session::{ExistingSession, Session, SessionKind, SessionStatus};
use crate::models::warning::Warning;
use crate::orchestrator::session_registry::{RegistrySettings, SessionRegistry};
use crate::persistence::state_store::{PoolState, StateStore, STATE_VERSION};
use crate::{AppError, Result};

use self::counters::{Counter, Counters, PoolCounters};
use self::progress::ProgressBook;
use self::warnings::WarningLog;

/// A live claim with its remaining lease.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimView {
    /// The claim record.
    #[serde(flatten)]
    pub claim: Claim,
    /// Seconds until the lease lapses.
    pub remaining_seconds: u64,
}

impl ClaimView {
    /// View of `claim` as of `now`.
    #[must_use]
    pub fn at(claim: Claim, now: DateTime<Utc>) -> Self {
        let remaining_seconds = claim.remaining(now).as_secs();
        Self {
            claim,
            remaining_seconds,
        }
    }
}

/// Answer to the `status` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Daemon process id.
    pub pid: u32,
    /// Daemon start time.
    pub started_at: DateTime<Utc>,
    /// Seconds since start.
    pub uptime_seconds: u64,
    /// Whether new sessions and claims are admitted.
    pub accepting: bool,
    /// Registered sessions.
    pub sessions: usize,
    /// Sessions in `Active` status.
    pub active_sessions: usize,
    /// Live claims.
    pub claims: usize,
    /// Progress records.
    pub progress: usize,
    /// Counter values.
    pub counters: Counters,
    /// Held warnings, oldest first.
    pub warnings: Vec<Warning>,
    /// Interventions whose condition persists.
    pub interventions: Vec<FiredIntervention>,
}

/// Everything the daemon shares between tasks.
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<GlobalConfig>,
    /// Session table.
    pub registry: SessionRegistry,
    /// Claim coordinator over the lock directory.
    pub claims: Arc<ClaimCoordinator>,
    /// Agent progress records.
    pub progress: ProgressBook,
    /// Bounded warning list.
    pub warnings: Arc<WarningLog>,
    /// Fired interventions still in effect.
    pub interventions: Mutex<Vec<FiredIntervention>>,
    /// Monotonic counters.
    pub counters: Arc<PoolCounters>,
    /// Pool State document.
    pub store: StateStore,
    /// External backlog.
    pub backlog: Arc<dyn Backlog>,
    /// Audit sink, when enabled.
    pub audit: Option<Arc<dyn AuditLogger>>,
    accepting: AtomicBool,
    started_at: DateTime<Utc>,
    persist_lock: Mutex<()>,
}

impl AppState {
    /// Assemble the daemon state.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the claims directory cannot be created.
    pub fn new(
        config: Arc<GlobalConfig>,
        backend: Arc<dyn SessionBackend>,
        backlog: Arc<dyn Backlog>,
        audit: Option<Arc<dyn AuditLogger>>,
    ) -> Result<Self> {
        let counters = Arc::new(PoolCounters::default());
        let warnings = Arc::new(WarningLog::new(
            config.state.max_warnings,
            Arc::clone(&counters),
        ));
        let registry = SessionRegistry::new(
            backend,
            RegistrySettings::from_config(&config),
            Arc::clone(&warnings),
            Arc::clone(&counters),
        );
        let claims = Arc::new(ClaimCoordinator::open(&config.claims_dir())?);
        let store = StateStore::new(
            config.state_path(),
            config.archive_dir(),
            config.state.max_archives,
        );
        Ok(Self {
            config,
            registry,
            claims,
            progress: ProgressBook::default(),
            warnings,
            interventions: Mutex::new(Vec::new()),
            counters,
            store,
            backlog,
            audit,
            accepting: AtomicBool::new(true),
            started_at: Utc::now(),
            persist_lock: Mutex::new(()),
        })
    }

    // ── Admission and bookkeeping ───────────────────────────

    /// Whether new sessions and claims are admitted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Refuse new sessions and claims from now on.
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("no longer accepting new sessions or claims");
        }
    }

    fn admit(&self) -> Result<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(AppError::ShuttingDown)
        }
    }

    /// Append an audit entry. Audit failures are logged, never returned.
    pub fn audit(&self, entry: AuditEntry) {
        if let Some(audit) = &self.audit {
            if let Err(err) = audit.log_entry(entry) {
                warn!(%err, "audit entry dropped");
            }
        }
    }

    /// Record a warning.
    pub fn warn(&self, warning: Warning) {
        self.warnings.push(warning);
    }

    /// Load a persisted snapshot into the live components.
    pub async fn restore(&self, saved: PoolState) {
        self.counters.absorb(&saved.counters);
        self.registry.restore(saved.sessions).await;
        self.progress.restore(saved.progress).await;
        self.warnings.restore(saved.warnings);
        *self.interventions.lock().await = saved.interventions;
    }

    /// Current pool state as a document.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the claims directory cannot be listed.
    pub async fn snapshot(&self) -> Result<PoolState> {
        Ok(PoolState {
            version: STATE_VERSION,
            saved_at: Some(Utc::now()),
            sessions: self.registry.list_active().await,
            claims: self.snapshot_claims().await?,
            progress: self.progress.snapshot().await,
            warnings: self.warnings.snapshot(),
            interventions: self.interventions.lock().await.clone(),
            counters: self.counters.snapshot(),
        })
    }

    /// Write the Pool State document. Saves are serialized.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the document cannot be written.
    pub async fn persist(&self) -> Result<()> {
        let _held = self.persist_lock.lock().await;
        let state = self.snapshot().await?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&state))
            .await
            .map_err(|err| AppError::Io(format!("persist task failed: {err}")))?
    }

    /// Persist, logging instead of failing. Used after mutations whose
    /// result the caller already has.
    async fn persist_quietly(&self) {
        if let Err(err) = self.persist().await {
            warn!(%err, "pool state save failed");
        }
    }

    async fn blocking_claims<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ClaimCoordinator) -> Result<T> + Send + 'static,
    {
        let claims = Arc::clone(&self.claims);
        tokio::task::spawn_blocking(move || op(&claims))
            .await
            .map_err(|err| AppError::Io(format!("claim task failed: {err}")))?
    }

    // ── Sessions ────────────────────────────────────────────

    /// Create a session. Roles missing from the role table open an
    /// interactive shell labelled with the requested role.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` while draining, plus any registry error.
    pub async fn create_session(
        &self,
        name: &str,
        role: &str,
        working_dir: &Path,
        on_existing: ExistingSession,
    ) -> Result<Session> {
        self.admit()?;
        let kind = SessionKind::for_role(self.config.role(role));
        let session = self
            .registry
            .create(name, role, kind, working_dir, on_existing)
            .await?;
        self.audit(
            AuditEntry::new(AuditEventType::SessionCreate)
                .with_session(session.id.clone())
                .with_detail(json!({ "name": session.name, "role": session.role })),
        );
        self.persist_quietly().await;
        Ok(session)
    }

    /// Destroy a session; unknown ids succeed.
    ///
    /// # Errors
    ///
    /// Never fails for backend problems; see [`SessionRegistry::destroy`].
    pub async fn destroy_session(&self, id: &str) -> Result<Option<Session>> {
        let removed = self.registry.destroy(id).await?;
        if removed.is_some() {
            self.audit(AuditEntry::new(AuditEventType::SessionDestroy).with_session(id));
            self.persist_quietly().await;
        }
        Ok(removed)
    }

    /// Restart a session in place.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` or the backend error.
    pub async fn restart_session(&self, id: &str) -> Result<Session> {
        let result = self.registry.restart(id).await;
        if let Ok(session) = &result {
            self.audit(
                AuditEntry::new(AuditEventType::SessionRestart)
                    .with_session(id)
                    .with_detail(json!({ "handle": session.backend_handle })),
            );
        }
        self.persist_quietly().await;
        result
    }

    // ── Claims ──────────────────────────────────────────────

    /// Claim `item_id` for `holder`. Without `ttl` the configured default
    /// lease applies.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` while draining, `AlreadyClaimed` naming the
    /// current holder, or a storage error.
    pub async fn claim(&self, item_id: &str, holder: &str, ttl: Option<u64>) -> Result<Claim> {
        self.admit()?;
        let ttl = Duration::from_secs(ttl.unwrap_or(self.config.claims.default_ttl_seconds));
        let (item, who) = (item_id.to_owned(), holder.to_owned());
        let span = info_span!("pool_claim", item_id, holder);
        let result = self
            .blocking_claims(move |c| c.claim(&item, &who, ttl))
            .instrument(span)
            .await;
        match &result {
            Ok(claim) => {
                self.counters.bump(Counter::ClaimsGranted);
                self.progress
                    .begin(holder, Some(item_id.to_owned()), claim.created_at)
                    .await;
                self.clear_interventions(holder).await;
                let session = self.registry.associate(holder, item_id).await;
                let mut entry = AuditEntry::new(AuditEventType::ClaimGrant)
                    .with_item(item_id)
                    .with_holder(holder)
                    .with_detail(json!({ "expires_at": claim.expires_at, "nonce": claim.nonce }));
                if let Some(session) = session {
                    entry = entry.with_session(session);
                }
                self.audit(entry);
                self.persist_quietly().await;
            }
            Err(AppError::AlreadyClaimed { .. }) => self.counters.bump(Counter::ClaimsConflicted),
            Err(_) => {}
        }
        result
    }

    /// Extend `holder`'s lease on `item_id`.
    ///
    /// # Errors
    ///
    /// Returns `NotHolder` or `AlreadyClaimed` when the caller does not hold
    /// a live claim.
    pub async fn renew(&self, item_id: &str, holder: &str, ttl: Option<u64>) -> Result<Claim> {
        let ttl = Duration::from_secs(ttl.unwrap_or(self.config.claims.default_ttl_seconds));
        let (item, who) = (item_id.to_owned(), holder.to_owned());
        self.blocking_claims(move |c| c.renew(&item, &who, ttl))
            .await
    }

    /// Release `holder`'s claim on `item_id`. Returns whether a record was
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns `NotHolder` when another holder's live claim is recorded.
    pub async fn release(&self, item_id: &str, holder: &str) -> Result<bool> {
        let (item, who) = (item_id.to_owned(), holder.to_owned());
        let released = self
            .blocking_claims(move |c| c.release(&item, &who))
            .await?;
        if released {
            self.counters.bump(Counter::ClaimsReleased);
            self.registry.dissociate(item_id).await;
            self.audit(
                AuditEntry::new(AuditEventType::ClaimRelease)
                    .with_item(item_id)
                    .with_holder(holder),
            );
            self.persist_quietly().await;
        }
        Ok(released)
    }

    /// Holder and expiry of `item_id`, or unclaimed.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn check(&self, item_id: &str) -> Result<ClaimStatus> {
        let item = item_id.to_owned();
        self.blocking_claims(move |c| c.check(&item)).await
    }

    /// Live claims as stored.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn snapshot_claims(&self) -> Result<Vec<Claim>> {
        self.blocking_claims(ClaimCoordinator::list).await
    }

    /// Live claims with remaining lease.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn list_claims(&self) -> Result<Vec<ClaimView>> {
        let now = Utc::now();
        Ok(self
            .blocking_claims(ClaimCoordinator::list)
            .await?
            .into_iter()
            .map(|c| ClaimView::at(c, now))
            .collect())
    }

    /// Reap lapsed claims. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn sweep_claims(&self) -> Result<usize> {
        let reaped = self.blocking_claims(ClaimCoordinator::sweep).await?;
        for claim in &reaped {
            self.registry.dissociate(&claim.item_id).await;
        }
        if !reaped.is_empty() {
            self.counters
                .add(Counter::ClaimsExpired, reaped.len() as u64);
            self.persist_quietly().await;
        }
        Ok(reaped.len())
    }

    // ── Progress ────────────────────────────────────────────

    /// Record an agent heartbeat.
    pub async fn heartbeat(
        &self,
        holder: &str,
        item_id: Option<String>,
        status: Option<AgentStatus>,
    ) -> ProgressRecord {
        self.progress
            .heartbeat(holder, item_id, status, Utc::now())
            .await
    }

    /// Append an agent milestone.
    pub async fn milestone(
        &self,
        holder: &str,
        kind: MilestoneKind,
        message: String,
    ) -> ProgressRecord {
        self.progress
            .milestone(holder, kind, message, Utc::now())
            .await
    }

    /// Return a paused agent to work and forget its fired interventions.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` when `holder` has no progress record.
    pub async fn resume(&self, holder: &str) -> Result<ProgressRecord> {
        let record = self
            .progress
            .resume(holder, Utc::now())
            .await
            .ok_or_else(|| AppError::Protocol(format!("no progress record for {holder}")))?;
        self.clear_interventions(holder).await;
        self.persist_quietly().await;
        Ok(record)
    }

    async fn clear_interventions(&self, holder: &str) {
        self.interventions
            .lock()
            .await
            .retain(|fired| fired.holder != holder);
    }

    // ── Status ──────────────────────────────────────────────

    /// Daemon status summary.
    ///
    /// # Errors
    ///
    /// Returns a storage error if claims cannot be listed.
    pub async fn status(&self) -> Result<StatusReport> {
        let sessions = self.registry.list_active().await;
        let claims = self.blocking_claims(ClaimCoordinator::list).await?;
        let now = Utc::now();
        Ok(StatusReport {
            pid: std::process::id(),
            started_at: self.started_at,
            uptime_seconds: (now - self.started_at).to_std().unwrap_or_default().as_secs(),
            accepting: self.is_accepting(),
            sessions: sessions.len(),
            active_sessions: sessions
                .iter()
                .filter(|s| s.status == SessionStatus::Active)
                .count(),
            claims: claims.len(),
            progress: self.progress.snapshot().await.len(),
            counters: self.counters.snapshot(),
            warnings: self.warnings.snapshot(),
            interventions: self.interventions.lock().await.clone(),
        })
    }

    /// Progress records keyed by holder.
    pub async fn progress_records(&self) -> BTreeMap<String, ProgressRecord> {
        self.progress.snapshot().await
    }
}
