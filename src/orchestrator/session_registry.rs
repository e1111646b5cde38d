//! Session registry: the table of managed sessions and their lifecycle.
//!
//! The registry owns every create/destroy/restart of a backend session.
//! Mutations of one session are serialized through a per-session async lock;
//! unrelated sessions proceed in parallel. Creates are additionally
//! serialized per derived backend name so two callers cannot race for the
//! same name.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::backend::{BackendSession, LaunchSpec, SessionBackend};
use crate::config::GlobalConfig;
use crate::models::intervention::Severity;
use crate::models::session::{
    derive_backend_name, ExistingSession, Session, SessionKind, SessionStatus,
};
use crate::models::warning::{Warning, WarningKind};
use crate::pool::counters::{Counter, PoolCounters};
use crate::pool::warnings::WarningLog;
use crate::{AppError, Result};

/// Prefix of logical session ids.
pub const SESSION_ID_PREFIX: &str = "terminal-";

/// Registry settings derived from [`GlobalConfig`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Prefix for backend session names.
    pub session_prefix: String,
    /// Directory holding per-session output logs.
    pub log_dir: PathBuf,
    /// Keep output logs after destroy.
    pub retain_logs: bool,
    /// Upper bound on any single backend call.
    pub call_timeout: Duration,
    /// Extra create attempts after a retryable failure.
    pub create_retries: u32,
    /// Delay before the first retry; doubled on each attempt.
    pub retry_backoff: Duration,
}

impl RegistrySettings {
    /// Settings from the `[backend]` section.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            session_prefix: config.backend.session_prefix.clone(),
            log_dir: config.session_log_dir(),
            retain_logs: config.backend.retain_logs,
            // tmux enforces its own timeout; the outer bound covers fakes
            // and a wedged child that ignores kill.
            call_timeout: config.backend_timeout() + Duration::from_secs(1),
            create_retries: config.backend.create_retries,
            retry_backoff: Duration::from_millis(config.backend.retry_backoff_ms),
        }
    }
}

/// In-memory session table backed by a [`SessionBackend`].
pub struct SessionRegistry {
    backend: Arc<dyn SessionBackend>,
    settings: RegistrySettings,
    table: RwLock<BTreeMap<String, Session>>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    warnings: Arc<WarningLog>,
    counters: Arc<PoolCounters>,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        settings: RegistrySettings,
        warnings: Arc<WarningLog>,
        counters: Arc<PoolCounters>,
    ) -> Self {
        Self {
            backend,
            settings,
            table: RwLock::new(BTreeMap::new()),
            locks: StdMutex::new(HashMap::new()),
            warnings,
            counters,
        }
    }

    async fn lock(&self, key: String) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key).or_default())
        };
        mutex.lock_owned().await
    }

    fn forget_lock(&self, key: &str) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    async fn bounded<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.settings.call_timeout, call)
            .await
            .map_err(|_| {
                AppError::BackendUnavailable(format!(
                    "{what} timed out after {}s",
                    self.settings.call_timeout.as_secs()
                ))
            })?
    }

    /// Backend create with bounded, exponentially backed-off retries.
    async fn launch(&self, spec: &LaunchSpec) -> Result<BackendSession> {
        let mut delay = self.settings.retry_backoff;
        let mut attempt = 0_u32;
        loop {
            let err = match self.bounded("create", self.backend.create(spec)).await {
                Ok(session) => return Ok(session),
                Err(err) => err,
            };
            if !matches!(err, AppError::DuplicateSession(_)) {
                self.discard_partial(spec).await;
            }
            if !err.is_retryable() || attempt >= self.settings.create_retries {
                return Err(err);
            }
            attempt += 1;
            warn!(attempt, error = %err, "backend create failed, retrying");
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }

    /// Kill whatever a failed create may have left running under
    /// `spec.name`, so the next attempt does not collide with it.
    async fn discard_partial(&self, spec: &LaunchSpec) {
        if let Err(err) = self.bounded("destroy", self.backend.destroy(&spec.name)).await {
            debug!(backend_name = %spec.name, %err, "no partial session cleaned up");
        }
    }

    fn launch_spec(&self, session: &Session) -> LaunchSpec {
        LaunchSpec {
            name: session.backend_name.clone(),
            working_dir: session.working_dir.clone(),
            kind: session.kind.clone(),
            log_path: session.log_path.clone(),
            session_id: session.id.clone(),
        }
    }

    async fn live_by_backend_name(&self, backend_name: &str) -> Option<Session> {
        self.table
            .read()
            .await
            .values()
            .find(|s| s.backend_name == backend_name && s.is_live())
            .cloned()
    }

    /// Create a session named `name` for `role`, rooted at `working_dir`.
    ///
    /// `on_existing` decides what happens when a live session already uses
    /// the derived backend name.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateSession` under [`ExistingSession::Reject`] when the
    /// name is taken, and `BackendUnavailable` once retries are exhausted.
    pub async fn create(
        &self,
        name: &str,
        role: &str,
        kind: SessionKind,
        working_dir: &Path,
        on_existing: ExistingSession,
    ) -> Result<Session> {
        let backend_name = derive_backend_name(&self.settings.session_prefix, name);
        let span = info_span!("create_session", name, role, backend_name = %backend_name);
        async move {
            if derive_backend_name("", name).is_empty() {
                return Err(AppError::Protocol(format!("invalid session name {name:?}")));
            }
            let _name_guard = self.lock(format!("name:{backend_name}")).await;

            if let Some(existing) = self.live_by_backend_name(&backend_name).await {
                match on_existing {
                    ExistingSession::Reject => {
                        return Err(AppError::DuplicateSession(format!(
                            "{name} is already running as {}",
                            existing.id
                        )));
                    }
                    ExistingSession::Reuse => {
                        info!(session_id = %existing.id, "reusing existing session");
                        return Ok(existing);
                    }
                    ExistingSession::Replace => {
                        info!(session_id = %existing.id, "replacing existing session");
                        self.destroy(&existing.id).await?;
                    }
                }
            }

            let seq = self.counters.next_session_seq();
            let id = format!("{SESSION_ID_PREFIX}{seq}");
            let mut session = Session {
                id: id.clone(),
                name: name.to_owned(),
                role: role.to_owned(),
                kind,
                backend_name: backend_name.clone(),
                backend_handle: None,
                working_dir: working_dir.to_path_buf(),
                log_path: self.settings.log_dir.join(format!("{id}.log")),
                created_at: Utc::now(),
                status: SessionStatus::Creating,
                work_item: None,
            };
            let _id_guard = self.lock(id.clone()).await;
            self.table.write().await.insert(id.clone(), session.clone());

            match self.start_backend(&session, on_existing).await {
                Ok(handle) => {
                    session.backend_handle = Some(handle);
                    session.status = SessionStatus::Active;
                    self.table.write().await.insert(id.clone(), session.clone());
                    self.counters.bump(Counter::SessionsCreated);
                    info!(session_id = %id, "session created");
                    Ok(session)
                }
                Err(err) => {
                    self.table.write().await.remove(&id);
                    self.warnings.push(
                        Warning::new(
                            WarningKind::StaleSession,
                            Severity::Medium,
                            format!("create of {name} failed: {err}"),
                        )
                        .with("session_id", id.clone())
                        .with("backend_name", backend_name.clone()),
                    );
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Start the backend session, resolving a name collision with a session
    /// the registry does not track according to `on_existing`.
    async fn start_backend(&self, session: &Session, on_existing: ExistingSession) -> Result<String> {
        tokio::fs::create_dir_all(&self.settings.log_dir).await?;
        let spec = self.launch_spec(session);
        match self.launch(&spec).await {
            Ok(started) => Ok(started.handle),
            Err(AppError::DuplicateSession(_)) if on_existing == ExistingSession::Reuse => {
                let sessions = self.bounded("list", self.backend.list()).await?;
                sessions
                    .into_iter()
                    .find(|s| s.name == spec.name)
                    .map(|s| {
                        info!(handle = %s.handle, "adopted untracked backend session");
                        s.handle
                    })
                    .ok_or_else(|| AppError::DuplicateSession(spec.name.clone()))
            }
            Err(AppError::DuplicateSession(_)) if on_existing == ExistingSession::Replace => {
                info!("killing untracked backend session before create");
                self.bounded("destroy", self.backend.destroy(&spec.name))
                    .await?;
                Ok(self.launch(&spec).await?.handle)
            }
            Err(err) => Err(err),
        }
    }

    /// Destroy session `id`. Unknown ids succeed. Backend failures are
    /// recorded as warnings and never fail the caller; the registry entry
    /// is always removed.
    ///
    /// Returns the removed session, if there was one.
    ///
    /// # Errors
    ///
    /// Infallible in practice; the signature leaves room for callers that
    /// propagate.
    pub async fn destroy(&self, id: &str) -> Result<Option<Session>> {
        let span = info_span!("destroy_session", session_id = id);
        async move {
            let guard = self.lock(id.to_owned()).await;
            let Some(session) = self.table.read().await.get(id).cloned() else {
                debug!("destroy of unknown session is a no-op");
                drop(guard);
                self.forget_lock(id);
                return Ok(None);
            };

            if let Some(handle) = &session.backend_handle {
                if let Err(err) = self.bounded("destroy", self.backend.destroy(handle)).await {
                    self.warnings.push(
                        Warning::new(
                            WarningKind::BackendKillFailed,
                            Severity::Medium,
                            format!("backend kill of {} failed: {err}", session.backend_name),
                        )
                        .with("session_id", id)
                        .with("handle", handle.clone()),
                    );
                }
            }

            if !self.settings.retain_logs {
                match tokio::fs::remove_file(&session.log_path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!(path = %session.log_path.display(), %err, "log purge failed"),
                }
            }

            self.table.write().await.remove(id);
            self.counters.bump(Counter::SessionsDestroyed);
            drop(guard);
            self.forget_lock(id);
            info!("session destroyed");
            Ok(Some(session))
        }
        .instrument(span)
        .await
    }

    /// Non-destroyed sessions ordered by logical id number.
    pub async fn list_active(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .table
            .read()
            .await
            .values()
            .filter(|s| s.status != SessionStatus::Destroyed)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| (session_seq(&s.id), s.id.clone()));
        sessions
    }

    /// Session `id`, if registered.
    pub async fn get(&self, id: &str) -> Option<Session> {
        self.table.read().await.get(id).cloned()
    }

    /// Session named by `holder` through its logical id or display name.
    pub async fn find_holder(&self, holder: &str) -> Option<Session> {
        let table = self.table.read().await;
        table
            .get(holder)
            .or_else(|| table.values().find(|s| s.is_held_by(holder)))
            .cloned()
    }

    async fn live_handle(&self, id: &str) -> Result<String> {
        let table = self.table.read().await;
        let session = table
            .get(id)
            .ok_or_else(|| AppError::SessionNotFound(id.to_owned()))?;
        match (&session.backend_handle, session.status) {
            (Some(handle), SessionStatus::Active) => Ok(handle.clone()),
            _ => Err(AppError::SessionNotFound(format!(
                "{id} has no running backend session"
            ))),
        }
    }

    /// Type `text` into session `id`.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for unknown or errored sessions and
    /// `BackendUnavailable` if the backend does not answer.
    pub async fn send_input(&self, id: &str, text: &str, submit: bool) -> Result<()> {
        let span = info_span!("send_input", session_id = id, bytes = text.len());
        async move {
            let _guard = self.lock(id.to_owned()).await;
            let handle = self.live_handle(id).await?;
            self.bounded("send_input", self.backend.send_input(&handle, text, submit))
                .await
        }
        .instrument(span)
        .await
    }

    /// Last `max_lines` lines of output from session `id`.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for unknown or errored sessions and
    /// `BackendUnavailable` if the backend does not answer.
    pub async fn read_output(&self, id: &str, max_lines: usize) -> Result<Vec<String>> {
        let handle = self.live_handle(id).await?;
        self.bounded("read_output", self.backend.read_output(&handle, max_lines))
            .instrument(info_span!("read_output", session_id = id, max_lines))
            .await
    }

    /// Kill and re-create session `id` from its stored configuration. The
    /// logical id, role, working directory, and kind are preserved; the
    /// backend handle changes. A failed re-create leaves the session
    /// `Errored`.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for unknown ids and the backend error if the
    /// re-create fails.
    pub async fn restart(&self, id: &str) -> Result<Session> {
        let span = info_span!("restart_session", session_id = id);
        async move {
            let _guard = self.lock(id.to_owned()).await;
            let mut session = self
                .get(id)
                .await
                .ok_or_else(|| AppError::SessionNotFound(id.to_owned()))?;

            if let Some(handle) = session.backend_handle.take() {
                if let Err(err) = self.bounded("destroy", self.backend.destroy(&handle)).await {
                    self.warnings.push(
                        Warning::new(
                            WarningKind::BackendKillFailed,
                            Severity::Medium,
                            format!("kill before restart of {} failed: {err}", session.backend_name),
                        )
                        .with("session_id", id)
                        .with("handle", handle),
                    );
                }
            }

            session.status = SessionStatus::Creating;
            self.table.write().await.insert(id.to_owned(), session.clone());

            let spec = self.launch_spec(&session);
            let result = match tokio::fs::create_dir_all(&self.settings.log_dir).await {
                Ok(()) => self.launch(&spec).await,
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(started) => {
                    session.backend_handle = Some(started.handle);
                    session.status = SessionStatus::Active;
                    self.table.write().await.insert(id.to_owned(), session.clone());
                    info!(handle = ?session.backend_handle, "session restarted");
                    Ok(session)
                }
                Err(err) => {
                    session.status = SessionStatus::Errored;
                    self.table.write().await.insert(id.to_owned(), session);
                    self.warnings.push(
                        Warning::new(
                            WarningKind::StaleSession,
                            Severity::High,
                            format!("restart of {id} failed: {err}"),
                        )
                        .with("session_id", id),
                    );
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Record `item_id` as the believed work item of the session `holder`
    /// names. Returns the session id when one matched.
    pub async fn associate(&self, holder: &str, item_id: &str) -> Option<String> {
        let mut table = self.table.write().await;
        let session = table.values_mut().find(|s| s.is_held_by(holder))?;
        session.work_item = Some(item_id.to_owned());
        Some(session.id.clone())
    }

    /// Clear `item_id` from every session that believes it is working on it.
    pub async fn dissociate(&self, item_id: &str) {
        let mut table = self.table.write().await;
        for session in table.values_mut() {
            if session.work_item.as_deref() == Some(item_id) {
                session.work_item = None;
            }
        }
    }

    /// Load persisted sessions. Destroyed entries are dropped, and the id
    /// sequence is advanced past every restored id.
    pub async fn restore(&self, saved: Vec<Session>) {
        let mut table = self.table.write().await;
        table.clear();
        for session in saved {
            if session.status == SessionStatus::Destroyed {
                continue;
            }
            if let Some(seq) = session_seq(&session.id) {
                self.counters.observe_session_seq(seq);
            }
            table.insert(session.id.clone(), session);
        }
    }

    /// Compare the table against the backend. Sessions believed live whose
    /// backend session is gone become `Errored` with a warning. Returns the
    /// ids marked.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the backend cannot be listed; the
    /// table is left untouched.
    pub async fn reconcile_with_backend(&self) -> Result<Vec<String>> {
        let span = info_span!("reconcile_sessions");
        async move {
            let present = self.bounded("list", self.backend.list()).await?;
            let mut marked = Vec::new();
            let mut table = self.table.write().await;
            for session in table.values_mut().filter(|s| s.is_live()) {
                let alive = present.iter().any(|b| match &session.backend_handle {
                    Some(handle) => &b.handle == handle,
                    None => b.name == session.backend_name,
                });
                if !alive {
                    session.status = SessionStatus::Errored;
                    marked.push(session.id.clone());
                }
            }
            drop(table);
            for id in &marked {
                self.warnings.push(
                    Warning::new(
                        WarningKind::StaleSession,
                        Severity::Medium,
                        format!("stale state: session {id} is gone from the backend"),
                    )
                    .with("session_id", id.clone()),
                );
            }
            info!(marked = marked.len(), "sessions reconciled");
            Ok(marked)
        }
        .instrument(span)
        .await
    }

    /// Backend sessions currently alive, bounded by the call timeout.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the backend cannot be listed.
    pub async fn backend_sessions(&self) -> Result<Vec<BackendSession>> {
        self.bounded("list", self.backend.list()).await
    }
}

/// Numeric part of a `terminal-N` id.
#[must_use]
pub fn session_seq(id: &str) -> Option<u64> {
    id.strip_prefix(SESSION_ID_PREFIX)?.parse().ok()
}
