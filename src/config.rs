//! Global configuration parsing, validation, and credential loading.

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::models::intervention::{Intervention, Severity};
use crate::{AppError, Result};

/// Session backend (tmux) settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct BackendConfig {
    /// tmux executable.
    pub tmux_binary: String,
    /// Prefix for derived backend session names (`<prefix>-<name>`).
    pub session_prefix: String,
    /// Upper bound for any single backend command.
    pub command_timeout_seconds: u64,
    /// Extra attempts after a `BackendUnavailable` on create.
    pub create_retries: u32,
    /// Initial backoff between create attempts; doubles per attempt.
    pub retry_backoff_ms: u64,
    /// Directory for per-session output logs. Defaults to `<state_dir>/sessions`.
    pub log_dir: Option<PathBuf>,
    /// Keep output logs after a session is destroyed.
    pub retain_logs: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            tmux_binary: "tmux".into(),
            session_prefix: "pool".into(),
            command_timeout_seconds: 10,
            create_retries: 3,
            retry_backoff_ms: 200,
            log_dir: None,
            retain_logs: true,
        }
    }
}

/// Claim coordinator settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ClaimsConfig {
    /// Lock directory. Defaults to `<state_dir>/claims`.
    pub dir: Option<PathBuf>,
    /// Lease length applied when a caller does not pass one.
    pub default_ttl_seconds: u64,
    /// Period of the expired-record sweep.
    pub sweep_interval_seconds: u64,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            default_ttl_seconds: 3600,
            sweep_interval_seconds: 60,
        }
    }
}

/// Severity-to-intervention table. Defaults are monotonic.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct InterventionMap {
    /// Intervention for [`Severity::Low`].
    pub low: Intervention,
    /// Intervention for [`Severity::Medium`].
    pub medium: Intervention,
    /// Intervention for [`Severity::High`].
    pub high: Intervention,
    /// Intervention for [`Severity::Critical`].
    pub critical: Intervention,
}

impl Default for InterventionMap {
    fn default() -> Self {
        Self {
            low: Intervention::Alert,
            medium: Intervention::Suggest,
            high: Intervention::Pause,
            critical: Intervention::Escalate,
        }
    }
}

impl InterventionMap {
    /// Look up the intervention configured for `severity`.
    #[must_use]
    pub fn for_severity(&self, severity: Severity) -> Intervention {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }
}

/// Heartbeat and stuck detection settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct DetectorConfig {
    /// Whether the periodic detector pass runs.
    pub enabled: bool,
    /// Period of the detector pass.
    pub interval_seconds: u64,
    /// Heartbeat age after which a working agent is `no_progress`.
    pub idle_threshold_seconds: u64,
    /// Claim age after which unfinished work is `extended_work`.
    pub working_threshold_seconds: u64,
    /// Window inspected for repeated error signatures.
    pub loop_window_seconds: u64,
    /// Matching error signatures that constitute a loop.
    pub loop_threshold: usize,
    /// Window inspected for error bursts.
    pub error_spike_window_seconds: u64,
    /// Error milestones within the window that constitute a spike.
    pub error_spike_threshold: usize,
    /// Severity-to-intervention table.
    pub interventions: InterventionMap,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            idle_threshold_seconds: 600,
            working_threshold_seconds: 1800,
            loop_window_seconds: 900,
            loop_threshold: 3,
            error_spike_window_seconds: 300,
            error_spike_threshold: 5,
            interventions: InterventionMap::default(),
        }
    }
}

/// Orphan recovery settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct RecoveryConfig {
    /// Commit recovery writes from the periodic pass. When false the pass
    /// only records warnings for manual action.
    pub enabled: bool,
    /// Period of the reconciliation pass.
    pub interval_seconds: u64,
    /// Heartbeat age after which a working record is orphaned.
    pub heartbeat_staleness_seconds: u64,
    /// Fresh claims younger than this are never treated as stale.
    pub claim_grace_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 120,
            heartbeat_staleness_seconds: 300,
            claim_grace_seconds: 300,
        }
    }
}

/// Which external backlog the daemon talks to.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BacklogProvider {
    /// No backlog; label reconciliation is skipped.
    #[default]
    None,
    /// GitHub issues and labels over the REST API.
    Github,
}

/// Label names for the backlog workflow.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct LabelConfig {
    /// Item is ready for pickup.
    pub ready: String,
    /// Item is being worked on.
    pub in_progress: String,
    /// Item is finished.
    pub done: String,
    /// Item is blocked on external input.
    pub blocked: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            ready: "ready".into(),
            in_progress: "in-progress".into(),
            done: "done".into(),
            blocked: "blocked".into(),
        }
    }
}

/// External backlog settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct BacklogConfig {
    /// Backlog implementation.
    pub provider: BacklogProvider,
    /// `owner/name` repository slug (GitHub).
    pub repo: Option<String>,
    /// REST API base URL.
    pub api_url: String,
    /// Upper bound for a single backlog request.
    pub request_timeout_seconds: u64,
    /// Label names.
    pub labels: LabelConfig,
    /// API token (populated at runtime).
    #[serde(skip)]
    pub token: String,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            provider: BacklogProvider::None,
            repo: None,
            api_url: "https://api.github.com".into(),
            request_timeout_seconds: 15,
            labels: LabelConfig::default(),
            token: String::new(),
        }
    }
}

/// Pool State document retention.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct StateConfig {
    /// Archived state documents kept across restarts.
    pub max_archives: usize,
    /// Warnings kept in the pool state; oldest are dropped first.
    pub max_warnings: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            max_archives: 5,
            max_warnings: 200,
        }
    }
}

/// A named agent role. Sessions created with this role run `command`
/// instead of an interactive shell.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RoleConfig {
    /// Role identifier referenced by `create`.
    pub name: String,
    /// Program launched in the session; `None` opens an interactive shell.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments for `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment exported into the session.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Human-readable description shown by `status`.
    #[serde(default)]
    pub description: Option<String>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".agent-pool")
}

fn default_ipc_name() -> String {
    "agent-pool".into()
}

fn default_shutdown_grace() -> u64 {
    10
}

/// Global configuration parsed from `agent-pool.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root for the state document, archives, claims, logs, and pidfile.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Named pipe / Unix socket identifier.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Time allowed for in-flight requests to finish on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
    /// Session backend settings.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Claim coordinator settings.
    #[serde(default)]
    pub claims: ClaimsConfig,
    /// Stuck detector settings.
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Orphan recovery settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// External backlog settings.
    #[serde(default)]
    pub backlog: BacklogConfig,
    /// State document retention.
    #[serde(default)]
    pub state: StateConfig,
    /// Role table.
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            ipc_name: default_ipc_name(),
            shutdown_grace_seconds: default_shutdown_grace(),
            backend: BackendConfig::default(),
            claims: ClaimsConfig::default(),
            detector: DetectorConfig::default(),
            recovery: RecoveryConfig::default(),
            backlog: BacklogConfig::default(),
            state: StateConfig::default(),
            roles: Vec::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the backlog API token from OS keychain with env-var fallback.
    ///
    /// Only consulted when the GitHub provider is configured.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither keychain nor env var provide it.
    pub async fn load_credentials(&mut self) -> Result<()> {
        if self.backlog.provider == BacklogProvider::Github {
            self.backlog.token = load_credential("github_token", "AGENT_POOL_GITHUB_TOKEN").await?;
        }
        Ok(())
    }

    /// Look up a role by name.
    #[must_use]
    pub fn role(&self, name: &str) -> Option<&RoleConfig> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// Lock directory for claim records.
    #[must_use]
    pub fn claims_dir(&self) -> PathBuf {
        self.claims
            .dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("claims"))
    }

    /// Directory for per-session output logs.
    #[must_use]
    pub fn session_log_dir(&self) -> PathBuf {
        self.backend
            .log_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("sessions"))
    }

    /// Path of the live Pool State document.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join("pool-state.json")
    }

    /// Directory holding rotated Pool State archives.
    #[must_use]
    pub fn archive_dir(&self) -> PathBuf {
        self.state_dir.join("archive")
    }

    /// Directory for JSONL audit logs.
    #[must_use]
    pub fn audit_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Path of the daemon pidfile.
    #[must_use]
    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join("daemon.pid")
    }

    /// Backend command timeout.
    #[must_use]
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.command_timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.ipc_name.trim().is_empty() {
            return Err(AppError::Config("ipc_name must not be empty".into()));
        }
        if self.backend.command_timeout_seconds == 0 {
            return Err(AppError::Config(
                "backend.command_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.claims.default_ttl_seconds == 0 {
            return Err(AppError::Config(
                "claims.default_ttl_seconds must be greater than zero".into(),
            ));
        }
        let intervals = [
            ("claims.sweep_interval_seconds", self.claims.sweep_interval_seconds),
            ("detector.interval_seconds", self.detector.interval_seconds),
            ("recovery.interval_seconds", self.recovery.interval_seconds),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(AppError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.detector.loop_threshold < 2 || self.detector.error_spike_threshold < 2 {
            return Err(AppError::Config(
                "detector loop and error spike thresholds must be at least 2".into(),
            ));
        }
        if self.state.max_archives == 0 {
            return Err(AppError::Config(
                "state.max_archives must be greater than zero".into(),
            ));
        }
        if self.backlog.provider == BacklogProvider::Github {
            match self.backlog.repo.as_deref() {
                Some(repo) if repo.split('/').filter(|p| !p.is_empty()).count() == 2 => {}
                _ => {
                    return Err(AppError::Config(
                        "backlog.repo must be an owner/name slug for the github provider".into(),
                    ))
                }
            }
        }

        let mut seen = HashSet::new();
        for role in &self.roles {
            if role.name.trim().is_empty() {
                return Err(AppError::Config("role name must not be empty".into()));
            }
            if !seen.insert(role.name.as_str()) {
                return Err(AppError::Config(format!("duplicate role '{}'", role.name)));
            }
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new("agent-pool", &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key).map_err(|_| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
