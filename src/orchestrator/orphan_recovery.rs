//! Orphan recovery: reconcile claims, sessions, backlog labels, and
//! progress records, and reset work nobody is doing.
//!
//! An item is orphaned when
//! - its claim is past the grace period and nothing corroborates it (no live
//!   session believes it works on the item, no recent heartbeat),
//! - it carries the in-progress label but nobody holds a claim on it, or
//! - its holder's progress record stopped heartbeating.
//!
//! Recovery releases the exact claim that was observed (by nonce), moves the
//! label back to ready, marks the holder's record for that item errored, and
//! audits the action. A second pass over the same pool finds nothing to do.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::audit::{AuditEntry, AuditEventType};
use crate::backend::BackendSession;
use crate::config::RecoveryConfig;
use crate::models::claim::Claim;
use crate::models::intervention::Severity;
use crate::models::progress::{AgentStatus, ProgressRecord};
use crate::models::session::{Session, SessionStatus};
use crate::models::warning::{Warning, WarningKind};
use crate::pool::counters::Counter;
use crate::pool::AppState;
use crate::{AppError, Result};

/// Why an item was judged orphaned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum OrphanCause {
    /// Claim past its grace period with no live session or heartbeat.
    StaleClaim,
    /// In-progress label without a live claim.
    UntrackedItem,
    /// Holder stopped heartbeating.
    StaleHeartbeat,
}

impl OrphanCause {
    fn warning_kind(self) -> WarningKind {
        match self {
            Self::StaleClaim => WarningKind::StaleClaim,
            Self::UntrackedItem => WarningKind::UntrackedItem,
            Self::StaleHeartbeat => WarningKind::StaleHeartbeat,
        }
    }
}

/// One orphaned work item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Orphan {
    /// Work item.
    pub item_id: String,
    /// Claim holder, when a claim exists.
    pub holder: Option<String>,
    /// Nonce of the observed claim; only that exact claim is released.
    pub claim_nonce: Option<String>,
    /// Whether the item carries the in-progress label.
    pub labelled: bool,
    /// Every reason that applied.
    pub causes: Vec<OrphanCause>,
    /// Whether the holder's progress record belongs to this item and is
    /// marked errored on recovery.
    #[serde(default)]
    pub marks_record: bool,
}

/// Result of a recovery run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Whether writes were performed.
    pub committed: bool,
    /// Orphans found.
    pub orphans: Vec<Orphan>,
    /// Items recovered (commit only).
    pub recovered: Vec<String>,
    /// Per-item failures (commit only).
    pub failures: BTreeMap<String, String>,
}

/// Snapshot of everything recovery looks at.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryInputs<'a> {
    /// Live claims.
    pub claims: &'a [Claim],
    /// Registered sessions.
    pub sessions: &'a [Session],
    /// Sessions alive in the backend, or `None` if the backend could not be
    /// listed. Without it no claim is judged stale by absence of a session.
    pub backend: Option<&'a [BackendSession]>,
    /// Items carrying the in-progress label.
    pub in_progress: &'a [String],
    /// Progress records keyed by holder.
    pub progress: &'a BTreeMap<String, ProgressRecord>,
}

fn session_corroborates(
    claim: &Claim,
    sessions: &[Session],
    backend: &[BackendSession],
) -> bool {
    sessions.iter().any(|s| {
        s.status == SessionStatus::Active
            && (s.work_item.as_deref() == Some(claim.item_id.as_str())
                || s.is_held_by(&claim.holder))
            && s
                .backend_handle
                .as_deref()
                .is_some_and(|h| backend.iter().any(|b| b.handle == h))
    })
}

fn record_for<'a>(
    claim: &Claim,
    progress: &'a BTreeMap<String, ProgressRecord>,
) -> Option<&'a ProgressRecord> {
    progress.get(&claim.holder).filter(|r| {
        r.item_id
            .as_deref()
            .is_none_or(|item| item == claim.item_id)
    })
}

/// Find orphaned items. Pure; the result is sorted by item id.
#[must_use]
pub fn plan(
    inputs: &RecoveryInputs<'_>,
    config: &RecoveryConfig,
    now: DateTime<Utc>,
) -> Vec<Orphan> {
    let staleness = Duration::from_secs(config.heartbeat_staleness_seconds);
    let grace = Duration::from_secs(config.claim_grace_seconds);
    let mut orphans: BTreeMap<String, Orphan> = BTreeMap::new();
    let mut add = |item: &str, claim: Option<&Claim>, marks_record: bool, cause: OrphanCause| {
        let entry = orphans.entry(item.to_owned()).or_insert_with(|| Orphan {
            item_id: item.to_owned(),
            holder: claim.map(|c| c.holder.clone()),
            claim_nonce: claim.map(|c| c.nonce.clone()),
            labelled: inputs.in_progress.iter().any(|i| i == item),
            causes: Vec::new(),
            marks_record: false,
        });
        entry.marks_record |= marks_record;
        if !entry.causes.contains(&cause) {
            entry.causes.push(cause);
        }
    };

    for claim in inputs.claims.iter().filter(|c| !c.is_expired(now)) {
        let record = record_for(claim, inputs.progress);
        let fresh_heartbeat = record.is_some_and(|r| {
            r.status != AgentStatus::Errored && r.heartbeat_age(now) <= staleness
        });

        if let Some(backend) = inputs.backend {
            if claim.held_for(now) >= grace
                && !fresh_heartbeat
                && !session_corroborates(claim, inputs.sessions, backend)
            {
                add(
                    &claim.item_id,
                    Some(claim),
                    record.is_some(),
                    OrphanCause::StaleClaim,
                );
            }
        }

        if record.is_some_and(|r| {
            matches!(r.status, AgentStatus::Working | AgentStatus::Idle)
                && r.heartbeat_age(now) > staleness
        }) {
            add(&claim.item_id, Some(claim), true, OrphanCause::StaleHeartbeat);
        }
    }

    for item in inputs.in_progress {
        let claimed = inputs
            .claims
            .iter()
            .any(|c| &c.item_id == item && !c.is_expired(now));
        if !claimed {
            add(item, None, false, OrphanCause::UntrackedItem);
        }
    }

    orphans
        .into_values()
        .map(|mut o| {
            o.causes.sort();
            o
        })
        .collect()
}

/// Gather inputs, plan, and, with `commit`, recover every orphan. A
/// failure on one item never stops the others.
///
/// # Errors
///
/// Returns a storage error if claims cannot be listed.
pub async fn run(state: &AppState, commit: bool) -> Result<RecoveryReport> {
    let span = info_span!("orphan_recovery", commit);
    async move {
        let now = Utc::now();
        let claims = state.snapshot_claims().await?;
        let sessions = state.registry.list_active().await;
        let backend = match state.registry.backend_sessions().await {
            Ok(list) => Some(list),
            Err(err) => {
                warn!(%err, "backend unavailable; skipping session corroboration");
                None
            }
        };
        let in_progress = match state.backlog.in_progress().await {
            Ok(items) => items,
            Err(err) => {
                state.warnings.push_unique(Warning::new(
                    WarningKind::Backlog,
                    Severity::Medium,
                    format!("backlog listing failed: {err}"),
                ));
                Vec::new()
            }
        };
        let progress = state.progress.snapshot().await;

        let inputs = RecoveryInputs {
            claims: &claims,
            sessions: &sessions,
            backend: backend.as_deref(),
            in_progress: &in_progress,
            progress: &progress,
        };
        let orphans = plan(&inputs, &state.config.recovery, now);
        debug!(orphans = orphans.len(), "recovery planned");

        let mut report = RecoveryReport {
            committed: commit,
            orphans,
            ..RecoveryReport::default()
        };
        if !commit {
            return Ok(report);
        }

        for orphan in &report.orphans {
            match recover(state, orphan).await {
                Ok(()) => report.recovered.push(orphan.item_id.clone()),
                Err(err) => {
                    state.warn(
                        Warning::new(
                            WarningKind::RecoveryFailed,
                            Severity::High,
                            format!("recovery of {} incomplete: {err}", orphan.item_id),
                        )
                        .with("item_id", orphan.item_id.clone()),
                    );
                    report
                        .failures
                        .insert(orphan.item_id.clone(), err.to_string());
                }
            }
        }
        if !report.orphans.is_empty() {
            state.persist().await?;
        }
        info!(
            recovered = report.recovered.len(),
            failed = report.failures.len(),
            "recovery committed"
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

async fn recover(state: &AppState, orphan: &Orphan) -> Result<()> {
    let item = orphan.item_id.as_str();
    let mut released = false;
    if let Some(nonce) = &orphan.claim_nonce {
        let (claims, item_owned, nonce) =
            (Arc::clone(&state.claims), item.to_owned(), nonce.clone());
        released = tokio::task::spawn_blocking(move || claims.release_if(&item_owned, &nonce))
            .await
            .map_err(|err| AppError::Io(format!("release task failed: {err}")))??
            .is_some();
    }
    state.registry.dissociate(item).await;
    if let Some(holder) = orphan.holder.as_ref().filter(|_| orphan.marks_record) {
        state.progress.mark_errored(holder, item).await;
    }

    if orphan.labelled {
        let labels = &state.config.backlog.labels;
        state
            .backlog
            .transition(item, &labels.in_progress, &labels.ready)
            .await?;
        let causes: Vec<&str> = orphan
            .causes
            .iter()
            .map(|c| match c {
                OrphanCause::StaleClaim => "stale claim",
                OrphanCause::UntrackedItem => "no live claim",
                OrphanCause::StaleHeartbeat => "stale heartbeat",
            })
            .collect();
        let body = format!(
            "agent-pool reset this item to `{}` ({}).",
            labels.ready,
            causes.join(", ")
        );
        if let Err(err) = state.backlog.comment(item, &body).await {
            warn!(item_id = item, %err, "recovery comment failed");
        }
    }

    state.counters.bump(Counter::OrphansRecovered);
    state.audit(
        AuditEntry::new(AuditEventType::OrphanRecovery)
            .with_item(item)
            .with_detail(serde_json::json!({
                "holder": orphan.holder,
                "causes": orphan.causes,
                "claim_released": released,
                "relabelled": orphan.labelled,
            })),
    );
    info!(item_id = item, ?orphan.causes, "orphan recovered");
    Ok(())
}

/// Record one warning per orphan without acting on it. Repeated passes do
/// not duplicate warnings.
pub fn warn_only(state: &AppState, report: &RecoveryReport) {
    for orphan in &report.orphans {
        let Some(first) = orphan.causes.first() else {
            continue;
        };
        let mut warning = Warning::new(
            first.warning_kind(),
            Severity::Medium,
            format!(
                "stale state: {} looks orphaned ({:?}); run recover --commit",
                orphan.item_id, orphan.causes
            ),
        )
        .with("item_id", orphan.item_id.clone());
        if let Some(holder) = &orphan.holder {
            warning = warning.with("holder", holder.clone());
        }
        state.warnings.push_unique(warning);
    }
}

/// Spawn the periodic reconciliation task. With `[recovery] enabled` the
/// pass commits; otherwise it only records warnings.
#[must_use]
pub fn spawn(state: Arc<AppState>, ct: CancellationToken) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.recovery.interval_seconds.max(1));
    let commit = state.config.recovery.enabled;
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        debug!("orphan recovery cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        match run(&state, commit).await {
                            Ok(report) if !commit => warn_only(&state, &report),
                            Ok(_) => {}
                            Err(err) => warn!(%err, "recovery pass failed"),
                        }
                    }
                }
            }
        }
        .instrument(info_span!("orphan_recovery_task")),
    )
}
