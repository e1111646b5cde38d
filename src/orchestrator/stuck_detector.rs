//! Heartbeat and stuck-agent detection.
//!
//! A periodic pass classifies every progress record tied to a live claim and
//! applies the configured intervention for the flag's severity. A fired
//! intervention is remembered per `(holder, flag)` and not repeated while the
//! condition persists; it is forgotten once the condition clears or the
//! agent is resumed.
//!
//! Classification and planning are pure functions over snapshots. The pass
//! applies the plan afterwards, so no lock is held across a backend or
//! backlog call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::audit::{AuditEntry, AuditEventType};
use crate::config::DetectorConfig;
use crate::models::claim::Claim;
use crate::models::intervention::{FiredIntervention, Intervention, StuckFlag};
use crate::models::progress::{AgentStatus, ProgressRecord};
use crate::models::warning::{Warning, WarningKind};
use crate::pool::counters::Counter;
use crate::pool::AppState;
use crate::Result;

/// An intervention the pass decided to fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Stuck agent.
    pub holder: String,
    /// Claimed item.
    pub item_id: String,
    /// Raised flag.
    pub flag: StuckFlag,
    /// Intervention mapped from the flag's severity.
    pub intervention: Intervention,
}

/// Outcome of planning one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectorPlan {
    /// Interventions to fire now.
    pub fire: Vec<Finding>,
    /// Fired interventions whose condition persists or whose holder is
    /// paused; everything else is dropped.
    pub keep: Vec<FiredIntervention>,
}

/// Start of a window of `seconds` ending at `now`.
fn window_start(now: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Classify one record against the claim it is tied to. The first matching
/// flag in precedence order wins. Paused and errored records are never
/// flagged.
#[must_use]
pub fn classify(
    record: &ProgressRecord,
    claim: &Claim,
    config: &DetectorConfig,
    now: DateTime<Utc>,
) -> Option<StuckFlag> {
    if matches!(record.status, AgentStatus::Paused | AgentStatus::Errored) {
        return None;
    }

    if record.status == AgentStatus::Working
        && record.heartbeat_age(now) > Duration::from_secs(config.idle_threshold_seconds)
    {
        return Some(StuckFlag::NoProgress);
    }

    if claim.held_for(now) > Duration::from_secs(config.working_threshold_seconds)
        && !record.is_completed()
    {
        return Some(StuckFlag::ExtendedWork);
    }

    let mut signatures: HashMap<String, usize> = HashMap::new();
    for milestone in record.errors_since(window_start(now, config.loop_window_seconds)) {
        *signatures.entry(milestone.signature()).or_default() += 1;
    }
    if signatures
        .values()
        .any(|&count| count >= config.loop_threshold)
    {
        return Some(StuckFlag::Looping);
    }

    if record
        .errors_since(window_start(now, config.error_spike_window_seconds))
        .count()
        >= config.error_spike_threshold
    {
        return Some(StuckFlag::ErrorSpike);
    }

    None
}

/// The live claim a record is tied to: same holder, and the same item when
/// the record names one.
fn tied_claim<'a>(record: &ProgressRecord, claims: &'a [Claim]) -> Option<&'a Claim> {
    claims.iter().find(|c| {
        c.holder == record.holder
            && record
                .item_id
                .as_deref()
                .is_none_or(|item| item == c.item_id)
    })
}

/// Decide which interventions to fire and which fired ones remain.
#[must_use]
pub fn plan(
    records: &BTreeMap<String, ProgressRecord>,
    claims: &[Claim],
    fired: &[FiredIntervention],
    config: &DetectorConfig,
    now: DateTime<Utc>,
) -> DetectorPlan {
    let mut current: HashMap<&str, (StuckFlag, &Claim)> = HashMap::new();
    for record in records.values() {
        let Some(claim) = tied_claim(record, claims) else {
            continue;
        };
        if let Some(flag) = classify(record, claim, config, now) {
            current.insert(record.holder.as_str(), (flag, claim));
        }
    }

    let keep: Vec<FiredIntervention> = fired
        .iter()
        .filter(|f| {
            let paused = records
                .get(&f.holder)
                .is_some_and(|r| r.status == AgentStatus::Paused);
            paused
                || current
                    .get(f.holder.as_str())
                    .is_some_and(|(flag, _)| *flag == f.flag)
        })
        .cloned()
        .collect();

    let mut fire: Vec<Finding> = current
        .into_iter()
        .filter(|(holder, (flag, _))| {
            !keep
                .iter()
                .any(|f| f.holder == *holder && f.flag == *flag)
        })
        .map(|(holder, (flag, claim))| Finding {
            holder: holder.to_owned(),
            item_id: claim.item_id.clone(),
            flag,
            intervention: config.interventions.for_severity(flag.severity()),
        })
        .collect();
    fire.sort_by(|a, b| a.holder.cmp(&b.holder));

    DetectorPlan { fire, keep }
}

fn message_for(finding: &Finding) -> String {
    match finding.flag {
        StuckFlag::NoProgress => format!(
            "{} has not reported progress on {}",
            finding.holder, finding.item_id
        ),
        StuckFlag::ExtendedWork => format!(
            "{} has held {} past the working threshold without completing",
            finding.holder, finding.item_id
        ),
        StuckFlag::Looping => format!(
            "{} keeps hitting the same error on {}",
            finding.holder, finding.item_id
        ),
        StuckFlag::ErrorSpike => format!(
            "{} reported a burst of errors on {}",
            finding.holder, finding.item_id
        ),
    }
}

fn prompt_for(finding: &Finding) -> Option<String> {
    match finding.intervention {
        Intervention::Suggest => Some(format!(
            "[agent-pool] {}. Consider a different approach or hand the item back.",
            message_for(finding)
        )),
        Intervention::Clarify => Some(format!(
            "[agent-pool] {}. If the item is unclear, ask for clarification on it.",
            message_for(finding)
        )),
        Intervention::Alert | Intervention::Pause | Intervention::Escalate => None,
    }
}

/// Apply one intervention. External calls happen here, outside any lock.
async fn apply(state: &AppState, finding: &Finding) {
    let message = message_for(finding);

    state.warn(
        Warning::new(WarningKind::StuckAgent, finding.flag.severity(), message.clone())
            .with("holder", finding.holder.clone())
            .with("item_id", finding.item_id.clone())
            .with("flag", finding.flag.as_str())
            .with("intervention", finding.intervention.as_str()),
    );

    if finding.intervention.pauses() && state.progress.pause(&finding.holder).await {
        info!(holder = %finding.holder, "agent paused");
    }

    if let Some(prompt) = prompt_for(finding) {
        if let Some(session) = state.registry.find_holder(&finding.holder).await {
            if let Err(err) = state.registry.send_input(&session.id, &prompt, true).await {
                warn!(session_id = %session.id, %err, "intervention prompt not delivered");
            }
        }
    }

    if finding.intervention.notifies() {
        let body = format!(
            "agent-pool escalation: {message} ({})",
            finding.flag.as_str()
        );
        if let Err(err) = state.backlog.comment(&finding.item_id, &body).await {
            state.warn(
                Warning::new(
                    WarningKind::Backlog,
                    finding.flag.severity(),
                    format!("escalation comment on {} failed: {err}", finding.item_id),
                )
                .with("item_id", finding.item_id.clone()),
            );
        }
    }

    state.counters.bump(Counter::InterventionsFired);
    state.audit(
        AuditEntry::new(AuditEventType::Intervention)
            .with_item(finding.item_id.clone())
            .with_holder(finding.holder.clone())
            .with_detail(serde_json::json!({
                "flag": finding.flag.as_str(),
                "intervention": finding.intervention.as_str(),
            })),
    );
}

/// Run one detector pass. Returns the interventions fired.
///
/// # Errors
///
/// Returns a storage error if claims cannot be listed.
pub async fn run_pass(state: &AppState) -> Result<Vec<Finding>> {
    let now = Utc::now();
    let records = state.progress.snapshot().await;
    let claims = state.snapshot_claims().await?;
    let fired = state.interventions.lock().await.clone();

    let plan = plan(&records, &claims, &fired, &state.config.detector, now);
    debug!(
        records = records.len(),
        firing = plan.fire.len(),
        kept = plan.keep.len(),
        "detector pass planned"
    );

    for finding in &plan.fire {
        apply(state, finding).await;
    }

    {
        let mut interventions = state.interventions.lock().await;
        // Only entries present at planning time are replaced; a resume or
        // claim may have cleared others meanwhile.
        interventions.retain(|f| !fired.contains(f) || plan.keep.contains(f));
        interventions.extend(plan.fire.iter().map(|finding| FiredIntervention {
            holder: finding.holder.clone(),
            item_id: Some(finding.item_id.clone()),
            flag: finding.flag,
            intervention: finding.intervention,
            fired_at: now,
        }));
    }

    if !plan.fire.is_empty() || plan.keep.len() != fired.len() {
        state.persist().await?;
    }
    Ok(plan.fire)
}

/// Spawn the periodic detector task.
#[must_use]
pub fn spawn(state: Arc<AppState>, ct: CancellationToken) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.detector.interval_seconds.max(1));
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        debug!("stuck detector cancelled");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = run_pass(&state).await {
                            warn!(%err, "detector pass failed");
                        }
                    }
                }
            }
        }
        .instrument(info_span!("stuck_detector")),
    )
}
