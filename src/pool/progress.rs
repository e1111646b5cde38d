//! Agent progress records keyed by holder.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::models::progress::{AgentStatus, Milestone, MilestoneKind, ProgressRecord};

/// All progress records, one per holder.
///
/// Agents drive `working`/`idle` through heartbeats. `paused` is only set by
/// an intervention and cleared by [`ProgressBook::resume`]; `errored` is only
/// set by recovery and is terminal for the record.
#[derive(Debug, Default)]
pub struct ProgressBook {
    records: Mutex<BTreeMap<String, ProgressRecord>>,
}

impl ProgressBook {
    /// Start a fresh record for `holder` working on `item_id`.
    pub async fn begin(&self, holder: &str, item_id: Option<String>, now: DateTime<Utc>) {
        self.records.lock().await.insert(
            holder.to_owned(),
            ProgressRecord::begin(holder.to_owned(), item_id, now),
        );
    }

    /// Record a heartbeat. A heartbeat naming a different item than the
    /// current record starts a new record.
    pub async fn heartbeat(
        &self,
        holder: &str,
        item_id: Option<String>,
        status: Option<AgentStatus>,
        now: DateTime<Utc>,
    ) -> ProgressRecord {
        let mut records = self.records.lock().await;
        let record = records
            .entry(holder.to_owned())
            .or_insert_with(|| ProgressRecord::begin(holder.to_owned(), item_id.clone(), now));
        if item_id.is_some() && record.item_id != item_id {
            *record = ProgressRecord::begin(holder.to_owned(), item_id, now);
        }
        record.last_heartbeat = now;
        if let Some(status) = status {
            if agent_may_set(record.status, status) {
                record.status = status;
            }
        }
        record.clone()
    }

    /// Append a milestone. Milestones also count as a heartbeat.
    pub async fn milestone(
        &self,
        holder: &str,
        kind: MilestoneKind,
        message: String,
        now: DateTime<Utc>,
    ) -> ProgressRecord {
        let mut records = self.records.lock().await;
        let record = records
            .entry(holder.to_owned())
            .or_insert_with(|| ProgressRecord::begin(holder.to_owned(), None, now));
        record.last_heartbeat = now;
        record.milestones.push(Milestone {
            at: now,
            kind,
            message,
        });
        record.clone()
    }

    /// Set `holder` to paused. Returns false when the record is missing or
    /// already errored.
    pub async fn pause(&self, holder: &str) -> bool {
        let mut records = self.records.lock().await;
        match records.get_mut(holder) {
            Some(record) if record.status != AgentStatus::Errored => {
                record.status = AgentStatus::Paused;
                true
            }
            _ => false,
        }
    }

    /// Move a paused record back to working.
    pub async fn resume(&self, holder: &str, now: DateTime<Utc>) -> Option<ProgressRecord> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(holder)?;
        if record.status == AgentStatus::Paused {
            record.status = AgentStatus::Working;
            record.last_heartbeat = now;
        }
        Some(record.clone())
    }

    /// Set `holder` to errored if its record is for `item_id` or for no item.
    /// Returns whether a record changed.
    pub async fn mark_errored(&self, holder: &str, item_id: &str) -> bool {
        let mut records = self.records.lock().await;
        match records.get_mut(holder) {
            Some(record)
                if record.status != AgentStatus::Errored
                    && record.item_id.as_deref().is_none_or(|item| item == item_id) =>
            {
                record.status = AgentStatus::Errored;
                true
            }
            _ => false,
        }
    }

    /// Record for `holder`, if any.
    pub async fn get(&self, holder: &str) -> Option<ProgressRecord> {
        self.records.lock().await.get(holder).cloned()
    }

    /// Copy of every record.
    pub async fn snapshot(&self) -> BTreeMap<String, ProgressRecord> {
        self.records.lock().await.clone()
    }

    /// Replace all records with a persisted set.
    pub async fn restore(&self, saved: BTreeMap<String, ProgressRecord>) {
        *self.records.lock().await = saved;
    }
}

fn agent_may_set(current: AgentStatus, requested: AgentStatus) -> bool {
    !matches!(current, AgentStatus::Paused | AgentStatus::Errored)
        && matches!(requested, AgentStatus::Working | AgentStatus::Idle)
}
