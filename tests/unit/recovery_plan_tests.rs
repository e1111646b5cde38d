//! Unit tests for orphan detection over pool snapshots.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use agent_pool::backend::BackendSession;
use agent_pool::config::RecoveryConfig;
use agent_pool::models::claim::Claim;
use agent_pool::models::progress::{AgentStatus, ProgressRecord};
use agent_pool::models::session::{Session, SessionKind, SessionStatus};
use agent_pool::orchestrator::orphan_recovery::{plan, OrphanCause, RecoveryInputs};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap()
}

fn ago(seconds: i64) -> DateTime<Utc> {
    now() - chrono::Duration::seconds(seconds)
}

fn config() -> RecoveryConfig {
    RecoveryConfig {
        heartbeat_staleness_seconds: 300,
        claim_grace_seconds: 300,
        ..RecoveryConfig::default()
    }
}

fn claim(holder: &str, item: &str, held_seconds: i64) -> Claim {
    Claim::new(
        item.into(),
        holder.into(),
        Duration::from_secs(86_400),
        ago(held_seconds),
    )
}

fn record(holder: &str, item: &str, heartbeat_age: i64) -> ProgressRecord {
    let mut r = ProgressRecord::begin(holder.into(), Some(item.into()), ago(3600));
    r.last_heartbeat = ago(heartbeat_age);
    r
}

fn session(name: &str, handle: &str, work_item: Option<&str>) -> Session {
    Session {
        id: "terminal-1".into(),
        name: name.into(),
        role: "agent".into(),
        kind: SessionKind::Interactive,
        backend_name: format!("pool-{name}"),
        backend_handle: Some(handle.into()),
        working_dir: PathBuf::from("/w"),
        log_path: PathBuf::from("/l"),
        created_at: ago(7200),
        status: SessionStatus::Active,
        work_item: work_item.map(str::to_owned),
    }
}

fn alive(handle: &str) -> BackendSession {
    BackendSession {
        name: "whatever".into(),
        handle: handle.into(),
    }
}

struct Fixture {
    claims: Vec<Claim>,
    sessions: Vec<Session>,
    backend: Option<Vec<BackendSession>>,
    in_progress: Vec<String>,
    progress: BTreeMap<String, ProgressRecord>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            claims: Vec::new(),
            sessions: Vec::new(),
            backend: Some(Vec::new()),
            in_progress: Vec::new(),
            progress: BTreeMap::new(),
        }
    }

    fn with_record(mut self, r: ProgressRecord) -> Self {
        self.progress.insert(r.holder.clone(), r);
        self
    }

    fn plan(&self) -> Vec<agent_pool::orchestrator::orphan_recovery::Orphan> {
        let inputs = RecoveryInputs {
            claims: &self.claims,
            sessions: &self.sessions,
            backend: self.backend.as_deref(),
            in_progress: &self.in_progress,
            progress: &self.progress,
        };
        plan(&inputs, &config(), now())
    }
}

#[test]
fn claim_without_session_or_heartbeat_is_stale() {
    let mut f = Fixture::new();
    f.claims.push(claim("agent-a", "issue-1", 600));
    let orphans = f.plan();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].item_id, "issue-1");
    assert_eq!(orphans[0].holder.as_deref(), Some("agent-a"));
    assert_eq!(orphans[0].claim_nonce.as_deref(), Some(f.claims[0].nonce.as_str()));
    assert_eq!(orphans[0].causes, vec![OrphanCause::StaleClaim]);
    assert!(!orphans[0].labelled);
    assert!(!orphans[0].marks_record, "no progress record to mark");
}

#[test]
fn record_for_another_item_is_left_alone() {
    let mut f = Fixture::new().with_record(record("agent-a", "issue-2", 30));
    f.claims.push(claim("agent-a", "issue-1", 600));
    let orphans = f.plan();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].item_id, "issue-1");
    assert_eq!(orphans[0].causes, vec![OrphanCause::StaleClaim]);
    assert!(!orphans[0].marks_record);
}

#[test]
fn young_claims_get_a_grace_period() {
    let mut f = Fixture::new();
    f.claims.push(claim("agent-a", "issue-1", 60));
    assert!(f.plan().is_empty());
}

#[test]
fn live_session_corroborates_a_claim() {
    let mut f = Fixture::new();
    f.claims.push(claim("agent-a", "issue-1", 600));
    f.sessions.push(session("agent-a", "$4", None));
    f.backend = Some(vec![alive("$4")]);
    assert!(f.plan().is_empty(), "holder's session is alive");

    f.sessions[0].name = "someone-else".into();
    f.sessions[0].work_item = Some("issue-1".into());
    assert!(f.plan().is_empty(), "session working the item is alive");
}

#[test]
fn session_gone_from_backend_does_not_corroborate() {
    let mut f = Fixture::new();
    f.claims.push(claim("agent-a", "issue-1", 600));
    f.sessions.push(session("agent-a", "$4", Some("issue-1")));
    f.backend = Some(vec![alive("$9")]);
    assert_eq!(f.plan()[0].causes, vec![OrphanCause::StaleClaim]);
}

#[test]
fn fresh_heartbeat_corroborates_a_claim() {
    let mut f = Fixture::new().with_record(record("agent-a", "issue-1", 30));
    f.claims.push(claim("agent-a", "issue-1", 600));
    assert!(f.plan().is_empty());
}

#[test]
fn unknown_backend_state_never_judges_claims_stale() {
    let mut f = Fixture::new();
    f.claims.push(claim("agent-a", "issue-1", 600));
    f.backend = None;
    assert!(f.plan().is_empty());
}

#[test]
fn stale_heartbeat_is_reported_even_without_backend() {
    let mut f = Fixture::new().with_record(record("agent-a", "issue-1", 900));
    f.claims.push(claim("agent-a", "issue-1", 600));
    f.backend = None;
    let orphans = f.plan();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].causes, vec![OrphanCause::StaleHeartbeat]);
}

#[test]
fn causes_merge_per_item() {
    let mut f = Fixture::new().with_record(record("agent-a", "issue-1", 900));
    f.claims.push(claim("agent-a", "issue-1", 600));
    f.in_progress.push("issue-1".into());
    let orphans = f.plan();
    assert_eq!(orphans.len(), 1);
    assert_eq!(
        orphans[0].causes,
        vec![OrphanCause::StaleClaim, OrphanCause::StaleHeartbeat]
    );
    assert!(orphans[0].labelled);
    assert!(orphans[0].marks_record);
}

#[test]
fn paused_and_errored_records_are_not_stale_heartbeats() {
    for status in [AgentStatus::Paused, AgentStatus::Errored] {
        let mut r = record("agent-a", "issue-1", 900);
        r.status = status;
        let mut f = Fixture::new().with_record(r);
        f.claims.push(claim("agent-a", "issue-1", 60));
        assert!(f.plan().is_empty(), "{status:?}");
    }
}

#[test]
fn labelled_item_without_claim_is_untracked() {
    let mut f = Fixture::new();
    f.in_progress = vec!["issue-7".into(), "issue-3".into()];
    f.claims.push(claim("agent-a", "issue-3", 10));
    let orphans = f.plan();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].item_id, "issue-7");
    assert_eq!(orphans[0].causes, vec![OrphanCause::UntrackedItem]);
    assert!(orphans[0].holder.is_none());
    assert!(orphans[0].claim_nonce.is_none());
    assert!(orphans[0].labelled);
}

#[test]
fn expired_claims_do_not_track_labelled_items() {
    let mut f = Fixture::new();
    f.in_progress = vec!["issue-7".into()];
    let mut lapsed = claim("agent-a", "issue-7", 7200);
    lapsed.expires_at = ago(10);
    f.claims.push(lapsed);
    let orphans = f.plan();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].causes, vec![OrphanCause::UntrackedItem]);
}

#[test]
fn orphans_are_sorted_by_item() {
    let mut f = Fixture::new();
    f.claims.push(claim("agent-z", "issue-9", 600));
    f.claims.push(claim("agent-y", "issue-2", 600));
    f.in_progress = vec!["issue-5".into()];
    let items: Vec<String> = f.plan().into_iter().map(|o| o.item_id).collect();
    assert_eq!(items, vec!["issue-2", "issue-5", "issue-9"]);
}

#[test]
fn healthy_pool_has_no_orphans() {
    let mut f = Fixture::new().with_record(record("agent-a", "issue-1", 10));
    f.claims.push(claim("agent-a", "issue-1", 4000));
    f.in_progress.push("issue-1".into());
    f.sessions.push(session("agent-a", "$1", Some("issue-1")));
    f.backend = Some(vec![alive("$1")]);
    assert!(f.plan().is_empty());
}
