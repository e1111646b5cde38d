//! Integration tests for claim handling through the daemon state: session
//! association, counters, audit, admission control, and restart.

use std::time::Duration;

use chrono::Utc;

use agent_pool::audit::AuditEventType;
use agent_pool::claims::{record_name, ClaimStatus, LockDir, LockStore};
use agent_pool::models::claim::Claim;
use agent_pool::models::progress::{AgentStatus, MilestoneKind};
use agent_pool::models::session::ExistingSession;
use agent_pool::persistence::state_store::Loaded;
use agent_pool::AppError;

use super::test_helpers::harness;

#[tokio::test]
async fn claim_associates_session_and_starts_progress() {
    let h = harness();
    let session = h
        .state
        .create_session("alice", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap();

    let claim = h.state.claim("issue-7", "alice", Some(120)).await.unwrap();
    assert_eq!(claim.ttl_seconds, 120);
    assert_eq!(
        h.state.registry.get(&session.id).await.unwrap().work_item.as_deref(),
        Some("issue-7")
    );
    let record = h.state.progress.get("alice").await.unwrap();
    assert_eq!(record.item_id.as_deref(), Some("issue-7"));
    assert_eq!(record.status, AgentStatus::Working);

    let grant = h
        .audit
        .entries()
        .into_iter()
        .find(|e| e.event_type == AuditEventType::ClaimGrant)
        .unwrap();
    assert_eq!(grant.session_id.as_deref(), Some(session.id.as_str()));
    assert_eq!(grant.holder.as_deref(), Some("alice"));

    assert!(h.state.release("issue-7", "alice").await.unwrap());
    assert!(h
        .state
        .registry
        .get(&session.id)
        .await
        .unwrap()
        .work_item
        .is_none());
    assert_eq!(h.state.check("issue-7").await.unwrap(), ClaimStatus::Unclaimed);
}

#[tokio::test]
async fn default_lease_comes_from_config() {
    let h = harness();
    let claim = h.state.claim("issue-1", "agent-a", None).await.unwrap();
    assert_eq!(claim.ttl_seconds, h.state.config.claims.default_ttl_seconds);
}

#[tokio::test]
async fn conflicts_name_the_holder_and_are_counted() {
    let h = harness();
    h.state.claim("issue-1", "agent-a", None).await.unwrap();

    match h.state.claim("issue-1", "agent-b", None).await {
        Err(AppError::AlreadyClaimed { holder, item_id, .. }) => {
            assert_eq!(holder, "agent-a");
            assert_eq!(item_id, "issue-1");
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    let counters = h.state.counters.snapshot();
    assert_eq!(counters.claims_granted, 1);
    assert_eq!(counters.claims_conflicted, 1);

    let err = h.state.release("issue-1", "agent-b").await.unwrap_err();
    assert_eq!(err.kind(), "not_holder");
    assert!(!h.state.release("issue-2", "agent-b").await.unwrap());
}

#[tokio::test]
async fn renew_extends_only_for_the_holder() {
    let h = harness();
    let first = h.state.claim("issue-1", "agent-a", Some(60)).await.unwrap();
    let renewed = h.state.renew("issue-1", "agent-a", Some(600)).await.unwrap();
    assert!(renewed.expires_at > first.expires_at);
    assert_eq!(renewed.created_at, first.created_at);

    assert!(h.state.renew("issue-1", "agent-b", None).await.is_err());
}

#[tokio::test]
async fn list_claims_reports_remaining_lease() {
    let h = harness();
    h.state.claim("issue-2", "agent-b", Some(300)).await.unwrap();
    h.state.claim("issue-1", "agent-a", Some(600)).await.unwrap();

    let views = h.state.list_claims().await.unwrap();
    assert_eq!(views.len(), 2);
    for view in &views {
        assert!(view.remaining_seconds <= view.claim.ttl_seconds);
        assert!(view.remaining_seconds + 5 >= view.claim.ttl_seconds);
    }
}

#[tokio::test]
async fn sweep_reaps_lapsed_claims_and_counts_them() {
    let h = harness();
    let claims_dir = h.state.config.claims_dir();
    let lapsed = Claim::new(
        "issue-9".into(),
        "gone".into(),
        Duration::from_secs(60),
        Utc::now() - chrono::Duration::hours(1),
    );
    let store = LockDir::open(&claims_dir).unwrap();
    assert!(store
        .try_create(&record_name("issue-9"), &serde_json::to_vec(&lapsed).unwrap())
        .unwrap());
    h.state.claim("issue-1", "agent-a", None).await.unwrap();

    assert_eq!(h.state.sweep_claims().await.unwrap(), 1);
    assert_eq!(h.state.counters.snapshot().claims_expired, 1);
    assert_eq!(h.state.sweep_claims().await.unwrap(), 0);
    assert_eq!(h.state.list_claims().await.unwrap().len(), 1);
}

#[tokio::test]
async fn draining_refuses_new_work_but_allows_release() {
    let h = harness();
    h.state.claim("issue-1", "agent-a", None).await.unwrap();
    h.state.stop_accepting();
    assert!(!h.state.is_accepting());

    let err = h.state.claim("issue-2", "agent-a", None).await.unwrap_err();
    assert!(matches!(err, AppError::ShuttingDown));
    let err = h
        .state
        .create_session("late", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "shutting_down");

    assert!(h.state.release("issue-1", "agent-a").await.unwrap());
    assert!(!h.state.status().await.unwrap().accepting);
}

#[tokio::test]
async fn heartbeats_cannot_lift_a_pause() {
    let h = harness();
    h.state.claim("issue-1", "agent-a", None).await.unwrap();
    assert!(h.state.progress.pause("agent-a").await);

    let record = h
        .state
        .heartbeat("agent-a", None, Some(AgentStatus::Working))
        .await;
    assert_eq!(record.status, AgentStatus::Paused);

    let resumed = h.state.resume("agent-a").await.unwrap();
    assert_eq!(resumed.status, AgentStatus::Working);
    assert_eq!(h.state.resume("stranger").await.unwrap_err().kind(), "protocol_error");
}

#[tokio::test]
async fn state_survives_a_restart() {
    let h = harness();
    let wd = h.dir.path();
    h.state
        .create_session("alice", "agent", wd, ExistingSession::Reject)
        .await
        .unwrap();
    h.state
        .create_session("bob", "agent", wd, ExistingSession::Reject)
        .await
        .unwrap();
    h.state.claim("issue-1", "alice", None).await.unwrap();
    h.state
        .milestone("alice", MilestoneKind::Note, "tests green".into())
        .await;
    h.state.persist().await.unwrap();

    let reopened = h.reopen();
    let saved = match reopened.store.load().unwrap() {
        Loaded::Restored(saved) => *saved,
        other => panic!("expected a saved document, got {other:?}"),
    };
    assert_eq!(saved.claims.len(), 1);
    reopened.restore(saved).await;

    let ids: Vec<String> = reopened
        .registry
        .list_active()
        .await
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec!["terminal-1", "terminal-2"]);
    let record = reopened.progress.get("alice").await.unwrap();
    assert_eq!(record.milestones.len(), 1);
    assert_eq!(reopened.counters.snapshot().claims_granted, 1);

    let next = reopened
        .create_session("carol", "agent", wd, ExistingSession::Reject)
        .await
        .unwrap();
    assert_eq!(next.id, "terminal-3");
    assert!(matches!(
        reopened.check("issue-1").await.unwrap(),
        ClaimStatus::Held(_)
    ));
}
