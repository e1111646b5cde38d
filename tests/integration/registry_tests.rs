//! Integration tests for the session registry against an in-memory backend.
//!
//! Validates:
//! - logical ids are `terminal-N`, monotonic, and listed in numeric order
//! - the three `on_existing` policies, for tracked and untracked collisions
//! - destroy is idempotent and never fails on a backend kill error
//! - restart keeps the logical id and changes the backend handle
//! - a wedged backend call times out without blocking other sessions
//! - a create that fails after starting a session leaves nothing behind

use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_pool::audit::AuditEventType;
use agent_pool::models::session::{ExistingSession, SessionKind, SessionStatus};
use agent_pool::models::warning::WarningKind;

use super::test_helpers::{harness, harness_with};

#[tokio::test]
async fn create_assigns_sequential_ids_and_lists_in_order() {
    let h = harness();
    let wd = h.dir.path();
    for n in 1..=11 {
        let session = h
            .state
            .create_session(&format!("worker {n}"), "agent", wd, ExistingSession::Reject)
            .await
            .unwrap();
        assert_eq!(session.id, format!("terminal-{n}"));
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.backend_handle.is_some());
    }

    let ids: Vec<String> = h
        .state
        .registry
        .list_active()
        .await
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids.first().map(String::as_str), Some("terminal-1"));
    assert_eq!(ids[9], "terminal-10", "numeric, not lexical, order");
    assert_eq!(ids.len(), 11);

    let spec = &h.backend.launches()[0];
    assert_eq!(spec.name, "pool-worker-1");
    assert_eq!(spec.session_id, "terminal-1");
    assert!(spec.log_path.ends_with("sessions/terminal-1.log"));
    assert_eq!(
        h.audit.events().first(),
        Some(&AuditEventType::SessionCreate)
    );
}

#[tokio::test]
async fn unknown_role_opens_interactive_shell() {
    let h = harness();
    let session = h
        .state
        .create_session("alice", "no-such-role", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap();
    assert_eq!(session.kind, SessionKind::Interactive);
    assert_eq!(session.role, "no-such-role");
}

#[tokio::test]
async fn names_without_usable_characters_are_rejected() {
    let h = harness();
    let err = h
        .state
        .create_session("...", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "protocol_error");
    assert!(h.state.registry.list_active().await.is_empty());
}

#[tokio::test]
async fn existing_session_policies() {
    let h = harness();
    let wd = h.dir.path();
    let first = h
        .state
        .create_session("alice", "agent", wd, ExistingSession::Reject)
        .await
        .unwrap();

    let err = h
        .state
        .create_session("alice", "agent", wd, ExistingSession::Reject)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "duplicate_session");
    assert!(err.to_string().contains("terminal-1"), "{err}");

    let reused = h
        .state
        .create_session("Alice", "agent", wd, ExistingSession::Reuse)
        .await
        .unwrap();
    assert_eq!(reused.id, first.id, "display names normalize to one backend name");
    assert_eq!(reused.backend_handle, first.backend_handle);

    let replaced = h
        .state
        .create_session("alice", "agent", wd, ExistingSession::Replace)
        .await
        .unwrap();
    assert_eq!(replaced.id, "terminal-2");
    assert_ne!(replaced.backend_handle, first.backend_handle);
    assert!(!h.backend.has_handle(first.backend_handle.as_deref().unwrap()));
    assert!(h.state.registry.get("terminal-1").await.is_none());
    assert_eq!(h.backend.names(), vec!["pool-alice"]);
}

#[tokio::test]
async fn untracked_backend_collision_follows_policy() {
    let h = harness();
    let wd = h.dir.path();
    let planted = h.backend.plant("pool-ghost");

    let err = h
        .state
        .create_session("ghost", "agent", wd, ExistingSession::Reject)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "duplicate_session");
    assert!(h.state.registry.list_active().await.is_empty());

    let adopted = h
        .state
        .create_session("ghost", "agent", wd, ExistingSession::Reuse)
        .await
        .unwrap();
    assert_eq!(adopted.backend_handle.as_deref(), Some(planted.as_str()));

    let h = harness();
    let planted = h.backend.plant("pool-ghost");
    let fresh = h
        .state
        .create_session("ghost", "agent", wd, ExistingSession::Replace)
        .await
        .unwrap();
    assert_ne!(fresh.backend_handle.as_deref(), Some(planted.as_str()));
    assert!(!h.backend.has_handle(&planted));
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let h = harness();
    let session = h
        .state
        .create_session("alice", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap();

    let removed = h.state.destroy_session(&session.id).await.unwrap();
    assert_eq!(removed.map(|s| s.id), Some(session.id.clone()));
    assert!(h.backend.names().is_empty());

    assert!(h.state.destroy_session(&session.id).await.unwrap().is_none());
    assert!(h.state.destroy_session("terminal-99").await.unwrap().is_none());
    assert_eq!(h.state.counters.snapshot().sessions_destroyed, 1);
}

#[tokio::test]
async fn failed_kill_is_a_warning_and_entry_still_goes() {
    let h = harness();
    let session = h
        .state
        .create_session("alice", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap();
    h.backend.set_kill_fails(true);

    assert!(h.state.destroy_session(&session.id).await.unwrap().is_some());
    assert!(h.state.registry.get(&session.id).await.is_none());
    let warnings = h.state.warnings.snapshot();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].kind, WarningKind::BackendKillFailed);
    assert_eq!(warnings[0].context["session_id"], session.id);
}

#[tokio::test]
async fn logs_are_purged_unless_retained() {
    let h = harness_with(|c| c.backend.retain_logs = false);
    let session = h
        .state
        .create_session("alice", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap();
    std::fs::write(&session.log_path, "output\n").unwrap();
    h.state.destroy_session(&session.id).await.unwrap();
    assert!(!session.log_path.exists());

    let h = harness();
    let session = h
        .state
        .create_session("alice", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap();
    std::fs::write(&session.log_path, "output\n").unwrap();
    h.state.destroy_session(&session.id).await.unwrap();
    assert!(session.log_path.exists());
}

#[tokio::test]
async fn restart_keeps_id_and_changes_handle() {
    let h = harness();
    let before = h
        .state
        .create_session("alice", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap();

    let after = h.state.restart_session(&before.id).await.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.name, before.name);
    assert_eq!(after.working_dir, before.working_dir);
    assert_eq!(after.status, SessionStatus::Active);
    assert_ne!(after.backend_handle, before.backend_handle);
    assert!(!h.backend.has_handle(before.backend_handle.as_deref().unwrap()));
    assert!(h.audit.events().contains(&AuditEventType::SessionRestart));

    let err = h.state.restart_session("terminal-42").await.unwrap_err();
    assert_eq!(err.kind(), "session_not_found");
}

#[tokio::test]
async fn failed_restart_leaves_session_errored() {
    let h = harness();
    let session = h
        .state
        .create_session("alice", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap();
    h.backend.fail_creates_for("pool-alice");

    let err = h.state.restart_session(&session.id).await.unwrap_err();
    assert_eq!(err.kind(), "backend_unavailable");
    let stored = h.state.registry.get(&session.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Errored);

    let err = h
        .state
        .registry
        .send_input(&session.id, "ls", true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "session_not_found");
}

#[tokio::test]
async fn failed_create_leaves_no_entry() {
    let h = harness();
    h.backend.fail_creates_for("pool-alice");
    let err = h
        .state
        .create_session("alice", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(h.state.registry.list_active().await.is_empty());
    let warnings = h.state.warnings.snapshot();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].kind, WarningKind::StaleSession);
}

#[tokio::test]
async fn half_started_create_is_cleaned_up_before_retry() {
    let h = harness();
    h.backend.fail_after_start_for("pool-alice", 1);
    let session = h
        .state
        .create_session("alice", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(h.backend.launches().len(), 2, "retried once");
    assert_eq!(h.backend.names(), vec!["pool-alice"]);
}

#[tokio::test]
async fn half_started_create_leaks_nothing_when_retries_run_out() {
    let h = harness();
    h.backend.fail_after_start_for("pool-alice", 10);
    let err = h
        .state
        .create_session("alice", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "backend_unavailable");
    assert!(h.backend.names().is_empty(), "no tmux session left behind");
    assert!(h.state.registry.list_active().await.is_empty());

    let err = h
        .state
        .create_session("alice", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "backend_unavailable", "never a duplicate");
}

#[tokio::test]
async fn wedged_backend_times_out_without_blocking_others() {
    let h = harness_with(|c| c.backend.create_retries = 0);
    h.backend.hang_creates_for("pool-stuck");
    let wd = h.dir.path().to_path_buf();

    let state = Arc::clone(&h.state);
    let stuck_wd = wd.clone();
    let stuck = tokio::spawn(async move {
        state
            .create_session("stuck", "agent", &stuck_wd, ExistingSession::Reject)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let ok = h
        .state
        .create_session("healthy", "agent", &wd, ExistingSession::Reject)
        .await
        .unwrap();
    assert_eq!(ok.status, SessionStatus::Active);
    assert!(started.elapsed() < Duration::from_secs(1));

    let err = stuck.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), "backend_unavailable");
    assert!(err.to_string().contains("timed out"), "{err}");
}

#[tokio::test]
async fn input_and_output_go_through_the_backend() {
    let h = harness();
    let session = h
        .state
        .create_session("alice", "agent", h.dir.path(), ExistingSession::Reject)
        .await
        .unwrap();

    h.state
        .registry
        .send_input(&session.id, "cargo test", true)
        .await
        .unwrap();
    let inputs = h.backend.inputs();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].text, "cargo test");
    assert!(inputs[0].submit);

    let lines = h.state.registry.read_output(&session.id, 10).await.unwrap();
    assert_eq!(lines, vec!["cargo test"]);

    let err = h
        .state
        .registry
        .read_output("terminal-7", 10)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "session_not_found");
}

#[tokio::test]
async fn reconcile_marks_vanished_sessions_errored() {
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
    h.backend.vanish("pool-alice");

    let marked = h.state.registry.reconcile_with_backend().await.unwrap();
    assert_eq!(marked, vec!["terminal-1"]);
    assert_eq!(
        h.state.registry.get("terminal-1").await.unwrap().status,
        SessionStatus::Errored
    );
    assert_eq!(
        h.state.registry.get("terminal-2").await.unwrap().status,
        SessionStatus::Active
    );
    let warnings = h.state.warnings.snapshot();
    assert!(warnings[0].message.starts_with("stale state:"));

    assert!(h.state.registry.reconcile_with_backend().await.unwrap().is_empty());

    h.backend.set_list_fails(true);
    let err = h.state.registry.reconcile_with_backend().await.unwrap_err();
    assert_eq!(err.kind(), "backend_unavailable");
}
