//! Unit tests for the claim coordinator over a real lock directory.
//!
//! Separate `ClaimCoordinator` instances over one directory stand in for
//! separate processes: they share nothing but the files.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::Utc;

use agent_pool::claims::{record_name, ClaimCoordinator, ClaimStatus, LockDir, LockStore};
use agent_pool::models::claim::Claim;
use agent_pool::AppError;

const HOUR: Duration = Duration::from_secs(3600);

fn coordinator() -> (tempfile::TempDir, ClaimCoordinator) {
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = ClaimCoordinator::open(dir.path()).expect("open");
    (dir, coordinator)
}

/// Write a claim for `item` that lapsed an hour ago.
fn plant_expired(dir: &std::path::Path, item: &str, holder: &str) -> Claim {
    let started = Utc::now() - chrono::Duration::hours(2);
    let claim = Claim::new(item.into(), holder.into(), Duration::from_secs(60), started);
    let store = LockDir::open(dir).unwrap();
    assert!(store
        .try_create(&record_name(item), &serde_json::to_vec(&claim).unwrap())
        .unwrap());
    claim
}

#[test]
fn grant_then_check_and_list() {
    let (_dir, claims) = coordinator();
    let claim = claims.claim("issue-1", "agent-a", HOUR).unwrap();
    assert_eq!(claim.holder, "agent-a");
    assert_eq!(claim.ttl_seconds, 3600);
    assert!(claim.expires_at > claim.created_at);

    match claims.check("issue-1").unwrap() {
        ClaimStatus::Held(held) => assert_eq!(held, claim),
        ClaimStatus::Unclaimed => panic!("claim should be held"),
    }
    assert_eq!(claims.list().unwrap(), vec![claim]);
    assert_eq!(claims.check("issue-2").unwrap(), ClaimStatus::Unclaimed);
}

#[test]
fn contested_claim_names_current_holder() {
    let (dir, first) = coordinator();
    first.claim("issue-1", "agent-a", HOUR).unwrap();

    let second = ClaimCoordinator::open(dir.path()).unwrap();
    match second.claim("issue-1", "agent-b", HOUR) {
        Err(AppError::AlreadyClaimed { item_id, holder, .. }) => {
            assert_eq!(item_id, "issue-1");
            assert_eq!(holder, "agent-a");
        }
        other => panic!("expected AlreadyClaimed, got {other:?}"),
    }
}

#[test]
fn release_requires_the_holder() {
    let (_dir, claims) = coordinator();
    claims.claim("issue-1", "agent-a", HOUR).unwrap();

    match claims.release("issue-1", "agent-b") {
        Err(AppError::NotHolder { holder, .. }) => assert_eq!(holder, "agent-a"),
        other => panic!("expected NotHolder, got {other:?}"),
    }
    assert!(matches!(claims.check("issue-1").unwrap(), ClaimStatus::Held(_)));

    assert!(claims.release("issue-1", "agent-a").unwrap());
    assert!(!claims.release("issue-1", "agent-a").unwrap(), "second release is a no-op");
    assert_eq!(claims.check("issue-1").unwrap(), ClaimStatus::Unclaimed);
}

#[test]
fn released_item_can_be_claimed_by_someone_else() {
    let (_dir, claims) = coordinator();
    claims.claim("issue-1", "agent-a", HOUR).unwrap();
    claims.release("issue-1", "agent-a").unwrap();
    let claim = claims.claim("issue-1", "agent-b", HOUR).unwrap();
    assert_eq!(claim.holder, "agent-b");
}

#[test]
fn expired_claim_reads_as_unclaimed_and_is_reaped_on_grant() {
    let (dir, claims) = coordinator();
    let stale = plant_expired(dir.path(), "issue-9", "agent-dead");

    assert_eq!(claims.check("issue-9").unwrap(), ClaimStatus::Unclaimed);
    assert!(claims.list().unwrap().is_empty());

    let fresh = claims.claim("issue-9", "agent-b", HOUR).unwrap();
    assert_eq!(fresh.holder, "agent-b");
    assert_ne!(fresh.nonce, stale.nonce);
}

#[test]
fn releasing_a_lapsed_claim_reports_nothing_released() {
    let (dir, claims) = coordinator();
    plant_expired(dir.path(), "issue-9", "agent-dead");
    assert!(!claims.release("issue-9", "agent-other").unwrap());
    let store = LockDir::open(dir.path()).unwrap();
    assert!(store.read(&record_name("issue-9")).unwrap().is_none());
}

#[test]
fn sweep_removes_only_lapsed_records() {
    let (dir, claims) = coordinator();
    plant_expired(dir.path(), "issue-old", "agent-dead");
    claims.claim("issue-live", "agent-a", HOUR).unwrap();

    let reaped = claims.sweep().unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].item_id, "issue-old");

    let remaining: Vec<String> = claims.list().unwrap().into_iter().map(|c| c.item_id).collect();
    assert_eq!(remaining, vec!["issue-live".to_owned()]);
    assert!(claims.sweep().unwrap().is_empty(), "sweep is idempotent");
}

#[test]
fn unreadable_record_counts_as_expired() {
    let (dir, claims) = coordinator();
    let store = LockDir::open(dir.path()).unwrap();
    store.try_create(&record_name("issue-3"), b"{ torn").unwrap();

    assert_eq!(claims.check("issue-3").unwrap(), ClaimStatus::Unclaimed);
    let claim = claims.claim("issue-3", "agent-a", HOUR).unwrap();
    assert_eq!(claim.holder, "agent-a");
}

#[test]
fn renew_extends_lease_and_keeps_grant_time() {
    let (_dir, claims) = coordinator();
    let original = claims
        .claim("issue-1", "agent-a", Duration::from_secs(60))
        .unwrap();
    let renewed = claims.renew("issue-1", "agent-a", HOUR).unwrap();

    assert_eq!(renewed.created_at, original.created_at);
    assert!(renewed.expires_at > original.expires_at);
    assert_eq!(renewed.ttl_seconds, 3600);
    assert_eq!(
        claims.check("issue-1").unwrap(),
        ClaimStatus::Held(renewed)
    );
}

#[test]
fn renew_rejects_other_holders_and_missing_claims() {
    let (_dir, claims) = coordinator();
    claims.claim("issue-1", "agent-a", HOUR).unwrap();

    assert!(matches!(
        claims.renew("issue-1", "agent-b", HOUR),
        Err(AppError::NotHolder { .. })
    ));
    assert!(matches!(
        claims.renew("issue-2", "agent-a", HOUR),
        Err(AppError::StaleState(_))
    ));
}

#[test]
fn release_if_only_touches_the_observed_grant() {
    let (_dir, claims) = coordinator();
    let first = claims.claim("issue-1", "agent-a", HOUR).unwrap();
    claims.release("issue-1", "agent-a").unwrap();
    let second = claims.claim("issue-1", "agent-b", HOUR).unwrap();

    assert!(claims.release_if("issue-1", &first.nonce).unwrap().is_none());
    assert!(matches!(claims.check("issue-1").unwrap(), ClaimStatus::Held(_)));

    let removed = claims.release_if("issue-1", &second.nonce).unwrap();
    assert_eq!(removed.map(|c| c.holder), Some("agent-b".to_owned()));
    assert_eq!(claims.check("issue-1").unwrap(), ClaimStatus::Unclaimed);
}

#[test]
fn stale_removal_guard_is_broken() {
    let (dir, claims) = coordinator();
    claims.claim("issue-1", "agent-a", HOUR).unwrap();

    let guard = format!(
        "{}.guard",
        record_name("issue-1").trim_end_matches(".claim")
    );
    let store = LockDir::open(dir.path()).unwrap();
    store
        .try_create(&guard, br#"{"pid":1,"at":"2020-01-01T00:00:00Z"}"#)
        .unwrap();

    assert!(claims.release("issue-1", "agent-a").unwrap());
    assert!(store.read(&guard).unwrap().is_none(), "guard dropped after use");
}

#[test]
fn live_removal_guard_is_waited_on_not_broken() {
    let (dir, claims) = coordinator();
    claims.claim("issue-1", "agent-a", HOUR).unwrap();

    let guard = format!(
        "{}.guard",
        record_name("issue-1").trim_end_matches(".claim")
    );
    let store = LockDir::open(dir.path()).unwrap();
    let held = serde_json::to_vec(&serde_json::json!({ "pid": 1, "at": Utc::now() })).unwrap();
    assert!(store.try_create(&guard, &held).unwrap());

    let releaser = {
        let path = dir.path().to_path_buf();
        thread::spawn(move || {
            ClaimCoordinator::open(&path)
                .unwrap()
                .release("issue-1", "agent-a")
        })
    };
    thread::sleep(Duration::from_millis(200));
    assert_eq!(
        store.read(&guard).unwrap().as_deref(),
        Some(held.as_slice()),
        "a live guard stays in place"
    );
    assert!(matches!(claims.check("issue-1").unwrap(), ClaimStatus::Held(_)));

    assert!(store.remove(&guard).unwrap());
    assert!(releaser.join().unwrap().unwrap());
    assert_eq!(claims.check("issue-1").unwrap(), ClaimStatus::Unclaimed);
}

#[test]
fn conditional_remove_only_deletes_matching_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let store = LockDir::open(dir.path()).unwrap();
    assert!(!store.remove_if("a.guard", b"old").unwrap(), "missing");

    assert!(store.try_create("a.guard", b"new").unwrap());
    assert!(!store.remove_if("a.guard", b"old").unwrap());
    assert_eq!(store.read("a.guard").unwrap().as_deref(), Some(&b"new"[..]));

    assert!(store.remove_if("a.guard", b"new").unwrap());
    assert!(store.read("a.guard").unwrap().is_none());
    assert_eq!(
        std::fs::read_dir(dir.path()).unwrap().count(),
        0,
        "no tombstones left behind"
    );
}

#[test]
fn rejects_empty_identifiers_and_zero_ttl() {
    let (_dir, claims) = coordinator();
    for result in [
        claims.claim("", "agent-a", HOUR),
        claims.claim("issue-1", "  ", HOUR),
        claims.claim("issue-1", "agent-a", Duration::ZERO),
    ] {
        assert!(matches!(result, Err(AppError::Protocol(_))), "{result:?}");
    }
}

#[test]
fn record_names_never_collide_on_punctuation() {
    let a = record_name("team/issue-1");
    let b = record_name("team_issue-1");
    assert_ne!(a, b);
    assert!(a.ends_with(".claim"));
    assert!(!a.contains('/'));
    assert_eq!(a, record_name("team/issue-1"), "names are deterministic");
}

#[test]
fn racing_claimants_get_exactly_one_grant() {
    let dir = tempfile::tempdir().unwrap();
    let contenders = 12;
    let barrier = Arc::new(Barrier::new(contenders));

    let handles: Vec<_> = (0..contenders)
        .map(|n| {
            let path = dir.path().to_path_buf();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let claims = ClaimCoordinator::open(&path).unwrap();
                barrier.wait();
                claims.claim("issue-hot", &format!("agent-{n}"), HOUR)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<&Claim> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "exactly one grant: {results:?}");

    let winner = &winners[0].holder;
    for result in &results {
        match result {
            Ok(_) => {}
            Err(AppError::AlreadyClaimed { holder, .. }) => assert_eq!(holder, winner),
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
}
