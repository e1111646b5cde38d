//! Unit tests for stuck classification and intervention planning.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use agent_pool::config::DetectorConfig;
use agent_pool::models::claim::Claim;
use agent_pool::models::intervention::{FiredIntervention, Intervention, StuckFlag};
use agent_pool::models::progress::{AgentStatus, Milestone, MilestoneKind, ProgressRecord};
use agent_pool::orchestrator::stuck_detector::{classify, plan};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap()
}

fn ago(seconds: i64) -> DateTime<Utc> {
    now() - chrono::Duration::seconds(seconds)
}

fn config() -> DetectorConfig {
    DetectorConfig {
        idle_threshold_seconds: 600,
        working_threshold_seconds: 1800,
        loop_window_seconds: 900,
        loop_threshold: 3,
        error_spike_window_seconds: 300,
        error_spike_threshold: 5,
        ..DetectorConfig::default()
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
    let mut r = ProgressRecord::begin(holder.into(), Some(item.into()), ago(120));
    r.last_heartbeat = ago(heartbeat_age);
    r
}

fn error(message: &str, age: i64) -> Milestone {
    Milestone {
        at: ago(age),
        kind: MilestoneKind::Error,
        message: message.into(),
    }
}

// ── classify ──────────────────────────────────────────────

#[test]
fn healthy_agent_is_not_flagged() {
    let r = record("a", "i", 10);
    assert_eq!(classify(&r, &claim("a", "i", 120), &config(), now()), None);
}

#[test]
fn silent_working_agent_has_no_progress() {
    let r = record("a", "i", 601);
    assert_eq!(
        classify(&r, &claim("a", "i", 700), &config(), now()),
        Some(StuckFlag::NoProgress)
    );
}

#[test]
fn silent_idle_agent_is_not_no_progress() {
    let mut r = record("a", "i", 601);
    r.status = AgentStatus::Idle;
    assert_eq!(classify(&r, &claim("a", "i", 700), &config(), now()), None);
}

#[test]
fn long_held_claim_is_extended_work_until_completed() {
    let mut r = record("a", "i", 10);
    let c = claim("a", "i", 1801);
    assert_eq!(classify(&r, &c, &config(), now()), Some(StuckFlag::ExtendedWork));

    r.milestones.push(Milestone {
        at: ago(5),
        kind: MilestoneKind::Completed,
        message: "done".into(),
    });
    assert_eq!(classify(&r, &c, &config(), now()), None);
}

#[test]
fn repeated_error_signature_is_looping() {
    let mut r = record("a", "i", 10);
    r.milestones = vec![
        error("build failed at line 10", 800),
        error("build failed at line 22", 400),
        error("build failed at line 31", 60),
    ];
    assert_eq!(
        classify(&r, &claim("a", "i", 900), &config(), now()),
        Some(StuckFlag::Looping)
    );
}

#[test]
fn repeats_outside_the_loop_window_do_not_count() {
    let mut r = record("a", "i", 10);
    r.milestones = vec![
        error("build failed at line 10", 1200),
        error("build failed at line 22", 400),
        error("build failed at line 31", 60),
    ];
    assert_eq!(classify(&r, &claim("a", "i", 1500), &config(), now()), None);
}

#[test]
fn burst_of_distinct_errors_is_a_spike() {
    let mut r = record("a", "i", 10);
    r.milestones = ["disk full", "permission denied", "network unreachable", "parse failure", "segfault"]
        .iter()
        .enumerate()
        .map(|(n, m)| error(m, 20 * i64::try_from(n).unwrap() + 10))
        .collect();
    assert_eq!(
        classify(&r, &claim("a", "i", 300), &config(), now()),
        Some(StuckFlag::ErrorSpike)
    );
}

#[test]
fn first_flag_in_precedence_order_wins() {
    let mut r = record("a", "i", 700);
    r.milestones = vec![
        error("same thing", 30),
        error("same thing", 20),
        error("same thing", 10),
    ];
    // Silent, long-held, and looping: no_progress is checked first.
    r.last_heartbeat = ago(700);
    assert_eq!(
        classify(&r, &claim("a", "i", 4000), &config(), now()),
        Some(StuckFlag::NoProgress)
    );
}

#[test]
fn paused_and_errored_records_are_never_flagged() {
    for status in [AgentStatus::Paused, AgentStatus::Errored] {
        let mut r = record("a", "i", 5000);
        r.status = status;
        assert_eq!(classify(&r, &claim("a", "i", 5000), &config(), now()), None);
    }
}

// ── plan ──────────────────────────────────────────────────

fn book(records: Vec<ProgressRecord>) -> BTreeMap<String, ProgressRecord> {
    records.into_iter().map(|r| (r.holder.clone(), r)).collect()
}

fn fired(holder: &str, flag: StuckFlag, intervention: Intervention) -> FiredIntervention {
    FiredIntervention {
        holder: holder.into(),
        item_id: Some("i".into()),
        flag,
        intervention,
        fired_at: ago(60),
    }
}

#[test]
fn plan_maps_severity_to_intervention() {
    let records = book(vec![record("a", "i", 601), record("b", "j", 10)]);
    let claims = vec![claim("a", "i", 700), claim("b", "j", 2000)];
    let p = plan(&records, &claims, &[], &config(), now());

    assert_eq!(p.fire.len(), 2);
    assert_eq!(p.fire[0].holder, "a");
    assert_eq!(p.fire[0].flag, StuckFlag::NoProgress);
    assert_eq!(p.fire[0].intervention, Intervention::Suggest);
    assert_eq!(p.fire[1].holder, "b");
    assert_eq!(p.fire[1].flag, StuckFlag::ExtendedWork);
    assert_eq!(p.fire[1].intervention, Intervention::Alert);
    assert!(p.keep.is_empty());
}

#[test]
fn records_without_a_live_claim_are_ignored() {
    let records = book(vec![record("a", "i", 5000)]);
    let other_item = vec![claim("a", "other", 5000)];
    assert!(plan(&records, &[], &[], &config(), now()).fire.is_empty());
    assert!(plan(&records, &other_item, &[], &config(), now()).fire.is_empty());
}

#[test]
fn persisting_condition_does_not_refire() {
    let records = book(vec![record("a", "i", 601)]);
    let claims = vec![claim("a", "i", 700)];
    let already = vec![fired("a", StuckFlag::NoProgress, Intervention::Suggest)];

    let p = plan(&records, &claims, &already, &config(), now());
    assert!(p.fire.is_empty());
    assert_eq!(p.keep, already);
}

#[test]
fn cleared_condition_is_forgotten_and_can_fire_again() {
    let healthy = book(vec![record("a", "i", 5)]);
    let claims = vec![claim("a", "i", 700)];
    let already = vec![fired("a", StuckFlag::NoProgress, Intervention::Suggest)];

    let p = plan(&healthy, &claims, &already, &config(), now());
    assert!(p.fire.is_empty());
    assert!(p.keep.is_empty(), "cleared flag is dropped");

    let silent_again = book(vec![record("a", "i", 601)]);
    let p = plan(&silent_again, &claims, &p.keep, &config(), now());
    assert_eq!(p.fire.len(), 1);
}

#[test]
fn changed_flag_fires_the_new_one() {
    let mut r = record("a", "i", 10);
    r.milestones = vec![error("oops 1", 30), error("oops 2", 20), error("oops 3", 10)];
    let records = book(vec![r]);
    let claims = vec![claim("a", "i", 300)];
    let already = vec![fired("a", StuckFlag::NoProgress, Intervention::Suggest)];

    let p = plan(&records, &claims, &already, &config(), now());
    assert!(p.keep.is_empty());
    assert_eq!(p.fire.len(), 1);
    assert_eq!(p.fire[0].flag, StuckFlag::Looping);
    assert_eq!(p.fire[0].intervention, Intervention::Pause);
}

#[test]
fn paused_holder_keeps_its_interventions() {
    let mut r = record("a", "i", 5000);
    r.status = AgentStatus::Paused;
    let records = book(vec![r]);
    let claims = vec![claim("a", "i", 5000)];
    let already = vec![fired("a", StuckFlag::Looping, Intervention::Pause)];

    let p = plan(&records, &claims, &already, &config(), now());
    assert!(p.fire.is_empty());
    assert_eq!(p.keep, already);
}
