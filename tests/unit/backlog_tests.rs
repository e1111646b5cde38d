//! Unit tests for backlog construction and GitHub item ids.

use agent_pool::backlog::github::{item_id, parse_item_id, GithubBacklog};
use agent_pool::backlog::{from_config, Backlog, NoBacklog};
use agent_pool::config::{BacklogConfig, BacklogProvider, GlobalConfig};

#[test]
fn item_ids_round_trip_through_accepted_forms() {
    assert_eq!(item_id(42), "issue-42");
    for form in ["issue-42", "#42", "42"] {
        assert_eq!(parse_item_id(form).unwrap(), 42, "{form}");
    }
}

#[test]
fn non_issue_ids_are_backlog_errors() {
    for form in ["issue-", "PROJ-42", "#", "issue-4x"] {
        let err = parse_item_id(form).unwrap_err();
        assert_eq!(err.kind(), "backlog", "{form}");
    }
}

#[test]
fn github_requires_repo_and_token() {
    let mut config = BacklogConfig {
        provider: BacklogProvider::Github,
        ..BacklogConfig::default()
    };
    let err = GithubBacklog::new(&config).unwrap_err();
    assert!(err.to_string().contains("backlog.repo"), "{err}");

    config.repo = Some("acme/widgets".into());
    let err = GithubBacklog::new(&config).unwrap_err();
    assert!(err.to_string().contains("token"), "{err}");

    config.token = "ghp_test".into();
    assert!(GithubBacklog::new(&config).is_ok());
}

#[tokio::test]
async fn no_backlog_accepts_everything_and_reports_nothing() {
    let backlog = NoBacklog;
    assert!(backlog.in_progress().await.unwrap().is_empty());
    backlog.transition("issue-1", "in-progress", "ready").await.unwrap();
    backlog.comment("issue-1", "hello").await.unwrap();
}

#[tokio::test]
async fn default_config_selects_no_backlog() {
    let backlog = from_config(&GlobalConfig::default()).unwrap();
    assert!(backlog.in_progress().await.unwrap().is_empty());
}
