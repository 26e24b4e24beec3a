// tests/integration/journal_test.rs

//! Integration tests for the topology journal
//! Tests: restart during an outage, expiry, corruption, atomic rewrite

use super::test_helpers::{TestContext, new_monitor, three_node_cluster};
use replgate::core::monitor::MonitorCommand;
use replgate::core::monitor::journal::{self, JournalSnapshot};
use replgate::core::monitor::server::ServerStatus;
use std::fs;
use std::time::Duration;

#[tokio::test]
async fn test_monitor_pass_writes_journal() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;

    let snapshot = ctx.journal().await.unwrap();
    assert_eq!(snapshot.master.as_deref(), Some("a"));
    assert_eq!(
        snapshot.status_of("a"),
        Some(ServerStatus::RUNNING | ServerStatus::MASTER)
    );
    assert_eq!(snapshot.servers.len(), 3);
}

#[tokio::test]
async fn test_restart_during_outage_remembers_master() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;
    ctx.cluster.kill("a");

    // A fresh monitor started while the master is down.
    let mut restarted = new_monitor(&ctx.cluster, ctx.monitor.config().clone());
    assert!(restarted.load_journal().await);
    assert_eq!(restarted.master_name(), Some("a"));

    let assessment = restarted.tick().await;
    assert!(assessment.master_lost);
    assert_eq!(restarted.master_name(), Some("a"));
}

#[tokio::test]
async fn test_restart_without_journal_has_no_master() {
    let ctx = TestContext::three_nodes();
    ctx.cluster.kill("a");

    let mut monitor = new_monitor(&ctx.cluster, ctx.monitor.config().clone());
    assert!(!monitor.load_journal().await);
    let assessment = monitor.tick().await;
    assert!(!assessment.master_lost);
    assert_eq!(monitor.master_name(), None);
}

#[tokio::test]
async fn test_expired_journal_is_ignored() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;

    let mut config = ctx.monitor.config().clone();
    config.journal_max_age = Duration::from_millis(1);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut restarted = new_monitor(&ctx.cluster, config);
    assert!(!restarted.load_journal().await);
    assert_eq!(restarted.master_name(), None);
}

#[tokio::test]
async fn test_corrupt_journal_is_ignored() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;

    let path = journal::journal_path(ctx.journal_dir.path(), "main");
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&path, &bytes).unwrap();

    let mut restarted = new_monitor(&ctx.cluster, ctx.monitor.config().clone());
    assert!(!restarted.load_journal().await);
    assert!(restarted.status_of("a").unwrap().is_empty());
}

#[tokio::test]
async fn test_write_replaces_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let path = journal::journal_path(dir.path(), "main");

    let first = JournalSnapshot {
        servers: vec![("a".to_string(), ServerStatus::RUNNING | ServerStatus::MASTER)],
        master: Some("a".to_string()),
    };
    let second = JournalSnapshot {
        servers: vec![
            ("a".to_string(), ServerStatus::DOWN),
            ("b".to_string(), ServerStatus::RUNNING | ServerStatus::MASTER),
        ],
        master: Some("b".to_string()),
    };
    journal::write(&path, &first).await.unwrap();
    journal::write(&path, &second).await.unwrap();

    assert_eq!(journal::load(&path, Duration::from_secs(60)).await, Some(second));
    // No temporary files are left behind.
    let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn test_journal_rejects_unjournalable_names() {
    let snapshot = JournalSnapshot {
        servers: vec![("bad\0name".to_string(), ServerStatus::RUNNING)],
        master: None,
    };
    assert!(journal::encode(&snapshot).is_err());
}

#[tokio::test]
async fn test_tick_recovers_journal_directory() {
    let mut ctx = three_node_ctx_with_nested_dir();
    ctx.ticks(1).await;
    let path = journal::journal_path(&ctx.monitor.config().journal_dir, "main");
    assert!(path.exists());
}

fn three_node_ctx_with_nested_dir() -> TestContext {
    let mut ctx = TestContext::three_nodes();
    let mut config = ctx.monitor.config().clone();
    config.journal_dir = ctx.journal_dir.path().join("nested").join("dir");
    ctx.monitor = new_monitor(&ctx.cluster, config);
    ctx
}

#[tokio::test]
async fn test_journal_names_master_right_after_automatic_failover() {
    let mut ctx = TestContext::with_cluster(three_node_cluster(), |config| {
        config.auto_failover = true
    });
    ctx.ticks(1).await;
    ctx.cluster.kill("a");

    let assessment = ctx.monitor.tick().await;
    assert!(assessment.master_lost);
    ctx.monitor.run_automatic_actions(&assessment).await;
    assert_eq!(ctx.monitor.master_name(), Some("b"));

    let snapshot = ctx.journal().await.unwrap();
    assert_eq!(snapshot.master.as_deref(), Some("b"));
    assert!(snapshot.status_of("b").unwrap().is_master());
}

#[tokio::test]
async fn test_journal_names_master_right_after_switchover() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;

    let report = ctx
        .monitor
        .execute(MonitorCommand::Switchover {
            candidate: Some("b".to_string()),
            current: None,
        })
        .await
        .unwrap();
    assert_eq!(report.master.as_deref(), Some("b"));

    let snapshot = ctx.journal().await.unwrap();
    assert_eq!(snapshot.master.as_deref(), Some("b"));
}

#[tokio::test]
async fn test_refused_command_leaves_journal_alone() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;
    let before = fs::metadata(journal::journal_path(ctx.journal_dir.path(), "main"))
        .unwrap()
        .modified()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = ctx.monitor.execute(MonitorCommand::Failover).await.unwrap_err();
    assert!(err.is_safe_to_retry(), "got {err:?}");
    let after = fs::metadata(journal::journal_path(ctx.journal_dir.path(), "main"))
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(before, after);
}
