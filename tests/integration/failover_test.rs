// tests/integration/failover_test.rs

//! Integration tests for the failover engine
//! Tests: candidate choice, exclusions, relay-log drain, refusal before mutation

use super::test_helpers::{TestContext, three_node_cluster};
use replgate::core::MonitorError;
use replgate::core::monitor::fake::FakeCluster;
use std::time::Duration;

fn no_commands(ctx: &TestContext) -> bool {
    ["a", "b", "c"]
        .iter()
        .all(|name| ctx.cluster.commands(name).is_empty())
}

/// Kills master `a` after making `b` lag behind `c`, then commits the failure.
async fn lose_master_with_b_behind(ctx: &mut TestContext) {
    ctx.ticks(1).await;
    ctx.cluster.kill("a");
    ctx.cluster.with("b", |s| {
        s.received = 8;
        s.applied = 8;
        s.binlog = 8;
    });
    assert!(ctx.ticks(1).await, "master should be reported lost");
}

#[tokio::test]
async fn test_failover_promotes_most_advanced_slave() {
    let mut ctx = TestContext::three_nodes();
    lose_master_with_b_behind(&mut ctx).await;

    let report = ctx.monitor.failover().await.unwrap();
    assert_eq!(report.master.as_deref(), Some("c"));
    assert_eq!(report.changed, vec!["b".to_string()]);
    assert!(report.failed.is_empty());
    assert!(report.confirmed);

    let c_commands = ctx.cluster.commands("c");
    assert_eq!(
        &c_commands[..3],
        ["stop_replication", "reset_replication", "set_read_only(false)"]
    );
    assert!(
        ctx.cluster
            .commands("b")
            .contains(&"change_master(c.db:3306)".to_string())
    );

    ctx.ticks(1).await;
    assert_eq!(ctx.monitor.master_name(), Some("c"));
    assert!(ctx.status("c").is_master());
    assert!(ctx.status("b").is_slave());
    assert!(ctx.status("a").is_down());
}

#[tokio::test]
async fn test_failover_refused_while_master_runs() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;

    let err = ctx.monitor.failover().await.unwrap_err();
    assert!(matches!(err, MonitorError::Precondition(_)), "got {err:?}");
    assert!(err.is_safe_to_retry());
    assert!(no_commands(&ctx));
}

#[tokio::test]
async fn test_failover_refuses_non_gtid_slave_without_mutation() {
    let mut ctx = TestContext::three_nodes();
    ctx.cluster.with("b", |s| s.links[0].using_gtid = false);
    ctx.ticks(1).await;
    ctx.cluster.kill("a");
    ctx.ticks(1).await;

    let err = ctx.monitor.failover().await.unwrap_err();
    assert!(matches!(err, MonitorError::Precondition(_)), "got {err:?}");
    assert!(err.to_string().contains("GTID"));
    assert!(no_commands(&ctx));
}

#[tokio::test]
async fn test_automatic_failover_is_disabled_by_non_gtid_slave() {
    let cluster = FakeCluster::new();
    cluster.add_server("a", 1);
    cluster.add_server("b", 2);
    cluster.add_server("c", 3);
    cluster.replicate("b", "a");
    cluster.replicate("c", "a");
    cluster.with("c", |s| s.links[0].using_gtid = false);
    let mut ctx = TestContext::with_cluster(cluster, |config| config.auto_failover = true);

    let assessment = ctx.monitor.tick().await;
    ctx.monitor.run_automatic_actions(&assessment).await;
    assert!(!ctx.monitor.auto_failover_enabled());
    let reason = ctx.monitor.snapshot().features.auto_failover_disabled_reason;
    assert!(reason.is_some_and(|r| r.contains("'c'")));

    ctx.cluster.kill("a");
    let assessment = ctx.monitor.tick().await;
    assert!(assessment.master_lost);
    ctx.monitor.run_automatic_actions(&assessment).await;
    assert_eq!(ctx.monitor.master_name(), Some("a"));
    assert!(no_commands(&ctx));
}

#[tokio::test]
async fn test_automatic_failover_runs_when_master_lost() {
    let mut ctx = TestContext::with_cluster(three_node_cluster(), |config| {
        config.auto_failover = true
    });
    ctx.ticks(1).await;
    ctx.cluster.kill("a");

    let assessment = ctx.monitor.tick().await;
    ctx.monitor.run_automatic_actions(&assessment).await;
    // Equal positions: the first configured slave wins.
    assert_eq!(ctx.monitor.master_name(), Some("b"));
    assert!(ctx.monitor.auto_failover_enabled());
}

#[tokio::test]
async fn test_excluded_server_is_passed_over() {
    let mut ctx = TestContext::with_cluster(three_node_cluster(), |config| {
        config.failover_exclusions = vec!["c".to_string()]
    });
    lose_master_with_b_behind(&mut ctx).await;

    let report = ctx.monitor.failover().await.unwrap();
    assert_eq!(report.master.as_deref(), Some("b"));
    assert!(ctx.cluster.commands("c").contains(&"change_master(b.db:3306)".to_string()));
}

#[tokio::test]
async fn test_excluded_server_is_promoted_when_nothing_else_is_eligible() {
    let mut ctx = TestContext::with_cluster(three_node_cluster(), |config| {
        config.failover_exclusions = vec!["c".to_string()]
    });
    ctx.cluster.with("b", |s| s.log_bin = false);
    lose_master_with_b_behind(&mut ctx).await;

    let report = ctx.monitor.failover().await.unwrap();
    assert_eq!(report.master.as_deref(), Some("c"));
}

#[tokio::test]
async fn test_drain_aborts_when_old_master_still_sends_events() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;
    // The monitor loses the master, but it keeps running and replicating.
    ctx.cluster.set_reachable("a", false);
    ctx.cluster.with("a", |s| s.trickle = 1);

    let assessment = ctx.monitor.tick().await;
    assert!(
        !assessment.master_lost,
        "slaves still see the master, so it is not lost"
    );
    assert!(ctx.status("a").is_down());

    let err = ctx.monitor.failover().await.unwrap_err();
    match err {
        MonitorError::Aborted { step, message, .. } => {
            assert_eq!(step, "drain");
            assert!(message.contains("may be alive"));
        }
        other => panic!("expected a drain abort, got {other:?}"),
    }
    assert!(ctx.cluster.commands("b").is_empty());
    assert!(ctx.cluster.commands("c").is_empty());
}

#[tokio::test]
async fn test_drain_waits_for_relay_backlog() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;
    ctx.cluster.kill("a");
    ctx.cluster.with("c", |s| {
        s.received = 20;
        s.apply_rate = Some(1);
    });
    ctx.ticks(1).await;

    let report = ctx.monitor.failover().await.unwrap();
    assert_eq!(report.master.as_deref(), Some("c"));
    let applied = ctx.cluster.with("c", |s| s.applied).unwrap();
    assert!(applied >= 20, "candidate promoted at {applied} of 20");
}

#[tokio::test]
async fn test_drain_times_out_within_budget() {
    let mut ctx = TestContext::with_cluster(three_node_cluster(), |config| {
        config.failover_timeout = Duration::from_millis(300)
    });
    ctx.ticks(1).await;
    ctx.cluster.kill("a");
    ctx.cluster.with("c", |s| {
        s.received = 20;
        s.apply_rate = Some(0);
    });
    ctx.ticks(1).await;

    let err = ctx.monitor.failover().await.unwrap_err();
    assert!(
        matches!(err, MonitorError::Timeout { step: "drain" }),
        "got {err:?}"
    );
    assert!(ctx.cluster.commands("c").is_empty());
    assert_eq!(ctx.monitor.master_name(), Some("a"));
}

#[tokio::test]
async fn test_failed_redirect_is_reported_not_fatal() {
    let mut ctx = TestContext::three_nodes();
    lose_master_with_b_behind(&mut ctx).await;
    ctx.cluster.fail_op("b", "change_master");

    let report = ctx.monitor.failover().await.unwrap();
    assert_eq!(report.master.as_deref(), Some("c"));
    assert_eq!(report.failed, vec!["b".to_string()]);
    assert!(!report.confirmed, "no redirected slave can confirm");
}
