// tests/integration/rejoin_test.rs

//! Integration tests for the rejoin engine
//! Tests: standalone servers, divergence refusal, repair after a partial failover, relays

use super::test_helpers::{TestContext, three_node_cluster};
use replgate::core::MonitorError;
use replgate::core::monitor::fake::FakeCluster;

/// Master `a` with slave `b`; `c` is a standalone server that never replicated.
fn cluster_with_standalone_c() -> FakeCluster {
    let cluster = FakeCluster::new();
    cluster.add_server("a", 1);
    cluster.add_server("b", 2);
    cluster.add_server("c", 3);
    cluster.replicate("b", "a");
    cluster.write("a", 10);
    cluster
}

async fn tick_and_act(ctx: &mut TestContext) {
    let assessment = ctx.monitor.tick().await;
    ctx.monitor.run_automatic_actions(&assessment).await;
}

#[tokio::test]
async fn test_standalone_server_is_joined_read_only() {
    let mut ctx = TestContext::with_cluster(cluster_with_standalone_c(), |config| {
        config.auto_rejoin = true
    });
    tick_and_act(&mut ctx).await;

    assert_eq!(
        ctx.cluster.commands("c"),
        [
            "set_read_only(true)",
            "stop_replication",
            "change_master(a.db:3306)",
            "start_replication",
        ]
    );
    assert!(ctx.cluster.commands("a").is_empty());
    assert!(ctx.cluster.commands("b").is_empty());

    ctx.ticks(1).await;
    assert!(ctx.status("c").is_slave());
    assert_eq!(ctx.cluster.with("c", |s| s.applied), Some(10));
}

#[tokio::test]
async fn test_standalone_server_is_left_alone_without_auto_rejoin() {
    let mut ctx = TestContext::with_cluster(cluster_with_standalone_c(), |_| {});
    tick_and_act(&mut ctx).await;
    assert!(ctx.cluster.commands("c").is_empty());
}

#[tokio::test]
async fn test_diverged_server_is_never_joined() {
    let cluster = cluster_with_standalone_c();
    // `c` took writes of its own, more than the master has.
    cluster.write("c", 20);
    let mut ctx = TestContext::with_cluster(cluster, |config| config.auto_rejoin = true);

    tick_and_act(&mut ctx).await;
    assert!(ctx.cluster.commands("c").is_empty());

    let err = ctx.monitor.rejoin("c").await.unwrap_err();
    assert!(matches!(err, MonitorError::Precondition(_)), "got {err:?}");
    assert!(err.to_string().contains("diverged"));
    assert!(ctx.cluster.commands("c").is_empty());
}

#[tokio::test]
async fn test_manual_rejoin_repairs_failed_redirect() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;
    ctx.cluster.kill("a");
    ctx.cluster.with("b", |s| {
        s.received = 8;
        s.applied = 8;
        s.binlog = 8;
    });
    ctx.ticks(1).await;
    ctx.cluster.fail_op("b", "change_master");
    let report = ctx.monitor.failover().await.unwrap();
    assert_eq!(report.failed, vec!["b".to_string()]);

    // The new master keeps its role even though nothing replicates from it yet.
    ctx.ticks(1).await;
    assert_eq!(ctx.monitor.master_name(), Some("c"));
    assert!(ctx.status("c").is_master());

    ctx.cluster.clear_failures("b");
    let report = ctx.monitor.rejoin("b").await.unwrap();
    assert_eq!(report.master.as_deref(), Some("c"));
    assert_eq!(report.changed, vec!["b".to_string()]);
    assert!(
        ctx.cluster
            .commands("b")
            .ends_with(&["change_master(c.db:3306)".to_string(), "start_replication".to_string()])
    );

    ctx.ticks(1).await;
    assert!(ctx.status("b").is_slave());
    assert!(!ctx.status("c").contains(replgate::core::monitor::server::ServerStatus::STALE_STATUS));
}

#[tokio::test]
async fn test_revived_old_master_rejoins_automatically() {
    let mut ctx = TestContext::with_cluster(three_node_cluster(), |config| {
        config.auto_failover = true;
        config.auto_rejoin = true;
    });
    tick_and_act(&mut ctx).await;
    ctx.cluster.kill("a");
    tick_and_act(&mut ctx).await;
    assert_eq!(ctx.monitor.master_name(), Some("b"));

    ctx.cluster.revive("a");
    tick_and_act(&mut ctx).await;
    assert_eq!(
        ctx.cluster.commands("a"),
        [
            "set_read_only(true)",
            "stop_replication",
            "change_master(b.db:3306)",
            "start_replication",
        ]
    );

    ctx.ticks(1).await;
    assert!(ctx.status("a").is_slave());
    assert_eq!(ctx.monitor.master_name(), Some("b"));
}

#[tokio::test]
async fn test_relay_chain_is_not_rejoined() {
    let cluster = FakeCluster::new();
    cluster.add_server("a", 1);
    cluster.add_server("b", 2);
    cluster.add_server("c", 3);
    cluster.replicate("b", "a");
    cluster.replicate("c", "b");
    cluster.write("a", 10);
    let mut ctx = TestContext::with_cluster(cluster, |config| config.auto_rejoin = true);

    tick_and_act(&mut ctx).await;
    for name in ["a", "b", "c"] {
        assert!(ctx.cluster.commands(name).is_empty(), "{name} was changed");
    }
    assert!(ctx.status("b").is_slave());
    assert!(ctx.status("c").is_slave());
}

#[tokio::test]
async fn test_manual_rejoin_preconditions() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;

    let err = ctx.monitor.rejoin("nope").await.unwrap_err();
    assert!(matches!(err, MonitorError::UnknownServer(_)), "got {err:?}");

    let err = ctx.monitor.rejoin("a").await.unwrap_err();
    assert!(matches!(err, MonitorError::Precondition(_)), "got {err:?}");

    // Already replicating from the master.
    let err = ctx.monitor.rejoin("b").await.unwrap_err();
    assert!(matches!(err, MonitorError::Precondition(_)), "got {err:?}");

    for name in ["a", "b", "c"] {
        assert!(ctx.cluster.commands(name).is_empty());
    }
}
