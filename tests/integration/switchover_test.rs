// tests/integration/switchover_test.rs

//! Integration tests for the switchover engine
//! Tests: demote-first ordering, old master returned as slave, compensation on failure

use super::test_helpers::{TestContext, three_node_cluster};
use replgate::core::MonitorError;
use std::time::Duration;

#[tokio::test]
async fn test_switchover_moves_master_and_keeps_old_master_as_slave() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;

    let report = ctx.monitor.switchover(Some("b"), Some("a")).await.unwrap();
    assert_eq!(report.master.as_deref(), Some("b"));
    assert_eq!(report.changed, vec!["c".to_string(), "a".to_string()]);
    assert!(report.failed.is_empty());
    assert!(report.confirmed);

    assert_eq!(
        ctx.cluster.commands("a"),
        [
            "set_read_only(true)",
            "flush_logs",
            "stop_replication",
            "change_master(b.db:3306)",
            "start_replication",
        ]
    );

    ctx.ticks(1).await;
    assert_eq!(ctx.monitor.master_name(), Some("b"));
    assert!(ctx.status("b").is_master());
    assert!(ctx.status("a").is_slave());
    assert!(ctx.status("c").is_slave());
}

#[tokio::test]
async fn test_switchover_without_candidate_picks_a_slave() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;

    let report = ctx.monitor.switchover(None, None).await.unwrap();
    assert_eq!(report.master.as_deref(), Some("b"));
}

#[tokio::test]
async fn test_switchover_waits_for_writes_accepted_before_demotion() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;
    // Clients keep writing until the master turns read-only.
    ctx.cluster.with("a", |s| s.trickle = 2);

    ctx.monitor.switchover(Some("c"), None).await.unwrap();

    let (a_binlog, c_applied) = (
        ctx.cluster.with("a", |s| s.binlog).unwrap(),
        ctx.cluster.with("c", |s| s.applied).unwrap(),
    );
    assert!(
        c_applied >= a_binlog,
        "new master at {c_applied} lost writes of old master at {a_binlog}"
    );
}

#[tokio::test]
async fn test_catch_up_timeout_restores_writable_master() {
    let mut ctx = TestContext::with_cluster(three_node_cluster(), |config| {
        config.switchover_timeout = Duration::from_millis(300)
    });
    ctx.ticks(1).await;
    // `c` receives new events but never applies them.
    ctx.cluster.with("c", |s| s.apply_rate = Some(0));
    ctx.cluster.write("a", 5);

    let err = ctx.monitor.switchover(Some("b"), None).await.unwrap_err();
    match err {
        MonitorError::Compensated {
            step,
            server,
            undo_ok,
            ..
        } => {
            assert_eq!(step, "catch-up");
            assert_eq!(server, "a");
            assert!(undo_ok);
        }
        other => panic!("expected a compensated failure, got {other:?}"),
    }
    assert_eq!(
        ctx.cluster.commands("a"),
        ["set_read_only(true)", "flush_logs", "set_read_only(false)"]
    );
    assert_eq!(ctx.cluster.with("a", |s| s.read_only), Some(false));
    assert!(ctx.cluster.commands("b").is_empty(), "nothing was promoted");
    assert_eq!(ctx.monitor.master_name(), Some("a"));
}

#[tokio::test]
async fn test_promote_failure_undoes_demotion() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;
    ctx.cluster.fail_op("b", "reset_replication");

    let err = ctx.monitor.switchover(Some("b"), None).await.unwrap_err();
    assert!(
        matches!(
            err,
            MonitorError::Compensated {
                step: "promote",
                undo_ok: true,
                ..
            }
        ),
        "got {err:?}"
    );
    assert_eq!(ctx.cluster.with("a", |s| s.read_only), Some(false));
}

#[tokio::test]
async fn test_failed_demotion_changes_nothing() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;
    ctx.cluster.fail_op("a", "set_read_only");

    let err = ctx.monitor.switchover(Some("b"), None).await.unwrap_err();
    assert!(
        matches!(err, MonitorError::Aborted { step: "demote", .. }),
        "got {err:?}"
    );
    for name in ["a", "b", "c"] {
        assert!(ctx.cluster.commands(name).is_empty());
    }
    assert_eq!(ctx.cluster.with("a", |s| s.read_only), Some(false));
}

#[tokio::test]
async fn test_switchover_rejects_wrong_current_master() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;

    let err = ctx.monitor.switchover(Some("c"), Some("b")).await.unwrap_err();
    assert!(matches!(err, MonitorError::Precondition(_)), "got {err:?}");
    for name in ["a", "b", "c"] {
        assert!(ctx.cluster.commands(name).is_empty());
    }
}

#[tokio::test]
async fn test_switchover_rejects_unknown_and_invalid_candidates() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;

    let err = ctx.monitor.switchover(Some("zz"), None).await.unwrap_err();
    assert!(matches!(err, MonitorError::UnknownServer(_)), "got {err:?}");

    let err = ctx.monitor.switchover(Some("a"), None).await.unwrap_err();
    assert!(matches!(err, MonitorError::Precondition(_)), "got {err:?}");

    ctx.cluster.with("c", |s| s.log_bin = false);
    ctx.ticks(1).await;
    let err = ctx.monitor.switchover(Some("c"), None).await.unwrap_err();
    assert!(err.to_string().contains("binary logging"));
}

#[tokio::test]
async fn test_switchover_refused_when_master_down() {
    let mut ctx = TestContext::three_nodes();
    ctx.ticks(1).await;
    ctx.cluster.kill("a");
    ctx.ticks(1).await;

    let err = ctx.monitor.switchover(Some("b"), None).await.unwrap_err();
    assert!(matches!(err, MonitorError::Precondition(_)), "got {err:?}");
}
