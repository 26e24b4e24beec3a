// tests/property/engine_test.rs

//! Property-based tests for detection and the engines
//! Tests hysteresis, failover candidate choice and safety, and rejoin divergence checks

use crate::test_helpers::{TestContext, three_node_cluster};
use proptest::prelude::*;
use replgate::core::MonitorError;
use replgate::core::monitor::fake::FakeCluster;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 100,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_status_holds_until_failcount(failcount in 1u32..6) {
        runtime().block_on(async {
            let mut ctx = TestContext::with_cluster(three_node_cluster(), |config| {
                config.failcount = failcount
            });
            ctx.ticks(1).await;
            let before = ctx.status("b");
            ctx.cluster.set_reachable("b", false);

            for _ in 1..failcount {
                ctx.ticks(1).await;
                assert_eq!(ctx.status("b"), before);
            }
            ctx.ticks(1).await;
            assert!(ctx.status("b").is_down());
        });
    }

    #[test]
    fn test_failover_promotes_most_advanced_and_keeps_one_master(
        lag_b in 0u64..10,
        lag_c in 0u64..10,
    ) {
        runtime().block_on(async {
            let mut ctx = TestContext::three_nodes();
            ctx.ticks(1).await;
            ctx.cluster.kill("a");
            for (name, lag) in [("b", lag_b), ("c", lag_c)] {
                ctx.cluster.with(name, |s| {
                    s.received = 10 - lag;
                    s.applied = 10 - lag;
                    s.binlog = 10 - lag;
                });
            }
            assert!(ctx.ticks(1).await);

            let report = ctx.monitor.failover().await.unwrap();
            let expected = if lag_c < lag_b { "c" } else { "b" };
            assert_eq!(report.master.as_deref(), Some(expected));

            ctx.ticks(1).await;
            let masters = ctx
                .monitor
                .servers()
                .iter()
                .filter(|s| s.status.is_master())
                .count();
            assert_eq!(masters, 1);
            assert_eq!(ctx.monitor.master_name(), Some(expected));
        });
    }

    #[test]
    fn test_failover_without_gtid_changes_nothing(non_gtid_slave in prop::sample::select(vec!["b", "c"])) {
        runtime().block_on(async {
            let mut ctx = TestContext::three_nodes();
            ctx.cluster.with(non_gtid_slave, |s| s.links[0].using_gtid = false);
            ctx.ticks(1).await;
            ctx.cluster.kill("a");
            ctx.ticks(1).await;

            let err = ctx.monitor.failover().await.unwrap_err();
            assert!(matches!(err, MonitorError::Precondition(_)));
            for name in ["a", "b", "c"] {
                assert!(ctx.cluster.commands(name).is_empty());
            }
        });
    }

    #[test]
    fn test_rejoin_never_joins_a_server_ahead_of_the_master(own_writes in 0u64..20) {
        runtime().block_on(async {
            let cluster = FakeCluster::new();
            cluster.add_server("a", 1);
            cluster.add_server("b", 2);
            cluster.add_server("c", 3);
            cluster.replicate("b", "a");
            cluster.write("a", 10);
            cluster.write("c", own_writes);
            let mut ctx = TestContext::with_cluster(cluster, |config| config.auto_rejoin = true);

            let assessment = ctx.monitor.tick().await;
            ctx.monitor.run_automatic_actions(&assessment).await;

            let joined = !ctx.cluster.commands("c").is_empty();
            assert_eq!(joined, own_writes <= 10, "c wrote {own_writes} events");
        });
    }
}
