// tests/property/topology_test.rs

//! Property-based tests for the topology builder
//! Tests tree roles and depths under any server order, cycle handling and the SCC walk

use proptest::prelude::*;
use replgate::core::monitor::gtid::GtidList;
use replgate::core::monitor::server::{IoState, ReplicationLink, Role, ServerAddress, ServerInfo};
use replgate::core::monitor::topology::{NodeView, Topology, strongly_connected_components};

fn addr(label: usize) -> ServerAddress {
    ServerAddress::new(format!("db{label}"), 3306)
}

fn link_to(parent: usize) -> ReplicationLink {
    ReplicationLink {
        master_host: format!("db{parent}"),
        master_port: 3306,
        master_server_id: parent as i64 + 1,
        io_state: IoState::Yes,
        sql_running: true,
        using_gtid: true,
        gtid_io_pos: GtidList::default(),
        last_error: String::new(),
    }
}

fn info(label: usize, parents: &[usize], read_only: bool) -> ServerInfo {
    ServerInfo {
        server_id: label as i64 + 1,
        read_only,
        log_bin: true,
        links: parents.iter().map(|&p| link_to(p)).collect(),
        ..ServerInfo::default()
    }
}

fn build(addrs: &[ServerAddress], infos: &[ServerInfo]) -> (Topology, Vec<Role>) {
    let views: Vec<NodeView<'_>> = addrs
        .iter()
        .zip(infos)
        .map(|(addr, info)| NodeView {
            addr,
            info: Some(info),
            running: true,
        })
        .collect();
    let topology = Topology::build(&views, None);
    let roles = (0..views.len()).map(|i| topology.role_of(i, &views)).collect();
    (topology, roles)
}

/// A tree as `parents[k]` = parent label of label `k + 1`, plus a configuration order.
fn tree() -> impl Strategy<Value = (Vec<usize>, Vec<usize>)> {
    proptest::collection::vec(any::<prop::sample::Index>(), 0..12).prop_flat_map(|picks| {
        let parents: Vec<usize> = picks
            .iter()
            .enumerate()
            .map(|(k, pick)| pick.index(k + 1))
            .collect();
        let n = parents.len() + 1;
        (Just(parents), Just((0..n).collect::<Vec<usize>>()).prop_shuffle())
    })
}

/// Up to two parents per node, possibly itself, plus a read-only flag.
fn graph() -> impl Strategy<Value = Vec<(Vec<usize>, bool)>> {
    (2usize..9).prop_flat_map(|n| {
        proptest::collection::vec(
            (proptest::collection::vec(0..n, 0..3), any::<bool>()),
            n,
        )
    })
}

/// `reach[i][j]`: `j` is reachable from `i` following `adjacency`.
fn brute_force_reachability(adjacency: &[Vec<usize>]) -> Vec<Vec<bool>> {
    let n = adjacency.len();
    let mut reach = vec![vec![false; n]; n];
    for (i, edges) in adjacency.iter().enumerate() {
        reach[i][i] = true;
        for &j in edges {
            reach[i][j] = true;
        }
    }
    for k in 0..n {
        for i in 0..n {
            for j in 0..n {
                if reach[i][k] && reach[k][j] {
                    reach[i][j] = true;
                }
            }
        }
    }
    reach
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_tree_roles_and_depths_ignore_server_order((parents, order) in tree()) {
        let n = order.len();
        let mut depth = vec![0i32; n];
        for (k, &p) in parents.iter().enumerate() {
            depth[k + 1] = depth[p] + 1;
        }
        let parent_of = |label: usize| -> Vec<usize> {
            if label == 0 { vec![] } else { vec![parents[label - 1]] }
        };

        let addrs: Vec<ServerAddress> = order.iter().map(|&label| addr(label)).collect();
        let infos: Vec<ServerInfo> = order
            .iter()
            .map(|&label| info(label, &parent_of(label), label != 0))
            .collect();
        let (topology, roles) = build(&addrs, &infos);

        let mut position = vec![0; n];
        for (p, &label) in order.iter().enumerate() {
            position[label] = p;
        }
        prop_assert_eq!(topology.master, Some(position[0]));
        prop_assert_eq!(roles[position[0]], Role::Master);
        for label in 1..n {
            let p = position[label];
            prop_assert!(matches!(roles[p], Role::Slave | Role::RelayMaster));
            prop_assert_eq!(topology.nodes[p].depth, depth[label]);
            prop_assert_eq!(topology.nodes[p].group, 0);
        }
    }

    #[test]
    fn test_cycle_members_follow_read_only_flag(nodes in graph()) {
        let addrs: Vec<ServerAddress> = (0..nodes.len()).map(addr).collect();
        let infos: Vec<ServerInfo> = nodes
            .iter()
            .enumerate()
            .map(|(label, (parents, read_only))| info(label, parents, *read_only))
            .collect();
        let (topology, roles) = build(&addrs, &infos);

        let adjacency: Vec<Vec<usize>> = nodes
            .iter()
            .enumerate()
            .map(|(i, (parents, _))| parents.iter().copied().filter(|&p| p != i).collect())
            .collect();
        let reach = brute_force_reachability(&adjacency);

        for (i, (_, read_only)) in nodes.iter().enumerate() {
            let node = &topology.nodes[i];
            let in_cycle = (0..nodes.len()).any(|j| j != i && reach[i][j] && reach[j][i]);
            prop_assert_eq!(node.group > 0, in_cycle);
            if node.group > 0 {
                let expected = if *read_only { Role::Slave } else { Role::Master };
                prop_assert_eq!(roles[i], expected);
            }
        }
    }

    #[test]
    fn test_build_is_deterministic(nodes in graph()) {
        let addrs: Vec<ServerAddress> = (0..nodes.len()).map(addr).collect();
        let infos: Vec<ServerInfo> = nodes
            .iter()
            .enumerate()
            .map(|(label, (parents, read_only))| info(label, parents, *read_only))
            .collect();
        let (first, first_roles) = build(&addrs, &infos);
        let (second, second_roles) = build(&addrs, &infos);
        prop_assert_eq!(first.master, second.master);
        prop_assert_eq!(first.nodes, second.nodes);
        prop_assert_eq!(first.groups, second.groups);
        prop_assert_eq!(first_roles, second_roles);
    }

    #[test]
    fn test_scc_matches_mutual_reachability(
        adjacency in (1usize..12).prop_flat_map(|n| {
            proptest::collection::vec(proptest::collection::vec(0..n, 0..4), n)
        })
    ) {
        let n = adjacency.len();
        let components = strongly_connected_components(&adjacency);
        let reach = brute_force_reachability(&adjacency);

        let mut component_of = vec![usize::MAX; n];
        for (c, members) in components.iter().enumerate() {
            for &m in members {
                prop_assert_eq!(component_of[m], usize::MAX, "node {} listed twice", m);
                component_of[m] = c;
            }
        }
        prop_assert!(component_of.iter().all(|&c| c != usize::MAX));
        for i in 0..n {
            for j in 0..n {
                let mutual = reach[i][j] && reach[j][i];
                prop_assert_eq!(component_of[i] == component_of[j], mutual);
            }
        }
    }
}

#[test]
fn test_self_replication_is_not_a_cycle() {
    let addrs = vec![addr(0), addr(1)];
    let infos = vec![info(0, &[0], false), info(1, &[0], true)];
    let (topology, roles) = build(&addrs, &infos);
    assert!(topology.groups.is_empty());
    assert_eq!(topology.master, Some(0));
    assert_eq!(roles, vec![Role::Master, Role::Slave]);
    assert!(!topology.nodes[0].external_master);
}

#[test]
fn test_deep_chain_does_not_recurse() {
    let n = 3_000;
    let addrs: Vec<ServerAddress> = (0..n).map(addr).collect();
    let infos: Vec<ServerInfo> = (0..n)
        .map(|i| if i == 0 { info(0, &[], false) } else { info(i, &[i - 1], true) })
        .collect();
    let (topology, _) = build(&addrs, &infos);
    assert_eq!(topology.master, Some(0));
    assert_eq!(topology.nodes[n - 1].depth, n as i32 - 1);
}
