// src/core/monitor/detector.rs

//! The failure detector: turns one tick of probe results plus the derived topology into
//! staged status bits for every server.
//!
//! Rules applied in order:
//! - failed probes are held at the previous status until `failcount` is reached;
//! - reachable servers take the role the topology implies;
//! - a master that lost every slave is kept as a stale master;
//! - a slave whose link broke while the master is reachable is kept as a stale slave;
//! - a lone survivor of an otherwise failed cluster becomes a standalone master.

use super::server::{MonitoredServer, Role, ServerInfo, ServerStatus};
use super::topology::{NodeView, Topology};
use crate::config::ClusterConfig;
use std::time::Instant;
use tracing::warn;

/// What the probe phase learned about one server in this tick.
#[derive(Debug)]
pub enum ProbeOutcome {
    Reached(ServerInfo),
    AuthFailed,
    Failed(String),
    /// Not probed because the server is in maintenance.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Staged {
    Fresh,
    AuthError,
    Held,
    Down,
    Maintenance,
}

/// The outcome of assessing one tick.
#[derive(Debug, Default)]
pub struct Assessment {
    pub topology: Topology,
    /// The server the cluster treats as master: the confirmed one, or a down master kept
    /// until it is replaced.
    pub master: Option<usize>,
    /// The master is down and slaves stopped seeing it for `master_failure_timeout`.
    pub master_lost: bool,
    /// Servers put into maintenance by the standalone-master rule in this tick.
    pub quarantined: Vec<usize>,
}

/// Stages `pending` for every server and derives the master for this tick. Nothing is
/// committed here; the caller commits once the whole tick succeeded.
pub fn assess(
    servers: &mut [MonitoredServer],
    outcomes: Vec<ProbeOutcome>,
    previous_master: Option<usize>,
    config: &ClusterConfig,
    now: Instant,
) -> Assessment {
    let staged: Vec<Staged> = servers
        .iter_mut()
        .zip(outcomes)
        .map(|(server, outcome)| stage_probe(server, outcome, config.failcount))
        .collect();

    let (topology, roles) = {
        let views: Vec<NodeView<'_>> = servers
            .iter()
            .zip(&staged)
            .map(|(server, st)| NodeView {
                addr: &server.addr,
                info: match st {
                    Staged::AuthError | Staged::Down => None,
                    _ => server.info.as_ref(),
                },
                running: server.pending.is_running(),
            })
            .collect();
        let topology = Topology::build(&views, previous_master);
        let roles: Vec<Role> = (0..views.len())
            .map(|i| topology.role_of(i, &views))
            .collect();
        (topology, roles)
    };

    for (i, server) in servers.iter_mut().enumerate() {
        server.node = topology.nodes[i].clone();
        if staged[i] != Staged::Fresh {
            continue;
        }
        let mut role = roles[i];
        // A root with nothing replicating from it is not a confirmed master, unless it is
        // the whole cluster or part of a multi-master group.
        if role == Role::Master
            && topology.master == Some(i)
            && server.node.group == 0
            && server.node.reach == 0
            && staged.len() > 1
        {
            role = Role::None;
        }
        server.pending.set_role(role);
        if server.node.external_master {
            server.pending.insert(ServerStatus::SLAVE_OF_EXTERNAL_MASTER);
        }
    }

    // --- Stale master ---
    let master_confirmed = servers.iter().any(|s| s.pending.is_master());
    if config.detect_stale_master
        && !master_confirmed
        && let Some(p) = previous_master
        && staged.get(p) == Some(&Staged::Fresh)
    {
        let server = &mut servers[p];
        if !server.pending.is_master() && server.status.is_master() && !server.is_read_only() {
            if !server.status.contains(ServerStatus::STALE_STATUS) {
                warn!(
                    "Master '{}' has no running slaves left; keeping it as a stale master.",
                    server.name
                );
            }
            server.pending.set_role(Role::Master);
            server.pending.insert(ServerStatus::STALE_STATUS);
        }
    }

    // --- Stale slaves ---
    let reachable_master = previous_master
        .or(topology.master)
        .is_some_and(|m| servers[m].pending.is_running());
    if config.detect_stale_slave && reachable_master {
        for (i, server) in servers.iter_mut().enumerate() {
            if staged[i] != Staged::Fresh
                || server.pending.intersects(ServerStatus::MASTER | ServerStatus::SLAVE)
                || !server.status.is_slave()
                || !server.info.as_ref().is_some_and(|info| info.has_links())
            {
                continue;
            }
            server.pending.set_role(Role::Slave);
            server.pending.insert(ServerStatus::STALE_SLAVE);
        }
    }

    // --- Standalone master ---
    let mut quarantined = Vec::new();
    if config.detect_standalone_master {
        let running: Vec<usize> = (0..servers.len())
            .filter(|&i| servers[i].pending.is_running() && staged[i] != Staged::Maintenance)
            .collect();
        let others_failed = servers
            .iter()
            .enumerate()
            .filter(|(i, _)| !running.contains(i))
            .all(|(_, s)| s.err_count >= config.failcount);
        if let [lone] = running[..]
            && staged[lone] == Staged::Fresh
            && others_failed
        {
            let server = &mut servers[lone];
            if !server.status.is_master() && staged.len() > 1 {
                warn!(
                    "Server '{}' is the only running server; assigning it standalone master status.",
                    server.name
                );
            }
            server.pending.remove(
                ServerStatus::STALE_STATUS
                    | ServerStatus::STALE_SLAVE
                    | ServerStatus::SLAVE_OF_EXTERNAL_MASTER,
            );
            server.pending.set_role(Role::Master);
            if config.maintenance_on_standalone_master {
                for (i, other) in servers.iter_mut().enumerate() {
                    if i != lone && !other.pending.is_in_maintenance() {
                        other.pending.insert(ServerStatus::MAINTENANCE);
                        quarantined.push(i);
                    }
                }
            }
        }
    }

    let master = select_cluster_master(servers, &topology, previous_master);
    let master_lost = match master {
        Some(m) => track_master_liveness(servers, m, config, now),
        None => false,
    };

    Assessment {
        topology,
        master,
        master_lost,
        quarantined,
    }
}

fn stage_probe(server: &mut MonitoredServer, outcome: ProbeOutcome, failcount: u32) -> Staged {
    match outcome {
        ProbeOutcome::Skipped => {
            server.pending = server.status | ServerStatus::MAINTENANCE;
            Staged::Maintenance
        }
        ProbeOutcome::Reached(info) => {
            server.err_count = 0;
            server.last_error = None;
            server.info = Some(info);
            server.pending = ServerStatus::RUNNING;
            Staged::Fresh
        }
        ProbeOutcome::AuthFailed => {
            server.err_count = 0;
            server.last_error = Some("authentication failed".to_string());
            server.pending = ServerStatus::RUNNING | ServerStatus::AUTH_ERROR;
            Staged::AuthError
        }
        ProbeOutcome::Failed(message) => {
            server.err_count = server.err_count.saturating_add(1);
            server.last_error = Some(message);
            server.pending = server.status;
            if server.err_count >= failcount {
                server.pending.set_down();
                Staged::Down
            } else {
                Staged::Held
            }
        }
    }
}

fn select_cluster_master(
    servers: &[MonitoredServer],
    topology: &Topology,
    previous_master: Option<usize>,
) -> Option<usize> {
    if let Some(m) = topology.master
        && servers[m].pending.is_master()
    {
        return Some(m);
    }
    if let Some(p) = previous_master
        && servers[p].pending.is_master()
    {
        return Some(p);
    }
    // Stale and standalone masters are not necessarily topology roots.
    let assigned = servers.iter().position(|s| {
        s.pending.is_master() && s.node.group == 0 && !s.pending.is_in_maintenance()
    });
    // A down master stays the cluster master until something replaces it.
    assigned.or(previous_master.filter(|&p| servers[p].pending.is_down()))
}

/// Refreshes the "last seen alive" stamp of master `m` and reports whether it is lost.
fn track_master_liveness(
    servers: &mut [MonitoredServer],
    m: usize,
    config: &ClusterConfig,
    now: Instant,
) -> bool {
    let master_id = servers[m].server_id();
    let master_addr = servers[m].addr.clone();
    let slave_sees_master = servers.iter().enumerate().any(|(i, s)| {
        i != m
            && s.pending.is_running()
            && s.info.as_ref().is_some_and(|info| {
                info.links.iter().any(|l| {
                    l.is_live()
                        && ((master_id != 0 && l.master_server_id == master_id)
                            || l.points_at(&master_addr))
                })
            })
    });

    let master = &mut servers[m];
    if master.pending.is_running() || slave_sees_master {
        master.last_live_slave_link = Some(now);
        return false;
    }
    if master.pending.is_in_maintenance() || !master.pending.contains(ServerStatus::DOWN) {
        return false;
    }
    let since = *master.last_live_slave_link.get_or_insert(now);
    now.saturating_duration_since(since) >= config.master_failure_timeout
}
