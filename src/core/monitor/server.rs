// src/core/monitor/server.rs

//! Defines the per-server data structures: the status flag set, the replication metadata
//! refreshed by every probe, and the `MonitoredServer` record owned by a cluster monitor.

use super::backend::ServerBackend;
use super::gtid::{Gtid, GtidList};
use bitflags::bitflags;
use serde::Serialize;
use std::fmt;
use std::time::Instant;

bitflags! {
    /// Status facts of a monitored server. Several can hold at once (e.g. SLAVE and
    /// STALE_SLAVE), which is why this is a flag set rather than an enum.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ServerStatus: u32 {
        const RUNNING                  = 1 << 0;
        const DOWN                     = 1 << 1;
        const MASTER                   = 1 << 2;
        const SLAVE                    = 1 << 3;
        const RELAY_MASTER             = 1 << 4;
        const MAINTENANCE              = 1 << 5;
        const AUTH_ERROR               = 1 << 6;
        const STALE_STATUS             = 1 << 7;
        const STALE_SLAVE              = 1 << 8;
        const SLAVE_OF_EXTERNAL_MASTER = 1 << 9;
    }
}

/// The replication role the topology assigns. Roles are exclusive; applying one clears
/// the bits of every other, so MASTER and SLAVE can only coexist through a multi-master
/// group's own rule (which still assigns exactly one of them per server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    None,
    Master,
    Slave,
    /// A slave that also has running slaves of its own.
    RelayMaster,
}

impl ServerStatus {
    /// Bits describing the replication role or its staleness.
    pub const ROLE_BITS: ServerStatus = ServerStatus::MASTER
        .union(ServerStatus::SLAVE)
        .union(ServerStatus::RELAY_MASTER)
        .union(ServerStatus::STALE_STATUS)
        .union(ServerStatus::STALE_SLAVE)
        .union(ServerStatus::SLAVE_OF_EXTERNAL_MASTER);

    pub fn is_running(self) -> bool {
        self.contains(ServerStatus::RUNNING)
    }

    pub fn is_down(self) -> bool {
        !self.contains(ServerStatus::RUNNING)
    }

    pub fn is_master(self) -> bool {
        self.contains(ServerStatus::RUNNING | ServerStatus::MASTER)
    }

    pub fn is_slave(self) -> bool {
        self.contains(ServerStatus::RUNNING | ServerStatus::SLAVE)
    }

    pub fn is_in_maintenance(self) -> bool {
        self.contains(ServerStatus::MAINTENANCE)
    }

    /// Replaces the role bits with `role`, leaving liveness and maintenance untouched.
    pub fn set_role(&mut self, role: Role) {
        self.remove(ServerStatus::MASTER | ServerStatus::SLAVE | ServerStatus::RELAY_MASTER);
        match role {
            Role::None => {}
            Role::Master => self.insert(ServerStatus::MASTER),
            Role::Slave => self.insert(ServerStatus::SLAVE),
            Role::RelayMaster => self.insert(ServerStatus::SLAVE | ServerStatus::RELAY_MASTER),
        }
    }

    /// Marks the server reachable. Clears DOWN.
    pub fn set_running(&mut self) {
        self.remove(ServerStatus::DOWN);
        self.insert(ServerStatus::RUNNING);
    }

    /// Marks the server down. A down server holds no role.
    pub fn set_down(&mut self) {
        self.remove(ServerStatus::RUNNING | ServerStatus::AUTH_ERROR | ServerStatus::ROLE_BITS);
        self.insert(ServerStatus::DOWN);
    }

    /// Human-readable names of the set flags, in a stable order.
    pub fn names(self) -> Vec<&'static str> {
        const NAMES: [(ServerStatus, &str); 10] = [
            (ServerStatus::MAINTENANCE, "Maintenance"),
            (ServerStatus::MASTER, "Master"),
            (ServerStatus::RELAY_MASTER, "Relay Master"),
            (ServerStatus::SLAVE, "Slave"),
            (ServerStatus::SLAVE_OF_EXTERNAL_MASTER, "Slave of External Server"),
            (ServerStatus::STALE_STATUS, "Stale Status"),
            (ServerStatus::STALE_SLAVE, "Stale Slave"),
            (ServerStatus::AUTH_ERROR, "Auth Error"),
            (ServerStatus::RUNNING, "Running"),
            (ServerStatus::DOWN, "Down"),
        ];
        NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() {
            f.write_str("Unknown")
        } else {
            f.write_str(&names.join(", "))
        }
    }
}

/// Network address of a monitored server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// State of a replication link's receiving (I/O) thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IoState {
    Yes,
    Connecting,
    No,
}

/// One configured "replicates from" link of a server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationLink {
    pub master_host: String,
    pub master_port: u16,
    /// Identity of the server at the other end, 0 if never connected.
    pub master_server_id: i64,
    pub io_state: IoState,
    pub sql_running: bool,
    pub using_gtid: bool,
    /// Position received into the relay log.
    pub gtid_io_pos: GtidList,
    pub last_error: String,
}

impl ReplicationLink {
    /// The link is applying events and its receiver has not been stopped.
    pub fn is_replicating(&self) -> bool {
        self.sql_running && self.io_state != IoState::No
    }

    /// The link is fully connected to its master.
    pub fn is_live(&self) -> bool {
        self.sql_running && self.io_state == IoState::Yes
    }

    pub fn points_at(&self, addr: &ServerAddress) -> bool {
        self.master_port == addr.port && self.master_host.eq_ignore_ascii_case(&addr.host)
    }
}

/// Replication metadata of one server, refreshed wholesale by each probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerInfo {
    pub server_id: i64,
    pub read_only: bool,
    pub gtid_domain_id: Option<u32>,
    /// Position applied by this server.
    pub gtid_current_pos: GtidList,
    /// Position written to this server's own binary log.
    pub gtid_binlog_pos: GtidList,
    pub log_bin: bool,
    pub gtid_strict_mode: bool,
    pub log_slave_updates: bool,
    pub links: Vec<ReplicationLink>,
}

impl ServerInfo {
    /// The replicated-from identity of the first link, 0 if the server replicates from nobody.
    pub fn master_server_id(&self) -> i64 {
        self.links.first().map_or(0, |l| l.master_server_id)
    }

    pub fn has_links(&self) -> bool {
        !self.links.is_empty()
    }

    /// Position received into the relay log in `domain` (first link), falling back to the
    /// applied position when nothing is buffered.
    pub fn relay_sequence(&self, domain: u32) -> u64 {
        let io = self
            .links
            .first()
            .map_or(0, |l| l.gtid_io_pos.sequence(domain));
        io.max(self.gtid_current_pos.sequence(domain))
    }

    /// Events received but not yet applied, in `domain`.
    pub fn relay_backlog(&self, domain: u32) -> u64 {
        self.relay_sequence(domain)
            .saturating_sub(self.gtid_current_pos.sequence(domain))
    }

    /// The most advanced position this server has, applied or written.
    pub fn position(&self, domain: u32) -> Option<Gtid> {
        let current = self.gtid_current_pos.get(domain);
        let binlog = self.gtid_binlog_pos.get(domain);
        match (current, binlog) {
            (Some(c), Some(b)) => Some(if b.sequence > c.sequence { b } else { c }),
            (c, b) => c.or(b),
        }
    }

    pub fn position_sequence(&self, domain: u32) -> u64 {
        self.position(domain).map_or(0, |g| g.sequence)
    }
}

/// Per-tick graph bookkeeping for one server, rebuilt by the topology builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeData {
    /// Distance from the root master, -1 if not reachable from it.
    pub depth: i32,
    /// Indexes of the monitored servers this one replicates from.
    pub parents: Vec<usize>,
    /// Indexes of the monitored servers replicating from this one.
    pub children: Vec<usize>,
    /// Multi-master group id, 0 when not part of a replication cycle.
    pub group: u32,
    /// Replicates from a server that is not monitored.
    pub external_master: bool,
    /// Reachable from the cluster master through replication edges.
    pub in_master_tree: bool,
    /// The link to the first resolved parent is connected and applying.
    pub parent_link_live: bool,
    /// Running servers replicating from this one, directly or indirectly.
    pub reach: usize,
}

impl NodeData {
    pub fn reset(&mut self) {
        self.depth = -1;
        self.parents.clear();
        self.children.clear();
        self.group = 0;
        self.external_master = false;
        self.in_master_tree = false;
        self.parent_link_live = false;
        self.reach = 0;
    }
}

/// One configured database endpoint and everything the monitor knows about it.
#[derive(Debug)]
pub struct MonitoredServer {
    pub name: String,
    pub addr: ServerAddress,
    pub backend: Box<dyn ServerBackend>,
    /// Status committed at the end of the last tick.
    pub status: ServerStatus,
    /// Status staged during the current tick.
    pub pending: ServerStatus,
    /// Status committed one tick before `status`, for transition detection.
    pub prev_status: ServerStatus,
    /// Consecutive failed probes.
    pub err_count: u32,
    /// Replication metadata from the last successful probe.
    pub info: Option<ServerInfo>,
    pub last_error: Option<String>,
    pub node: NodeData,
    /// Last time a slave was seen with a live link to this server.
    pub last_live_slave_link: Option<Instant>,
}

impl MonitoredServer {
    pub fn new(name: impl Into<String>, addr: ServerAddress, backend: Box<dyn ServerBackend>) -> Self {
        Self {
            name: name.into(),
            addr,
            backend,
            status: ServerStatus::empty(),
            pending: ServerStatus::empty(),
            prev_status: ServerStatus::empty(),
            err_count: 0,
            info: None,
            last_error: None,
            node: NodeData {
                depth: -1,
                ..NodeData::default()
            },
            last_live_slave_link: None,
        }
    }

    pub fn server_id(&self) -> i64 {
        self.info.as_ref().map_or(0, |i| i.server_id)
    }

    pub fn is_read_only(&self) -> bool {
        self.info.as_ref().is_some_and(|i| i.read_only)
    }

    /// True if this server has a link that points at `other` by identity or address.
    pub fn replicates_from(&self, other: &MonitoredServer) -> bool {
        let Some(info) = &self.info else {
            return false;
        };
        let other_id = other.server_id();
        info.links.iter().any(|l| {
            (other_id != 0 && l.master_server_id == other_id) || l.points_at(&other.addr)
        })
    }

    /// Commits the staged status, remembering the previous one.
    pub fn commit_status(&mut self) -> bool {
        let changed = self.pending != self.status;
        self.prev_status = self.status;
        self.status = self.pending;
        changed
    }
}
