// src/core/monitor/status.rs

//! The read-only status export of a cluster monitor, published after every committed tick.

use super::server::{MonitoredServer, ServerAddress};
use serde::Serialize;

/// Everything the administrative layer may read about one monitored server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub name: String,
    pub address: ServerAddress,
    pub server_id: i64,
    pub master_server_id: i64,
    pub status: Vec<&'static str>,
    pub status_bits: u32,
    pub read_only: bool,
    pub gtid_current_pos: String,
    pub gtid_binlog_pos: String,
    pub gtid_io_pos: String,
    pub relay_backlog: u64,
    pub group: u32,
    pub depth: i32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl ServerSnapshot {
    pub fn from_server(server: &MonitoredServer, domain: Option<u32>) -> Self {
        let info = server.info.as_ref();
        Self {
            name: server.name.clone(),
            address: server.addr.clone(),
            server_id: server.server_id(),
            master_server_id: info.map_or(0, |i| i.master_server_id()),
            status: server.status.names(),
            status_bits: server.status.bits(),
            read_only: server.is_read_only(),
            gtid_current_pos: info.map(|i| i.gtid_current_pos.to_string()).unwrap_or_default(),
            gtid_binlog_pos: info.map(|i| i.gtid_binlog_pos.to_string()).unwrap_or_default(),
            gtid_io_pos: info
                .and_then(|i| i.links.first())
                .map(|l| l.gtid_io_pos.to_string())
                .unwrap_or_default(),
            relay_backlog: match (info, domain) {
                (Some(i), Some(d)) => i.relay_backlog(d),
                _ => 0,
            },
            group: server.node.group,
            depth: server.node.depth,
            consecutive_failures: server.err_count,
            last_error: server.last_error.clone(),
        }
    }
}

/// Enabled features, including ones durably disabled by a configuration problem.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeatureSnapshot {
    pub auto_failover: bool,
    pub auto_rejoin: bool,
    pub detect_stale_master: bool,
    pub detect_stale_slave: bool,
    pub detect_standalone_master: bool,
    pub enforce_read_only_slaves: bool,
    /// Why `auto_failover` was switched off by the monitor, if it was.
    pub auto_failover_disabled_reason: Option<String>,
}

/// Timing settings of the monitor, in milliseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimeoutSnapshot {
    pub monitor_interval_ms: u64,
    pub failcount: u32,
    pub master_failure_timeout_ms: u64,
    pub failover_timeout_ms: u64,
    pub switchover_timeout_ms: u64,
}

/// A committed view of one cluster.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSnapshot {
    pub cluster: String,
    pub tick: u64,
    /// RFC 3339 time of the commit, `None` before the first tick.
    pub updated_at: Option<String>,
    pub master: Option<String>,
    pub master_address: Option<ServerAddress>,
    pub gtid_domain: Option<u32>,
    pub features: FeatureSnapshot,
    pub timeouts: TimeoutSnapshot,
    pub servers: Vec<ServerSnapshot>,
}

impl MonitorSnapshot {
    pub fn server(&self, name: &str) -> Option<&ServerSnapshot> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// The address writes should go to: the master while it holds MASTER status.
    pub fn writable_master(&self) -> Option<&ServerAddress> {
        let master = self.master.as_deref()?;
        let server = self.server(master)?;
        server
            .status
            .contains(&"Master")
            .then_some(&server.address)
    }
}
