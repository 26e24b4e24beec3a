// src/core/monitor/fake.rs

//! An in-memory cluster of scripted servers implementing `ServerBackend`.
//!
//! Used by the test suite to drive the monitor and its engines without database servers.
//! Every backend call first runs a replication step, so positions move forward the way a
//! real cluster's would while the monitor polls it.

use super::backend::{ReplicationTarget, ServerBackend};
use super::gtid::{Gtid, GtidList};
use super::server::{IoState, ReplicationLink, ServerInfo};
use crate::config::{ClusterConfig, ServerConfig};
use crate::core::MonitorError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// One configured replication link of a fake server.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeLink {
    pub host: String,
    pub port: u16,
    /// Replication threads are started.
    pub running: bool,
    pub using_gtid: bool,
    /// Identity learned once the link connected.
    pub master_server_id: i64,
    /// Forces the reported receiver state regardless of the master's health.
    pub io_override: Option<IoState>,
}

/// Scripted state of one fake server.
#[derive(Debug, Clone)]
pub struct FakeServer {
    pub server_id: i64,
    pub host: String,
    pub port: u16,
    /// The server process is up; replication flows to and from it.
    pub alive: bool,
    /// The monitor can talk to it. An alive but unreachable server models a partition.
    pub reachable: bool,
    pub auth_error: bool,
    pub read_only: bool,
    pub log_bin: bool,
    pub log_slave_updates: bool,
    pub gtid_strict_mode: bool,
    pub domain: u32,
    /// Server id of the origin of the latest event this server knows of.
    pub origin: i64,
    /// Sequence received into the relay log.
    pub received: u64,
    /// Sequence applied.
    pub applied: u64,
    /// Sequence written to this server's own binary log.
    pub binlog: u64,
    /// Events applied per replication step; `None` applies everything at once.
    pub apply_rate: Option<u64>,
    /// Events written by clients at every replication step while alive and writable.
    pub trickle: u64,
    pub links: Vec<FakeLink>,
    /// Applied marker: `(token, sequence)`.
    pub marker: Option<(String, u64)>,
    /// Marker received from the master, applied once `applied` reaches its sequence.
    pub incoming_marker: Option<(String, u64)>,
    /// Operations that fail with a backend error.
    pub failing: HashSet<&'static str>,
    /// Every mutating command received, in order.
    pub commands: Vec<String>,
}

impl FakeServer {
    fn new(server_id: i64, host: String, port: u16) -> Self {
        Self {
            server_id,
            host,
            port,
            alive: true,
            reachable: true,
            auth_error: false,
            read_only: false,
            log_bin: true,
            log_slave_updates: true,
            gtid_strict_mode: true,
            domain: 0,
            origin: server_id,
            received: 0,
            applied: 0,
            binlog: 0,
            apply_rate: None,
            trickle: 0,
            links: Vec::new(),
            marker: None,
            incoming_marker: None,
            failing: HashSet::new(),
            commands: Vec::new(),
        }
    }

    fn position(&self, seq: u64) -> GtidList {
        if seq == 0 {
            GtidList::default()
        } else {
            GtidList::new(vec![Gtid::new(self.domain, self.origin, seq)])
        }
    }

    /// Commits `events` client writes on this server.
    pub fn write(&mut self, events: u64) {
        self.applied += events;
        self.received = self.received.max(self.applied);
        self.binlog = self.applied;
        self.origin = self.server_id;
    }
}

#[derive(Debug, Default)]
struct FakeState {
    servers: Vec<(String, FakeServer)>,
}

impl FakeState {
    fn index(&self, name: &str) -> Option<usize> {
        self.servers.iter().position(|(n, _)| n == name)
    }

    fn index_by_addr(&self, host: &str, port: u16) -> Option<usize> {
        self.servers
            .iter()
            .position(|(_, s)| s.port == port && s.host.eq_ignore_ascii_case(host))
    }

    /// One replication step: trickle writes, ship binlogs down every running link, apply.
    fn sync(&mut self) {
        for (_, s) in self.servers.iter_mut() {
            if s.alive && !s.read_only && s.trickle > 0 {
                let events = s.trickle;
                s.write(events);
            }
        }

        let n = self.servers.len();
        let mut rate_limited_done = vec![false; n];
        for _ in 0..n.max(1) {
            let mut changed = false;
            for i in 0..n {
                if !self.servers[i].1.alive {
                    continue;
                }
                let Some(link) = self.servers[i].1.links.first().cloned() else {
                    continue;
                };
                if !link.running {
                    continue;
                }
                let Some(m) = self.index_by_addr(&link.host, link.port) else {
                    continue;
                };
                if m == i || !self.servers[m].1.alive {
                    continue;
                }
                let master = &self.servers[m].1;
                let (m_id, m_binlog, m_origin, m_marker) = (
                    master.server_id,
                    master.binlog,
                    master.origin,
                    master.marker.clone(),
                );

                let slave = &mut self.servers[i].1;
                slave.links[0].master_server_id = m_id;
                if m_binlog > slave.received {
                    slave.received = m_binlog;
                    slave.origin = m_origin;
                    changed = true;
                }
                if let Some((token, seq)) = m_marker
                    && seq <= slave.received
                    && slave.marker.as_ref().is_none_or(|(t, _)| *t != token)
                {
                    slave.incoming_marker = Some((token, seq));
                }
            }

            for (i, (_, s)) in self.servers.iter_mut().enumerate() {
                if !s.alive || s.applied >= s.received {
                    continue;
                }
                let step = match s.apply_rate {
                    None => u64::MAX,
                    Some(_) if rate_limited_done[i] => continue,
                    Some(rate) => {
                        rate_limited_done[i] = true;
                        rate
                    }
                };
                let before = s.applied;
                s.applied = s.received.min(s.applied.saturating_add(step));
                if s.applied != before {
                    changed = true;
                }
                if s.log_slave_updates {
                    s.binlog = s.binlog.max(s.applied);
                }
            }

            for (_, s) in self.servers.iter_mut() {
                if let Some((token, seq)) = s.incoming_marker.clone()
                    && s.applied >= seq
                {
                    s.marker = Some((token, seq));
                    s.incoming_marker = None;
                }
            }

            if !changed {
                break;
            }
        }
    }

    fn io_state(&self, link: &FakeLink) -> IoState {
        if !link.running {
            return IoState::No;
        }
        if let Some(state) = link.io_override {
            return state;
        }
        match self.index_by_addr(&link.host, link.port) {
            Some(m) if self.servers[m].1.alive => IoState::Yes,
            _ => IoState::Connecting,
        }
    }

    fn info(&self, i: usize) -> ServerInfo {
        let s = &self.servers[i].1;
        ServerInfo {
            server_id: s.server_id,
            read_only: s.read_only,
            gtid_domain_id: Some(s.domain),
            gtid_current_pos: s.position(s.applied),
            gtid_binlog_pos: s.position(s.binlog),
            log_bin: s.log_bin,
            gtid_strict_mode: s.gtid_strict_mode,
            log_slave_updates: s.log_slave_updates,
            links: s
                .links
                .iter()
                .map(|l| ReplicationLink {
                    master_host: l.host.clone(),
                    master_port: l.port,
                    master_server_id: l.master_server_id,
                    io_state: self.io_state(l),
                    sql_running: l.running,
                    using_gtid: l.using_gtid,
                    gtid_io_pos: s.position(s.received),
                    last_error: String::new(),
                })
                .collect(),
        }
    }
}

/// A shared handle to the scripted cluster. Clones see the same servers.
#[derive(Debug, Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a writable standalone server reachable at `<name>.db:3306`.
    pub fn add_server(&self, name: &str, server_id: i64) {
        let mut state = self.state.lock();
        let server = FakeServer::new(server_id, format!("{name}.db"), 3306);
        state.servers.push((name.to_string(), server));
    }

    /// Points `slave` at `master` with a started GTID link and makes it read-only.
    pub fn replicate(&self, slave: &str, master: &str) {
        let mut state = self.state.lock();
        let (Some(s), Some(m)) = (state.index(slave), state.index(master)) else {
            return;
        };
        let (host, port) = {
            let master = &state.servers[m].1;
            (master.host.clone(), master.port)
        };
        let server = &mut state.servers[s].1;
        server.read_only = true;
        server.links = vec![FakeLink {
            host,
            port,
            running: true,
            using_gtid: true,
            master_server_id: 0,
            io_override: None,
        }];
        state.sync();
    }

    /// Commits `events` client writes on `name` and replicates them.
    pub fn write(&self, name: &str, events: u64) {
        self.with(name, |s| s.write(events));
        self.sync();
    }

    /// Stops the server process.
    pub fn kill(&self, name: &str) {
        self.with(name, |s| {
            s.alive = false;
            s.reachable = false;
        });
    }

    pub fn revive(&self, name: &str) {
        self.with(name, |s| {
            s.alive = true;
            s.reachable = true;
        });
        self.sync();
    }

    /// Cuts (or restores) the monitor's connectivity to a server that keeps running.
    pub fn set_reachable(&self, name: &str, reachable: bool) {
        self.with(name, |s| s.reachable = reachable);
    }

    /// Makes `op` (e.g. `"set_read_only"`, `"probe"`) fail on `name`.
    pub fn fail_op(&self, name: &str, op: &'static str) {
        self.with(name, |s| {
            s.failing.insert(op);
        });
    }

    pub fn clear_failures(&self, name: &str) {
        self.with(name, |s| s.failing.clear());
    }

    /// Runs `f` on the scripted state of `name`. Returns `None` for unknown servers.
    pub fn with<R>(&self, name: &str, f: impl FnOnce(&mut FakeServer) -> R) -> Option<R> {
        let mut state = self.state.lock();
        let i = state.index(name)?;
        Some(f(&mut state.servers[i].1))
    }

    pub fn sync(&self) {
        self.state.lock().sync();
    }

    /// The metadata a probe of `name` would return, without counting as a command.
    pub fn info(&self, name: &str) -> Option<ServerInfo> {
        let mut state = self.state.lock();
        state.sync();
        let i = state.index(name)?;
        Some(state.info(i))
    }

    /// Mutating commands `name` received so far.
    pub fn commands(&self, name: &str) -> Vec<String> {
        self.with(name, |s| s.commands.clone()).unwrap_or_default()
    }

    pub fn server_configs(&self) -> Vec<ServerConfig> {
        self.state
            .lock()
            .servers
            .iter()
            .map(|(name, s)| ServerConfig {
                name: name.clone(),
                host: s.host.clone(),
                port: s.port,
            })
            .collect()
    }

    /// A cluster definition covering every fake server, with replication credentials set.
    pub fn cluster_config(&self, name: &str) -> ClusterConfig {
        let mut config = ClusterConfig::new(name, self.server_configs());
        config.replication_user = Some("repl".to_string());
        config.replication_password = Some("repl-secret".to_string());
        config
    }

    pub fn backend(&self, name: &str) -> Box<dyn ServerBackend> {
        Box::new(FakeBackend {
            cluster: self.clone(),
            name: name.to_string(),
        })
    }
}

/// A `ServerBackend` bound to one server of a `FakeCluster`.
#[derive(Debug)]
pub struct FakeBackend {
    cluster: FakeCluster,
    name: String,
}

impl FakeBackend {
    /// Runs a replication step, checks reachability and injected failures, then applies
    /// `f` to this server.
    fn call<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut FakeState, usize) -> R,
    ) -> Result<R, MonitorError> {
        let mut state = self.cluster.state.lock();
        state.sync();
        let Some(i) = state.index(&self.name) else {
            return Err(MonitorError::UnknownServer(self.name.clone()));
        };
        let server = &state.servers[i].1;
        if !server.reachable {
            return Err(MonitorError::Unreachable(self.name.clone()));
        }
        if server.auth_error {
            return Err(MonitorError::AuthFailed(self.name.clone()));
        }
        if server.failing.contains(op) {
            return Err(MonitorError::Backend {
                server: self.name.clone(),
                message: format!("injected failure of {op}"),
            });
        }
        Ok(f(&mut state, i))
    }

    fn mutate(
        &self,
        op: &'static str,
        record: String,
        f: impl FnOnce(&mut FakeServer),
    ) -> Result<(), MonitorError> {
        self.call(op, |state, i| {
            let server = &mut state.servers[i].1;
            server.commands.push(record);
            f(server);
            state.sync();
        })
    }
}

#[async_trait]
impl ServerBackend for FakeBackend {
    async fn probe(&mut self) -> Result<ServerInfo, MonitorError> {
        self.call("probe", |state, i| state.info(i))
    }

    async fn set_read_only(&mut self, read_only: bool) -> Result<(), MonitorError> {
        self.mutate("set_read_only", format!("set_read_only({read_only})"), |s| {
            s.read_only = read_only
        })
    }

    async fn flush_logs(&mut self) -> Result<(), MonitorError> {
        self.mutate("flush_logs", "flush_logs".to_string(), |_| {})
    }

    async fn stop_replication(&mut self) -> Result<(), MonitorError> {
        self.mutate("stop_replication", "stop_replication".to_string(), |s| {
            s.links.iter_mut().for_each(|l| l.running = false)
        })
    }

    async fn start_replication(&mut self) -> Result<(), MonitorError> {
        self.mutate("start_replication", "start_replication".to_string(), |s| {
            s.links.iter_mut().for_each(|l| l.running = true)
        })
    }

    async fn reset_replication(&mut self) -> Result<(), MonitorError> {
        self.mutate("reset_replication", "reset_replication".to_string(), |s| {
            s.links.clear();
            s.incoming_marker = None;
        })
    }

    async fn change_master(&mut self, target: &ReplicationTarget) -> Result<(), MonitorError> {
        let record = format!("change_master({}:{})", target.host, target.port);
        let (host, port) = (target.host.clone(), target.port);
        self.mutate("change_master", record, move |s| {
            s.links = vec![FakeLink {
                host,
                port,
                running: false,
                using_gtid: true,
                master_server_id: 0,
                io_override: None,
            }];
        })
    }

    async fn write_marker(&mut self, token: &str) -> Result<(), MonitorError> {
        let token = token.to_string();
        self.mutate("write_marker", format!("write_marker({token})"), move |s| {
            s.write(1);
            s.marker = Some((token, s.applied));
        })
    }

    async fn read_marker(&mut self) -> Result<Option<String>, MonitorError> {
        self.call("read_marker", |state, i| {
            state.servers[i].1.marker.as_ref().map(|(token, _)| token.clone())
        })
    }
}
