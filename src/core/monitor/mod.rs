// src/core/monitor/mod.rs

//! The replication-cluster monitor.
//!
//! One `ClusterMonitor` owns the servers of one configured cluster. Its task runs a fixed
//! period loop: probe every server, rebuild the topology, stage and commit statuses, run
//! the automatic engines whose preconditions hold, then write the journal. Operator
//! commands arrive over a channel and run between ticks, so no two engines ever act on
//! the cluster at the same time.

use crate::config::{ClusterConfig, ServerConfig};
use crate::core::MonitorError;
use crate::core::metrics;
use futures::future::join_all;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub mod backend;
pub mod budget;
pub mod client;
pub mod detector;
pub mod failover;
pub mod fake;
pub mod gtid;
pub mod journal;
pub mod rejoin;
pub mod server;
pub mod status;
pub mod switchover;
pub mod topology;

use self::backend::{ReplicationTarget, ServerBackend};
use self::client::{ClientSettings, RespBackend};
use self::detector::{Assessment, ProbeOutcome};
use self::journal::JournalSnapshot;
use self::server::{MonitoredServer, Role, ServerAddress, ServerStatus};
use self::status::{FeatureSnapshot, MonitorSnapshot, ServerSnapshot, TimeoutSnapshot};

/// Capacity of the operator command queue of one monitor.
const COMMAND_QUEUE_SIZE: usize = 16;

/// Outcome of a successful operator or automatic action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OpReport {
    pub operation: &'static str,
    /// The master after the operation, if it names one.
    pub master: Option<String>,
    /// Servers that were redirected, joined or otherwise changed.
    pub changed: Vec<String>,
    /// Servers the operation tried to change but could not.
    pub failed: Vec<String>,
    /// Replication from the new master was observed on at least one slave.
    pub confirmed: bool,
}

impl OpReport {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            ..Self::default()
        }
    }
}

/// Operator actions accepted by a running monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCommand {
    Failover,
    Switchover {
        candidate: Option<String>,
        current: Option<String>,
    },
    Rejoin(String),
    Maintenance { server: String, enabled: bool },
    Feature { feature: String, enabled: bool },
}

/// A queued command with the channel its result goes back on.
#[derive(Debug)]
pub struct CommandRequest {
    pub command: MonitorCommand,
    pub reply: oneshot::Sender<Result<OpReport, MonitorError>>,
}

/// The cheap, cloneable side of a running monitor used by the admin listener.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    name: String,
    commands: mpsc::Sender<CommandRequest>,
    snapshot: watch::Receiver<Arc<MonitorSnapshot>>,
}

impl MonitorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last committed snapshot.
    pub fn snapshot(&self) -> Arc<MonitorSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Queues `command` and waits for the monitor to run it.
    pub async fn execute(&self, command: MonitorCommand) -> Result<OpReport, MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(CommandRequest { command, reply })
            .await
            .map_err(|_| MonitorError::MonitorStopped(self.name.clone()))?;
        rx.await
            .map_err(|_| MonitorError::MonitorStopped(self.name.clone()))?
    }
}

/// Runtime state of the automatic features. Starts from configuration, changed by
/// operators and by configuration-disabling failures.
#[derive(Debug, Clone)]
struct Features {
    auto_failover: bool,
    auto_rejoin: bool,
    failover_disabled_reason: Option<String>,
}

/// The monitor of one replication cluster.
#[derive(Debug)]
pub struct ClusterMonitor {
    name: String,
    config: ClusterConfig,
    servers: Vec<MonitoredServer>,
    /// Index of the current (possibly down) master.
    master: Option<usize>,
    /// Replication domain of the cluster, learned from the master.
    domain: Option<u32>,
    features: Features,
    journal_path: PathBuf,
    tick_count: u64,
    /// An automatic failover refusal was already logged for the current outage.
    failover_refusal_logged: bool,
    snapshot_tx: watch::Sender<Arc<MonitorSnapshot>>,
}

impl ClusterMonitor {
    /// Builds a monitor talking to real servers over RESP.
    pub fn new(config: ClusterConfig) -> Self {
        let settings = ClientSettings {
            user: config.user.clone(),
            password: config.password.clone(),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
        };
        Self::with_backends(config, |server| {
            Box::new(RespBackend::new(
                server.name.clone(),
                ServerAddress::new(server.host.clone(), server.port),
                settings.clone(),
            ))
        })
    }

    /// Builds a monitor whose servers are reached through `backend_for`.
    pub fn with_backends<F>(config: ClusterConfig, mut backend_for: F) -> Self
    where
        F: FnMut(&ServerConfig) -> Box<dyn ServerBackend>,
    {
        let servers = config
            .servers
            .iter()
            .map(|s| {
                MonitoredServer::new(
                    s.name.clone(),
                    ServerAddress::new(s.host.clone(), s.port),
                    backend_for(s),
                )
            })
            .collect();
        let (snapshot_tx, _) = watch::channel(Arc::new(MonitorSnapshot::default()));
        let monitor = Self {
            name: config.name.clone(),
            features: Features {
                auto_failover: config.auto_failover,
                auto_rejoin: config.auto_rejoin,
                failover_disabled_reason: None,
            },
            journal_path: journal::journal_path(&config.journal_dir, &config.name),
            config,
            servers,
            master: None,
            domain: None,
            tick_count: 0,
            failover_refusal_logged: false,
            snapshot_tx,
        };
        monitor.publish();
        monitor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn servers(&self) -> &[MonitoredServer] {
        &self.servers
    }

    pub fn server(&self, name: &str) -> Option<&MonitoredServer> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Committed status of `name`.
    pub fn status_of(&self, name: &str) -> Option<ServerStatus> {
        self.server(name).map(|s| s.status)
    }

    pub fn master(&self) -> Option<&MonitoredServer> {
        self.master.map(|m| &self.servers[m])
    }

    pub fn master_name(&self) -> Option<&str> {
        self.master().map(|m| m.name.as_str())
    }

    pub fn auto_failover_enabled(&self) -> bool {
        self.features.auto_failover
    }

    pub fn auto_rejoin_enabled(&self) -> bool {
        self.features.auto_rejoin
    }

    fn index_of(&self, name: &str) -> Result<usize, MonitorError> {
        self.servers
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| MonitorError::UnknownServer(name.to_string()))
    }

    // --- Journal ---

    /// Seeds statuses and the master pointer from the journal, if a valid one exists.
    /// Must run before the first tick.
    pub async fn load_journal(&mut self) -> bool {
        let Some(snapshot) = journal::load(&self.journal_path, self.config.journal_max_age).await
        else {
            return false;
        };
        self.apply_journal(&snapshot);
        info!(
            "[{}] Restored journal: {} server record(s), master {:?}.",
            self.name,
            snapshot.servers.len(),
            snapshot.master
        );
        true
    }

    fn apply_journal(&mut self, snapshot: &JournalSnapshot) {
        for server in &mut self.servers {
            if let Some(status) = snapshot.status_of(&server.name) {
                server.status = status;
                server.pending = status;
            }
        }
        self.master = snapshot
            .master
            .as_deref()
            .and_then(|name| self.servers.iter().position(|s| s.name == name));
    }

    fn journal_snapshot(&self) -> JournalSnapshot {
        JournalSnapshot {
            servers: self
                .servers
                .iter()
                .map(|s| (s.name.clone(), s.status))
                .collect(),
            master: self.master_name().map(str::to_string),
        }
    }

    async fn write_journal(&self) {
        if let Err(e) = journal::write(&self.journal_path, &self.journal_snapshot()).await {
            metrics::JOURNAL_WRITE_FAILURES_TOTAL
                .with_label_values(&[self.name.as_str()])
                .inc();
            warn!("[{}] {}", self.name, e);
        }
    }

    // --- Tick ---

    /// Runs the observing half of a monitoring pass: probe, assess, commit, publish. The
    /// engines and the journal write follow in `run_automatic_actions`.
    pub async fn tick(&mut self) -> Assessment {
        let started = Instant::now();
        let cluster = self.name.clone();

        let probes = self.servers.iter_mut().map(|server| async move {
            if server.status.is_in_maintenance() {
                return ProbeOutcome::Skipped;
            }
            match server.backend.probe().await {
                Ok(info) => ProbeOutcome::Reached(info),
                Err(MonitorError::AuthFailed(_)) => ProbeOutcome::AuthFailed,
                Err(e) => ProbeOutcome::Failed(e.to_string()),
            }
        });
        let outcomes = join_all(probes).await;
        for (server, outcome) in self.servers.iter().zip(&outcomes) {
            if let ProbeOutcome::Failed(e) = outcome {
                debug!("[{}] Probe of '{}' failed: {}", cluster, server.name, e);
                metrics::PROBE_FAILURES_TOTAL
                    .with_label_values(&[cluster.as_str(), server.name.as_str()])
                    .inc();
            }
        }

        let assessment = detector::assess(
            &mut self.servers,
            outcomes,
            self.master,
            &self.config,
            Instant::now(),
        );
        self.commit(&assessment);
        self.tick_count += 1;
        self.publish();

        metrics::MONITOR_TICKS_TOTAL
            .with_label_values(&[cluster.as_str()])
            .inc();
        metrics::TICK_DURATION_SECONDS
            .with_label_values(&[cluster.as_str()])
            .observe(started.elapsed().as_secs_f64());
        assessment
    }

    fn commit(&mut self, assessment: &Assessment) {
        for server in &mut self.servers {
            if server.commit_status() {
                info!(
                    "[{}] Server '{}' changed state: {} -> {}",
                    self.name, server.name, server.prev_status, server.status
                );
            }
        }
        for &i in &assessment.quarantined {
            warn!(
                "[{}] Server '{}' put into maintenance to protect the standalone master.",
                self.name, self.servers[i].name
            );
        }

        if assessment.master != self.master {
            match assessment.master {
                Some(m) => info!("[{}] Master is now '{}'.", self.name, self.servers[m].name),
                None => warn!("[{}] Cluster has no master.", self.name),
            }
        }
        self.master = assessment.master;
        if let Some(domain) = self
            .master()
            .and_then(|m| m.info.as_ref())
            .and_then(|info| info.gtid_domain_id)
        {
            self.domain = Some(domain);
        }

        let down = self.servers.iter().filter(|s| s.status.contains(ServerStatus::DOWN)).count();
        metrics::SERVERS_DOWN
            .with_label_values(&[self.name.as_str()])
            .set(down as f64);
        let has_master = self.master().is_some_and(|m| m.status.is_master());
        metrics::MASTER_PRESENT
            .with_label_values(&[self.name.as_str()])
            .set(if has_master { 1.0 } else { 0.0 });
    }

    /// Runs the engines whose triggers hold after a committed tick, then journals the
    /// resulting view whether or not any engine ran.
    pub async fn run_automatic_actions(&mut self, assessment: &Assessment) {
        self.check_failover_capability();
        metrics::AUTO_FAILOVER_ENABLED
            .with_label_values(&[self.name.as_str()])
            .set(if self.features.auto_failover { 1.0 } else { 0.0 });

        if assessment.master_lost {
            if self.features.auto_failover {
                self.automatic_failover().await;
            }
        } else {
            self.failover_refusal_logged = false;
            if self.features.auto_rejoin {
                let report = self.rejoin_all().await;
                if !report.changed.is_empty() || !report.failed.is_empty() {
                    self.publish();
                }
            }
            if self.config.enforce_read_only_slaves {
                self.enforce_read_only().await;
            }
        }
        self.write_journal().await;
    }

    async fn automatic_failover(&mut self) {
        match self.run_failover(true).await {
            Ok(report) => {
                self.failover_refusal_logged = false;
                info!(
                    "[{}] Automatic failover promoted '{}'.",
                    self.name,
                    report.master.as_deref().unwrap_or("?")
                );
                self.publish();
            }
            Err(e) if e.is_safe_to_retry() => {
                if !self.failover_refusal_logged {
                    warn!("[{}] Automatic failover not possible: {}", self.name, e);
                    self.failover_refusal_logged = true;
                } else {
                    debug!("[{}] Automatic failover still not possible: {}", self.name, e);
                }
            }
            Err(e) => {
                error!("[{}] Automatic failover failed: {}", self.name, e);
            }
        }
    }

    /// Durably disables automatic failover when the topology makes it undecidable: a slave
    /// with several masters, or a slave not replicating by GTID.
    fn check_failover_capability(&mut self) {
        if !self.features.auto_failover {
            return;
        }
        let problem = self.servers.iter().find_map(|s| {
            if !s.status.is_slave() {
                return None;
            }
            let info = s.info.as_ref()?;
            if info.links.len() > 1 {
                Some(format!(
                    "slave '{}' replicates from {} masters",
                    s.name,
                    info.links.len()
                ))
            } else if info.links.iter().any(|l| !l.using_gtid) {
                Some(format!("slave '{}' does not replicate by GTID", s.name))
            } else {
                None
            }
        });
        if let Some(reason) = problem {
            self.disable_auto_failover(reason);
        }
    }

    fn disable_auto_failover(&mut self, reason: String) {
        error!(
            "[{}] Disabling automatic failover: {}. Re-enable it once the topology is fixed.",
            self.name, reason
        );
        self.features.auto_failover = false;
        self.features.failover_disabled_reason = Some(reason);
    }

    /// Sets every writable slave read-only while the cluster has a stable master.
    async fn enforce_read_only(&mut self) {
        if !self.master().is_some_and(|m| m.status.is_master()) {
            return;
        }
        for server in &mut self.servers {
            let writable = server.info.as_ref().is_some_and(|i| !i.read_only);
            if !server.status.is_slave() || server.status.is_in_maintenance() || !writable {
                continue;
            }
            match server.backend.set_read_only(true).await {
                Ok(()) => {
                    info!("[{}] Set slave '{}' read-only.", self.name, server.name);
                    if let Some(info) = server.info.as_mut() {
                        info.read_only = true;
                    }
                }
                Err(e) => warn!(
                    "[{}] Could not set slave '{}' read-only: {}",
                    self.name, server.name, e
                ),
            }
        }
    }

    // --- Operator commands ---

    /// Runs an operator command to completion.
    pub async fn execute(&mut self, command: MonitorCommand) -> Result<OpReport, MonitorError> {
        let changes_topology = !matches!(command, MonitorCommand::Feature { .. });
        let result = match command {
            MonitorCommand::Failover => self.failover().await,
            MonitorCommand::Switchover { candidate, current } => {
                self.switchover(candidate.as_deref(), current.as_deref()).await
            }
            MonitorCommand::Rejoin(server) => self.rejoin(&server).await,
            MonitorCommand::Maintenance { server, enabled } => {
                self.set_maintenance(&server, enabled)
            }
            MonitorCommand::Feature { feature, enabled } => self.set_feature(&feature, enabled),
        };
        // A refusal changed nothing; anything else may have moved the master.
        let refused = result.as_ref().is_err_and(MonitorError::is_safe_to_retry);
        if changes_topology && !refused {
            self.write_journal().await;
        }
        self.publish();
        result
    }

    /// Sets or clears MAINTENANCE on `name`. Takes effect immediately.
    pub fn set_maintenance(&mut self, name: &str, enabled: bool) -> Result<OpReport, MonitorError> {
        let i = self.index_of(name)?;
        let server = &mut self.servers[i];
        if enabled {
            server.status.insert(ServerStatus::MAINTENANCE);
        } else {
            server.status.remove(ServerStatus::MAINTENANCE);
            server.err_count = 0;
        }
        server.pending = server.status;
        info!(
            "[{}] Maintenance {} for server '{}'.",
            self.name,
            if enabled { "set" } else { "cleared" },
            name
        );
        Ok(OpReport {
            changed: vec![name.to_string()],
            ..OpReport::new("maintenance")
        })
    }

    /// Enables or disables an automatic feature.
    pub fn set_feature(&mut self, feature: &str, enabled: bool) -> Result<OpReport, MonitorError> {
        match feature.to_ascii_lowercase().as_str() {
            "auto_failover" => {
                if enabled
                    && (self.config.replication_user.is_none()
                        || self.config.replication_password.is_none())
                {
                    return Err(MonitorError::Precondition(
                        "auto_failover needs replication_user and replication_password".into(),
                    ));
                }
                self.features.auto_failover = enabled;
                self.features.failover_disabled_reason = None;
            }
            "auto_rejoin" => self.features.auto_rejoin = enabled,
            other => {
                return Err(MonitorError::Config(format!("unknown feature '{other}'")));
            }
        }
        info!(
            "[{}] Feature '{}' {}.",
            self.name,
            feature,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(OpReport::new("feature"))
    }

    // --- Helpers shared by the engines ---

    /// Credentials and address handed to servers that should replicate from `master`.
    fn replication_target(&self, master: usize) -> Result<ReplicationTarget, MonitorError> {
        let (Some(user), Some(password)) = (
            self.config.replication_user.clone(),
            self.config.replication_password.clone(),
        ) else {
            return Err(MonitorError::Precondition(
                "no replication_user/replication_password configured".into(),
            ));
        };
        let addr = &self.servers[master].addr;
        Ok(ReplicationTarget {
            host: addr.host.clone(),
            port: addr.port,
            user,
            password,
        })
    }

    /// The cluster's replication domain: learned from the master, or agreed on by every
    /// slave of `master` that reports one.
    fn cluster_domain(&self, master: usize) -> Option<u32> {
        if let Some(d) = self
            .domain
            .or_else(|| self.servers[master].info.as_ref()?.gtid_domain_id)
        {
            return Some(d);
        }
        let mut domains = self
            .slaves_of(master)
            .into_iter()
            .filter_map(|i| self.servers[i].info.as_ref()?.gtid_domain_id);
        let first = domains.next()?;
        domains.all(|d| d == first).then_some(first)
    }

    /// Running, non-maintenance servers with a replication link pointing at `master`.
    fn slaves_of(&self, master: usize) -> Vec<usize> {
        let master_server = &self.servers[master];
        self.servers
            .iter()
            .enumerate()
            .filter(|(i, s)| {
                *i != master
                    && s.status.is_running()
                    && !s.status.is_in_maintenance()
                    && !s.status.contains(ServerStatus::AUTH_ERROR)
                    && s.replicates_from(master_server)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Records a completed promotion: `i` becomes the master pointer and holds the master
    /// role until the next tick reassesses it. Any other master loses the role.
    fn mark_promoted(&mut self, i: usize) {
        for (j, server) in self.servers.iter_mut().enumerate() {
            if j == i {
                server.status.set_role(Role::Master);
                if let Some(info) = server.info.as_mut() {
                    info.read_only = false;
                    info.links.clear();
                }
            } else if server.status.is_master() {
                server.status.set_role(Role::None);
            }
        }
        self.master = Some(i);
    }

    fn master_count(&self) -> usize {
        self.servers.iter().filter(|s| s.status.is_master()).count()
    }

    /// Every slave must have exactly one link and replicate by GTID for a position-based
    /// operation to be decidable.
    fn check_slave_links(&mut self, slaves: &[usize], automatic: bool) -> Result<(), MonitorError> {
        for &i in slaves {
            let server = &self.servers[i];
            let Some(info) = server.info.as_ref() else {
                continue;
            };
            let problem = if info.links.len() > 1 {
                Some(format!(
                    "slave '{}' replicates from {} masters",
                    server.name,
                    info.links.len()
                ))
            } else if info.links.iter().any(|l| !l.using_gtid) {
                Some(format!("slave '{}' does not replicate by GTID", server.name))
            } else {
                None
            };
            if let Some(reason) = problem {
                if automatic && self.features.auto_failover {
                    self.disable_auto_failover(reason.clone());
                    return Err(MonitorError::FeatureDisabled {
                        feature: "auto_failover",
                        reason,
                    });
                }
                return Err(MonitorError::Precondition(reason));
            }
        }
        Ok(())
    }

    // --- Snapshot ---

    pub fn snapshot(&self) -> MonitorSnapshot {
        let master = self.master();
        MonitorSnapshot {
            cluster: self.name.clone(),
            tick: self.tick_count,
            updated_at: (self.tick_count > 0).then(|| chrono::Utc::now().to_rfc3339()),
            master: master.map(|m| m.name.clone()),
            master_address: master.map(|m| m.addr.clone()),
            gtid_domain: self.domain,
            features: FeatureSnapshot {
                auto_failover: self.features.auto_failover,
                auto_rejoin: self.features.auto_rejoin,
                detect_stale_master: self.config.detect_stale_master,
                detect_stale_slave: self.config.detect_stale_slave,
                detect_standalone_master: self.config.detect_standalone_master,
                enforce_read_only_slaves: self.config.enforce_read_only_slaves,
                auto_failover_disabled_reason: self.features.failover_disabled_reason.clone(),
            },
            timeouts: TimeoutSnapshot {
                monitor_interval_ms: self.config.monitor_interval.as_millis() as u64,
                failcount: self.config.failcount,
                master_failure_timeout_ms: self.config.master_failure_timeout.as_millis() as u64,
                failover_timeout_ms: self.config.failover_timeout.as_millis() as u64,
                switchover_timeout_ms: self.config.switchover_timeout.as_millis() as u64,
            },
            servers: self
                .servers
                .iter()
                .map(|s| ServerSnapshot::from_server(s, self.domain))
                .collect(),
        }
    }

    fn publish(&self) {
        let snapshot = Arc::new(self.snapshot());
        self.snapshot_tx.send_replace(snapshot);
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MonitorSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    // --- Task ---

    /// Moves the monitor onto its own task. Returns the handle operators use and the
    /// task's join handle.
    pub fn spawn(
        self,
        shutdown: broadcast::Receiver<()>,
    ) -> (MonitorHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let handle = MonitorHandle {
            name: self.name.clone(),
            commands: tx,
            snapshot: self.subscribe(),
        };
        let task = tokio::spawn(self.run(rx, shutdown));
        (handle, task)
    }

    /// The monitor loop. Ends only on shutdown.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<CommandRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            "[{}] Monitor started for {} server(s), interval {:?}.",
            self.name,
            self.servers.len(),
            self.config.monitor_interval
        );
        let mut ticker = time::interval(self.config.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    // A tick is abandoned on shutdown; nothing of it has been committed.
                    let assessment = tokio::select! {
                        _ = shutdown.recv() => break,
                        assessment = self.tick() => assessment,
                    };
                    self.run_automatic_actions(&assessment).await;
                }
                Some(request) = commands.recv() => {
                    let result = self.execute(request.command).await;
                    if let Err(e) = &result {
                        warn!("[{}] Command failed ({}): {}", self.name, e.class(), e);
                    }
                    let _ = request.reply.send(result);
                }
            }
        }
        info!("[{}] Monitor stopped.", self.name);
    }
}
