// src/core/monitor/rejoin.rs

//! The rejoin engine: attaches standalone and mis-pointed servers to the current master.

use super::backend::{self, ReplicationTarget};
use super::failover::step_error;
use super::server::ServerStatus;
use super::{ClusterMonitor, OpReport};
use crate::core::MonitorError;
use crate::core::metrics;
use tracing::{debug, info, warn};

/// How a suspect gets attached to the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// No replication configured. May have taken writes, so it is made read-only first.
    Standalone,
    /// One link pointing at the wrong server or the master's old address.
    Redirect,
}

impl ClusterMonitor {
    /// Rejoins `name` to the current master on operator request.
    pub async fn rejoin(&mut self, name: &str) -> Result<OpReport, MonitorError> {
        let result = self.rejoin_one(name).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.class(),
        };
        metrics::record_operation(&self.name, "rejoin", outcome);
        result
    }

    async fn rejoin_one(&mut self, name: &str) -> Result<OpReport, MonitorError> {
        let i = self.index_of(name)?;
        let (master, domain) = self.rejoin_master()?;
        let master_name = self.servers[master].name.clone();
        if i == master {
            return Err(MonitorError::Precondition(format!(
                "'{name}' is the master"
            )));
        }
        let kind = self.join_kind(i, master).ok_or_else(|| {
            MonitorError::Precondition(format!(
                "'{name}' is not running, in maintenance or already replicating from '{master_name}'"
            ))
        })?;
        self.check_not_ahead(i, master, domain)
            .map_err(MonitorError::Precondition)?;
        let target = self.replication_target(master)?;

        self.join(i, kind, &target)
            .await
            .map_err(|e| step_error("rejoin", name, e))?;
        info!(
            "[{}] Rejoined '{}' to master '{}'.",
            self.name, name, master_name
        );
        Ok(OpReport {
            master: Some(master_name),
            changed: vec![name.to_string()],
            ..OpReport::new("rejoin")
        })
    }

    /// Rejoins every suspect that is safe to join. Runs after each tick when enabled.
    pub(super) async fn rejoin_all(&mut self) -> OpReport {
        let mut report = OpReport::new("rejoin");
        let Ok((master, domain)) = self.rejoin_master() else {
            return report;
        };
        let suspects: Vec<(usize, JoinKind)> = (0..self.servers.len())
            .filter_map(|i| self.join_kind(i, master).map(|kind| (i, kind)))
            .collect();
        if suspects.is_empty() {
            return report;
        }
        let target = match self.replication_target(master) {
            Ok(target) => target,
            Err(e) => {
                debug!("[{}] Cannot rejoin servers: {}", self.name, e);
                return report;
            }
        };
        let master_name = self.servers[master].name.clone();
        report.master = Some(master_name.clone());

        for (i, kind) in suspects {
            let name = self.servers[i].name.clone();
            if let Err(reason) = self.check_not_ahead(i, master, domain) {
                warn!("[{}] Not rejoining '{}': {}", self.name, name, reason);
                continue;
            }
            match self.join(i, kind, &target).await {
                Ok(()) => {
                    info!(
                        "[{}] Rejoined '{}' to master '{}'.",
                        self.name, name, master_name
                    );
                    report.changed.push(name);
                }
                Err(e) => {
                    warn!("[{}] Failed to rejoin '{}': {}", self.name, name, e);
                    report.failed.push(name);
                }
            }
        }
        if !report.changed.is_empty() || !report.failed.is_empty() {
            let outcome = if report.failed.is_empty() {
                "success"
            } else {
                "partial"
            };
            metrics::record_operation(&self.name, "rejoin", outcome);
        }
        report
    }

    /// The master servers may be joined to: running, unambiguous and outside any
    /// multi-master group. Also returns the cluster's domain.
    fn rejoin_master(&self) -> Result<(usize, u32), MonitorError> {
        let master = self
            .master
            .filter(|&m| {
                let server = &self.servers[m];
                server.status.is_master() && server.node.group == 0
            })
            .ok_or_else(|| {
                MonitorError::Precondition("cluster has no confirmed master".into())
            })?;
        if self.master_count() != 1 {
            return Err(MonitorError::Precondition(
                "more than one server holds master status".into(),
            ));
        }
        let domain = self.cluster_domain(master).ok_or_else(|| {
            MonitorError::Precondition("replication domain of the cluster is unknown".into())
        })?;
        Ok((master, domain))
    }

    /// Whether server `i` should be joined to `master`, and how.
    pub fn join_kind(&self, i: usize, master: usize) -> Option<JoinKind> {
        let server = &self.servers[i];
        if i == master
            || !server.status.is_running()
            || server.status.is_in_maintenance()
            || server.status.contains(ServerStatus::AUTH_ERROR)
        {
            return None;
        }
        let info = server.info.as_ref()?;
        let [link] = info.links.as_slice() else {
            return info.links.is_empty().then_some(JoinKind::Standalone);
        };

        let master_server = &self.servers[master];
        let master_id = master_server.server_id();
        let right_address = link.points_at(&master_server.addr);
        let right_identity = master_id != 0 && link.master_server_id == master_id;
        if right_address {
            return (link.master_server_id != 0 && !right_identity).then_some(JoinKind::Redirect);
        }
        if right_identity {
            return Some(JoinKind::Redirect);
        }
        // Replicating through a relay inside the master's tree is a valid topology.
        let via_relay = server
            .node
            .parents
            .iter()
            .any(|&p| p != master && self.servers[p].node.in_master_tree);
        (!via_relay).then_some(JoinKind::Redirect)
    }

    /// Refuses suspects that have events the master does not have.
    fn check_not_ahead(&self, i: usize, master: usize, domain: u32) -> Result<(), String> {
        let server = &self.servers[i];
        let master_server = &self.servers[master];
        let Some(master_info) = master_server.info.as_ref() else {
            return Err(format!(
                "position of master '{}' is unknown",
                master_server.name
            ));
        };
        let Some(info) = server.info.as_ref() else {
            return Err(format!("position of '{}' is unknown", server.name));
        };
        let suspect_position = info
            .position_sequence(domain)
            .max(info.relay_sequence(domain));
        let master_position = master_info.position_sequence(domain);
        if suspect_position > master_position {
            return Err(format!(
                "'{}' is ahead of master '{}' in domain {} ({} > {}); its history has diverged",
                server.name, master_server.name, domain, suspect_position, master_position
            ));
        }
        Ok(())
    }

    async fn join(
        &mut self,
        i: usize,
        kind: JoinKind,
        target: &ReplicationTarget,
    ) -> Result<(), MonitorError> {
        let server = &mut self.servers[i];
        if kind == JoinKind::Standalone {
            server.backend.set_read_only(true).await?;
            if let Some(info) = server.info.as_mut() {
                info.read_only = true;
            }
        }
        backend::redirect(server.backend.as_mut(), target).await
    }
}
