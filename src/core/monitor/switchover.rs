// src/core/monitor/switchover.rs

//! The switchover engine: an operator-requested master change while the master is healthy.
//!
//! The master is demoted before anything else so no acknowledged write can be lost. Every
//! failure after the demotion tries to make the old master writable again; that attempt is
//! reported as `MonitorError::Compensated`.

use super::backend;
use super::budget::TimeBudget;
use super::failover::{POLL_INTERVAL, step_error};
use super::{ClusterMonitor, OpReport};
use crate::core::MonitorError;
use crate::core::metrics;
use tracing::{debug, error, info, warn};

impl ClusterMonitor {
    /// Moves the master role to `candidate` (or the best slave). `current`, when given, must
    /// name the running master.
    pub async fn switchover(
        &mut self,
        candidate: Option<&str>,
        current: Option<&str>,
    ) -> Result<OpReport, MonitorError> {
        let result = self.switchover_steps(candidate, current).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.class(),
        };
        metrics::record_operation(&self.name, "switchover", outcome);
        result
    }

    async fn switchover_steps(
        &mut self,
        candidate: Option<&str>,
        current: Option<&str>,
    ) -> Result<OpReport, MonitorError> {
        // --- Preconditions ---
        let old = self
            .master
            .filter(|&m| self.servers[m].status.is_master())
            .ok_or_else(|| MonitorError::Precondition("cluster has no running master".into()))?;
        let old_name = self.servers[old].name.clone();
        if let Some(current) = current
            && self.index_of(current)? != old
        {
            return Err(MonitorError::Precondition(format!(
                "'{current}' is not the current master ('{old_name}')"
            )));
        }
        if self.master_count() > 1 {
            return Err(MonitorError::Precondition(
                "more than one server holds master status".into(),
            ));
        }
        let domain = self.cluster_domain(old).ok_or_else(|| {
            MonitorError::Precondition("replication domain of the cluster is unknown".into())
        })?;
        let slaves = self.slaves_of(old);
        if slaves.is_empty() {
            return Err(MonitorError::Precondition(format!(
                "master '{old_name}' has no running slaves"
            )));
        }
        self.check_slave_links(&slaves, false)?;
        let candidate = match candidate {
            Some(name) => {
                let i = self.index_of(name)?;
                if !slaves.contains(&i) {
                    return Err(MonitorError::Precondition(format!(
                        "'{name}' is not a running slave of '{old_name}'"
                    )));
                }
                if self.candidate_rank(i, domain).is_none() {
                    return Err(MonitorError::Precondition(format!(
                        "'{name}' cannot be promoted: binary logging is disabled"
                    )));
                }
                i
            }
            None => self.select_candidate(&slaves, domain, true).ok_or_else(|| {
                MonitorError::Precondition("no slave has binary logging enabled".into())
            })?,
        };
        let target = self.replication_target(candidate)?;
        let candidate_name = self.servers[candidate].name.clone();

        let budget = TimeBudget::new(self.config.switchover_timeout);
        info!(
            "[{}] Starting switchover from '{}' to '{}' (budget {:?}).",
            self.name, old_name, candidate_name, self.config.switchover_timeout
        );

        // --- Step 1: Demote the old master ---
        budget
            .run("demote", self.servers[old].backend.set_read_only(true))
            .await
            .map_err(|e| step_error("demote", &old_name, e))?;
        let final_position = match self.final_position(old, domain, &budget).await {
            Ok(position) => position,
            Err(e) => return Err(self.undo_demotion(old, "demote", e).await),
        };
        info!(
            "[{}] Demoted '{}'; final position {} in domain {}.",
            self.name, old_name, final_position, domain
        );

        // --- Step 2: Wait for every slave to reach the final position ---
        if let Err(e) = self.wait_catch_up(&slaves, domain, final_position, &budget).await {
            return Err(self.undo_demotion(old, "catch-up", e).await);
        }

        // --- Step 3: Promote ---
        let promoted = budget
            .run(
                "promote",
                backend::promote(self.servers[candidate].backend.as_mut()),
            )
            .await
            .map_err(|e| step_error("promote", &candidate_name, e));
        if let Err(e) = promoted {
            return Err(self.undo_demotion(old, "promote", e).await);
        }
        info!("[{}] Promoted '{}' to master.", self.name, candidate_name);
        self.mark_promoted(candidate);

        // --- Step 4: Redirect the remaining slaves ---
        let others: Vec<usize> = slaves.into_iter().filter(|&i| i != candidate).collect();
        let (mut redirected, mut failed) = self.redirect_all(&others, &target, &budget).await;

        // --- Step 5: Return the old master to the pool as a slave ---
        let (old_ok, old_failed) = self.redirect_all(&[old], &target, &budget).await;
        if old_failed.is_empty() {
            if let Some(info) = self.servers[old].info.as_mut() {
                info.read_only = true;
            }
        } else {
            error!(
                "[{}] Old master '{}' is read-only but not replicating; rejoin it manually.",
                self.name, old_name
            );
        }
        redirected.extend(old_ok);
        failed.extend(old_failed);

        // --- Step 6: Confirm replication from the new master ---
        let confirmed = self
            .confirm_replication(candidate, &redirected, &budget)
            .await;

        Ok(OpReport {
            master: Some(candidate_name),
            changed: self.names(&redirected),
            failed: self.names(&failed),
            confirmed,
            ..OpReport::new("switchover")
        })
    }

    /// Flushes the logs of the demoted master and reads the position no write will go past.
    async fn final_position(
        &mut self,
        old: usize,
        domain: u32,
        budget: &TimeBudget,
    ) -> Result<u64, MonitorError> {
        let name = self.servers[old].name.clone();
        budget
            .run("demote", self.servers[old].backend.flush_logs())
            .await
            .map_err(|e| step_error("demote", &name, e))?;
        let info = budget
            .run("demote", self.servers[old].backend.probe())
            .await
            .map_err(|e| step_error("demote", &name, e))?;
        let position = info.position_sequence(domain);
        self.servers[old].info = Some(info);
        Ok(position)
    }

    /// Polls `slaves` until all of them applied up to `position`.
    async fn wait_catch_up(
        &mut self,
        slaves: &[usize],
        domain: u32,
        position: u64,
        budget: &TimeBudget,
    ) -> Result<(), MonitorError> {
        let mut waiting: Vec<usize> = slaves.to_vec();
        loop {
            let mut behind = Vec::with_capacity(waiting.len());
            for &i in &waiting {
                let name = self.servers[i].name.clone();
                let info = budget
                    .run("catch-up", self.servers[i].backend.probe())
                    .await
                    .map_err(|e| step_error("catch-up", &name, e))?;
                let applied = info.gtid_current_pos.sequence(domain);
                self.servers[i].info = Some(info);
                if applied < position {
                    debug!(
                        "[{}] '{}' is at {} of {}.",
                        self.name, name, applied, position
                    );
                    behind.push(i);
                }
            }
            if behind.is_empty() {
                debug!("[{}] All slaves reached position {}.", self.name, position);
                return Ok(());
            }
            waiting = behind;
            budget.pause("catch-up", POLL_INTERVAL).await?;
        }
    }

    /// Best-effort undo of a demotion. Returns the error to report to the caller.
    async fn undo_demotion(
        &mut self,
        old: usize,
        step: &'static str,
        cause: MonitorError,
    ) -> MonitorError {
        let name = self.servers[old].name.clone();
        warn!(
            "[{}] Switchover failed at '{}': {}. Making '{}' writable again.",
            self.name, step, cause, name
        );
        // The undo is not bounded by the exhausted budget; the backend's own timeouts apply.
        let undo = self.servers[old].backend.set_read_only(false).await;
        let undo_ok = match undo {
            Ok(()) => {
                if let Some(info) = self.servers[old].info.as_mut() {
                    info.read_only = false;
                }
                info!("[{}] '{}' is writable again.", self.name, name);
                true
            }
            Err(e) => {
                error!(
                    "[{}] Could not make '{}' writable again: {}. The cluster has no writable master; manual action is required.",
                    self.name, name, e
                );
                false
            }
        };
        let server = match &cause {
            MonitorError::Aborted { server, .. } => server.clone(),
            _ => name,
        };
        MonitorError::Compensated {
            step,
            server,
            message: cause.to_string(),
            undo_ok,
        }
    }
}
