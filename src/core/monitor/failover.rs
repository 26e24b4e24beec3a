// src/core/monitor/failover.rs

//! Contains the failover engine: replacing a lost master with the most up-to-date slave.
//!
//! All steps share one `failover_timeout` budget. Preconditions are checked before anything
//! is changed; after the candidate has been promoted nothing is rolled back, since it is
//! already the authoritative copy of the data.

use super::backend::{self, ReplicationTarget};
use super::budget::TimeBudget;
use super::{ClusterMonitor, OpReport};
use crate::core::MonitorError;
use crate::core::metrics;
use std::cmp::Reverse;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// How often positions and markers are polled while waiting.
pub(super) const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Promotion preference of a slave; larger is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CandidateRank {
    /// Position received into the relay log.
    pub relay: u64,
    /// Position applied.
    pub applied: u64,
    /// The slave writes applied events to its own binary log, so it can serve slaves.
    pub log_slave_updates: bool,
}

/// Keeps timeouts as they are and wraps other failures with the step and server.
pub(super) fn step_error(step: &'static str, server: &str, e: MonitorError) -> MonitorError {
    match e {
        MonitorError::Timeout { .. } => e,
        other => MonitorError::Aborted {
            step,
            server: server.to_string(),
            message: other.to_string(),
        },
    }
}

impl ClusterMonitor {
    /// Promotes a slave in place of the (down) master. Same path as the automatic trigger.
    pub async fn failover(&mut self) -> Result<OpReport, MonitorError> {
        self.run_failover(false).await
    }

    pub(super) async fn run_failover(&mut self, automatic: bool) -> Result<OpReport, MonitorError> {
        let result = self.failover_steps(automatic).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.class(),
        };
        metrics::record_operation(&self.name, "failover", outcome);
        result
    }

    async fn failover_steps(&mut self, automatic: bool) -> Result<OpReport, MonitorError> {
        // --- Preconditions ---
        let old = self
            .master
            .ok_or_else(|| MonitorError::Precondition("cluster has no known master".into()))?;
        let old_name = self.servers[old].name.clone();
        if self.servers[old].status.is_running() {
            return Err(MonitorError::Precondition(format!(
                "master '{old_name}' is running; use switchover instead"
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
        self.check_slave_links(&slaves, automatic)?;
        let candidate = self.select_candidate(&slaves, domain, true).ok_or_else(|| {
            MonitorError::Precondition("no slave has binary logging enabled".into())
        })?;
        let target = self.replication_target(candidate)?;
        let candidate_name = self.servers[candidate].name.clone();

        let budget = TimeBudget::new(self.config.failover_timeout);
        info!(
            "[{}] Starting failover: '{}' replaces lost master '{}' (budget {:?}).",
            self.name, candidate_name, old_name, self.config.failover_timeout
        );

        // --- Step 1: Let the candidate apply everything it received ---
        self.drain_relay_log(candidate, domain, &budget).await?;

        // --- Step 2: Promote ---
        budget
            .run(
                "promote",
                backend::promote(self.servers[candidate].backend.as_mut()),
            )
            .await
            .map_err(|e| step_error("promote", &candidate_name, e))?;
        info!("[{}] Promoted '{}' to master.", self.name, candidate_name);
        self.mark_promoted(candidate);

        // --- Step 3: Redirect the remaining slaves ---
        let others: Vec<usize> = slaves.into_iter().filter(|&i| i != candidate).collect();
        let (redirected, failed) = self.redirect_all(&others, &target, &budget).await;

        // --- Step 4: Confirm replication from the new master ---
        let confirmed = self
            .confirm_replication(candidate, &redirected, &budget)
            .await;

        Ok(OpReport {
            master: Some(candidate_name),
            changed: self.names(&redirected),
            failed: self.names(&failed),
            confirmed,
            ..OpReport::new("failover")
        })
    }

    pub(super) fn names(&self, indexes: &[usize]) -> Vec<String> {
        indexes
            .iter()
            .map(|&i| self.servers[i].name.clone())
            .collect()
    }

    /// Picks the slave to promote among `slaves`.
    ///
    /// With `honor_exclusions`, excluded servers are only chosen when nothing else is
    /// eligible, and a warning names an excluded server that was ahead of the choice.
    pub(super) fn select_candidate(
        &self,
        slaves: &[usize],
        domain: u32,
        honor_exclusions: bool,
    ) -> Option<usize> {
        let ranked: Vec<(usize, CandidateRank)> = slaves
            .iter()
            .filter_map(|&i| self.candidate_rank(i, domain).map(|rank| (i, rank)))
            .collect();
        let best = |allow: &dyn Fn(usize) -> bool| {
            ranked
                .iter()
                .filter(|(i, _)| allow(*i))
                .max_by_key(|(i, rank)| (*rank, Reverse(*i)))
                .copied()
        };
        let excluded = |i: usize| {
            self.config
                .failover_exclusions
                .iter()
                .any(|name| *name == self.servers[i].name)
        };

        let overall = best(&|_| true);
        if !honor_exclusions {
            return overall.map(|(i, _)| i);
        }
        match best(&|i| !excluded(i)) {
            Some((chosen, rank)) => {
                if let Some((better, better_rank)) = overall
                    && better != chosen
                    && better_rank > rank
                {
                    warn!(
                        "[{}] Excluded server '{}' is more up to date than the selected candidate '{}'; keeping the exclusion.",
                        self.name, self.servers[better].name, self.servers[chosen].name
                    );
                }
                Some(chosen)
            }
            None => {
                if let Some((i, _)) = overall {
                    warn!(
                        "[{}] Only excluded servers are eligible; selecting '{}'.",
                        self.name, self.servers[i].name
                    );
                }
                overall.map(|(i, _)| i)
            }
        }
    }

    /// Ranking of server `i`, `None` if it cannot be promoted at all.
    pub fn candidate_rank(&self, i: usize, domain: u32) -> Option<CandidateRank> {
        let server = &self.servers[i];
        let info = server.info.as_ref()?;
        if !info.log_bin || server.status.is_in_maintenance() {
            return None;
        }
        Some(CandidateRank {
            relay: info.relay_sequence(domain),
            applied: info.gtid_current_pos.sequence(domain),
            log_slave_updates: info.log_slave_updates,
        })
    }

    /// Polls `candidate` until its relay log is applied. Aborts if positions move in a way
    /// only a live master explains, or if the candidate cannot be queried.
    async fn drain_relay_log(
        &mut self,
        candidate: usize,
        domain: u32,
        budget: &TimeBudget,
    ) -> Result<(), MonitorError> {
        let name = self.servers[candidate].name.clone();
        let mut last = self.servers[candidate].info.as_ref().map(|info| {
            (
                info.relay_sequence(domain),
                info.gtid_current_pos.sequence(domain),
            )
        });

        loop {
            let info = budget
                .run("drain", self.servers[candidate].backend.probe())
                .await
                .map_err(|e| step_error("drain", &name, e))?;
            let relay = info.relay_sequence(domain);
            let applied = info.gtid_current_pos.sequence(domain);
            let backlog = info.relay_backlog(domain);
            self.servers[candidate].info = Some(info);

            if let Some((prev_relay, prev_applied)) = last {
                if applied < prev_applied {
                    return Err(MonitorError::Aborted {
                        step: "drain",
                        server: name,
                        message: format!(
                            "applied position went backwards ({prev_applied} -> {applied})"
                        ),
                    });
                }
                if relay > prev_relay {
                    return Err(MonitorError::Aborted {
                        step: "drain",
                        server: name,
                        message: format!(
                            "relay log still receiving events ({prev_relay} -> {relay}); the old master may be alive"
                        ),
                    });
                }
            }
            if backlog == 0 {
                debug!("[{}] Relay log of '{}' is drained.", self.name, name);
                return Ok(());
            }
            debug!(
                "[{}] '{}' has {} event(s) left to apply.",
                self.name, name, backlog
            );
            last = Some((relay, applied));
            budget.pause("drain", POLL_INTERVAL).await?;
        }
    }

    /// Points every server in `slaves` at `target`. Failures are logged and returned, never
    /// propagated.
    pub(super) async fn redirect_all(
        &mut self,
        slaves: &[usize],
        target: &ReplicationTarget,
        budget: &TimeBudget,
    ) -> (Vec<usize>, Vec<usize>) {
        let mut redirected = Vec::new();
        let mut failed = Vec::new();
        for &i in slaves {
            let result = budget
                .run("redirect", backend::redirect(self.servers[i].backend.as_mut(), target))
                .await;
            match result {
                Ok(()) => {
                    info!(
                        "[{}] Redirected '{}' to {}:{}.",
                        self.name, self.servers[i].name, target.host, target.port
                    );
                    redirected.push(i);
                }
                Err(e) => {
                    warn!(
                        "[{}] Failed to redirect '{}': {}",
                        self.name, self.servers[i].name, e
                    );
                    failed.push(i);
                }
            }
        }
        (redirected, failed)
    }

    /// Writes a marker on `master` and waits for any of `slaves` to apply it. A `false`
    /// result means replication health is unverified, not that the operation failed.
    pub(super) async fn confirm_replication(
        &mut self,
        master: usize,
        slaves: &[usize],
        budget: &TimeBudget,
    ) -> bool {
        if slaves.is_empty() {
            warn!(
                "[{}] No redirected slave to confirm replication from '{}'.",
                self.name, self.servers[master].name
            );
            return false;
        }
        let token = uuid::Uuid::new_v4().to_string();
        if let Err(e) = budget
            .run("confirm", self.servers[master].backend.write_marker(&token))
            .await
        {
            warn!(
                "[{}] Could not write replication marker on '{}': {}",
                self.name, self.servers[master].name, e
            );
            return false;
        }

        loop {
            for &i in slaves {
                let seen = budget
                    .run("confirm", self.servers[i].backend.read_marker())
                    .await;
                if let Ok(Some(t)) = seen
                    && t == token
                {
                    info!(
                        "[{}] Replication from '{}' confirmed by '{}'.",
                        self.name, self.servers[master].name, self.servers[i].name
                    );
                    return true;
                }
            }
            if budget.pause("confirm", POLL_INTERVAL).await.is_err() {
                warn!(
                    "[{}] No slave confirmed replication from '{}' in time; replication health is unverified.",
                    self.name, self.servers[master].name
                );
                return false;
            }
        }
    }
}
