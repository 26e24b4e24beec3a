// src/core/monitor/budget.rs

//! A single wall-clock budget shared by all steps of an engine operation. Each step gets
//! what the previous steps left over; running out is reported exactly like a timeout.

use crate::core::MonitorError;
use std::future::Future;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    started: Instant,
    total: Duration,
}

impl TimeBudget {
    pub fn new(total: Duration) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.elapsed())
    }

    /// Returns the remaining time, or a timeout error for `step` if nothing is left.
    pub fn check(&self, step: &'static str) -> Result<Duration, MonitorError> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            Err(MonitorError::Timeout { step })
        } else {
            Ok(remaining)
        }
    }

    /// Runs `fut` bounded by the remaining budget.
    pub async fn run<T, F>(&self, step: &'static str, fut: F) -> Result<T, MonitorError>
    where
        F: Future<Output = Result<T, MonitorError>>,
    {
        let remaining = self.check(step)?;
        tokio::time::timeout(remaining, fut)
            .await
            .map_err(|_| MonitorError::Timeout { step })?
    }

    /// Sleeps for `interval`, or for what is left if that is shorter.
    pub async fn pause(&self, step: &'static str, interval: Duration) -> Result<(), MonitorError> {
        let remaining = self.check(step)?;
        tokio::time::sleep(interval.min(remaining)).await;
        Ok(())
    }
}
