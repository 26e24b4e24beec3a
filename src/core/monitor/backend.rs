// src/core/monitor/backend.rs

//! The narrow capability interface the monitor uses to talk to one database server.
//! Engines are written against this trait only, so they can run against the in-memory
//! fake as well as against real servers.

use super::server::ServerInfo;
use crate::core::MonitorError;
use async_trait::async_trait;
use std::fmt;

/// Where, and with which credentials, a server should replicate from.
#[derive(Clone, PartialEq, Eq)]
pub struct ReplicationTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

// Keep the password out of logs.
impl fmt::Debug for ReplicationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Commands a monitor may issue to one server. Every call is bounded by the backend's
/// own connect/read timeouts and either completes or fails; none retries internally.
#[async_trait]
pub trait ServerBackend: Send + Sync + fmt::Debug {
    /// Reads status and replication metadata.
    async fn probe(&mut self) -> Result<ServerInfo, MonitorError>;

    async fn set_read_only(&mut self, read_only: bool) -> Result<(), MonitorError>;

    /// Rotates the binary log so the server's written position is final.
    async fn flush_logs(&mut self) -> Result<(), MonitorError>;

    async fn stop_replication(&mut self) -> Result<(), MonitorError>;

    async fn start_replication(&mut self) -> Result<(), MonitorError>;

    /// Removes every configured replication link.
    async fn reset_replication(&mut self) -> Result<(), MonitorError>;

    /// Replaces the configured link with one pointing at `target`. Replication must be
    /// stopped first and is left stopped.
    async fn change_master(&mut self, target: &ReplicationTarget) -> Result<(), MonitorError>;

    /// Commits a marker transaction carrying `token`.
    async fn write_marker(&mut self, token: &str) -> Result<(), MonitorError>;

    /// Reads the last marker token this server has applied.
    async fn read_marker(&mut self) -> Result<Option<String>, MonitorError>;
}

/// Points `backend` at `target` and starts replicating: stop, change, start.
pub async fn redirect(
    backend: &mut dyn ServerBackend,
    target: &ReplicationTarget,
) -> Result<(), MonitorError> {
    backend.stop_replication().await?;
    backend.change_master(target).await?;
    backend.start_replication().await
}

/// Turns `backend` into a standalone writable server: stop and remove its links, then
/// disable read-only.
pub async fn promote(backend: &mut dyn ServerBackend) -> Result<(), MonitorError> {
    backend.stop_replication().await?;
    backend.reset_replication().await?;
    backend.set_read_only(false).await
}
