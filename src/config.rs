// src/config.rs

//! Manages gateway configuration: loading the TOML file, applying defaults and
//! validating cluster definitions before any monitor is built from them.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// The top-level configuration of the gateway process.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub clusters: Vec<ClusterConfig>,
}

/// Where the admin command listener accepts operator connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_host")]
    pub host: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: default_admin_host(),
            port: default_admin_port(),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// One monitored database endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// Everything one cluster monitor needs: membership, timing, features and credentials.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub name: String,
    pub servers: Vec<ServerConfig>,

    /// Credentials used by the monitor's own probes.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    /// Credentials handed to servers when their replication is redirected or joined.
    #[serde(default)]
    pub replication_user: Option<String>,
    #[serde(default)]
    pub replication_password: Option<String>,

    #[serde(with = "humantime_serde", default = "default_monitor_interval")]
    pub monitor_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Consecutive failed probes before a server is considered down.
    #[serde(default = "default_failcount")]
    pub failcount: u32,
    /// How long no slave may see a live link to a down master before it is declared lost.
    #[serde(with = "humantime_serde", default = "default_master_failure_timeout")]
    pub master_failure_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub failover_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub switchover_timeout: Duration,

    #[serde(default)]
    pub auto_failover: bool,
    #[serde(default)]
    pub auto_rejoin: bool,
    #[serde(default = "default_true")]
    pub detect_stale_master: bool,
    #[serde(default = "default_true")]
    pub detect_stale_slave: bool,
    #[serde(default = "default_true")]
    pub detect_standalone_master: bool,
    /// Put every other server into maintenance when a standalone master is assigned.
    #[serde(default)]
    pub maintenance_on_standalone_master: bool,
    #[serde(default)]
    pub enforce_read_only_slaves: bool,

    /// Servers never chosen for automatic promotion unless nothing else is eligible.
    #[serde(default)]
    pub failover_exclusions: Vec<String>,

    #[serde(default = "default_journal_dir")]
    pub journal_dir: PathBuf,
    #[serde(with = "humantime_serde", default = "default_journal_max_age")]
    pub journal_max_age: Duration,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_admin_host() -> String {
    "127.0.0.1".to_string()
}
fn default_admin_port() -> u16 {
    7890
}
fn default_metrics_port() -> u16 {
    9890
}
fn default_monitor_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_read_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_failcount() -> u32 {
    5
}
fn default_master_failure_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_operation_timeout() -> Duration {
    Duration::from_secs(90)
}
fn default_true() -> bool {
    true
}
fn default_journal_dir() -> PathBuf {
    PathBuf::from("/var/lib/replgate")
}
fn default_journal_max_age() -> Duration {
    Duration::from_secs(8 * 3600)
}

impl ClusterConfig {
    /// A cluster definition with every optional key at its default.
    pub fn new(name: impl Into<String>, servers: Vec<ServerConfig>) -> Self {
        Self {
            name: name.into(),
            servers,
            user: None,
            password: None,
            replication_user: None,
            replication_password: None,
            monitor_interval: default_monitor_interval(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            failcount: default_failcount(),
            master_failure_timeout: default_master_failure_timeout(),
            failover_timeout: default_operation_timeout(),
            switchover_timeout: default_operation_timeout(),
            auto_failover: false,
            auto_rejoin: false,
            detect_stale_master: true,
            detect_stale_slave: true,
            detect_standalone_master: true,
            maintenance_on_standalone_master: false,
            enforce_read_only_slaves: false,
            failover_exclusions: Vec::new(),
            journal_dir: default_journal_dir(),
            journal_max_age: default_journal_max_age(),
        }
    }

    /// Checks one cluster definition for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("cluster name cannot be empty"));
        }
        if self.servers.is_empty() {
            return Err(anyhow!("cluster '{}' has no servers", self.name));
        }
        let mut names = HashSet::new();
        for server in &self.servers {
            if server.port == 0 {
                return Err(anyhow!(
                    "server '{}' in cluster '{}' has port 0",
                    server.name,
                    self.name
                ));
            }
            if !names.insert(server.name.as_str()) {
                return Err(anyhow!(
                    "duplicate server name '{}' in cluster '{}'",
                    server.name,
                    self.name
                ));
            }
        }
        if self.failcount == 0 {
            return Err(anyhow!("failcount of cluster '{}' must be at least 1", self.name));
        }
        for (key, value) in [
            ("monitor_interval", self.monitor_interval),
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
            ("failover_timeout", self.failover_timeout),
            ("switchover_timeout", self.switchover_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{key} of cluster '{}' cannot be 0", self.name));
            }
        }
        for excluded in &self.failover_exclusions {
            if !names.contains(excluded.as_str()) {
                return Err(anyhow!(
                    "failover exclusion '{}' of cluster '{}' is not a configured server",
                    excluded,
                    self.name
                ));
            }
        }
        if (self.auto_failover || self.auto_rejoin)
            && (self.replication_user.is_none() || self.replication_password.is_none())
        {
            return Err(anyhow!(
                "cluster '{}' enables auto_failover or auto_rejoin but has no replication_user/replication_password",
                self.name
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Loads and validates the configuration file at `path`.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid configuration in '{path}'"))
    }

    /// Parses and validates configuration text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the parsed configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            return Err(anyhow!("at least one [[clusters]] entry is required"));
        }
        if self.admin.port == 0 {
            return Err(anyhow!("admin port cannot be 0"));
        }
        if self.metrics.enabled && self.metrics.port == self.admin.port {
            return Err(anyhow!("metrics port and admin port must differ"));
        }
        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if !names.insert(cluster.name.as_str()) {
                return Err(anyhow!("duplicate cluster name '{}'", cluster.name));
            }
            cluster.validate()?;
        }
        Ok(())
    }
}
