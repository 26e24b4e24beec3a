// src/core/errors.rs

//! Defines the primary error type for the monitor core.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing every failure the monitor core can report.
///
/// The variants follow the failure classes the monitor distinguishes: transient probe
/// failures, precondition failures (refused before any mutation), mid-operation failures
/// (with or without a compensating action), durable feature disabling and journal problems.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server '{0}' is unreachable")]
    Unreachable(String),

    #[error("Authentication to server '{0}' failed")]
    AuthFailed(String),

    #[error("Command on server '{server}' failed: {message}")]
    Backend { server: String, message: String },

    #[error("Operation refused: {0}")]
    Precondition(String),

    #[error("Timed out during step '{step}'")]
    Timeout { step: &'static str },

    #[error("Aborted during step '{step}' on '{server}': {message}")]
    Aborted {
        step: &'static str,
        server: String,
        message: String,
    },

    /// A failure after the old master was demoted. `undo_ok` tells whether writes were
    /// re-enabled on the demoted server.
    #[error(
        "Failed during step '{step}' on '{server}': {message} (demotion undo {})",
        undo_outcome(.undo_ok)
    )]
    Compensated {
        step: &'static str,
        server: String,
        message: String,
        undo_ok: bool,
    },

    #[error("Feature '{feature}' is disabled: {reason}")]
    FeatureDisabled { feature: &'static str, reason: String },

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown server '{0}'")]
    UnknownServer(String),

    #[error("Unknown cluster '{0}'")]
    UnknownCluster(String),

    #[error("Monitor for cluster '{0}' is not running")]
    MonitorStopped(String),
}

fn undo_outcome(undo_ok: &bool) -> &'static str {
    if *undo_ok {
        "succeeded"
    } else {
        "FAILED, manual intervention required"
    }
}

impl MonitorError {
    /// A stable short name of the failure class, used in admin replies and metric labels.
    pub fn class(&self) -> &'static str {
        match self {
            MonitorError::Io(_) | MonitorError::IncompleteData | MonitorError::Protocol(_) => {
                "io"
            }
            MonitorError::Unreachable(_)
            | MonitorError::AuthFailed(_)
            | MonitorError::Backend { .. } => "transient",
            MonitorError::Precondition(_)
            | MonitorError::UnknownServer(_)
            | MonitorError::UnknownCluster(_) => "precondition",
            MonitorError::Timeout { .. } => "timeout",
            MonitorError::Aborted { .. } => "mid-operation",
            MonitorError::Compensated { .. } => "compensated",
            MonitorError::FeatureDisabled { .. } => "disabled",
            MonitorError::Journal(_) => "journal",
            MonitorError::Config(_) => "config",
            MonitorError::MonitorStopped(_) => "stopped",
        }
    }

    /// True if the error was raised before anything on the cluster was changed.
    pub fn is_safe_to_retry(&self) -> bool {
        matches!(
            self,
            MonitorError::Precondition(_)
                | MonitorError::UnknownServer(_)
                | MonitorError::FeatureDisabled { .. }
                | MonitorError::Unreachable(_)
                | MonitorError::AuthFailed(_)
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
impl Clone for MonitorError {
    fn clone(&self) -> Self {
        match self {
            MonitorError::Io(e) => MonitorError::Io(Arc::clone(e)),
            MonitorError::IncompleteData => MonitorError::IncompleteData,
            MonitorError::Protocol(s) => MonitorError::Protocol(s.clone()),
            MonitorError::Unreachable(s) => MonitorError::Unreachable(s.clone()),
            MonitorError::AuthFailed(s) => MonitorError::AuthFailed(s.clone()),
            MonitorError::Backend { server, message } => MonitorError::Backend {
                server: server.clone(),
                message: message.clone(),
            },
            MonitorError::Precondition(s) => MonitorError::Precondition(s.clone()),
            MonitorError::Timeout { step } => MonitorError::Timeout { step: *step },
            MonitorError::Aborted {
                step,
                server,
                message,
            } => MonitorError::Aborted {
                step: *step,
                server: server.clone(),
                message: message.clone(),
            },
            MonitorError::Compensated {
                step,
                server,
                message,
                undo_ok,
            } => MonitorError::Compensated {
                step: *step,
                server: server.clone(),
                message: message.clone(),
                undo_ok: *undo_ok,
            },
            MonitorError::FeatureDisabled { feature, reason } => MonitorError::FeatureDisabled {
                feature: *feature,
                reason: reason.clone(),
            },
            MonitorError::Journal(s) => MonitorError::Journal(s.clone()),
            MonitorError::Config(s) => MonitorError::Config(s.clone()),
            MonitorError::UnknownServer(s) => MonitorError::UnknownServer(s.clone()),
            MonitorError::UnknownCluster(s) => MonitorError::UnknownCluster(s.clone()),
            MonitorError::MonitorStopped(s) => MonitorError::MonitorStopped(s.clone()),
        }
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(e: std::io::Error) -> Self {
        MonitorError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(e: serde_json::Error) -> Self {
        MonitorError::Protocol(format!("JSON serialization error: {e}"))
    }
}
