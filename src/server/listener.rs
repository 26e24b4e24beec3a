// src/server/listener.rs

//! The admin TCP listener. Operators speak RESP to it: read a cluster's committed status,
//! ask for the writable master, or run failover, switchover and rejoin commands.

use crate::core::MonitorError;
use crate::core::monitor::{MonitorCommand, MonitorHandle, OpReport};
use crate::core::protocol::{RespFrame, RespFrameCodec};
use anyhow::Result;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Running monitors by cluster name.
pub type MonitorRegistry = Arc<DashMap<String, MonitorHandle>>;

/// Accepts admin connections until shutdown.
pub async fn run_listener(
    listener: TcpListener,
    registry: MonitorRegistry,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    info!("Admin listener accepting commands on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Admin listener shutting down.");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        debug!("Accepted admin connection from: {}", addr);
                        if let Err(e) = handle_connection(socket, registry).await {
                            warn!("Error handling admin connection from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept admin connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(socket: TcpStream, registry: MonitorRegistry) -> Result<()> {
    let mut framed = Framed::new(socket, RespFrameCodec);

    while let Some(result) = framed.next().await {
        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Error decoding frame from admin client: {}", e);
                break;
            }
        };

        let response = match frame {
            RespFrame::Array(args) => process_admin_command(&args, &registry).await,
            _ => RespFrame::Error(
                "ERR invalid command format. Commands must be RESP arrays.".to_string(),
            ),
        };
        if let Err(e) = framed.send(response).await {
            warn!("Error sending response to admin client: {}", e);
            break;
        }
    }
    Ok(())
}

/// Parses and runs one admin command.
pub async fn process_admin_command(args: &[RespFrame], registry: &MonitorRegistry) -> RespFrame {
    let words: Vec<String> = args.iter().filter_map(RespFrame::as_text).collect();
    if words.len() != args.len() || words.is_empty() {
        return RespFrame::Error("ERR invalid command format".to_string());
    }
    let command = words[0].to_ascii_uppercase();
    let rest = &words[1..];

    match (command.as_str(), rest) {
        ("PING", []) => RespFrame::SimpleString("PONG".into()),
        ("CLUSTERS", []) => {
            let mut names: Vec<String> = registry.iter().map(|e| e.key().clone()).collect();
            names.sort();
            RespFrame::Array(names.into_iter().map(RespFrame::bulk).collect())
        }
        ("STATUS", [cluster]) => match lookup(registry, cluster) {
            Ok(handle) => match serde_json::to_string(&*handle.snapshot()) {
                Ok(json) => RespFrame::bulk(json),
                Err(e) => error_frame(&MonitorError::from(e)),
            },
            Err(e) => error_frame(&e),
        },
        ("MASTER", [cluster]) => match lookup(registry, cluster) {
            Ok(handle) => match handle.snapshot().writable_master() {
                Some(addr) => RespFrame::Array(vec![
                    RespFrame::bulk(addr.host.clone()),
                    RespFrame::Integer(i64::from(addr.port)),
                ]),
                None => RespFrame::Null,
            },
            Err(e) => error_frame(&e),
        },
        ("FAILOVER", [cluster]) => run(registry, cluster, MonitorCommand::Failover).await,
        ("SWITCHOVER", [cluster, extra @ ..]) if extra.len() <= 2 => {
            let command = MonitorCommand::Switchover {
                candidate: extra.first().cloned(),
                current: extra.get(1).cloned(),
            };
            run(registry, cluster, command).await
        }
        ("REJOIN", [cluster, server]) => {
            run(registry, cluster, MonitorCommand::Rejoin(server.clone())).await
        }
        ("MAINTENANCE", [cluster, server, flag]) => match parse_flag(flag) {
            Some(enabled) => {
                let command = MonitorCommand::Maintenance {
                    server: server.clone(),
                    enabled,
                };
                run(registry, cluster, command).await
            }
            None => RespFrame::Error("ERR expected ON or OFF".to_string()),
        },
        ("FEATURE", [cluster, feature, flag]) => match parse_flag(flag) {
            Some(enabled) => {
                let command = MonitorCommand::Feature {
                    feature: feature.clone(),
                    enabled,
                };
                run(registry, cluster, command).await
            }
            None => RespFrame::Error("ERR expected ON or OFF".to_string()),
        },
        (
            "PING" | "CLUSTERS" | "STATUS" | "MASTER" | "FAILOVER" | "SWITCHOVER" | "REJOIN"
            | "MAINTENANCE" | "FEATURE",
            _,
        ) => RespFrame::Error(format!(
            "ERR wrong number of arguments for '{}'",
            command.to_ascii_lowercase()
        )),
        _ => RespFrame::Error(format!("ERR Unknown command '{}'", words[0])),
    }
}

fn lookup(registry: &MonitorRegistry, cluster: &str) -> Result<MonitorHandle, MonitorError> {
    registry
        .get(cluster)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| MonitorError::UnknownCluster(cluster.to_string()))
}

async fn run(registry: &MonitorRegistry, cluster: &str, command: MonitorCommand) -> RespFrame {
    // The registry guard must not be held across the await.
    let handle = match lookup(registry, cluster) {
        Ok(handle) => handle,
        Err(e) => return error_frame(&e),
    };
    info!("Admin command for cluster '{}': {:?}", cluster, command);
    match handle.execute(command).await {
        Ok(report) => report_frame(&report),
        Err(e) => error_frame(&e),
    }
}

fn report_frame(report: &OpReport) -> RespFrame {
    match serde_json::to_string(report) {
        Ok(json) => RespFrame::bulk(json),
        Err(e) => error_frame(&MonitorError::from(e)),
    }
}

/// `-ERR <class>: <message>`, so clients can tell a refusal from a mid-operation failure.
pub fn error_frame(e: &MonitorError) -> RespFrame {
    RespFrame::Error(format!("ERR {}: {}", e.class(), e))
}

fn parse_flag(flag: &str) -> Option<bool> {
    match flag.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}
