// src/core/monitor/client.rs

//! The production `ServerBackend`: a small asynchronous RESP client speaking the
//! replication-control dialect of the monitored servers.

use super::backend::{ReplicationTarget, ServerBackend};
use super::gtid::GtidList;
use super::server::{IoState, ReplicationLink, ServerAddress, ServerInfo};
use crate::core::MonitorError;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// An open, authenticated connection to one server.
#[derive(Debug)]
struct Connection {
    stream: TcpStream,
    codec: RespFrameCodec,
    read_buf: BytesMut,
}

/// Connection settings shared by every backend of a cluster.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub user: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// A `ServerBackend` that issues commands over a (re)used TCP connection.
#[derive(Debug)]
pub struct RespBackend {
    name: String,
    addr: ServerAddress,
    settings: ClientSettings,
    conn: Option<Connection>,
}

impl RespBackend {
    pub fn new(name: impl Into<String>, addr: ServerAddress, settings: ClientSettings) -> Self {
        Self {
            name: name.into(),
            addr,
            settings,
            conn: None,
        }
    }

    fn backend_error(&self, message: impl Into<String>) -> MonitorError {
        MonitorError::Backend {
            server: self.name.clone(),
            message: message.into(),
        }
    }

    /// Connects with the configured timeout and authenticates if credentials are set.
    async fn connect(&self) -> Result<Connection, MonitorError> {
        let target = format!("{}:{}", self.addr.host, self.addr.port);
        let stream = match tokio::time::timeout(
            self.settings.connect_timeout,
            TcpStream::connect(&target),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Connection to '{}' ({}) failed: {}", self.name, target, e);
                return Err(MonitorError::Unreachable(self.name.clone()));
            }
            Err(_) => {
                debug!("Connection to '{}' ({}) timed out", self.name, target);
                return Err(MonitorError::Unreachable(self.name.clone()));
            }
        };
        let mut conn = Connection {
            stream,
            codec: RespFrameCodec,
            read_buf: BytesMut::with_capacity(4096),
        };

        if let (Some(user), Some(password)) = (&self.settings.user, &self.settings.password) {
            let auth = RespFrame::command(&["AUTH", user.as_str(), password.as_str()]);
            let reply = self.roundtrip(&mut conn, auth).await?;
            if let RespFrame::Error(e) = reply {
                return Err(self.classify_error(e));
            }
        }
        Ok(conn)
    }

    /// Sends one frame and waits for a single reply frame.
    async fn roundtrip(
        &self,
        conn: &mut Connection,
        frame: RespFrame,
    ) -> Result<RespFrame, MonitorError> {
        let mut write_buf = BytesMut::new();
        conn.codec.encode(frame, &mut write_buf)?;
        conn.stream.write_all(&write_buf).await?;

        loop {
            if let Some(reply) = conn.codec.decode(&mut conn.read_buf)? {
                return Ok(reply);
            }
            let read = tokio::time::timeout(
                self.settings.read_timeout,
                conn.stream.read_buf(&mut conn.read_buf),
            )
            .await;
            match read {
                Ok(Ok(0)) => return Err(self.backend_error("connection closed by peer")),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(self.backend_error("read timeout while waiting for reply")),
            }
        }
    }

    fn classify_error(&self, message: String) -> MonitorError {
        if message.starts_with("WRONGPASS") || message.starts_with("NOAUTH") {
            MonitorError::AuthFailed(self.name.clone())
        } else {
            self.backend_error(message)
        }
    }

    /// Runs a command on the cached connection, reconnecting once if there is none.
    /// Any transport failure drops the connection so the next call starts fresh.
    async fn execute(&mut self, args: &[&str]) -> Result<RespFrame, MonitorError> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };
        let reply = self.roundtrip(&mut conn, RespFrame::command(args)).await;
        match reply {
            Ok(RespFrame::Error(e)) => {
                self.conn = Some(conn);
                Err(self.classify_error(e))
            }
            Ok(frame) => {
                self.conn = Some(conn);
                Ok(frame)
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_ok(&mut self, args: &[&str]) -> Result<(), MonitorError> {
        self.execute(args).await.map(|_| ())
    }
}

#[async_trait]
impl ServerBackend for RespBackend {
    async fn probe(&mut self) -> Result<ServerInfo, MonitorError> {
        let reply = self.execute(&["INFO", "replication"]).await?;
        let text = reply
            .as_text()
            .ok_or_else(|| self.backend_error(format!("unexpected INFO reply: {reply:?}")))?;
        parse_replication_info(&text).map_err(|e| self.backend_error(e))
    }

    async fn set_read_only(&mut self, read_only: bool) -> Result<(), MonitorError> {
        let value = if read_only { "yes" } else { "no" };
        self.execute_ok(&["CONFIG", "SET", "read_only", value]).await
    }

    async fn flush_logs(&mut self) -> Result<(), MonitorError> {
        self.execute_ok(&["FLUSH", "LOGS"]).await
    }

    async fn stop_replication(&mut self) -> Result<(), MonitorError> {
        self.execute_ok(&["REPLICATION", "STOP"]).await
    }

    async fn start_replication(&mut self) -> Result<(), MonitorError> {
        self.execute_ok(&["REPLICATION", "START"]).await
    }

    async fn reset_replication(&mut self) -> Result<(), MonitorError> {
        self.execute_ok(&["REPLICATION", "RESET"]).await
    }

    async fn change_master(&mut self, target: &ReplicationTarget) -> Result<(), MonitorError> {
        let port = target.port.to_string();
        self.execute_ok(&[
            "REPLICATION",
            "CHANGE",
            target.host.as_str(),
            port.as_str(),
            target.user.as_str(),
            target.password.as_str(),
        ])
        .await
    }

    async fn write_marker(&mut self, token: &str) -> Result<(), MonitorError> {
        self.execute_ok(&["MARKER", "SET", token]).await
    }

    async fn read_marker(&mut self) -> Result<Option<String>, MonitorError> {
        match self.execute(&["MARKER", "GET"]).await? {
            RespFrame::Null => Ok(None),
            frame => Ok(frame.as_text()),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "yes" | "on" | "true"
    )
}

fn parse_gtids(key: &str, value: &str) -> Result<GtidList, String> {
    value
        .parse()
        .map_err(|e| format!("invalid {key} '{value}': {e}"))
}

/// Parses the `INFO replication` text of a monitored server.
///
/// The reply is a list of `key:value` lines. Replication links are reported on lines
/// named `link0`, `link1`, ... whose value is a comma separated `field=value` list.
pub fn parse_replication_info(text: &str) -> Result<ServerInfo, String> {
    let mut info = ServerInfo::default();
    let mut links: Vec<(u32, ReplicationLink)> = Vec::new();
    let mut saw_server_id = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "server_id" => {
                info.server_id = value
                    .parse()
                    .map_err(|_| format!("invalid server_id '{value}'"))?;
                saw_server_id = true;
            }
            "read_only" => info.read_only = parse_flag(value),
            "gtid_domain_id" => {
                info.gtid_domain_id = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid gtid_domain_id '{value}'"))?,
                )
            }
            "gtid_current_pos" => info.gtid_current_pos = parse_gtids(key, value)?,
            "gtid_binlog_pos" => info.gtid_binlog_pos = parse_gtids(key, value)?,
            "log_bin" => info.log_bin = parse_flag(value),
            "gtid_strict_mode" => info.gtid_strict_mode = parse_flag(value),
            "log_slave_updates" => info.log_slave_updates = parse_flag(value),
            _ => {
                if let Some(index) = key.strip_prefix("link").and_then(|n| n.parse().ok()) {
                    links.push((index, parse_link(value)?));
                }
            }
        }
    }

    if !saw_server_id {
        return Err("reply has no server_id".to_string());
    }
    links.sort_by_key(|(index, _)| *index);
    info.links = links.into_iter().map(|(_, link)| link).collect();
    Ok(info)
}

fn parse_link(value: &str) -> Result<ReplicationLink, String> {
    let fields: HashMap<&str, &str> = value
        .split(',')
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    let master_host = fields
        .get("master_host")
        .ok_or("link without master_host")?
        .to_string();
    let master_port = fields
        .get("master_port")
        .and_then(|p| p.parse().ok())
        .ok_or("link without a valid master_port")?;
    let io_state = match fields.get("io").map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("yes") => IoState::Yes,
        Some("connecting") => IoState::Connecting,
        _ => IoState::No,
    };
    let gtid_io_pos = match fields.get("gtid_io_pos") {
        // Domains inside a link field are separated by ';' since ',' separates fields.
        Some(v) => parse_gtids("gtid_io_pos", &v.replace(';', ","))?,
        None => GtidList::default(),
    };

    Ok(ReplicationLink {
        master_host,
        master_port,
        master_server_id: fields
            .get("master_server_id")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        io_state,
        sql_running: fields.get("sql").is_some_and(|v| parse_flag(v)),
        using_gtid: fields.get("using_gtid").is_some_and(|v| parse_flag(v)),
        gtid_io_pos,
        last_error: fields.get("last_error").unwrap_or(&"").to_string(),
    })
}
