// src/core/monitor/journal.rs

//! The topology journal: a small checksummed snapshot of every server's status and the
//! current master, rewritten after each tick and read once at startup.
//!
//! File layout (little endian):
//!
//! ```text
//! [payload length: u32][payload][CRC-32 of payload: u32]
//! payload = [version: u8] { [1][server name\0][status bits: u32] }* ( [2][master name\0] )?
//! ```
//!
//! Any mismatch (length, version, checksum, malformed record) makes the whole file count as
//! absent. Nothing from a bad journal is ever applied.

use super::server::ServerStatus;
use crate::core::MonitorError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_32_ISO_HDLC, Crc};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub const JOURNAL_VERSION: u8 = 1;

const TAG_SERVER: u8 = 1;
const TAG_MASTER: u8 = 2;
const CHECKSUM_ALGO: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The persisted view of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalSnapshot {
    pub servers: Vec<(String, ServerStatus)>,
    pub master: Option<String>,
}

impl JournalSnapshot {
    pub fn status_of(&self, name: &str) -> Option<ServerStatus> {
        self.servers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, status)| *status)
    }
}

/// The journal file of cluster `cluster` inside `dir`.
pub fn journal_path(dir: &Path, cluster: &str) -> PathBuf {
    dir.join(format!("{cluster}.journal"))
}

/// Encodes a snapshot into the on-disk representation.
pub fn encode(snapshot: &JournalSnapshot) -> Result<Bytes, MonitorError> {
    let mut payload = BytesMut::new();
    payload.put_u8(JOURNAL_VERSION);
    for (name, status) in &snapshot.servers {
        payload.put_u8(TAG_SERVER);
        put_name(&mut payload, name)?;
        payload.put_u32_le(status.bits());
    }
    if let Some(master) = &snapshot.master {
        payload.put_u8(TAG_MASTER);
        put_name(&mut payload, master)?;
    }

    let len = u32::try_from(payload.len())
        .map_err(|_| MonitorError::Journal("journal payload too large".into()))?;
    let mut out = BytesMut::with_capacity(payload.len() + 8);
    out.put_u32_le(len);
    out.put_slice(&payload);
    out.put_u32_le(CHECKSUM_ALGO.checksum(&payload));
    Ok(out.freeze())
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<(), MonitorError> {
    if name.is_empty() || name.as_bytes().contains(&0) {
        return Err(MonitorError::Journal(format!(
            "server name '{name}' cannot be journaled"
        )));
    }
    buf.put_slice(name.as_bytes());
    buf.put_u8(0);
    Ok(())
}

/// Decodes a journal. Returns `None` for anything that does not verify.
pub fn decode(bytes: &[u8]) -> Option<JournalSnapshot> {
    let mut buf = bytes;
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() != len.checked_add(4)? {
        return None;
    }
    let (payload, mut crc) = buf.split_at(len);
    if CHECKSUM_ALGO.checksum(payload) != crc.get_u32_le() {
        return None;
    }

    let mut records = payload;
    if !records.has_remaining() || records.get_u8() != JOURNAL_VERSION {
        return None;
    }

    let mut snapshot = JournalSnapshot::default();
    while records.has_remaining() {
        let tag = records.get_u8();
        let name = read_name(&mut records)?;
        match tag {
            TAG_SERVER => {
                if records.remaining() < 4 {
                    return None;
                }
                let status = ServerStatus::from_bits_truncate(records.get_u32_le());
                snapshot.servers.push((name, status));
            }
            TAG_MASTER if snapshot.master.is_none() => snapshot.master = Some(name),
            _ => return None,
        }
    }
    Some(snapshot)
}

fn read_name(buf: &mut &[u8]) -> Option<String> {
    let slice: &[u8] = *buf;
    let end = slice.iter().position(|&b| b == 0)?;
    let name = std::str::from_utf8(&slice[..end]).ok()?.to_string();
    if name.is_empty() {
        return None;
    }
    buf.advance(end + 1);
    Some(name)
}

/// Writes the journal atomically: a temporary file in the same directory is renamed over
/// the target, so a crash leaves either the old or the new journal.
pub async fn write(path: &Path, snapshot: &JournalSnapshot) -> Result<(), MonitorError> {
    let bytes = encode(snapshot)?;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    let temp_path = path.with_extension(format!("journal.tmp.{}", rand::random::<u32>()));
    if let Err(e) = write_and_rename(&temp_path, path, &bytes).await {
        if let Err(remove_err) = fs::remove_file(&temp_path).await {
            debug!(
                "Could not remove temporary journal '{}': {}",
                temp_path.display(),
                remove_err
            );
        }
        return Err(MonitorError::Journal(format!(
            "failed to write '{}': {e}",
            path.display()
        )));
    }
    Ok(())
}

async fn write_and_rename(temp_path: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(temp_path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(temp_path, path).await
}

/// Loads the journal at `path`. A missing, expired or corrupt journal yields `None`.
pub async fn load(path: &Path, max_age: Duration) -> Option<JournalSnapshot> {
    let metadata = match fs::metadata(path).await {
        Ok(m) => m,
        Err(e) => {
            debug!("No journal at '{}': {}", path.display(), e);
            return None;
        }
    };
    let age = metadata
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default();
    if age > max_age {
        warn!(
            "Journal '{}' is {:?} old (max {:?}); ignoring it.",
            path.display(),
            age,
            max_age
        );
        return None;
    }
    let bytes = match fs::read(path).await {
        Ok(b) => b,
        Err(e) => {
            warn!("Failed to read journal '{}': {}", path.display(), e);
            return None;
        }
    };
    let snapshot = decode(&bytes);
    if snapshot.is_none() {
        warn!(
            "Journal '{}' failed verification; starting without it.",
            path.display()
        );
    }
    snapshot
}
