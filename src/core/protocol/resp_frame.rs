// src/core/protocol/resp_frame.rs

//! Implements the RESP frame structure and the corresponding `Encoder` and `Decoder`.
//! The same codec is used by the backend client that talks to monitored servers and by
//! the admin listener that serves operator commands.

use crate::core::MonitorError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Limits for frames coming from monitored servers and admin clients.
const MAX_FRAME_ELEMENTS: usize = 64 * 1024;
const MAX_BULK_STRING_SIZE: usize = 64 * 1024 * 1024;
const MAX_NESTING_DEPTH: usize = 32;

/// A single frame of the RESP protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Builds a command array out of plain string arguments.
    pub fn command<S: AsRef<str>>(args: &[S]) -> Self {
        RespFrame::Array(
            args.iter()
                .map(|a| RespFrame::BulkString(Bytes::copy_from_slice(a.as_ref().as_bytes())))
                .collect(),
        )
    }

    /// Convenience constructor for a bulk string reply.
    pub fn bulk(s: impl Into<String>) -> Self {
        RespFrame::BulkString(Bytes::from(s.into()))
    }

    /// Returns the textual content of string-like frames.
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespFrame::SimpleString(s) => Some(s.clone()),
            RespFrame::BulkString(b) => Some(String::from_utf8_lossy(b).to_string()),
            RespFrame::Integer(i) => Some(i.to_string()),
            _ => None,
        }
    }

    /// Encodes the frame into a byte vector.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, MonitorError> {
        let mut buf = BytesMut::new();
        RespFrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// A `tokio_util::codec` implementation for `RespFrame`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = MonitorError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => write_line(dst, b'+', s.as_bytes()),
            RespFrame::Error(s) => write_line(dst, b'-', s.as_bytes()),
            RespFrame::Integer(i) => write_line(dst, b':', i.to_string().as_bytes()),
            RespFrame::BulkString(b) => {
                write_line(dst, b'$', b.len().to_string().as_bytes());
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
            RespFrame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
            RespFrame::Array(arr) => {
                write_line(dst, b'*', arr.len().to_string().as_bytes());
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

fn write_line(dst: &mut BytesMut, prefix: u8, body: &[u8]) {
    dst.reserve(body.len() + 3);
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(body);
    dst.extend_from_slice(CRLF);
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = MonitorError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = &src[..];
        match parse_frame(&mut cursor, 0) {
            Ok(frame) => {
                let consumed = src.len() - cursor.len();
                src.advance(consumed);
                Ok(Some(frame))
            }
            // More bytes are needed; leave the buffer untouched.
            Err(MonitorError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn parse_frame(bytes: &mut &[u8], depth: usize) -> Result<RespFrame, MonitorError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(MonitorError::Protocol("RESP nesting too deep".into()));
    }
    let Some((&prefix, rest)) = bytes.split_first() else {
        return Err(MonitorError::IncompleteData);
    };
    *bytes = rest;

    match prefix {
        b'+' => Ok(RespFrame::SimpleString(lossy(parse_line(bytes)?))),
        b'-' => Ok(RespFrame::Error(lossy(parse_line(bytes)?))),
        b':' => Ok(RespFrame::Integer(parse_number(parse_line(bytes)?)?)),
        b'$' => {
            let len = parse_number(parse_line(bytes)?)?;
            if len < 0 {
                return Ok(RespFrame::Null);
            }
            let len = len as usize;
            if len > MAX_BULK_STRING_SIZE {
                return Err(MonitorError::Protocol(format!(
                    "bulk string of {len} bytes exceeds limit"
                )));
            }
            if bytes.len() < len + CRLF_LEN {
                return Err(MonitorError::IncompleteData);
            }
            if &bytes[len..len + CRLF_LEN] != CRLF {
                return Err(MonitorError::Protocol(
                    "bulk string not terminated by CRLF".into(),
                ));
            }
            let data = Bytes::copy_from_slice(&bytes[..len]);
            *bytes = &bytes[len + CRLF_LEN..];
            Ok(RespFrame::BulkString(data))
        }
        b'*' => {
            let len = parse_number(parse_line(bytes)?)?;
            if len < 0 {
                return Ok(RespFrame::NullArray);
            }
            let len = len as usize;
            if len > MAX_FRAME_ELEMENTS {
                return Err(MonitorError::Protocol(format!(
                    "array of {len} elements exceeds limit"
                )));
            }
            let mut frames = Vec::with_capacity(len);
            for _ in 0..len {
                frames.push(parse_frame(bytes, depth + 1)?);
            }
            Ok(RespFrame::Array(frames))
        }
        other => Err(MonitorError::Protocol(format!(
            "unexpected RESP type byte {other:#04x}"
        ))),
    }
}

fn parse_line<'a>(bytes: &mut &'a [u8]) -> Result<&'a [u8], MonitorError> {
    let pos = bytes
        .windows(CRLF_LEN)
        .position(|w| w == CRLF)
        .ok_or(MonitorError::IncompleteData)?;
    let line = &bytes[..pos];
    *bytes = &bytes[pos + CRLF_LEN..];
    Ok(line)
}

fn parse_number(line: &[u8]) -> Result<i64, MonitorError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| MonitorError::Protocol(format!("invalid length or integer: {}", lossy(line))))
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_string()
}
