//! Wire format of the worker channel.
//!
//! Workers write raw rows to a Unix domain socket owned by the bridge. Each
//! frame is a 4-byte big-endian length followed by a MessagePack
//! [`ChannelFrame`]. The channel is one-way: the bridge never answers.

use serde::{Deserialize, Serialize};

use crate::protocol::message::WriterRecord;

/// Bumped whenever [`ChannelFrame`] changes shape.
pub const CHANNEL_VERSION: u32 = 1;

/// File name of the socket inside the per-run scratch directory.
pub const SOCKET_FILE: &str = "worker.sock";

/// Frames larger than this mean the peer is not speaking the protocol.
pub const MAX_CHANNEL_FRAME: usize = 100 * 1024 * 1024;

/// One row in flight from worker to bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub version: u32,
    /// Position of the row in the run, starting at zero.
    pub sequence: u64,
    pub record: WriterRecord,
}

impl ChannelFrame {
    pub fn new(sequence: u64, record: WriterRecord) -> Self {
        Self {
            version: CHANNEL_VERSION,
            sequence,
            record,
        }
    }
}

/// Encode a frame to MessagePack bytes with length prefix.
pub fn encode_frame(frame: &ChannelFrame) -> Result<Vec<u8>, EncodeError> {
    let payload = rmp_serde::to_vec(frame).map_err(|e| EncodeError(e.to_string()))?;
    let len = u32::try_from(payload.len()).map_err(|_| EncodeError("frame too large".into()))?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a frame from MessagePack bytes (without length prefix).
pub fn decode_frame(data: &[u8]) -> Result<ChannelFrame, DecodeError> {
    let frame: ChannelFrame = rmp_serde::from_slice(data).map_err(|e| DecodeError(e.to_string()))?;
    if frame.version != CHANNEL_VERSION {
        return Err(DecodeError(format!(
            "channel version {} (expected {CHANNEL_VERSION})",
            frame.version
        )));
    }
    Ok(frame)
}

/// Reassembles frames from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, or `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<ChannelFrame>, DecodeError> {
        let Some(prefix) = self.buf.first_chunk::<4>() else {
            return Ok(None);
        };
        let len = u32::from_be_bytes(*prefix) as usize;
        if len > MAX_CHANNEL_FRAME {
            return Err(DecodeError(format!("frame of {len} bytes exceeds limit")));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let frame = decode_frame(&self.buf[4..4 + len]);
        self.buf.drain(..4 + len);
        frame.map(Some)
    }

    /// Bytes received but not yet forming a whole frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Debug, Clone)]
pub struct EncodeError(pub String);

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "encode error: {}", self.0)
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug, Clone)]
pub struct DecodeError(pub String);

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode error: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}
