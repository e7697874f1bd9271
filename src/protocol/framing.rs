//! Length-prefixed encoding of a message sequence.
//!
//! A fit is the concatenation of `(varint length, message bytes)` pairs,
//! where each message is a self-describing MessagePack map. Streams can be
//! appended to incrementally and read back without scanning payloads for
//! delimiters.

use std::io::Write;

use thiserror::Error;

use super::message::WriterMessage;

/// Frames larger than this are treated as corruption rather than allocated.
pub const MAX_FRAME_LEN: u64 = 100 * 1024 * 1024;

/// Longest LEB128 encoding of a `u64`.
const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("stream truncated at byte {offset}")]
    Truncated { offset: usize },
    #[error("length prefix at byte {offset} does not fit in 64 bits")]
    VarintOverflow { offset: usize },
    #[error("frame of {len} bytes at byte {offset} exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge { offset: usize, len: u64 },
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error at byte {offset}: {message}")]
    Decode { offset: usize, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Append `value` as an unsigned LEB128 varint.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Read a varint from the front of `input`.
///
/// Returns the value and the number of bytes consumed, or `Ok(None)` when
/// `input` ends inside the varint.
pub fn read_varint(input: &[u8]) -> Result<Option<(u64, usize)>, FramingError> {
    let mut value: u64 = 0;
    for (i, &byte) in input.iter().enumerate() {
        if i >= MAX_VARINT_LEN || (i == MAX_VARINT_LEN - 1 && byte > 1) {
            return Err(FramingError::VarintOverflow { offset: 0 });
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

/// Serialize one message body (no length prefix).
pub fn encode_message(message: &WriterMessage) -> Result<Vec<u8>, FramingError> {
    rmp_serde::to_vec_named(message).map_err(|e| FramingError::Encode(e.to_string()))
}

/// Writes framed messages to any `Write` sink.
pub struct FrameWriter<W: Write> {
    sink: W,
    written: usize,
    scratch: Vec<u8>,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            written: 0,
            scratch: Vec::with_capacity(MAX_VARINT_LEN),
        }
    }

    pub fn write(&mut self, message: &WriterMessage) -> Result<(), FramingError> {
        let body = encode_message(message)?;
        self.scratch.clear();
        write_varint(&mut self.scratch, body.len() as u64);
        self.sink.write_all(&self.scratch)?;
        self.sink.write_all(&body)?;
        self.written += 1;
        Ok(())
    }

    /// Number of messages written so far.
    pub fn messages_written(&self) -> usize {
        self.written
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

/// Iterates over the messages of a framed stream held in memory.
pub struct FrameReader<'a> {
    input: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> FrameReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            offset: 0,
            failed: false,
        }
    }

    fn next_frame(&mut self) -> Result<WriterMessage, FramingError> {
        let start = self.offset;
        let rest = &self.input[start..];
        let (len, prefix) = read_varint(rest)
            .map_err(|_| FramingError::VarintOverflow { offset: start })?
            .ok_or(FramingError::Truncated { offset: start })?;
        if len > MAX_FRAME_LEN {
            return Err(FramingError::FrameTooLarge { offset: start, len });
        }
        let body_start = prefix;
        let body_end = body_start + len as usize;
        let body = rest
            .get(body_start..body_end)
            .ok_or(FramingError::Truncated { offset: start })?;
        let message = rmp_serde::from_slice(body).map_err(|e| FramingError::Decode {
            offset: start,
            message: e.to_string(),
        })?;
        self.offset = start + body_end;
        Ok(message)
    }
}

impl Iterator for FrameReader<'_> {
    type Item = Result<WriterMessage, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.input.len() {
            return None;
        }
        let item = self.next_frame();
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

/// Frame a whole sequence.
pub fn encode_messages(messages: &[WriterMessage]) -> Result<Vec<u8>, FramingError> {
    let mut writer = FrameWriter::new(Vec::new());
    for message in messages {
        writer.write(message)?;
    }
    Ok(writer.into_inner())
}

/// Decode a whole stream, failing on the first malformed frame.
pub fn decode_messages(input: &[u8]) -> Result<Vec<WriterMessage>, FramingError> {
    FrameReader::new(input).collect()
}

/// Render messages as JSON Lines, one message per line.
pub fn to_json_lines(messages: &[WriterMessage]) -> Result<String, FramingError> {
    let mut out = String::new();
    for message in messages {
        let line = serde_json::to_string(message).map_err(|e| FramingError::Encode(e.to_string()))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}
