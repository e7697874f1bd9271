//! Worker-side end of the channel.
//!
//! A service function receives the socket path, connects once and writes
//! rows as it produces them. Everything here is blocking; it runs on the
//! worker, never on the runtime.

use std::io::{BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::debug;

use super::protocol::{ChannelFrame, encode_frame};
use crate::protocol::message::{Topic, WriterRecord};

pub struct SocketWriter {
    stream: BufWriter<UnixStream>,
    sequence: u64,
}

impl SocketWriter {
    pub fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        debug!(socket = %path.display(), "Worker connected to channel");
        Ok(Self {
            stream: BufWriter::new(stream),
            sequence: 0,
        })
    }

    pub fn write(&mut self, record: WriterRecord) -> std::io::Result<()> {
        let frame = ChannelFrame::new(self.sequence, record);
        let encoded = encode_frame(&frame).map_err(|e| std::io::Error::other(e.to_string()))?;
        self.stream.write_all(&encoded)?;
        self.sequence += 1;
        Ok(())
    }

    /// A free-text line on the `LOGGER` topic.
    ///
    /// Flushed immediately so progress is visible while the run continues.
    pub fn log(&mut self, line: impl Into<String>) -> std::io::Result<()> {
        self.write(WriterRecord::text(Topic::Logger, line))?;
        self.stream.flush()
    }

    pub fn header<S: AsRef<str>>(
        &mut self,
        topic: Topic,
        names: impl IntoIterator<Item = S>,
    ) -> std::io::Result<()> {
        self.write(WriterRecord::names(topic, names))
    }

    pub fn values(&mut self, topic: Topic, values: impl IntoIterator<Item = f64>) -> std::io::Result<()> {
        self.write(WriterRecord::numbers(topic, values))
    }

    pub fn text(&mut self, topic: Topic, line: impl Into<String>) -> std::io::Result<()> {
        self.write(WriterRecord::text(topic, line))
    }

    /// Flush and close the write half so the reader sees EOF.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.stream.flush()?;
        self.stream.get_ref().shutdown(std::net::Shutdown::Write)
    }
}
