// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer-facing handle.

use std::io;

use tokio_util::sync::CancellationToken;

use crate::buffer::LineBuffer;
use crate::config::ShipperConfig;
use crate::errors::ConfigError;
use crate::shipper::Shipper;

/// Cheap-to-clone byte sink feeding the delivery loop.
///
/// Writes never block on the network and never fail: bytes are appended to
/// the shared buffer and the full length is reported as written.
#[derive(Debug, Clone)]
pub struct Writer {
    buffer: LineBuffer,
}

impl Writer {
    /// Starts a shipper with default settings for `peers` and returns its writer.
    ///
    /// Must be called from within a tokio runtime. The delivery loop runs in
    /// the background until `cancel_token` is cancelled.
    pub fn new<S: Into<String>>(
        peers: impl IntoIterator<Item = S>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let shipper = Shipper::start(ShipperConfig::with_peers(peers), cancel_token)?;
        Ok(shipper.writer())
    }

    pub(crate) fn from_buffer(buffer: LineBuffer) -> Self {
        Writer { buffer }
    }

    /// Appends `bytes`, returning `bytes.len()`.
    pub fn write(&self, bytes: &[u8]) -> usize {
        self.buffer.append(bytes)
    }

    /// Complete records waiting for delivery.
    pub fn queued(&self) -> usize {
        self.buffer.len()
    }

    /// Records discarded because a bounded buffer was full.
    pub fn dropped(&self) -> u64 {
        self.buffer.dropped()
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.buffer.append(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_write_accepts_everything() {
        let writer = Writer::from_buffer(LineBuffer::unbounded());
        assert_eq!(writer.write(b"a\nb"), 3);
        assert_eq!(writer.queued(), 1);
    }

    #[test]
    fn test_io_write() {
        let mut writer = Writer::from_buffer(LineBuffer::unbounded());
        writeln!(writer, "formatted {}", 42).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.queued(), 1);
    }

    #[test]
    fn test_clones_share_buffer() {
        let buffer = LineBuffer::unbounded();
        let first = Writer::from_buffer(buffer.clone());
        let second = first.clone();
        first.write(b"one\n");
        second.write(b"two\n");
        assert_eq!(buffer.len(), 2);
    }

    #[tokio::test]
    async fn test_new_rejects_bad_peers() {
        let empty: Vec<String> = Vec::new();
        assert!(matches!(
            Writer::new(empty, CancellationToken::new()),
            Err(ConfigError::NoPeers)
        ));
        assert!(Writer::new(["tcp://host/path"], CancellationToken::new()).is_err());
    }
}
