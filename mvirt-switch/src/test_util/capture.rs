//! Capture source fed from the test through a datagram socket.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;

use crate::capture::{CaptureSource, RecordFormat};

/// Default read buffer for canned captures
pub const CANNED_BUFFER_SIZE: usize = 64 * 1024;

/// A `CaptureSource` whose reads return exactly what was pushed into its feed.
///
/// Each push is one read, so a push in BPF format can carry a whole batch.
pub struct CannedCapture {
    rx: UnixDatagram,
    format: RecordFormat,
    buffer_size: usize,
}

/// Sending half of a `CannedCapture`.
pub struct CaptureFeed {
    tx: UnixDatagram,
}

impl CannedCapture {
    pub fn new(format: RecordFormat) -> io::Result<(Self, CaptureFeed)> {
        Self::with_buffer_size(format, CANNED_BUFFER_SIZE)
    }

    pub fn with_buffer_size(format: RecordFormat, buffer_size: usize) -> io::Result<(Self, CaptureFeed)> {
        let (rx, tx) = UnixDatagram::pair()?;
        rx.set_nonblocking(true)?;
        Ok((
            Self {
                rx,
                format,
                buffer_size,
            },
            CaptureFeed { tx },
        ))
    }
}

impl CaptureFeed {
    /// Queue one read's worth of bytes.
    pub fn push(&self, batch: &[u8]) -> io::Result<()> {
        self.tx.send(batch).map(|_| ())
    }
}

impl AsFd for CannedCapture {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }
}

impl CaptureSource for CannedCapture {
    fn read_batch(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rx.recv(buf)
    }

    fn record_format(&self) -> RecordFormat {
        self.format
    }

    fn read_buffer_size(&self) -> usize {
        self.buffer_size
    }
}
