//! Raw link-layer capture and transmit paths.
//!
//! A capture source delivers frames addressed to one port; a frame sink puts
//! complete Ethernet frames on the wire. Platform backends live in
//! `linux` (AF_PACKET) and `macos` (/dev/bpf + PF_NDRV).

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "linux")]
pub use linux::{PacketCapture, PacketTransmit};
#[cfg(target_os = "macos")]
pub use macos::{BpfCapture, NdrvTransmit};

use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;

use crate::error::Result;
use crate::filter::FilterProgram;

/// Layout of a BPF-style record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfLayout {
    /// Offset of the u32 captured length
    pub caplen_offset: usize,
    /// Offset of the u16 header length
    pub hdrlen_offset: usize,
    /// Smallest valid header
    pub min_header: usize,
    /// Records start on multiples of this
    pub alignment: usize,
}

/// Darwin `struct bpf_hdr` (timeval32, caplen, datalen, hdrlen).
pub const DARWIN_BPF: BpfLayout = BpfLayout {
    caplen_offset: 8,
    hdrlen_offset: 16,
    min_header: 18,
    alignment: 4,
};

/// How one read from a capture source is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    /// A read returns exactly one frame
    Frame,
    /// A read returns a batch of header-prefixed records
    Bpf(BpfLayout),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    /// The record's payload runs past the valid bytes
    Truncated { offset: usize, end: usize, valid: usize },
    /// The record header is too short to be parsed
    BadHeader { offset: usize, len: usize },
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Truncated { offset, end, valid } => write!(
                f,
                "record at {offset} ends at {end}, past {valid} valid bytes"
            ),
            RecordError::BadHeader { offset, len } => {
                write!(f, "record header at {offset} is only {len} bytes")
            }
        }
    }
}

/// Walks the records in one capture read.
///
/// Yields payload slices in order. After the first error the walk ends.
pub struct Records<'a> {
    buf: &'a [u8],
    format: RecordFormat,
    pos: usize,
    done: bool,
}

pub fn records(buf: &[u8], format: RecordFormat) -> Records<'_> {
    Records {
        buf,
        format,
        pos: 0,
        done: false,
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = std::result::Result<&'a [u8], RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.buf.len() {
            return None;
        }

        let layout = match self.format {
            RecordFormat::Frame => {
                self.done = true;
                return Some(Ok(self.buf));
            }
            RecordFormat::Bpf(layout) => layout,
        };

        let offset = self.pos;
        let remaining = self.buf.len() - offset;
        if remaining < layout.min_header {
            self.done = true;
            return Some(Err(RecordError::BadHeader {
                offset,
                len: remaining,
            }));
        }

        let header = &self.buf[offset..];
        let caplen = read_u32(header, layout.caplen_offset) as usize;
        let hdrlen = read_u16(header, layout.hdrlen_offset) as usize;
        if hdrlen < layout.min_header {
            self.done = true;
            return Some(Err(RecordError::BadHeader { offset, len: hdrlen }));
        }

        let start = offset + hdrlen;
        let end = start.saturating_add(caplen);
        if end > self.buf.len() {
            self.done = true;
            return Some(Err(RecordError::Truncated {
                offset,
                end,
                valid: self.buf.len(),
            }));
        }

        self.pos = word_align(end - offset, layout.alignment).saturating_add(offset);
        Some(Ok(&self.buf[start..end]))
    }
}

fn word_align(len: usize, alignment: usize) -> usize {
    len.div_ceil(alignment) * alignment
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes([buf[offset], buf[offset + 1]])
}

/// Kernel capture counters, where the platform keeps them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub received: u64,
    pub dropped: u64,
}

/// Host-facing receive path of a port.
pub trait CaptureSource: AsFd + Send {
    /// One non-blocking read into `buf`.
    fn read_batch(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn record_format(&self) -> RecordFormat;

    /// Size the read buffer must have.
    fn read_buffer_size(&self) -> usize;

    fn stats(&mut self) -> Option<CaptureStats> {
        None
    }
}

/// Host-facing transmit path of a port.
pub trait FrameSink: Send {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<usize>;
}

impl FrameSink for UnixDatagram {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.send(frame)
    }
}

/// Capture settings beyond the filter.
#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    pub buffer_size: usize,
    pub promiscuous: bool,
}

/// Open the capture path for `interface` with `filter` installed.
#[cfg(target_os = "linux")]
pub fn open_capture(
    interface: &str,
    filter: &FilterProgram,
    opts: CaptureOptions,
) -> Result<Box<dyn CaptureSource>> {
    Ok(Box::new(PacketCapture::open(interface, filter, opts)?))
}

/// Open the header-complete transmit path for `interface`.
#[cfg(target_os = "linux")]
pub fn open_transmit(interface: &str) -> Result<Box<dyn FrameSink>> {
    Ok(Box::new(PacketTransmit::open(interface)?))
}

#[cfg(target_os = "macos")]
pub fn open_capture(
    interface: &str,
    filter: &FilterProgram,
    opts: CaptureOptions,
) -> Result<Box<dyn CaptureSource>> {
    Ok(Box::new(BpfCapture::open(interface, filter, opts)?))
}

#[cfg(target_os = "macos")]
pub fn open_transmit(interface: &str) -> Result<Box<dyn FrameSink>> {
    Ok(Box::new(NdrvTransmit::open(interface)?))
}

/// A descriptor that became readable, with the bytes the OS reports pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessEvent {
    pub fd: RawFd,
    pub available: usize,
}

impl ReadinessEvent {
    pub fn new(fd: RawFd, available: usize) -> Self {
        Self { fd, available }
    }

    /// Build an event for `fd`, asking the kernel how much is pending.
    pub fn query(fd: &impl AsRawFd) -> Self {
        let raw = fd.as_raw_fd();
        Self {
            fd: raw,
            available: pending_bytes(raw).unwrap_or(0),
        }
    }
}

/// FIONREAD on `fd`.
pub fn pending_bytes(fd: RawFd) -> io::Result<usize> {
    let mut n: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD as _, &mut n) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n.max(0) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::append_bpf_record;

    #[test]
    fn frame_format_yields_whole_read() {
        let buf = [1u8, 2, 3, 4];
        let out: Vec<_> = records(&buf, RecordFormat::Frame).collect();
        assert_eq!(out, vec![Ok(&buf[..])]);
        assert_eq!(records(&[], RecordFormat::Frame).count(), 0);
    }

    #[test]
    fn bpf_records_in_order() {
        let mut buf = Vec::new();
        append_bpf_record(&mut buf, &[0xaa; 14]);
        append_bpf_record(&mut buf, &[0xbb; 61]);
        append_bpf_record(&mut buf, &[]);

        let out: Vec<_> = records(&buf, RecordFormat::Bpf(DARWIN_BPF))
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], &[0xaa; 14][..]);
        assert_eq!(out[1], &[0xbb; 61][..]);
        assert!(out[2].is_empty());
    }

    #[test]
    fn truncated_record_stops_walk() {
        let mut buf = Vec::new();
        append_bpf_record(&mut buf, &[1; 20]);
        append_bpf_record(&mut buf, &[2; 20]);
        let cut = buf.len();
        append_bpf_record(&mut buf, &[3; 40]);
        buf.truncate(cut + 30);

        let out: Vec<_> = records(&buf, RecordFormat::Bpf(DARWIN_BPF)).collect();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Ok(&[1u8; 20][..]));
        assert_eq!(out[1], Ok(&[2u8; 20][..]));
        assert!(matches!(out[2], Err(RecordError::Truncated { offset, .. }) if offset == cut));
    }

    #[test]
    fn short_trailing_header_is_reported() {
        let mut buf = Vec::new();
        append_bpf_record(&mut buf, &[1; 16]);
        buf.extend_from_slice(&[0u8; 6]);

        let out: Vec<_> = records(&buf, RecordFormat::Bpf(DARWIN_BPF)).collect();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Err(RecordError::BadHeader { len: 6, .. })));
    }

    #[test]
    fn undersized_hdrlen_is_reported() {
        let mut buf = vec![0u8; 32];
        buf[DARWIN_BPF.hdrlen_offset..DARWIN_BPF.hdrlen_offset + 2]
            .copy_from_slice(&4u16.to_ne_bytes());

        let mut it = records(&buf, RecordFormat::Bpf(DARWIN_BPF));
        assert!(matches!(it.next(), Some(Err(RecordError::BadHeader { len: 4, .. }))));
        assert!(it.next().is_none());
    }

    #[test]
    fn pending_bytes_on_datagram_socket() {
        let (a, b) = UnixDatagram::pair().unwrap();
        a.send(&[0u8; 100]).unwrap();
        let event = ReadinessEvent::query(&b);
        assert_eq!(event.fd, b.as_raw_fd());
        assert_eq!(event.available, 100);
    }
}
