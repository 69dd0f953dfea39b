//! AF_PACKET capture and transmit.

use std::ffi::c_void;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use nix::net::if_::if_nametoindex;
use socket2::{Domain, Socket, Type};
use tracing::debug;

use super::{CaptureOptions, CaptureSource, CaptureStats, FrameSink, RecordFormat};
use crate::error::{OsContext, Result, check_interface_name};
use crate::filter::{FilterInsn, FilterProgram};

const ETH_P_ALL: u16 = 0x0003;
const PACKET_STATISTICS: libc::c_int = 6;
const PACKET_IGNORE_OUTGOING: libc::c_int = 23;

#[repr(C)]
#[derive(Default)]
struct TpacketStats {
    tp_packets: u32,
    tp_drops: u32,
}

const _: () = assert!(std::mem::size_of::<FilterInsn>() == std::mem::size_of::<libc::sock_filter>());

/// Filtered AF_PACKET receive socket bound to one interface.
pub struct PacketCapture {
    socket: Socket,
    interface: String,
    buffer_size: usize,
    stats: CaptureStats,
}

impl PacketCapture {
    pub fn open(interface: &str, filter: &FilterProgram, opts: CaptureOptions) -> Result<Self> {
        check_interface_name(interface)?;
        let if_index = if_nametoindex(interface).os_context(|| format!("if_nametoindex {interface}"))?;

        // Protocol 0 receives nothing until bound, so no unfiltered frame
        // can queue up before the filter is attached.
        let socket = Socket::new(Domain::PACKET, Type::RAW, None)
            .os_context(|| format!("socket(AF_PACKET) for {interface}"))?;

        attach_filter(&socket, filter.instructions())
            .os_context(|| format!("SO_ATTACH_FILTER {interface}"))?;

        socket
            .set_recv_buffer_size(opts.buffer_size)
            .os_context(|| format!("SO_RCVBUF {interface}"))?;

        set_int_option(&socket, libc::SOL_PACKET, PACKET_IGNORE_OUTGOING, 1)
            .os_context(|| format!("PACKET_IGNORE_OUTGOING {interface}"))?;

        bind_packet(&socket, if_index, ETH_P_ALL).os_context(|| format!("bind {interface}"))?;

        if opts.promiscuous {
            let mreq = libc::packet_mreq {
                mr_ifindex: if_index as i32,
                mr_type: libc::PACKET_MR_PROMISC as u16,
                mr_alen: 0,
                mr_address: [0u8; 8],
            };
            setsockopt_raw(&socket, libc::SOL_PACKET, libc::PACKET_ADD_MEMBERSHIP, &mreq)
                .os_context(|| format!("PACKET_MR_PROMISC {interface}"))?;
        }

        socket
            .set_nonblocking(true)
            .os_context(|| format!("O_NONBLOCK {interface}"))?;

        debug!(interface, if_index, snaplen = filter.snaplen(), "AF_PACKET capture open");

        Ok(Self {
            socket,
            interface: interface.to_string(),
            buffer_size: opts.buffer_size,
            stats: CaptureStats::default(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl AsFd for PacketCapture {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl CaptureSource for PacketCapture {
    fn read_batch(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.socket).read(buf)
    }

    fn record_format(&self) -> RecordFormat {
        RecordFormat::Frame
    }

    fn read_buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// The kernel resets its counters on every read, so they are accumulated here.
    fn stats(&mut self) -> Option<CaptureStats> {
        let mut raw = TpacketStats::default();
        let mut len = std::mem::size_of::<TpacketStats>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_PACKET,
                PACKET_STATISTICS,
                &mut raw as *mut TpacketStats as *mut c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return None;
        }
        self.stats.received += raw.tp_packets as u64;
        self.stats.dropped += raw.tp_drops as u64;
        Some(self.stats)
    }
}

/// Send-only AF_PACKET socket; frames carry their own Ethernet header.
pub struct PacketTransmit {
    socket: Socket,
}

impl PacketTransmit {
    pub fn open(interface: &str) -> Result<Self> {
        check_interface_name(interface)?;
        let if_index = if_nametoindex(interface).os_context(|| format!("if_nametoindex {interface}"))?;

        let socket = Socket::new(Domain::PACKET, Type::RAW, None)
            .os_context(|| format!("socket(AF_PACKET) for {interface}"))?;
        bind_packet(&socket, if_index, 0).os_context(|| format!("bind {interface}"))?;
        socket
            .set_nonblocking(true)
            .os_context(|| format!("O_NONBLOCK {interface}"))?;

        debug!(interface, if_index, "AF_PACKET transmit open");
        Ok(Self { socket })
    }
}

impl FrameSink for PacketTransmit {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.socket.send(frame)
    }
}

fn bind_packet(socket: &Socket, if_index: u32, protocol: u16) -> io::Result<()> {
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = protocol.to_be();
    addr.sll_ifindex = if_index as i32;

    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn attach_filter(socket: &Socket, insns: &[FilterInsn]) -> io::Result<()> {
    let len = u16::try_from(insns.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "filter too long"))?;
    let prog = libc::sock_fprog {
        len,
        filter: insns.as_ptr() as *mut libc::sock_filter,
    };
    setsockopt_raw(socket, libc::SOL_SOCKET, libc::SO_ATTACH_FILTER, &prog)
}

fn set_int_option(socket: &Socket, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    setsockopt_raw(socket, level, name, &value)
}

fn setsockopt_raw<T>(socket: &Socket, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            value as *const T as *const c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
