//! /dev/bpf capture and PF_NDRV transmit.

use std::ffi::c_void;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use tracing::debug;

use super::{CaptureOptions, CaptureSource, CaptureStats, DARWIN_BPF, FrameSink, RecordFormat};
use crate::error::{OsContext, Result, SwitchError, check_interface_name};
use crate::filter::{FilterInsn, FilterProgram};

// _IOC encoding: direction [31:29] | size [28:16] | group [15:8] | number [7:0]
const fn ioc(dir: u32, group: u8, num: u8, size: u32) -> libc::c_ulong {
    (dir | ((size & 0x1FFF) << 16) | ((group as u32) << 8) | num as u32) as libc::c_ulong
}

const IOC_VOID: u32 = 0x20000000;
const IOC_OUT: u32 = 0x40000000;
const IOC_IN: u32 = 0x80000000;
const IOC_INOUT: u32 = IOC_IN | IOC_OUT;

const BIOCGBLEN: libc::c_ulong = ioc(IOC_OUT, b'B', 102, 4);
const BIOCSBLEN: libc::c_ulong = ioc(IOC_INOUT, b'B', 102, 4);
const BIOCPROMISC: libc::c_ulong = ioc(IOC_VOID, b'B', 105, 0);
const BIOCSETIF: libc::c_ulong = ioc(IOC_IN, b'B', 108, 32);
const BIOCGSTATS: libc::c_ulong = ioc(IOC_OUT, b'B', 111, 8);
const BIOCIMMEDIATE: libc::c_ulong = ioc(IOC_IN, b'B', 112, 4);
const BIOCSHDRCMPLT: libc::c_ulong = ioc(IOC_IN, b'B', 117, 4);
const BIOCSSEESENT: libc::c_ulong = ioc(IOC_IN, b'B', 119, 4);
const BIOCSETFNR: libc::c_ulong = ioc(IOC_IN, b'B', 126, 16);

const _: () = assert!(BIOCSBLEN == 0xC004_4266);
const _: () = assert!(BIOCSETIF == 0x8020_426C);
const _: () = assert!(BIOCIMMEDIATE == 0x8004_4270);
const _: () = assert!(BIOCPROMISC == 0x2000_4269);
const _: () = assert!(BIOCGSTATS == 0x4008_426F);
const _: () = assert!(BIOCSETFNR == 0x8010_427E);

const AF_NDRV: libc::c_int = 27;
const BPF_DEVICE_COUNT: u32 = 256;

#[repr(C)]
struct BpfProgram {
    bf_len: u32,
    _pad: u32,
    bf_insns: *const FilterInsn,
}

#[repr(C)]
#[derive(Default)]
struct BpfStat {
    bs_recv: u32,
    bs_drop: u32,
}

#[repr(C)]
struct IfReqName {
    ifr_name: [u8; libc::IFNAMSIZ],
    _pad: [u8; 16],
}

#[repr(C)]
struct SockaddrNdrv {
    snd_len: u8,
    snd_family: u8,
    snd_name: [u8; libc::IFNAMSIZ],
}

/// A configured `/dev/bpfN` device.
pub struct BpfCapture {
    fd: OwnedFd,
    interface: String,
    buffer_size: usize,
}

impl BpfCapture {
    pub fn open(interface: &str, filter: &FilterProgram, opts: CaptureOptions) -> Result<Self> {
        check_interface_name(interface)?;
        let fd = open_bpf_device()?;

        let blen = opts.buffer_size.max(4096) as u32;
        ioctl_set(&fd, BIOCSBLEN, &blen).os_context(|| format!("BIOCSBLEN {interface}"))?;
        ioctl_set(&fd, BIOCIMMEDIATE, &1u32).os_context(|| format!("BIOCIMMEDIATE {interface}"))?;
        ioctl_set(&fd, BIOCSSEESENT, &0u32).os_context(|| format!("BIOCSSEESENT {interface}"))?;

        let mut ifr = IfReqName {
            ifr_name: [0; libc::IFNAMSIZ],
            _pad: [0; 16],
        };
        ifr.ifr_name[..interface.len()].copy_from_slice(interface.as_bytes());
        ioctl_set(&fd, BIOCSETIF, &ifr).os_context(|| format!("BIOCSETIF {interface}"))?;

        ioctl_set(&fd, BIOCSHDRCMPLT, &1u32).os_context(|| format!("BIOCSHDRCMPLT {interface}"))?;

        if opts.promiscuous && unsafe { libc::ioctl(fd.as_raw_fd(), BIOCPROMISC) } != 0 {
            return Err(SwitchError::last_os_error(format!("BIOCPROMISC {interface}")));
        }

        let insns = filter.instructions();
        let prog = BpfProgram {
            bf_len: insns.len() as u32,
            _pad: 0,
            bf_insns: insns.as_ptr(),
        };
        ioctl_set(&fd, BIOCSETFNR, &prog).os_context(|| format!("BIOCSETFNR {interface}"))?;

        let mut actual: u32 = 0;
        ioctl_get(&fd, BIOCGBLEN, &mut actual).os_context(|| format!("BIOCGBLEN {interface}"))?;

        set_nonblocking(&fd).os_context(|| format!("O_NONBLOCK {interface}"))?;

        debug!(interface, buffer_size = actual, "BPF capture open");

        Ok(Self {
            fd,
            interface: interface.to_string(),
            buffer_size: actual as usize,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl AsFd for BpfCapture {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl CaptureSource for BpfCapture {
    fn read_batch(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn record_format(&self) -> RecordFormat {
        RecordFormat::Bpf(DARWIN_BPF)
    }

    /// BPF reads fail unless the buffer is exactly the device buffer length.
    fn read_buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn stats(&mut self) -> Option<CaptureStats> {
        let mut stat = BpfStat::default();
        ioctl_get(&self.fd, BIOCGSTATS, &mut stat).ok()?;
        Some(CaptureStats {
            received: stat.bs_recv as u64,
            dropped: stat.bs_drop as u64,
        })
    }
}

/// PF_NDRV socket bound and connected to one interface.
pub struct NdrvTransmit {
    fd: OwnedFd,
}

impl NdrvTransmit {
    pub fn open(interface: &str) -> Result<Self> {
        check_interface_name(interface)?;

        let raw = unsafe { libc::socket(AF_NDRV, libc::SOCK_RAW, 0) };
        if raw < 0 {
            return Err(SwitchError::last_os_error(format!("socket(PF_NDRV) for {interface}")));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr = SockaddrNdrv {
            snd_len: std::mem::size_of::<SockaddrNdrv>() as u8,
            snd_family: AF_NDRV as u8,
            snd_name: [0; libc::IFNAMSIZ],
        };
        addr.snd_name[..interface.len()].copy_from_slice(interface.as_bytes());
        let addr_ptr = &addr as *const SockaddrNdrv as *const libc::sockaddr;
        let addr_len = std::mem::size_of::<SockaddrNdrv>() as libc::socklen_t;

        if unsafe { libc::bind(fd.as_raw_fd(), addr_ptr, addr_len) } < 0 {
            return Err(SwitchError::last_os_error(format!("bind PF_NDRV {interface}")));
        }
        if unsafe { libc::connect(fd.as_raw_fd(), addr_ptr, addr_len) } < 0 {
            return Err(SwitchError::last_os_error(format!("connect PF_NDRV {interface}")));
        }
        set_nonblocking(&fd).os_context(|| format!("O_NONBLOCK {interface}"))?;

        debug!(interface, "PF_NDRV transmit open");
        Ok(Self { fd })
    }
}

impl FrameSink for NdrvTransmit {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::send(self.fd.as_raw_fd(), frame.as_ptr() as *const c_void, frame.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

/// Try /dev/bpf0 through /dev/bpf255 until one is free.
fn open_bpf_device() -> Result<OwnedFd> {
    for i in 0..BPF_DEVICE_COUNT {
        let path = format!("/dev/bpf{i}");
        match open(path.as_str(), OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => return Ok(fd),
            Err(nix::errno::Errno::EBUSY) => continue,
            Err(e) => return Err(SwitchError::syscall(format!("open {path}"), e.into())),
        }
    }
    Err(SwitchError::syscall(
        "open /dev/bpf*",
        io::Error::new(io::ErrorKind::ResourceBusy, "all BPF devices busy"),
    ))
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn ioctl_set<T>(fd: &OwnedFd, request: libc::c_ulong, value: &T) -> io::Result<()> {
    if unsafe { libc::ioctl(fd.as_raw_fd(), request, value as *const T) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn ioctl_get<T>(fd: &OwnedFd, request: libc::c_ulong, value: &mut T) -> io::Result<()> {
    if unsafe { libc::ioctl(fd.as_raw_fd(), request, value as *mut T) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
