//! macOS link control: getifaddrs, feth fake-ethernet pairs, and bridge
//! driver-specific requests.

use std::collections::HashMap;
use std::ffi::{CStr, c_void};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tracing::debug;

use super::{InterfaceDescriptor, InterfaceType, LinkControl};
use crate::error::{Result, SwitchError, check_interface_name};
use crate::mac::MacAddr;

const IFT_ETHER: u8 = 0x06;
const IFT_LOOP: u8 = 0x18;
const IFT_BRIDGE: u8 = 0xd1;

const IF_FAKE_S_CMD_SET_PEER: libc::c_ulong = 1;
const BRDGADD: libc::c_ulong = 0;
const BRDGGIFFLGS: libc::c_ulong = 2;

const fn ioc(dir: u32, group: u8, num: u8, size: u32) -> libc::c_ulong {
    (dir | ((size & 0x1FFF) << 16) | ((group as u32) << 8) | num as u32) as libc::c_ulong
}

const IOC_OUT: u32 = 0x40000000;
const IOC_IN: u32 = 0x80000000;
const IOC_INOUT: u32 = IOC_IN | IOC_OUT;

/// Interface control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkIoctl {
    GetFlags,
    SetFlags,
    Create,
    Destroy,
    SetDriverSpec,
    GetDriverSpec,
}

impl LinkIoctl {
    const fn code(self) -> libc::c_ulong {
        match self {
            LinkIoctl::GetFlags => ioc(IOC_INOUT, b'i', 17, 32),
            LinkIoctl::SetFlags => ioc(IOC_IN, b'i', 16, 32),
            LinkIoctl::Create => ioc(IOC_INOUT, b'i', 122, 32),
            LinkIoctl::Destroy => ioc(IOC_IN, b'i', 121, 32),
            LinkIoctl::SetDriverSpec => ioc(IOC_IN, b'i', 123, 40),
            LinkIoctl::GetDriverSpec => ioc(IOC_INOUT, b'i', 123, 40),
        }
    }

    const fn name(self) -> &'static str {
        match self {
            LinkIoctl::GetFlags => "SIOCGIFFLAGS",
            LinkIoctl::SetFlags => "SIOCSIFFLAGS",
            LinkIoctl::Create => "SIOCIFCREATE2",
            LinkIoctl::Destroy => "SIOCIFDESTROY",
            LinkIoctl::SetDriverSpec => "SIOCSDRVSPEC",
            LinkIoctl::GetDriverSpec => "SIOCGDRVSPEC",
        }
    }
}

const _: () = assert!(LinkIoctl::GetFlags.code() == 0xC020_6911);
const _: () = assert!(LinkIoctl::SetFlags.code() == 0x8020_6910);
const _: () = assert!(LinkIoctl::Create.code() == 0xC020_697A);
const _: () = assert!(LinkIoctl::Destroy.code() == 0x8020_6979);
const _: () = assert!(LinkIoctl::SetDriverSpec.code() == 0x8028_697B);

#[repr(C)]
struct IfReq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 14],
}

#[repr(C)]
struct IfDrv {
    ifd_name: [u8; libc::IFNAMSIZ],
    ifd_cmd: libc::c_ulong,
    ifd_len: usize,
    ifd_data: *mut c_void,
}

#[repr(C)]
struct IfFakeRequest {
    iffr_reserved: [u64; 4],
    iffr_peer_name: [u8; libc::IFNAMSIZ],
    _pad: [u8; 112],
}

#[repr(C, packed(4))]
struct IfBReq {
    ifbr_ifsname: [u8; libc::IFNAMSIZ],
    ifbr_ifsflags: u32,
    ifbr_stpflags: u32,
    ifbr_path_cost: u32,
    ifbr_portno: u8,
    ifbr_priority: u8,
    ifbr_proto: u8,
    ifbr_role: u8,
    ifbr_state: u8,
    ifbr_addrcnt: u32,
    ifbr_addrmax: u32,
    ifbr_addrexceeded: u32,
    _pad: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<IfReq>() == 32);
const _: () = assert!(std::mem::size_of::<IfDrv>() == 40);
const _: () = assert!(std::mem::size_of::<IfFakeRequest>() == 160);
const _: () = assert!(std::mem::size_of::<IfBReq>() == 80);

fn name_bytes(name: &str) -> Result<[u8; libc::IFNAMSIZ]> {
    check_interface_name(name)?;
    let mut out = [0u8; libc::IFNAMSIZ];
    out[..name.len()].copy_from_slice(name.as_bytes());
    Ok(out)
}

/// Host-backed `LinkControl`.
pub struct SystemLinks {
    sock: OwnedFd,
}

impl SystemLinks {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(SwitchError::last_os_error("socket(AF_INET) for interface control"));
        }
        Ok(Self {
            sock: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn ioctl<T>(&self, request: LinkIoctl, target: &str, arg: &mut T) -> Result<()> {
        self.try_ioctl(request, arg)
            .map_err(|e| SwitchError::syscall(format!("{} {target}", request.name()), e))
    }

    fn try_ioctl<T>(&self, request: LinkIoctl, arg: &mut T) -> io::Result<()> {
        if unsafe { libc::ioctl(self.sock.as_raw_fd(), request.code(), arg as *mut T) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ifreq(name: &str) -> Result<IfReq> {
        Ok(IfReq {
            ifr_name: name_bytes(name)?,
            ifr_flags: 0,
            _pad: [0; 14],
        })
    }

    fn bridge_request(bridge: &str, cmd: libc::c_ulong, req: &mut IfBReq) -> Result<IfDrv> {
        Ok(IfDrv {
            ifd_name: name_bytes(bridge)?,
            ifd_cmd: cmd,
            ifd_len: std::mem::size_of::<IfBReq>(),
            ifd_data: req as *mut IfBReq as *mut c_void,
        })
    }

    fn bridge_member(member: &str) -> Result<IfBReq> {
        Ok(IfBReq {
            ifbr_ifsname: name_bytes(member)?,
            ifbr_ifsflags: 0,
            ifbr_stpflags: 0,
            ifbr_path_cost: 0,
            ifbr_portno: 0,
            ifbr_priority: 0,
            ifbr_proto: 0,
            ifbr_role: 0,
            ifbr_state: 0,
            ifbr_addrcnt: 0,
            ifbr_addrmax: 0,
            ifbr_addrexceeded: 0,
            _pad: [0; 32],
        })
    }
}

impl LinkControl for SystemLinks {
    fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>> {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if unsafe { libc::getifaddrs(&mut ifaddrs) } != 0 {
            return Err(SwitchError::last_os_error("getifaddrs"));
        }
        let result = collect(ifaddrs);
        unsafe { libc::freeifaddrs(ifaddrs) };
        Ok(result)
    }

    fn flags(&self, name: &str) -> Result<u32> {
        let mut ifr = Self::ifreq(name)?;
        self.ioctl(LinkIoctl::GetFlags, name, &mut ifr)?;
        Ok(ifr.ifr_flags as u16 as u32)
    }

    fn set_flags(&self, name: &str, flags: u32) -> Result<()> {
        let mut ifr = Self::ifreq(name)?;
        ifr.ifr_flags = (flags & 0xffff) as u16 as libc::c_short;
        self.ioctl(LinkIoctl::SetFlags, name, &mut ifr)
    }

    fn create_virtual_peer(&self, name: &str, peer: Option<&str>) -> Result<()> {
        let mut ifr = Self::ifreq(name)?;
        self.ioctl(LinkIoctl::Create, name, &mut ifr)?;

        let Some(peer) = peer else { return Ok(()) };

        let mut req = IfFakeRequest {
            iffr_reserved: [0; 4],
            iffr_peer_name: name_bytes(peer)?,
            _pad: [0; 112],
        };
        let mut drv = IfDrv {
            ifd_name: name_bytes(name)?,
            ifd_cmd: IF_FAKE_S_CMD_SET_PEER,
            ifd_len: std::mem::size_of::<IfFakeRequest>(),
            ifd_data: &mut req as *mut IfFakeRequest as *mut c_void,
        };
        if let Err(e) = self.ioctl(LinkIoctl::SetDriverSpec, &format!("{name} peer {peer}"), &mut drv) {
            let _ = self.destroy(name);
            return Err(e);
        }
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        let mut ifr = Self::ifreq(name)?;
        self.ioctl(LinkIoctl::Destroy, name, &mut ifr)
    }

    fn has_bridge_member(&self, bridge: &str, member: &str) -> Result<bool> {
        let mut req = Self::bridge_member(member)?;
        let mut drv = Self::bridge_request(bridge, BRDGGIFFLGS, &mut req)?;
        match self.try_ioctl(LinkIoctl::GetDriverSpec, &mut drv) {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
            Err(e) => Err(SwitchError::syscall(format!("BRDGGIFFLGS {bridge} {member}"), e)),
        }
    }

    fn bridge_add(&self, bridge: &str, member: &str) -> Result<()> {
        let mut req = Self::bridge_member(member)?;
        let mut drv = Self::bridge_request(bridge, BRDGADD, &mut req)?;
        self.ioctl(LinkIoctl::SetDriverSpec, &format!("BRDGADD {bridge} {member}"), &mut drv)?;
        debug!(bridge, member, "Added bridge member");
        Ok(())
    }
}

fn collect(ifaddrs: *mut libc::ifaddrs) -> Vec<InterfaceDescriptor> {
    let mut order: Vec<String> = Vec::new();
    let mut by_name: HashMap<String, InterfaceDescriptor> = HashMap::new();
    let mut current = ifaddrs;

    while !current.is_null() {
        let entry = unsafe { &*current };
        current = entry.ifa_next;

        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();
        let desc = by_name.entry(name.clone()).or_insert_with(|| {
            order.push(name.clone());
            InterfaceDescriptor::new(name.clone(), InterfaceType::Other(0), entry.ifa_flags)
        });

        if entry.ifa_addr.is_null() {
            continue;
        }
        match unsafe { (*entry.ifa_addr).sa_family } as libc::c_int {
            libc::AF_LINK => {
                let sdl = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_dl) };
                desc.if_type = classify(sdl.sdl_type);
                if sdl.sdl_alen == 6 {
                    // sdl_data may extend past the declared array
                    let base = sdl.sdl_data.as_ptr() as *const u8;
                    let bytes = unsafe { std::slice::from_raw_parts(base.add(sdl.sdl_nlen as usize), 6) };
                    desc.mac = MacAddr::from_slice(bytes);
                }
            }
            libc::AF_INET => {
                let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
                desc.addresses.push(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))));
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in6) };
                desc.addresses.push(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)));
            }
            _ => {}
        }
    }

    order.into_iter().filter_map(|n| by_name.remove(&n)).collect()
}

fn classify(sdl_type: u8) -> InterfaceType {
    match sdl_type {
        IFT_ETHER => InterfaceType::Ethernet,
        IFT_BRIDGE => InterfaceType::Bridge,
        IFT_LOOP => InterfaceType::Loopback,
        other => InterfaceType::Other(other as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_types() {
        assert_eq!(classify(IFT_ETHER), InterfaceType::Ethernet);
        assert_eq!(classify(IFT_BRIDGE), InterfaceType::Bridge);
        assert_eq!(classify(IFT_LOOP), InterfaceType::Loopback);
        assert_eq!(classify(0x47), InterfaceType::Other(0x47));
    }

    #[test]
    fn bridge_request_layout() {
        use std::mem::offset_of;

        assert_eq!(offset_of!(IfBReq, ifbr_portno), 28);
        assert_eq!(offset_of!(IfBReq, ifbr_state), 32);
        assert_eq!(offset_of!(IfBReq, ifbr_addrcnt), 36);
        assert_eq!(offset_of!(IfBReq, _pad), 48);

        let mut req = SystemLinks::bridge_member("feth0").unwrap();
        let drv = SystemLinks::bridge_request("bridge0", BRDGGIFFLGS, &mut req).unwrap();
        assert_eq!(drv.ifd_len, 80);
    }

    #[test]
    fn enumerates_loopback() {
        let links = SystemLinks::new().unwrap();
        let lo = links
            .interfaces()
            .unwrap()
            .into_iter()
            .find(|i| i.name == "lo0")
            .expect("lo0 present");
        assert!(lo.is_loopback());
        assert_eq!(lo.if_type, InterfaceType::Loopback);
    }
}
