//! Linux link control: getifaddrs, SIOC* ioctls, sysfs, and `ip link` for veth.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::process::Command;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::if_nametoindex;
use tracing::debug;

use super::{InterfaceDescriptor, InterfaceType, LinkControl};
use crate::error::{OsContext, Result, SwitchError, check_interface_name};
use crate::mac::MacAddr;

const SYSFS_NET: &str = "/sys/class/net";

const ARPHRD_ETHER: u32 = 1;
const ARPHRD_LOOPBACK: u32 = 772;

/// Interface control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkIoctl {
    GetFlags,
    SetFlags,
    BridgeAddIf,
}

impl LinkIoctl {
    const fn code(self) -> libc::c_ulong {
        match self {
            LinkIoctl::GetFlags => 0x8913,
            LinkIoctl::SetFlags => 0x8914,
            LinkIoctl::BridgeAddIf => 0x89a2,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            LinkIoctl::GetFlags => "SIOCGIFFLAGS",
            LinkIoctl::SetFlags => "SIOCSIFFLAGS",
            LinkIoctl::BridgeAddIf => "SIOCBRADDIF",
        }
    }
}

/// Host-backed `LinkControl`.
pub struct SystemLinks {
    sock: OwnedFd,
}

impl SystemLinks {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(SwitchError::last_os_error("socket(AF_INET) for interface control"));
        }
        Ok(Self {
            sock: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn ifreq(name: &str) -> Result<libc::ifreq> {
        check_interface_name(name)?;
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        Ok(ifr)
    }

    fn ioctl(&self, request: LinkIoctl, target: &str, ifr: &mut libc::ifreq) -> Result<()> {
        let ret = unsafe { libc::ioctl(self.sock.as_raw_fd(), request.code() as libc::Ioctl, ifr as *mut libc::ifreq) };
        if ret < 0 {
            return Err(SwitchError::last_os_error(format!("{} {target}", request.name())));
        }
        Ok(())
    }
}

impl LinkControl for SystemLinks {
    fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>> {
        let addrs = getifaddrs().os_context(|| "getifaddrs".to_string())?;

        let mut order: Vec<String> = Vec::new();
        let mut by_name: HashMap<String, InterfaceDescriptor> = HashMap::new();

        for entry in addrs {
            let name = entry.interface_name;
            let desc = by_name.entry(name.clone()).or_insert_with(|| {
                order.push(name.clone());
                InterfaceDescriptor::new(name.clone(), interface_type(&name), entry.flags.bits() as u32)
            });

            let Some(addr) = entry.address else { continue };
            if let Some(link) = addr.as_link_addr() {
                if let Some(mac) = link.addr() {
                    desc.mac = Some(MacAddr(mac));
                }
            } else if let Some(v4) = addr.as_sockaddr_in() {
                desc.addresses.push(IpAddr::V4(v4.ip()));
            } else if let Some(v6) = addr.as_sockaddr_in6() {
                desc.addresses.push(IpAddr::V6(v6.ip()));
            }
        }

        Ok(order.into_iter().filter_map(|n| by_name.remove(&n)).collect())
    }

    fn flags(&self, name: &str) -> Result<u32> {
        let mut ifr = Self::ifreq(name)?;
        self.ioctl(LinkIoctl::GetFlags, name, &mut ifr)?;
        Ok(unsafe { ifr.ifr_ifru.ifru_flags } as u16 as u32)
    }

    fn set_flags(&self, name: &str, flags: u32) -> Result<()> {
        let mut ifr = Self::ifreq(name)?;
        ifr.ifr_ifru.ifru_flags = (flags & 0xffff) as u16 as libc::c_short;
        self.ioctl(LinkIoctl::SetFlags, name, &mut ifr)
    }

    /// veth ends are always created in pairs; an unlinked end gets a
    /// `<name>.p` placeholder that a later linked create renames.
    fn create_virtual_peer(&self, name: &str, peer: Option<&str>) -> Result<()> {
        check_interface_name(name)?;
        match peer {
            None => {
                let placeholder = placeholder_name(name);
                check_interface_name(&placeholder)?;
                ip(&["link", "add", name, "type", "veth", "peer", "name", &placeholder])
            }
            Some(peer) => {
                let placeholder = placeholder_name(peer);
                ip(&["link", "set", "dev", &placeholder, "name", name])
            }
        }
    }

    fn destroy(&self, name: &str) -> Result<()> {
        check_interface_name(name)?;
        ip(&["link", "del", "dev", name])
    }

    fn has_bridge_member(&self, bridge: &str, member: &str) -> Result<bool> {
        check_interface_name(bridge)?;
        check_interface_name(member)?;
        let bridge_dir = Path::new(SYSFS_NET).join(bridge).join("bridge");
        if !bridge_dir.is_dir() {
            return Err(SwitchError::syscall(
                format!("bridge {bridge}"),
                io::Error::from_raw_os_error(libc::ENODEV),
            ));
        }
        Ok(Path::new(SYSFS_NET).join(bridge).join("brif").join(member).exists())
    }

    fn bridge_add(&self, bridge: &str, member: &str) -> Result<()> {
        let index = if_nametoindex(member).os_context(|| format!("if_nametoindex {member}"))?;
        let mut ifr = Self::ifreq(bridge)?;
        ifr.ifr_ifru.ifru_ifindex = index as libc::c_int;
        self.ioctl(LinkIoctl::BridgeAddIf, &format!("{bridge} {member}"), &mut ifr)?;
        debug!(bridge, member, "Added bridge member");
        Ok(())
    }
}

fn placeholder_name(name: &str) -> String {
    format!("{name}.p")
}

/// Classify from sysfs; unknown interfaces come back as `Other(0)`.
fn interface_type(name: &str) -> InterfaceType {
    let dir = Path::new(SYSFS_NET).join(name);
    let arphrd = fs::read_to_string(dir.join("type"))
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .unwrap_or(0);
    classify(arphrd, dir.join("bridge").is_dir())
}

fn classify(arphrd: u32, has_bridge_dir: bool) -> InterfaceType {
    match arphrd {
        ARPHRD_ETHER if has_bridge_dir => InterfaceType::Bridge,
        ARPHRD_ETHER => InterfaceType::Ethernet,
        ARPHRD_LOOPBACK => InterfaceType::Loopback,
        other => InterfaceType::Other(other),
    }
}

fn ip(args: &[&str]) -> Result<()> {
    let context = || format!("ip {}", args.join(" "));
    let output = Command::new("ip").args(args).output().os_context(context)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SwitchError::syscall(context(), io::Error::other(stderr.trim().to_string())));
    }
    debug!(command = %context(), "ip command succeeded");
    Ok(())
}
