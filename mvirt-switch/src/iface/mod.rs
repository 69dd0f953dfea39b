//! Host interface discovery, virtual peer links, and bridge membership.
//!
//! `InterfaceRegistry` holds the platform-independent logic (name
//! allocation, idempotent flag updates, pair creation with cleanup). The OS
//! primitives sit behind `LinkControl`.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "linux")]
pub use linux::SystemLinks;
#[cfg(target_os = "macos")]
pub use macos::SystemLinks;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Result, SwitchError};
use crate::mac::MacAddr;

/// Name prefix of switch-owned virtual peers.
#[cfg(target_os = "macos")]
pub const VIRTUAL_PEER_PREFIX: &str = "feth";
#[cfg(not(target_os = "macos"))]
pub const VIRTUAL_PEER_PREFIX: &str = "mvsw";

/// Virtual peers are named `<prefix>0` through `<prefix>127`.
pub const MAX_VIRTUAL_PEERS: u32 = 128;

const IFF_UP: u32 = libc::IFF_UP as u32;
const IFF_RUNNING: u32 = libc::IFF_RUNNING as u32;
const IFF_LOOPBACK: u32 = libc::IFF_LOOPBACK as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Ethernet,
    Bridge,
    Loopback,
    /// Raw platform type code (ARPHRD_* or IFT_*)
    Other(u32),
}

/// Snapshot of one host interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub mac: Option<MacAddr>,
    pub addresses: Vec<IpAddr>,
    pub if_type: InterfaceType,
    pub flags: u32,
}

impl InterfaceDescriptor {
    pub fn new(name: impl Into<String>, if_type: InterfaceType, flags: u32) -> Self {
        Self {
            name: name.into(),
            mac: None,
            addresses: Vec::new(),
            if_type,
            flags,
        }
    }

    pub fn is_bridge(&self) -> bool {
        self.if_type == InterfaceType::Bridge
    }

    pub fn is_loopback(&self) -> bool {
        self.flags & IFF_LOOPBACK != 0
    }

    pub fn is_virtual_peer(&self) -> bool {
        is_virtual_peer_name(&self.name)
    }

    pub fn is_up(&self) -> bool {
        self.flags & IFF_UP != 0
    }
}

/// `<prefix><decimal index>`, nothing else.
pub fn is_virtual_peer_name(name: &str) -> bool {
    name.strip_prefix(VIRTUAL_PEER_PREFIX)
        .is_some_and(|idx| !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()))
}

/// Two ends of a point-to-point Ethernet link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualPeerPair {
    /// Attached to the host bridge
    pub bridge_side: String,
    /// Captured and transmitted on by the port
    pub vm_side: String,
}

/// OS primitives used by the registry.
pub trait LinkControl: Send + Sync {
    /// Full enumeration, aggregated per interface in first-seen order.
    fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>>;

    fn flags(&self, name: &str) -> Result<u32>;

    fn set_flags(&self, name: &str, flags: u32) -> Result<()>;

    /// Create `name`; when `peer` is given, link the two as a pair.
    fn create_virtual_peer(&self, name: &str, peer: Option<&str>) -> Result<()>;

    fn destroy(&self, name: &str) -> Result<()>;

    /// Whether `member` is attached to `bridge`. "Not a member" is `Ok(false)`.
    fn has_bridge_member(&self, bridge: &str, member: &str) -> Result<bool>;

    fn bridge_add(&self, bridge: &str, member: &str) -> Result<()>;
}

/// Handle for interface operations. Cheap to clone.
#[derive(Clone)]
pub struct InterfaceRegistry {
    control: Arc<dyn LinkControl>,
}

impl std::fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceRegistry").finish_non_exhaustive()
    }
}

impl InterfaceRegistry {
    pub fn new(control: Arc<dyn LinkControl>) -> Self {
        Self { control }
    }

    /// Registry backed by the host OS.
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    pub fn system() -> Result<Self> {
        Ok(Self::new(Arc::new(SystemLinks::new()?)))
    }

    pub fn list_interfaces(&self) -> Result<Vec<InterfaceDescriptor>> {
        self.control.interfaces()
    }

    pub fn find_interface(&self, name: &str) -> Result<Option<InterfaceDescriptor>> {
        Ok(self.list_interfaces()?.into_iter().find(|i| i.name == name))
    }

    /// Set or clear UP|RUNNING. No write is issued when nothing changes.
    pub fn set_interface_up(&self, name: &str, up: bool) -> Result<()> {
        let current = self.control.flags(name)? & 0xffff;
        let mask = IFF_UP | IFF_RUNNING;
        let desired = if up { current | mask } else { current & !mask } & 0xffff;

        if desired == current {
            debug!(name, up, "Interface already in desired state");
            return Ok(());
        }

        self.control.set_flags(name, desired)?;
        debug!(name, up, flags = desired, "Interface flags updated");
        Ok(())
    }

    /// Create the lowest-numbered free virtual peer, optionally linked to `peer`.
    pub fn create_virtual_peer(&self, peer: Option<&str>) -> Result<String> {
        let taken: HashSet<String> = self
            .list_interfaces()?
            .into_iter()
            .map(|i| i.name)
            .collect();

        let name = (0..MAX_VIRTUAL_PEERS)
            .map(|i| format!("{VIRTUAL_PEER_PREFIX}{i}"))
            .find(|n| !taken.contains(n))
            .ok_or_else(|| {
                SwitchError::IllegalState(format!(
                    "all {MAX_VIRTUAL_PEERS} {VIRTUAL_PEER_PREFIX} interfaces in use"
                ))
            })?;

        self.control.create_virtual_peer(&name, peer)?;
        info!(name = %name, peer, "Created virtual peer");
        Ok(name)
    }

    /// Create a linked pair and bring both ends up.
    ///
    /// On failure, whatever was created is destroyed before returning.
    pub fn create_virtual_peer_pair(&self) -> Result<VirtualPeerPair> {
        let bridge_side = self.create_virtual_peer(None)?;

        let vm_side = match self.create_virtual_peer(Some(&bridge_side)) {
            Ok(name) => name,
            Err(e) => {
                self.cleanup(&[&bridge_side]);
                return Err(e);
            }
        };

        let up = self
            .set_interface_up(&bridge_side, true)
            .and_then(|_| self.set_interface_up(&vm_side, true));
        if let Err(e) = up {
            self.cleanup(&[&vm_side, &bridge_side]);
            return Err(e);
        }

        Ok(VirtualPeerPair {
            bridge_side,
            vm_side,
        })
    }

    pub fn delete_interface(&self, name: &str) -> Result<()> {
        self.control.destroy(name)?;
        info!(name, "Deleted interface");
        Ok(())
    }

    /// Attach `member` to `bridge` unless it already is. Returns whether it was added.
    pub fn ensure_bridge_membership(&self, bridge: &str, member: &str) -> Result<bool> {
        if self.control.has_bridge_member(bridge, member)? {
            return Ok(false);
        }
        self.control.bridge_add(bridge, member)?;
        Ok(true)
    }

    fn cleanup(&self, names: &[&str]) {
        for name in names {
            if let Err(e) = self.control.destroy(name) {
                warn!(name, error = %e, "Failed to clean up virtual peer");
            }
        }
    }
}
