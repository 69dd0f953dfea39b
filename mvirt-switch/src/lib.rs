//! mvirt-switch: packet switch between host interfaces and VM socket pairs.
//!
//! Each VM network device gets a `SwitchPort`: a filtered raw capture path
//! and a transmit path on a host interface, plus a datagram socket pair whose
//! far end is handed to the VMM. A single event loop thread relays frames
//! in both directions for all ports.
//!
//! # Architecture
//!
//! ```text
//! host LAN <--> br0 <--> peer A ==== peer B <--> capture/transmit
//!                                                      |
//!                                         SwitchPort (host side) <--> VM side <--> VMM
//! ```
//!
//! Ports on a plain interface skip the peer pair and capture on it directly.

pub mod capture;
pub mod config;
pub mod error;
pub mod filter;
pub mod iface;
pub mod mac;
pub mod port;
pub mod report;
pub mod switch;
pub mod test_util;

pub use config::{RelayPolicy, SwitchConfig};
pub use error::{Result, SwitchError};
pub use filter::{BroadcastPolicy, FilterProgram, Verdict};
pub use iface::{InterfaceDescriptor, InterfaceRegistry, InterfaceType, LinkControl, VirtualPeerPair};
pub use mac::MacAddr;
pub use port::{PortStats, SwitchPort};
pub use report::{Reporter, Severity};
pub use switch::{Switch, VmAttachment};
