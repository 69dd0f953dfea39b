//! Test utilities: in-memory link control, canned capture sources, and frame builders.
//!
//! Nothing here needs privileges, so the port and event loop can be tested
//! without touching the host's interfaces.

pub mod capture;
pub mod links;
pub mod packets;

pub use capture::{CannedCapture, CaptureFeed};
pub use links::FakeLinks;
pub use packets::{ETHERTYPE_IPV4, append_bpf_record, ethernet_frame};
