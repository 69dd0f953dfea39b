//! One bridging session between a host interface and a VM socket.
//!
//! A port owns a filtered capture path and a transmit path on the resolved
//! host interface, plus a connected datagram socket pair. The host end of
//! the pair is relayed by the switch; the VM end is handed to the VMM.
//! When the requested interface is a bridge, a virtual peer pair is created
//! and the port runs on its VM-facing end.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::Arc;

use nix::sys::socket::{setsockopt, sockopt};
use tracing::{debug, info, trace};

use crate::capture::{self, CaptureOptions, CaptureSource, CaptureStats, FrameSink, ReadinessEvent};
use crate::config::{RelayPolicy, SwitchConfig};
use crate::error::{OsContext, Result, SwitchError, check_interface_name};
use crate::filter::{BroadcastPolicy, FilterProgram};
use crate::iface::{InterfaceRegistry, VirtualPeerPair};
use crate::mac::MacAddr;
use crate::report::{Reporter, Severity, keys};

/// Upper bound on datagrams moved VM→host per readiness event when draining.
pub const MAX_DRAIN_DATAGRAMS: usize = 64;

/// Relay counters for one port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    pub frames_to_vm: u64,
    pub bytes_to_vm: u64,
    pub frames_to_host: u64,
    pub bytes_to_host: u64,
    /// Frames lost to failed or short writes
    pub dropped: u64,
    /// Capture batches cut short by a malformed record
    pub record_errors: u64,
}

pub struct SwitchPort {
    host_interface: String,
    resolved_interface: String,
    mac: MacAddr,
    peers: Option<VirtualPeerPair>,
    registry: Option<InterfaceRegistry>,
    host_side: Option<UnixDatagram>,
    vm_side: Option<UnixDatagram>,
    capture: Option<Box<dyn CaptureSource>>,
    transmit: Option<Box<dyn FrameSink>>,
    capture_buf: Vec<u8>,
    local_buf: Vec<u8>,
    relay_policy: RelayPolicy,
    reporter: Arc<Reporter>,
    stats: PortStats,
    closed: bool,
}

impl std::fmt::Debug for SwitchPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchPort")
            .field("host_interface", &self.host_interface)
            .field("resolved_interface", &self.resolved_interface)
            .field("mac", &self.mac)
            .field("peers", &self.peers)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl SwitchPort {
    fn empty(host_interface: &str, mac: MacAddr, config: &SwitchConfig, reporter: Arc<Reporter>) -> Self {
        Self {
            host_interface: host_interface.to_string(),
            resolved_interface: host_interface.to_string(),
            mac,
            peers: None,
            registry: None,
            host_side: None,
            vm_side: None,
            capture: None,
            transmit: None,
            capture_buf: Vec::new(),
            local_buf: vec![0u8; config.capture_buffer_size],
            relay_policy: config.relay_policy,
            reporter,
            stats: PortStats::default(),
            closed: false,
        }
    }

    /// Open a port on `host_interface` for a guest using `mac`.
    ///
    /// Everything acquired before a failure is released, including virtual
    /// peers created for a bridge.
    pub fn open(
        registry: &InterfaceRegistry,
        host_interface: &str,
        mac: MacAddr,
        config: &SwitchConfig,
        reporter: Arc<Reporter>,
    ) -> Result<Self> {
        check_interface_name(host_interface)?;
        let mut port = Self::empty(host_interface, mac, config, reporter);

        let is_bridge = registry
            .find_interface(host_interface)?
            .is_some_and(|i| i.is_bridge());

        if is_bridge {
            let pair = registry.create_virtual_peer_pair()?;
            port.resolved_interface = pair.vm_side.clone();
            port.peers = Some(pair);
            port.registry = Some(registry.clone());

            if let Some(pair) = &port.peers {
                registry.ensure_bridge_membership(host_interface, &pair.bridge_side)?;
            }
        }

        port.attach_local_pair(config)?;
        port.transmit = Some(capture::open_transmit(&port.resolved_interface)?);

        let filter = FilterProgram::new(mac, broadcast_policy(config), snaplen(config));
        let opts = CaptureOptions {
            buffer_size: config.capture_buffer_size,
            promiscuous: true,
        };
        let capture = capture::open_capture(&port.resolved_interface, &filter, opts)?;
        port.capture_buf = vec![0u8; capture.read_buffer_size()];
        port.capture = Some(capture);

        info!(
            host_interface,
            resolved = %port.resolved_interface,
            mac = %mac,
            bridge_backed = port.is_bridge_backed(),
            "Port opened"
        );
        Ok(port)
    }

    /// Build a port around caller-supplied capture and transmit paths.
    pub fn from_parts(
        host_interface: &str,
        mac: MacAddr,
        capture: Box<dyn CaptureSource>,
        transmit: Box<dyn FrameSink>,
        config: &SwitchConfig,
        reporter: Arc<Reporter>,
    ) -> Result<Self> {
        let mut port = Self::empty(host_interface, mac, config, reporter);
        port.attach_local_pair(config)?;
        port.capture_buf = vec![0u8; capture.read_buffer_size()];
        port.capture = Some(capture);
        port.transmit = Some(transmit);
        Ok(port)
    }

    fn attach_local_pair(&mut self, config: &SwitchConfig) -> Result<()> {
        let (host_side, vm_side) = UnixDatagram::pair().os_context(|| "socketpair(AF_UNIX, SOCK_DGRAM)".to_string())?;
        for sock in [&host_side, &vm_side] {
            setsockopt(sock, sockopt::SndBuf, &config.local_buffer_size)
                .os_context(|| format!("SO_SNDBUF {}", self.host_interface))?;
            setsockopt(sock, sockopt::RcvBuf, &config.local_buffer_size)
                .os_context(|| format!("SO_RCVBUF {}", self.host_interface))?;
        }
        host_side
            .set_nonblocking(true)
            .os_context(|| format!("O_NONBLOCK {}", self.host_interface))?;
        self.host_side = Some(host_side);
        self.vm_side = Some(vm_side);
        Ok(())
    }

    pub fn host_interface(&self) -> &str {
        &self.host_interface
    }

    /// Interface the capture and transmit paths are bound to.
    pub fn resolved_interface(&self) -> &str {
        &self.resolved_interface
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn peers(&self) -> Option<&VirtualPeerPair> {
        self.peers.as_ref()
    }

    pub fn is_bridge_backed(&self) -> bool {
        self.peers.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> PortStats {
        self.stats
    }

    pub fn capture_stats(&mut self) -> Option<CaptureStats> {
        self.capture.as_mut()?.stats()
    }

    /// `(bridge, member)` this port keeps attached, if bridge-backed.
    pub fn bridge_membership(&self) -> Option<(&str, &str)> {
        self.peers
            .as_ref()
            .map(|p| (self.host_interface.as_str(), p.bridge_side.as_str()))
    }

    pub fn vm_socket(&self) -> Option<&UnixDatagram> {
        self.vm_side.as_ref()
    }

    /// Duplicate of the VM end for handing to the VMM.
    pub fn attach_vm(&self) -> Result<OwnedFd> {
        let vm_side = self
            .vm_side
            .as_ref()
            .ok_or_else(|| SwitchError::IllegalState(format!("port {} is closed", self.host_interface)))?;
        vm_side
            .as_fd()
            .try_clone_to_owned()
            .os_context(|| format!("dup VM socket for {}", self.host_interface))
    }

    pub fn capture_fd(&self) -> Option<RawFd> {
        self.capture.as_ref().map(|c| c.as_fd().as_raw_fd())
    }

    pub fn host_fd(&self) -> Option<RawFd> {
        self.host_side.as_ref().map(|s| s.as_raw_fd())
    }

    /// Run the relay matching `event`. Returns false if the descriptor is not ours.
    pub fn route_traffic(&mut self, event: &ReadinessEvent) -> bool {
        if self.capture_fd() == Some(event.fd) {
            self.host_to_vm(event);
            return true;
        }
        if self.host_fd() == Some(event.fd) {
            self.vm_to_host(event, self.relay_policy == RelayPolicy::DrainReported);
            return true;
        }
        false
    }

    /// Relay one capture read to the VM, record by record.
    pub fn host_to_vm(&mut self, event: &ReadinessEvent) {
        let (Some(source), Some(host_side)) = (self.capture.as_mut(), self.host_side.as_ref()) else {
            return;
        };
        let reporter = &self.reporter;
        let ctx = self.resolved_interface.as_str();
        trace!(interface = ctx, fd = event.fd, available = event.available, "Capture readable");

        let n = match source.read_batch(&mut self.capture_buf) {
            Ok(0) => {
                reporter.report(
                    Severity::Warn,
                    ctx,
                    Some(keys::HOST_TO_VM_EOF),
                    format_args!("capture returned EOF"),
                );
                return;
            }
            Ok(n) => n,
            Err(e) if is_transient(&e) => return,
            Err(e) => {
                reporter.report(
                    Severity::Error,
                    ctx,
                    Some(keys::HOST_TO_VM_READ_FAILED),
                    format_args!("capture read failed: {e}"),
                );
                return;
            }
        };

        for record in capture::records(&self.capture_buf[..n], source.record_format()) {
            let frame = match record {
                Ok([]) => continue,
                Ok(frame) => frame,
                Err(e) => {
                    self.stats.record_errors += 1;
                    reporter.report(
                        Severity::Warn,
                        ctx,
                        Some(keys::HOST_TO_VM_RECORD_BOUNDS),
                        format_args!("dropping rest of capture batch: {e}"),
                    );
                    break;
                }
            };

            match host_side.send(frame) {
                Ok(written) if written == frame.len() => {
                    self.stats.frames_to_vm += 1;
                    self.stats.bytes_to_vm += written as u64;
                }
                Ok(written) => {
                    self.stats.dropped += 1;
                    reporter.report(
                        Severity::Warn,
                        ctx,
                        Some(keys::HOST_TO_VM_WRITE_PARTIAL),
                        format_args!("short write to VM: {written} of {} bytes", frame.len()),
                    );
                }
                Err(e) => {
                    self.stats.dropped += 1;
                    reporter.report(
                        Severity::Warn,
                        ctx,
                        Some(keys::HOST_TO_VM_WRITE_FAILED),
                        format_args!("write to VM failed: {e}"),
                    );
                }
            }
        }
    }

    /// Relay datagrams from the VM to the wire.
    ///
    /// Without `drain_all` exactly one read/write cycle runs. With it, reads
    /// continue until the socket would block, at most `MAX_DRAIN_DATAGRAMS`.
    pub fn vm_to_host(&mut self, event: &ReadinessEvent, drain_all: bool) {
        let (Some(transmit), Some(host_side)) = (self.transmit.as_mut(), self.host_side.as_ref()) else {
            return;
        };
        let reporter = &self.reporter;
        let ctx = self.resolved_interface.as_str();
        trace!(interface = ctx, fd = event.fd, available = event.available, "VM socket readable");

        // FIONREAD on a datagram socket only covers the next datagram, so it
        // cannot bound a drain.
        let limit = if drain_all { MAX_DRAIN_DATAGRAMS } else { 1 };

        for _ in 0..limit {
            let n = match host_side.recv(&mut self.local_buf) {
                Ok(0) => {
                    reporter.report(
                        Severity::Warn,
                        ctx,
                        Some(keys::VM_TO_HOST_EOF),
                        format_args!("VM socket returned EOF"),
                    );
                    break;
                }
                Ok(n) => n,
                Err(e) if is_transient(&e) => break,
                Err(e) => {
                    reporter.report(
                        Severity::Error,
                        ctx,
                        Some(keys::VM_TO_HOST_READ_FAILED),
                        format_args!("VM socket read failed: {e}"),
                    );
                    break;
                }
            };

            let frame = &self.local_buf[..n];
            match transmit.send_frame(frame) {
                Ok(written) if written == n => {
                    self.stats.frames_to_host += 1;
                    self.stats.bytes_to_host += written as u64;
                }
                Ok(written) => {
                    self.stats.dropped += 1;
                    reporter.report(
                        Severity::Warn,
                        ctx,
                        Some(keys::VM_TO_HOST_WRITE_PARTIAL),
                        format_args!("short write to host: {written} of {n} bytes"),
                    );
                }
                Err(e) => {
                    self.stats.dropped += 1;
                    reporter.report(
                        Severity::Warn,
                        ctx,
                        Some(keys::VM_TO_HOST_WRITE_FAILED),
                        format_args!("write to host failed: {e}"),
                    );
                }
            }
        }
    }

    /// Close all descriptors and delete any virtual peers. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.capture = None;
        self.transmit = None;
        self.host_side = None;
        self.vm_side = None;

        if let (Some(pair), Some(registry)) = (&self.peers, &self.registry) {
            for name in [&pair.vm_side, &pair.bridge_side] {
                if let Err(e) = registry.delete_interface(name) {
                    debug!(name = %name, error = %e, "Virtual peer cleanup failed");
                }
            }
        }

        info!(
            host_interface = %self.host_interface,
            mac = %self.mac,
            frames_to_vm = self.stats.frames_to_vm,
            frames_to_host = self.stats.frames_to_host,
            dropped = self.stats.dropped,
            "Port closed"
        );
    }
}

impl Drop for SwitchPort {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

fn broadcast_policy(config: &SwitchConfig) -> BroadcastPolicy {
    if config.accept_broadcast {
        BroadcastPolicy::Accept
    } else {
        BroadcastPolicy::Reject
    }
}

fn snaplen(config: &SwitchConfig) -> u32 {
    u32::try_from(config.capture_buffer_size).unwrap_or(u32::MAX)
}
