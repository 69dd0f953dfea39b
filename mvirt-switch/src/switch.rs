//! Switch controller and its single-threaded event loop.
//!
//! Ports are registered up front; `start` moves them onto a dedicated
//! thread that polls every port's capture and VM-side descriptors and runs
//! the matching relay. Cancellation is a flag checked once per poll round,
//! so the loop exits within one poll timeout.

use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, error, info};

use crate::capture::{ReadinessEvent, pending_bytes};
use crate::config::SwitchConfig;
use crate::error::{Result, SwitchError};
use crate::iface::InterfaceRegistry;
use crate::mac::MacAddr;
use crate::port::SwitchPort;
use crate::report::{Reporter, Severity, keys};

/// What the VMM needs to use a port.
#[derive(Debug)]
pub struct VmAttachment {
    /// Duplicate of the VM end of the port's socket pair
    pub fd: OwnedFd,
    pub mac: MacAddr,
    pub host_interface: String,
}

struct Worker {
    thread: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

pub struct Switch {
    registry: InterfaceRegistry,
    config: SwitchConfig,
    reporter: Arc<Reporter>,
    pending: Vec<SwitchPort>,
    memberships: Vec<(String, String)>,
    port_count: usize,
    cancel: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl Switch {
    pub fn new(registry: InterfaceRegistry, config: SwitchConfig) -> Self {
        let reporter = Arc::new(Reporter::new(config.throttle_window));
        Self {
            registry,
            config,
            reporter,
            pending: Vec::new(),
            memberships: Vec::new(),
            port_count: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }

    pub fn registry(&self) -> &InterfaceRegistry {
        &self.registry
    }

    /// Open a port on `host_interface` and register it.
    pub fn add_port(&mut self, host_interface: &str, mac: MacAddr) -> Result<VmAttachment> {
        self.ensure_not_started()?;
        let port = SwitchPort::open(
            &self.registry,
            host_interface,
            mac,
            &self.config,
            self.reporter.clone(),
        )?;
        self.register_port(port)
    }

    /// Register an already opened port. Fails once the loop has started.
    pub fn register_port(&mut self, port: SwitchPort) -> Result<VmAttachment> {
        self.ensure_not_started()?;

        let fd = port.attach_vm()?;
        if let Some((bridge, member)) = port.bridge_membership() {
            self.memberships.push((bridge.to_string(), member.to_string()));
        }
        let attachment = VmAttachment {
            fd,
            mac: port.mac(),
            host_interface: port.host_interface().to_string(),
        };

        info!(
            host_interface = %attachment.host_interface,
            mac = %attachment.mac,
            "Port registered"
        );
        self.pending.push(port);
        self.port_count += 1;
        Ok(attachment)
    }

    pub fn port_count(&self) -> usize {
        self.port_count
    }

    pub fn is_started(&self) -> bool {
        self.worker.is_some()
    }

    fn ensure_not_started(&self) -> Result<()> {
        if self.is_started() {
            return Err(SwitchError::IllegalState(
                "ports cannot be added after the switch has started".to_string(),
            ));
        }
        Ok(())
    }

    /// Move all registered ports onto the forwarding thread.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_not_started()?;

        let (done_tx, done) = crossbeam_channel::bounded(1);
        let event_loop = EventLoop {
            ports: std::mem::take(&mut self.pending),
            cancel: self.cancel.clone(),
            reporter: self.reporter.clone(),
            timeout: PollTimeout::from(self.config.poll_timeout_ms()),
        };

        let thread = thread::Builder::new()
            .name("mvirt-switch".to_string())
            .spawn(move || {
                let _done = DoneSignal(done_tx);
                event_loop.run();
            })
            .map_err(|e| SwitchError::syscall("spawn switch thread", e))?;

        self.worker = Some(Worker {
            thread: Some(thread),
            done,
        });
        Ok(())
    }

    /// Ask the loop to stop. It closes every port on its way out.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        match &self.worker {
            Some(w) => w.thread.as_ref().is_none_or(|t| t.is_finished()),
            None => false,
        }
    }

    /// Wait up to `timeout` for the loop to exit. True if it has (or never started).
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let Some(worker) = self.worker.as_mut() else {
            return true;
        };
        match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = worker.thread.take()
                    && thread.join().is_err()
                {
                    error!("Switch thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => worker.thread.is_none(),
        }
    }

    pub fn cancel_and_join(&mut self, timeout: Duration) -> bool {
        self.cancel();
        self.join_timeout(timeout)
    }

    /// Re-attach any bridge-side peer that fell out of its bridge.
    ///
    /// Skipped after cancellation. Returns how many members were re-added.
    pub fn ensure_bridge_membership(&self) -> usize {
        if self.is_cancelled() {
            return 0;
        }

        let mut added = 0;
        for (bridge, member) in &self.memberships {
            match self.registry.ensure_bridge_membership(bridge, member) {
                Ok(true) => {
                    info!(bridge = %bridge, member = %member, "Re-added bridge member");
                    added += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    self.reporter.report(
                        Severity::Error,
                        bridge,
                        Some(keys::MEMBERSHIP_FAILED),
                        format_args!("membership check for {member} failed: {e}"),
                    );
                }
            }
        }
        added
    }
}

impl Drop for Switch {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let timeout = self.config.poll_timeout * 2;
            if !self.cancel_and_join(timeout) {
                debug!("Switch thread still running at drop");
            }
        }
    }
}

/// Signals the controller when the loop thread exits, panic included.
struct DoneSignal(Sender<()>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

struct EventLoop {
    ports: Vec<SwitchPort>,
    cancel: Arc<AtomicBool>,
    reporter: Arc<Reporter>,
    timeout: PollTimeout,
}

impl EventLoop {
    /// Capture and VM-side descriptors of every port, in registration order.
    fn registrations(&self) -> Vec<RawFd> {
        self.ports
            .iter()
            .flat_map(|p| [p.capture_fd(), p.host_fd()])
            .flatten()
            .collect()
    }

    fn run(mut self) {
        let mut fds = self.registrations();
        info!(ports = self.ports.len(), descriptors = fds.len(), "Switch started");

        while !self.cancel.load(Ordering::SeqCst) {
            let ready = match self.wait(&fds) {
                Some(ready) => ready,
                None => continue,
            };

            for (fd, revents) in ready {
                self.dispatch(&mut fds, fd, revents);
            }
        }

        for port in &mut self.ports {
            port.close();
        }
        info!("Switch stopped");
    }

    /// Handle one ready descriptor. Unusable descriptors are dropped from `fds`.
    fn dispatch(&mut self, fds: &mut Vec<RawFd>, fd: RawFd, revents: PollFlags) {
        if revents.intersects(PollFlags::POLLNVAL)
            || (revents.contains(PollFlags::POLLHUP) && !revents.contains(PollFlags::POLLIN))
        {
            self.reporter.report(
                Severity::Error,
                "switch",
                Some(keys::EVENT_ERROR),
                format_args!("descriptor {fd} unusable ({revents:?}), unregistering"),
            );
            fds.retain(|f| *f != fd);
            return;
        }
        if revents.contains(PollFlags::POLLERR) {
            self.reporter.report(
                Severity::Warn,
                "switch",
                Some(keys::EVENT_ERROR),
                format_args!("error condition on descriptor {fd}"),
            );
        }

        let event = ReadinessEvent::new(fd, pending_bytes(fd).unwrap_or(0));
        if !self.ports.iter_mut().any(|p| p.route_traffic(&event)) {
            self.reporter.report(
                Severity::Warn,
                "switch",
                Some(keys::EVENT_NO_ROUTE),
                format_args!("no port owns descriptor {fd}"),
            );
        }
    }

    /// One bounded wait. `None` on timeout or a retryable error.
    fn wait(&self, fds: &[RawFd]) -> Option<Vec<(RawFd, PollFlags)>> {
        // Ports stay open until the loop exits, so every registered fd is live.
        let mut pollfds: Vec<PollFd> = fds
            .iter()
            .map(|fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN))
            .collect();

        match poll(&mut pollfds, self.timeout) {
            Ok(0) => None,
            Ok(_) => Some(
                pollfds
                    .iter()
                    .zip(fds)
                    .filter_map(|(p, fd)| p.revents().filter(|r| !r.is_empty()).map(|r| (*fd, r)))
                    .collect(),
            ),
            Err(Errno::EINTR | Errno::EAGAIN) => None,
            Err(e) => {
                self.reporter.report(
                    Severity::Error,
                    "switch",
                    Some(keys::POLL_FAILED),
                    format_args!("poll failed: {e}"),
                );
                thread::sleep(Duration::from_millis(100));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::RecordFormat;
    use crate::iface::InterfaceType;
    use crate::test_util::{CannedCapture, CaptureFeed, ETHERTYPE_IPV4, FakeLinks, ethernet_frame};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixDatagram;

    const VM_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc]);

    fn test_config() -> SwitchConfig {
        SwitchConfig {
            local_buffer_size: 128 * 1024,
            poll_timeout: Duration::from_millis(50),
            throttle_window: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn canned_port(switch: &Switch, name: &str) -> SwitchPort {
        let (capture, _feed) = CannedCapture::new(RecordFormat::Frame).unwrap();
        let (sink, _wire) = UnixDatagram::pair().unwrap();
        SwitchPort::from_parts(
            name,
            VM_MAC,
            Box::new(capture),
            Box::new(sink),
            switch.config(),
            switch.reporter().clone(),
        )
        .unwrap()
    }

    #[test]
    fn register_after_start_fails() {
        let links = Arc::new(FakeLinks::new());
        let mut switch = Switch::new(InterfaceRegistry::new(links), test_config());

        let port = canned_port(&switch, "eth0");
        switch.register_port(port).unwrap();
        switch.start().unwrap();

        let late = canned_port(&switch, "eth1");
        let err = switch.register_port(late).unwrap_err();
        assert!(matches!(err, SwitchError::IllegalState(_)));
        assert_eq!(switch.port_count(), 1);
        assert!(switch.start().is_err());

        assert!(switch.cancel_and_join(Duration::from_secs(5)));
        assert!(switch.is_finished());
    }

    #[test]
    fn join_without_start_is_immediate() {
        let links = Arc::new(FakeLinks::new());
        let mut switch = Switch::new(InterfaceRegistry::new(links), test_config());
        assert!(!switch.is_finished());
        assert!(switch.join_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn membership_skipped_after_cancel() {
        let links = Arc::new(FakeLinks::new());
        links.add("br0", InterfaceType::Bridge, 0);
        links.add("eth5", InterfaceType::Ethernet, 0);
        let mut switch = Switch::new(InterfaceRegistry::new(links.clone()), test_config());
        switch.memberships.push(("br0".to_string(), "eth5".to_string()));

        assert_eq!(switch.ensure_bridge_membership(), 1);
        assert_eq!(switch.ensure_bridge_membership(), 0);

        links.drop_member("br0", "eth5");
        switch.cancel();
        assert_eq!(switch.ensure_bridge_membership(), 0);
        assert!(!links.is_member("br0", "eth5"));
    }

    #[test]
    fn membership_failure_is_reported() {
        let links = Arc::new(FakeLinks::new());
        let mut switch = Switch::new(InterfaceRegistry::new(links), test_config());
        switch.memberships.push(("br9".to_string(), "eth5".to_string()));

        assert_eq!(switch.ensure_bridge_membership(), 0);
        assert_eq!(switch.reporter().count(keys::MEMBERSHIP_FAILED), 1);
    }

    /// A loop over one canned port that is never started.
    fn idle_loop() -> (EventLoop, CaptureFeed, UnixDatagram) {
        let reporter = Arc::new(Reporter::new(Duration::from_secs(3600)));
        let (capture, feed) = CannedCapture::new(RecordFormat::Frame).unwrap();
        let (sink, wire) = UnixDatagram::pair().unwrap();
        let port = SwitchPort::from_parts(
            "eth0",
            VM_MAC,
            Box::new(capture),
            Box::new(sink),
            &test_config(),
            reporter.clone(),
        )
        .unwrap();
        let event_loop = EventLoop {
            ports: vec![port],
            cancel: Arc::new(AtomicBool::new(false)),
            reporter,
            timeout: PollTimeout::from(50u16),
        };
        (event_loop, feed, wire)
    }

    #[test]
    fn unusable_descriptors_are_unregistered() {
        let (mut event_loop, _feed, _wire) = idle_loop();
        let mut fds = event_loop.registrations();
        assert_eq!(fds.len(), 2);
        let (capture_fd, host_fd) = (fds[0], fds[1]);

        event_loop.dispatch(&mut fds, capture_fd, PollFlags::POLLNVAL);
        assert_eq!(fds, vec![host_fd]);
        assert_eq!(event_loop.reporter.count(keys::EVENT_ERROR), 1);

        event_loop.dispatch(&mut fds, host_fd, PollFlags::POLLHUP);
        assert!(fds.is_empty());
        assert_eq!(event_loop.reporter.count(keys::EVENT_ERROR), 2);
        assert_eq!(event_loop.reporter.count(keys::EVENT_NO_ROUTE), 0);
    }

    #[test]
    fn hangup_with_pending_data_still_relays() {
        let (mut event_loop, feed, _wire) = idle_loop();
        let mut fds = event_loop.registrations();
        let capture_fd = fds[0];

        feed.push(&ethernet_frame(VM_MAC, MacAddr::BROADCAST, ETHERTYPE_IPV4, 80))
            .unwrap();
        event_loop.dispatch(&mut fds, capture_fd, PollFlags::POLLHUP | PollFlags::POLLIN);

        assert_eq!(fds.len(), 2);
        assert_eq!(event_loop.ports[0].stats().frames_to_vm, 1);
        assert_eq!(event_loop.reporter.count(keys::EVENT_ERROR), 0);
    }

    #[test]
    fn unowned_descriptor_reports_no_route() {
        let (mut event_loop, _feed, _wire) = idle_loop();
        let mut fds = event_loop.registrations();
        let (stray, _peer) = UnixDatagram::pair().unwrap();

        event_loop.dispatch(&mut fds, stray.as_raw_fd(), PollFlags::POLLIN);

        assert_eq!(fds.len(), 2);
        assert_eq!(event_loop.reporter.count(keys::EVENT_NO_ROUTE), 1);
        assert_eq!(event_loop.reporter.count(keys::EVENT_ERROR), 0);
    }
}
