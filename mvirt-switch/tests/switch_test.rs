//! Switch integration tests
//!
//! Drive the started event loop through in-memory capture and transmit
//! paths and a fake interface table, so no privileges are required.

use std::os::unix::net::UnixDatagram;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mvirt_switch::capture::{DARWIN_BPF, RecordFormat};
use mvirt_switch::report::keys;
use mvirt_switch::test_util::{
    CannedCapture, CaptureFeed, ETHERTYPE_IPV4, FakeLinks, append_bpf_record, ethernet_frame,
};
use mvirt_switch::{
    InterfaceRegistry, InterfaceType, MacAddr, RelayPolicy, Switch, SwitchConfig, SwitchError,
    SwitchPort, VmAttachment,
};

/// Guest MAC used by every port
const VM_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x01]);

/// Some other host on the LAN
const LAN_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x99]);

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(policy: RelayPolicy) -> SwitchConfig {
    SwitchConfig {
        local_buffer_size: 256 * 1024,
        poll_timeout: Duration::from_millis(50),
        relay_policy: policy,
        throttle_window: Duration::from_secs(3600),
        ..Default::default()
    }
}

/// One registered port plus the test's ends of its paths.
struct Wired {
    feed: CaptureFeed,
    wire: UnixDatagram,
    vm: UnixDatagram,
}

fn wire_port(switch: &mut Switch, name: &str, format: RecordFormat) -> Wired {
    let (capture, feed) = CannedCapture::new(format).expect("canned capture");
    let (sink, wire) = UnixDatagram::pair().expect("wire pair");
    wire.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();

    let port = SwitchPort::from_parts(
        name,
        VM_MAC,
        Box::new(capture),
        Box::new(sink),
        switch.config(),
        switch.reporter().clone(),
    )
    .expect("port");
    let VmAttachment { fd, mac, host_interface } = switch.register_port(port).expect("register");
    assert_eq!(mac, VM_MAC);
    assert_eq!(host_interface, name);

    let vm = UnixDatagram::from(fd);
    vm.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
    Wired { feed, wire, vm }
}

fn recv(sock: &UnixDatagram) -> Vec<u8> {
    let mut buf = vec![0u8; 65536];
    let n = sock.recv(&mut buf).expect("datagram within timeout");
    buf.truncate(n);
    buf
}

fn new_switch(policy: RelayPolicy) -> (Switch, Arc<FakeLinks>) {
    let links = Arc::new(FakeLinks::new());
    let switch = Switch::new(InterfaceRegistry::new(links.clone()), test_config(policy));
    (switch, links)
}

/// Frames cross the running switch in both directions
#[test]
fn test_relay_both_directions() {
    let _ = tracing_subscriber::fmt::try_init();
    let (mut switch, _links) = new_switch(RelayPolicy::OnePerEvent);
    let port = wire_port(&mut switch, "eth0", RecordFormat::Frame);
    switch.start().unwrap();

    let inbound = ethernet_frame(VM_MAC, LAN_MAC, ETHERTYPE_IPV4, 100);
    port.feed.push(&inbound).unwrap();
    assert_eq!(recv(&port.vm), inbound);

    let outbound = ethernet_frame(LAN_MAC, VM_MAC, ETHERTYPE_IPV4, 200);
    port.vm.send(&outbound).unwrap();
    assert_eq!(recv(&port.wire), outbound);

    assert!(switch.cancel_and_join(Duration::from_secs(5)));
    assert_eq!(switch.reporter().count(keys::EVENT_NO_ROUTE), 0);
}

/// A BPF batch is split into frames and delivered in capture order
#[test]
fn test_bpf_batch_delivered_in_order() {
    let (mut switch, _links) = new_switch(RelayPolicy::OnePerEvent);
    let port = wire_port(&mut switch, "en0", RecordFormat::Bpf(DARWIN_BPF));
    switch.start().unwrap();

    let frames: Vec<Vec<u8>> = (0..3)
        .map(|i| ethernet_frame(VM_MAC, LAN_MAC, ETHERTYPE_IPV4, 60 + i * 7))
        .collect();
    let mut batch = Vec::new();
    for f in &frames {
        append_bpf_record(&mut batch, f);
    }
    port.feed.push(&batch).unwrap();

    for f in &frames {
        assert_eq!(&recv(&port.vm), f);
    }
    assert!(switch.cancel_and_join(Duration::from_secs(5)));
}

/// Queued VM datagrams all go out, one per readiness event
#[test]
fn test_vm_burst_one_per_event() {
    let (mut switch, _links) = new_switch(RelayPolicy::OnePerEvent);
    let port = wire_port(&mut switch, "eth0", RecordFormat::Frame);

    let frames: Vec<Vec<u8>> = (0..8)
        .map(|i| ethernet_frame(LAN_MAC, VM_MAC, ETHERTYPE_IPV4, 64 + i))
        .collect();
    for f in &frames {
        port.vm.send(f).unwrap();
    }
    switch.start().unwrap();

    for f in &frames {
        assert_eq!(&recv(&port.wire), f);
    }
    assert!(switch.cancel_and_join(Duration::from_secs(5)));
}

/// Two ports on one loop do not mix their traffic
#[test]
fn test_ports_are_isolated() {
    let (mut switch, _links) = new_switch(RelayPolicy::DrainReported);
    let a = wire_port(&mut switch, "eth0", RecordFormat::Frame);
    let b = wire_port(&mut switch, "eth1", RecordFormat::Frame);
    assert_eq!(switch.port_count(), 2);
    switch.start().unwrap();

    let to_b = ethernet_frame(VM_MAC, LAN_MAC, ETHERTYPE_IPV4, 90);
    b.feed.push(&to_b).unwrap();
    assert_eq!(recv(&b.vm), to_b);

    let from_a = ethernet_frame(LAN_MAC, VM_MAC, ETHERTYPE_IPV4, 70);
    a.vm.send(&from_a).unwrap();
    assert_eq!(recv(&a.wire), from_a);

    a.vm.set_nonblocking(true).unwrap();
    b.wire.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 2048];
    assert!(a.vm.recv(&mut buf).is_err());
    assert!(b.wire.recv(&mut buf).is_err());

    assert!(switch.cancel_and_join(Duration::from_secs(5)));
}

/// Cancellation is observed within a few poll timeouts
#[test]
fn test_cancel_stops_loop_promptly() {
    let (mut switch, _links) = new_switch(RelayPolicy::OnePerEvent);
    let _port = wire_port(&mut switch, "eth0", RecordFormat::Frame);
    switch.start().unwrap();
    assert!(switch.is_started());

    // Let the loop settle into an idle wait
    std::thread::sleep(Duration::from_millis(120));

    let started = Instant::now();
    assert!(switch.cancel_and_join(Duration::from_secs(2)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(switch.is_finished());
    assert!(switch.is_cancelled());
}

/// Registration is closed once the loop runs
#[test]
fn test_register_after_start() {
    let (mut switch, _links) = new_switch(RelayPolicy::OnePerEvent);
    let _first = wire_port(&mut switch, "eth0", RecordFormat::Frame);
    switch.start().unwrap();

    let err = switch.add_port("eth1", VM_MAC).unwrap_err();
    assert!(matches!(err, SwitchError::IllegalState(_)));
    assert_eq!(switch.port_count(), 1);

    assert!(switch.cancel_and_join(Duration::from_secs(5)));
}

/// Membership is only re-added when missing
#[test]
fn test_bridge_membership_idempotent() {
    let links = Arc::new(FakeLinks::new());
    links.add("br0", InterfaceType::Bridge, 0);
    let registry = InterfaceRegistry::new(links.clone());

    let pair = registry.create_virtual_peer_pair().unwrap();
    assert!(registry.ensure_bridge_membership("br0", &pair.bridge_side).unwrap());
    assert!(!registry.ensure_bridge_membership("br0", &pair.bridge_side).unwrap());
    assert_eq!(links.bridge_add_calls(), 1);

    links.drop_member("br0", &pair.bridge_side);
    assert!(registry.ensure_bridge_membership("br0", &pair.bridge_side).unwrap());
    assert!(links.is_member("br0", &pair.bridge_side));
    assert_eq!(links.bridge_add_calls(), 2);
}

/// A bridge-backed port that fails to open leaves no virtual peers behind
#[test]
fn test_failed_bridge_port_removes_peers() {
    let links = Arc::new(FakeLinks::new());
    links.add("mvtestbr0", InterfaceType::Bridge, 0);
    let before = links.interfaces_len();

    let mut switch = Switch::new(
        InterfaceRegistry::new(links.clone()),
        test_config(RelayPolicy::OnePerEvent),
    );

    // The fake peers do not exist on the host, so the capture paths cannot open
    assert!(switch.add_port("mvtestbr0", VM_MAC).is_err());
    assert_eq!(switch.port_count(), 0);
    assert_eq!(links.interfaces_len(), before);
    assert_eq!(links.destroy_calls(), 2);
}
