//! Frame and capture-record builders.

use crate::capture::DARWIN_BPF;
use crate::mac::MacAddr;

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// IPv4 ethertype
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// Minimal Ethernet frame: header followed by `payload_len` bytes of a
/// counting pattern.
pub fn ethernet_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload_len: usize) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETHERNET_HDR_SIZE + payload_len);
    frame.extend_from_slice(&dst.octets());
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend((0..payload_len).map(|i| i as u8));
    frame
}

/// Append one Darwin `bpf_hdr` record carrying `payload`, padded to the
/// record alignment.
pub fn append_bpf_record(buf: &mut Vec<u8>, payload: &[u8]) {
    let layout = DARWIN_BPF;
    let start = buf.len();
    let hdrlen = layout.min_header;

    buf.resize(start + hdrlen, 0);
    let caplen = payload.len() as u32;
    buf[start + layout.caplen_offset..start + layout.caplen_offset + 4].copy_from_slice(&caplen.to_ne_bytes());
    // bh_datalen
    buf[start + 12..start + 16].copy_from_slice(&caplen.to_ne_bytes());
    buf[start + layout.hdrlen_offset..start + layout.hdrlen_offset + 2]
        .copy_from_slice(&(hdrlen as u16).to_ne_bytes());

    buf.extend_from_slice(payload);
    let total = (buf.len() - start).div_ceil(layout.alignment) * layout.alignment;
    buf.resize(start + total, 0);
}
