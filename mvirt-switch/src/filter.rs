//! Classic BPF program selecting frames addressed to one MAC.
//!
//! The program compares the Ethernet destination in two chunks that fit the
//! classic BPF load widths: a 32-bit word at offset 2 and a 16-bit halfword
//! at offset 0. Loads are big-endian, as the kernel performs them.
//!
//! With broadcast accepted the program is:
//!
//! ```text
//! [0] ld  [2]                       ; A = dst[2..6]
//! [1] jeq #low4     jt 0  jf 2      ; -> [2] / [4]
//! [2] ldh [0]                       ; A = dst[0..2]
//! [3] jeq #high2    jt 4  jf 0      ; -> [8] / [4]
//! [4] ld  [2]
//! [5] jeq #0xffffffff jt 0 jf 3     ; -> [6] / [9]
//! [6] ldh [0]
//! [7] jeq #0xffff   jt 0  jf 1      ; -> [8] / [9]
//! [8] ret #snaplen
//! [9] ret #0
//! ```
//!
//! The broadcast branch reloads both chunks, so a MAC whose low four bytes
//! are all ones cannot shadow the broadcast check.

use crate::mac::MacAddr;

// Instruction classes and fields (linux/filter.h, net/bpf.h)
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

const LD_W_ABS: u16 = BPF_LD | BPF_W | BPF_ABS;
const LD_H_ABS: u16 = BPF_LD | BPF_H | BPF_ABS;
const JEQ_K: u16 = BPF_JMP | BPF_JEQ | BPF_K;
const RET_K: u16 = BPF_RET | BPF_K;

/// One classic BPF instruction.
///
/// Same layout as `struct sock_filter` (Linux) and `struct bpf_insn` (BSD).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterInsn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const _: () = assert!(std::mem::size_of::<FilterInsn>() == 8);

const fn insn(code: u16, jt: u8, jf: u8, k: u32) -> FilterInsn {
    FilterInsn { code, jt, jf, k }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastPolicy {
    #[default]
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Capture up to this many bytes
    Accept(u32),
    Reject,
}

/// Compiled capture filter for one destination MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterProgram {
    mac: MacAddr,
    snaplen: u32,
    insns: Vec<FilterInsn>,
}

impl FilterProgram {
    pub fn new(mac: MacAddr, broadcast: BroadcastPolicy, snaplen: u32) -> Self {
        let o = mac.octets();
        let high2 = u16::from_be_bytes([o[0], o[1]]) as u32;
        let low4 = u32::from_be_bytes([o[2], o[3], o[4], o[5]]);

        let insns = match broadcast {
            BroadcastPolicy::Accept => vec![
                insn(LD_W_ABS, 0, 0, 2),
                insn(JEQ_K, 0, 2, low4),
                insn(LD_H_ABS, 0, 0, 0),
                insn(JEQ_K, 4, 0, high2),
                insn(LD_W_ABS, 0, 0, 2),
                insn(JEQ_K, 0, 3, 0xffff_ffff),
                insn(LD_H_ABS, 0, 0, 0),
                insn(JEQ_K, 0, 1, 0xffff),
                insn(RET_K, 0, 0, snaplen),
                insn(RET_K, 0, 0, 0),
            ],
            BroadcastPolicy::Reject => vec![
                insn(LD_W_ABS, 0, 0, 2),
                insn(JEQ_K, 0, 3, low4),
                insn(LD_H_ABS, 0, 0, 0),
                insn(JEQ_K, 0, 1, high2),
                insn(RET_K, 0, 0, snaplen),
                insn(RET_K, 0, 0, 0),
            ],
        };

        Self { mac, snaplen, insns }
    }

    /// Unicast to `mac` or broadcast.
    pub fn for_destination(mac: MacAddr, snaplen: u32) -> Self {
        Self::new(mac, BroadcastPolicy::Accept, snaplen)
    }

    pub fn instructions(&self) -> &[FilterInsn] {
        &self.insns
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    /// Run the program against a frame the way the kernel would.
    ///
    /// Only the instructions this module emits are understood; anything else,
    /// and any out-of-bounds load, rejects the frame.
    pub fn evaluate(&self, frame: &[u8]) -> u32 {
        let mut a: u32 = 0;
        let mut pc = 0usize;

        while let Some(i) = self.insns.get(pc) {
            pc += 1;
            match i.code {
                LD_W_ABS => match load::<4>(frame, i.k) {
                    Some(b) => a = u32::from_be_bytes(b),
                    None => return 0,
                },
                LD_H_ABS => match load::<2>(frame, i.k) {
                    Some(b) => a = u16::from_be_bytes(b) as u32,
                    None => return 0,
                },
                JEQ_K => {
                    let skip = if a == i.k { i.jt } else { i.jf };
                    pc += skip as usize;
                }
                RET_K => return i.k,
                _ => return 0,
            }
        }
        0
    }

    pub fn verdict(&self, frame: &[u8]) -> Verdict {
        match self.evaluate(frame) {
            0 => Verdict::Reject,
            n => Verdict::Accept(n),
        }
    }
}

fn load<const N: usize>(frame: &[u8], offset: u32) -> Option<[u8; N]> {
    let start = offset as usize;
    frame.get(start..start.checked_add(N)?)?.try_into().ok()
}
