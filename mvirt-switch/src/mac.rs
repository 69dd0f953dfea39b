//! Ethernet MAC address value type.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use thiserror::Error;

/// A 6-byte Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr(pub [u8; 6]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseMacError {
    #[error("expected 6 colon-separated octets, got {0}")]
    WrongLength(usize),
    #[error("invalid octet {0:?}")]
    InvalidOctet(String),
}

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_local(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// Random unicast address with the locally administered bit set.
    pub fn random() -> Self {
        let mut octets: [u8; 6] = rand::thread_rng().r#gen();
        octets[0] = (octets[0] & 0xfe) | 0x02;
        MacAddr(octets)
    }

    /// Build from a link-layer address slice, if it is exactly 6 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(MacAddr)
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ParseMacError::WrongLength(parts.len()));
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.is_empty() || part.len() > 2 {
                return Err(ParseMacError::InvalidOctet(part.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| ParseMacError::InvalidOctet(part.to_string()))?;
        }
        Ok(MacAddr(octets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let mac: MacAddr = "52:54:00:AB:cd:01".parse().unwrap();
        assert_eq!(mac.0, [0x52, 0x54, 0x00, 0xab, 0xcd, 0x01]);
        assert_eq!(mac.to_string(), "52:54:00:ab:cd:01");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(
            "52:54:00:ab:cd".parse::<MacAddr>(),
            Err(ParseMacError::WrongLength(5))
        );
        assert!("52:54:00:ab:cd:zz".parse::<MacAddr>().is_err());
        assert!("52:54:00:ab:cd:123".parse::<MacAddr>().is_err());
        assert!("52:54:00:ab::01".parse::<MacAddr>().is_err());
    }

    #[test]
    fn random_is_local_unicast() {
        for _ in 0..64 {
            let mac = MacAddr::random();
            assert!(mac.is_local());
            assert!(!mac.is_multicast());
        }
    }

    #[test]
    fn broadcast() {
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(MacAddr::BROADCAST.is_multicast());
        assert_eq!(MacAddr::from_slice(&[1, 2, 3]), None);
    }
}
