//! The Internet checksum (RFC 1071) over buffer chains.
//!
//! A checksum run over a packet that already carries a correct checksum
//! yields zero, which is how every input path verifies headers.

use crate::{ipv4::Ipv4Address, mbuf::Chain};
use std::net::Ipv6Addr;

/// A running one's-complement sum.
///
/// Words are added big-endian. A chain segment ending on an odd byte leaves
/// that byte pending so the next segment continues the same 16-bit word, as
/// though the bytes were contiguous.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum {
    sum: u16,
    odd: Option<u8>,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_u16(&mut self, value: u16) {
        let (sum, carry) = self.sum.overflowing_add(value);
        self.sum = sum + carry as u16;
    }

    pub fn add_u8(&mut self, a: u8, b: u8) {
        self.add_u16(u16::from_be_bytes([a, b]));
    }

    pub fn add_u32(&mut self, value: [u8; 4]) {
        self.add_u8(value[0], value[1]);
        self.add_u8(value[2], value[3]);
    }

    /// Adds a run of bytes that continues whatever was added before it.
    pub fn add_bytes(&mut self, mut bytes: &[u8]) {
        if let Some(high) = self.odd.take() {
            match bytes.split_first() {
                Some((&low, rest)) => {
                    self.add_u8(high, low);
                    bytes = rest;
                }
                None => {
                    self.odd = Some(high);
                    return;
                }
            }
        }
        let mut words = bytes.chunks_exact(2);
        for word in &mut words {
            self.add_u8(word[0], word[1]);
        }
        if let [last] = words.remainder() {
            self.odd = Some(*last);
        }
    }

    /// Adds the first `len` bytes of a chain, following it across segments.
    pub fn add_chain(&mut self, chain: &Chain, len: usize) {
        let mut remaining = len;
        for piece in chain.segments() {
            if remaining == 0 {
                break;
            }
            let take = piece.len().min(remaining);
            self.add_bytes(&piece[..take]);
            remaining -= take;
        }
    }

    /// Adds the IPv4 pseudo-header used by TCP and UDP.
    pub fn add_pseudo_header(
        &mut self,
        source: Ipv4Address,
        destination: Ipv4Address,
        protocol: u8,
        length: u16,
    ) {
        self.add_u32(source.into());
        self.add_u32(destination.into());
        self.add_u8(0, protocol);
        self.add_u16(length);
    }

    /// The checksum to write into a header. A trailing odd byte is padded
    /// with a zero.
    pub fn as_u16(&self) -> u16 {
        let mut this = *self;
        if let Some(high) = this.odd.take() {
            this.add_u8(high, 0);
        }
        !this.sum
    }

    /// The UDP form of the checksum, where zero means "not computed" and is
    /// sent as all ones instead.
    pub fn as_udp_u16(&self) -> u16 {
        match self.as_u16() {
            0 => 0xffff,
            sum => sum,
        }
    }
}

/// Checksums the first `len` bytes of a chain. Over a packet whose checksum
/// field is already correct the result is zero.
pub fn cksum(chain: &Chain, len: usize) -> u16 {
    let mut checksum = Checksum::new();
    checksum.add_chain(chain, len);
    checksum.as_u16()
}

/// Checksums an upper-layer payload carried in IPv6. The IPv6 pseudo-header
/// (RFC 8200 section 8.1) is folded into the same sum as the payload, which
/// must include the upper-layer header with its checksum field.
pub fn ip6_cksum(
    source: Ipv6Addr,
    destination: Ipv6Addr,
    next_header: u8,
    payload: &Chain,
) -> u16 {
    let mut checksum = Checksum::new();
    checksum.add_bytes(&source.octets());
    checksum.add_bytes(&destination.octets());
    checksum.add_u32((payload.len() as u32).to_be_bytes());
    checksum.add_u32([0, 0, 0, next_header]);
    checksum.add_chain(payload, payload.len());
    checksum.as_u16()
}
