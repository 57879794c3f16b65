//! ARP packets for IPv4 over Ethernet (RFC 826).

use crate::{ethernet::MacAddress, ipv4::Ipv4Address, utility::ByteReader};
use thiserror::Error as ThisError;

/// Hardware type, protocol type, and the two address lengths, as every
/// IPv4-over-Ethernet packet carries them.
const PREAMBLE: [u8; 6] = [0, 1, 0x08, 0x00, 6, 4];
/// The smallest Ethernet payload. Shorter packets are padded with zeros.
const MIN_PAYLOAD: usize = 46;

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ArpPacket {
    pub oper: Operation,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Address,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Address,
}

impl ArpPacket {
    /// Bytes in the packet before padding
    pub const LEN: usize = 28;

    /// Asks who has `target_ip`.
    pub fn request(sender_mac: MacAddress, sender_ip: Ipv4Address, target_ip: Ipv4Address) -> Self {
        Self {
            oper: Operation::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddress::ZERO,
            target_ip,
        }
    }

    /// Answers this request: `mac` has the address that was asked for.
    pub fn reply(&self, mac: MacAddress) -> Self {
        Self {
            oper: Operation::Reply,
            sender_mac: mac,
            sender_ip: self.target_ip,
            target_mac: self.sender_mac,
            target_ip: self.sender_ip,
        }
    }

    /// Serializes the packet, padded to the minimum Ethernet payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_PAYLOAD);
        out.extend_from_slice(&PREAMBLE);
        out.extend_from_slice(&(self.oper as u16).to_be_bytes());
        for (mac, ip) in [(self.sender_mac, self.sender_ip), (self.target_mac, self.target_ip)] {
            out.extend_from_slice(&mac.to_bytes());
            out.extend_from_slice(&ip.to_bytes());
        }
        out.resize(MIN_PAYLOAD, 0);
        out
    }

    pub fn from_bytes(mut bytes: impl Iterator<Item = u8>) -> Result<Self, ParseError> {
        let truncated = ParseError::Truncated;
        let preamble: [u8; 6] = bytes.take_array().ok_or(truncated)?;
        if preamble != PREAMBLE {
            return Err(ParseError::NotIpv4OverEthernet);
        }
        let oper = match bytes.take_u16().ok_or(truncated)? {
            1 => Operation::Request,
            2 => Operation::Reply,
            other => return Err(ParseError::Operation(other)),
        };
        Ok(Self {
            oper,
            sender_mac: bytes.take_mac().ok_or(truncated)?,
            sender_ip: bytes.take_ipv4().ok_or(truncated)?,
            target_mac: bytes.take_mac().ok_or(truncated)?,
            target_ip: bytes.take_ipv4().ok_or(truncated)?,
        })
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("The ARP packet is truncated")]
    Truncated,
    #[error("Unknown ARP operation {0}")]
    Operation(u16),
    #[error("Only IPv4 over Ethernet is supported")]
    NotIpv4OverEthernet,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Request = 1,
    Reply = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_MAC: MacAddress = MacAddress::new([0x52, 0x55, 10, 0, 2, 2]);
    const GUEST_MAC: MacAddress = MacAddress::new([0x52, 0x54, 0, 0x12, 0x34, 0x56]);
    const HOST: Ipv4Address = Ipv4Address::new([10, 0, 2, 2]);
    const GUEST: Ipv4Address = Ipv4Address::new([10, 0, 2, 15]);

    #[test]
    fn reply_swaps_the_ends() -> anyhow::Result<()> {
        let request = ArpPacket::request(GUEST_MAC, GUEST, HOST);
        let reply = request.reply(HOST_MAC);
        let bytes = reply.to_bytes();
        assert_eq!(bytes.len(), MIN_PAYLOAD);
        assert_eq!(&bytes[..8], &[0, 1, 8, 0, 6, 4, 0, 2]);
        assert_eq!(&bytes[8..14], &HOST_MAC.to_bytes());
        assert_eq!(&bytes[14..18], &[10, 0, 2, 2]);
        assert_eq!(&bytes[24..28], &[10, 0, 2, 15]);
        assert_eq!(ArpPacket::from_bytes(bytes.into_iter())?, reply);
        Ok(())
    }

    #[test]
    fn truncated_packet() {
        let bytes = ArpPacket::request(GUEST_MAC, GUEST, HOST).to_bytes();
        assert_eq!(
            ArpPacket::from_bytes(bytes[..ArpPacket::LEN - 1].iter().copied()),
            Err(ParseError::Truncated)
        );
    }

    #[test]
    fn other_protocols_and_operations() {
        let mut ipv6 = ArpPacket::request(GUEST_MAC, GUEST, HOST).to_bytes();
        ipv6[2..4].copy_from_slice(&[0x86, 0xdd]);
        assert_eq!(
            ArpPacket::from_bytes(ipv6.into_iter()),
            Err(ParseError::NotIpv4OverEthernet)
        );

        let mut rarp = ArpPacket::request(GUEST_MAC, GUEST, HOST).to_bytes();
        rarp[7] = 3;
        assert_eq!(ArpPacket::from_bytes(rarp.into_iter()), Err(ParseError::Operation(3)));
    }
}
