use crate::{checksum::Checksum, mbuf::Chain, utility::ByteReader};
use thiserror::Error as ThisError;

pub const HEADER_OCTETS: usize = 8;

pub const ECHO_REPLY: u8 = 0;
pub const DESTINATION_UNREACHABLE: u8 = 3;
pub const ECHO_REQUEST: u8 = 8;
pub const TIME_EXCEEDED: u8 = 11;

/// Destination unreachable codes
pub mod unreachable {
    pub const NET: u8 = 0;
    pub const HOST: u8 = 1;
    pub const PROTOCOL: u8 = 2;
    pub const PORT: u8 = 3;
    pub const NEED_FRAGMENT: u8 = 4;
}

/// An ICMP header. `rest` is the type-specific second word: identifier and
/// sequence number for echo, unused or next-hop MTU for errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub rest: [u8; 4],
}

impl IcmpHeader {
    /// Parses the header and verifies the checksum over the whole message.
    pub fn from_chain(message: &Chain) -> Result<Self, ParseError> {
        const HTS: ParseError = ParseError::HeaderTooShort;
        let mut bytes = message.iter();
        let [icmp_type, code] = bytes.take_array().ok_or(HTS)?;
        let checksum = bytes.take_u16().ok_or(HTS)?;
        let rest = bytes.take_array().ok_or(HTS)?;

        let mut sum = Checksum::new();
        sum.add_chain(message, message.len());
        if sum.as_u16() != 0 {
            Err(ParseError::Checksum(checksum))?
        }

        Ok(Self {
            icmp_type,
            code,
            checksum,
            rest,
        })
    }

    pub fn is_error(&self) -> bool {
        !matches!(self.icmp_type, ECHO_REPLY | ECHO_REQUEST)
    }

    pub fn echo_identifier(&self) -> u16 {
        u16::from_be_bytes([self.rest[0], self.rest[1]])
    }

    pub fn echo_sequence(&self) -> u16 {
        u16::from_be_bytes([self.rest[2], self.rest[3]])
    }
}

/// Serializes an ICMP message header for `body`, checksum included.
pub fn build_icmp_header(icmp_type: u8, code: u8, rest: [u8; 4], body: &Chain) -> Vec<u8> {
    let mut checksum = Checksum::new();
    checksum.add_u8(icmp_type, code);
    checksum.add_u32(rest);
    checksum.add_chain(body, body.len());

    let mut out = Vec::with_capacity(HEADER_OCTETS);
    out.push(icmp_type);
    out.push(code);
    out.extend_from_slice(&checksum.as_u16().to_be_bytes());
    out.extend_from_slice(&rest);
    out
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("Too few bytes to constitute an ICMP header")]
    HeaderTooShort,
    #[error("The ICMP checksum {0:#06x} did not verify")]
    Checksum(u16),
}
