use super::Ipv4Address;
use crate::checksum::Checksum;
use thiserror::Error as ThisError;

/// Header words when no options are present
pub const MIN_IHL: u8 = 5;
/// Header bytes when no options are present
pub const MIN_HEADER_LEN: u16 = MIN_IHL as u16 * 4;
/// Time to live on datagrams the stack originates
pub const DEFAULT_TTL: u8 = 64;

const DONT_FRAGMENT: u16 = 0x4000;
const MORE_FRAGMENTS: u16 = 0x2000;
const RESERVED_FLAG: u16 = 0x8000;
const OFFSET_MASK: u16 = 0x1fff;
const CHECKSUM_AT: usize = 10;

/// The fixed part of an IPv4 header (RFC 791 section 3.1). Options are
/// checked on input but never kept, and never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Header {
    /// Header length in 32-bit words, options included
    pub ihl: u8,
    pub type_of_service: TypeOfService,
    /// Header plus payload, in bytes
    pub total_length: u16,
    pub identification: u16,
    /// In 8-byte blocks
    pub fragment_offset: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    pub time_to_live: u8,
    pub protocol: u8,
    /// As received. Ignored when writing.
    pub checksum: u16,
    pub source: Ipv4Address,
    pub destination: Ipv4Address,
}

impl Ipv4Header {
    /// A header for a new unfragmented datagram carrying `payload_len` bytes.
    pub fn new(
        source: Ipv4Address,
        destination: Ipv4Address,
        protocol: u8,
        payload_len: u16,
    ) -> Result<Self, BuildHeaderError> {
        let total_length = payload_len
            .checked_add(MIN_HEADER_LEN)
            .ok_or(BuildHeaderError::PayloadTooLong)?;
        Ok(Self {
            ihl: MIN_IHL,
            type_of_service: TypeOfService::default(),
            total_length,
            identification: 0,
            fragment_offset: 0,
            dont_fragment: false,
            more_fragments: false,
            time_to_live: DEFAULT_TTL,
            protocol,
            checksum: 0,
            source,
            destination,
        })
    }

    /// Reads a header, options included, and checks its checksum.
    pub fn from_bytes(mut bytes: impl Iterator<Item = u8>) -> Result<Self, ParseError> {
        let mut fixed = [0u8; MIN_HEADER_LEN as usize];
        for slot in fixed.iter_mut() {
            *slot = bytes.next().ok_or(ParseError::Truncated)?;
        }
        let version = fixed[0] >> 4;
        if version != 4 {
            return Err(ParseError::Version(version));
        }
        let ihl = fixed[0] & 0x0f;
        if ihl < MIN_IHL {
            return Err(ParseError::HeaderLength(ihl));
        }
        let word = |at: usize| u16::from_be_bytes([fixed[at], fixed[at + 1]]);
        let total_length = word(2);
        if (total_length as usize) < ihl as usize * 4 {
            return Err(ParseError::TotalLength(total_length));
        }
        let fragment_field = word(6);
        if fragment_field & RESERVED_FLAG != 0 {
            return Err(ParseError::ReservedFlag);
        }

        let mut checksum = Checksum::new();
        checksum.add_bytes(&fixed);
        for _ in MIN_IHL..ihl {
            let mut option_word = [0u8; 4];
            for slot in option_word.iter_mut() {
                *slot = bytes.next().ok_or(ParseError::Truncated)?;
            }
            checksum.add_u32(option_word);
        }
        let residue = checksum.as_u16();
        if residue != 0 {
            return Err(ParseError::Checksum(residue));
        }

        Ok(Self {
            ihl,
            type_of_service: TypeOfService(fixed[1]),
            total_length,
            identification: word(4),
            fragment_offset: fragment_field & OFFSET_MASK,
            dont_fragment: fragment_field & DONT_FRAGMENT != 0,
            more_fragments: fragment_field & MORE_FRAGMENTS != 0,
            time_to_live: fixed[8],
            protocol: fixed[9],
            checksum: word(CHECKSUM_AT),
            source: Ipv4Address::new([fixed[12], fixed[13], fixed[14], fixed[15]]),
            destination: Ipv4Address::new([fixed[16], fixed[17], fixed[18], fixed[19]]),
        })
    }

    /// Header length in bytes, options included.
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    pub fn payload_len(&self) -> usize {
        (self.total_length as usize).saturating_sub(self.header_len())
    }

    /// Whether this datagram is a piece of a larger one.
    pub fn is_fragment(&self) -> bool {
        self.fragment_offset != 0 || self.more_fragments
    }

    /// Serializes the header for a datagram carrying `payload_len` bytes.
    /// The result never has options; the total length and checksum come from
    /// `payload_len` and the other fields.
    pub fn build(&self, payload_len: u16) -> Result<Vec<u8>, BuildHeaderError> {
        let total_length = payload_len
            .checked_add(MIN_HEADER_LEN)
            .ok_or(BuildHeaderError::PayloadTooLong)?;
        if self.fragment_offset > OFFSET_MASK {
            return Err(BuildHeaderError::FragmentOffset(self.fragment_offset));
        }
        let mut fragment_field = self.fragment_offset;
        if self.dont_fragment {
            fragment_field |= DONT_FRAGMENT;
        }
        if self.more_fragments {
            fragment_field |= MORE_FRAGMENTS;
        }

        let mut out = Vec::with_capacity(MIN_HEADER_LEN as usize);
        out.extend_from_slice(&[(4 << 4) | MIN_IHL, self.type_of_service.0]);
        out.extend_from_slice(&total_length.to_be_bytes());
        out.extend_from_slice(&self.identification.to_be_bytes());
        out.extend_from_slice(&fragment_field.to_be_bytes());
        out.extend_from_slice(&[self.time_to_live, self.protocol, 0, 0]);
        out.extend_from_slice(&self.source.to_bytes());
        out.extend_from_slice(&self.destination.to_bytes());

        let mut checksum = Checksum::new();
        checksum.add_bytes(&out);
        out[CHECKSUM_AT..CHECKSUM_AT + 2].copy_from_slice(&checksum.as_u16().to_be_bytes());
        Ok(out)
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("The IPv4 header is truncated")]
    Truncated,
    #[error("IP version {0} is not 4")]
    Version(u8),
    #[error("The reserved flag bit is set")]
    ReservedFlag,
    #[error("A header length of {0} words is below the minimum of 5")]
    HeaderLength(u8),
    #[error("Total length {0} is shorter than the header")]
    TotalLength(u16),
    #[error("The header checksum is off by {0:#06x}")]
    Checksum(u16),
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum BuildHeaderError {
    #[error("The payload does not fit in one datagram")]
    PayloadTooLong,
    #[error("Fragment offset {0} does not fit in 13 bits")]
    FragmentOffset(u16),
}

/// The type of service byte. Only the low-delay and throughput bits matter
/// here: they select which output queue a socket's traffic uses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeOfService(pub u8);

impl TypeOfService {
    pub const LOW_DELAY: Self = Self(0x10);
    pub const THROUGHPUT: Self = Self(0x08);

    pub const fn is_low_delay(self) -> bool {
        self.0 & Self::LOW_DELAY.0 != 0
    }
}
