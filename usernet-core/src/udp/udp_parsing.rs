use crate::{checksum::Checksum, ipv4::Ipv4Address, mbuf::Chain, utility::Endpoint};
use thiserror::Error as ThisError;

/// Bytes in a UDP header
pub const HEADER_LEN: usize = 8;
const PROTOCOL: u8 = 17;

/// A UDP header (RFC 768).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub source: u16,
    pub destination: u16,
    /// Header plus payload, in bytes
    pub length: u16,
    /// Zero when the sender did not compute one
    pub checksum: u16,
}

impl UdpHeader {
    /// Reads the header at the front of `packet`. The length field may be
    /// shorter than the packet; the bytes past it are padding. The checksum
    /// is verified unless the sender left it zero.
    pub fn from_chain(
        packet: &Chain,
        source_address: Ipv4Address,
        destination_address: Ipv4Address,
    ) -> Result<Self, ParseError> {
        let mut raw = [0u8; HEADER_LEN];
        if packet.copy_to(0, &mut raw) < HEADER_LEN {
            return Err(ParseError::Truncated);
        }
        let half = |at: usize| u16::from_be_bytes([raw[at], raw[at + 1]]);
        let header = Self {
            source: half(0),
            destination: half(2),
            length: half(4),
            checksum: half(6),
        };

        let length = header.length as usize;
        if !(HEADER_LEN..=packet.len()).contains(&length) {
            return Err(ParseError::Length(header.length));
        }
        if header.checksum != 0 {
            let mut sum = Checksum::new();
            sum.add_pseudo_header(source_address, destination_address, PROTOCOL, header.length);
            sum.add_chain(packet, length);
            let residue = sum.as_u16();
            if residue != 0 {
                return Err(ParseError::Checksum(residue));
            }
        }
        Ok(header)
    }

    /// Serializes a header for `payload` with its checksum filled in.
    pub fn to_bytes(
        source: Endpoint,
        destination: Endpoint,
        payload: &Chain,
    ) -> Result<Vec<u8>, BuildHeaderError> {
        let length = u16::try_from(HEADER_LEN + payload.len()).map_err(|_| BuildHeaderError::PayloadTooLong)?;

        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&source.port.to_be_bytes());
        out.extend_from_slice(&destination.port.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(&[0, 0]);

        let mut sum = Checksum::new();
        sum.add_pseudo_header(source.address, destination.address, PROTOCOL, length);
        sum.add_bytes(&out);
        sum.add_chain(payload, payload.len());
        out[6..].copy_from_slice(&sum.as_udp_u16().to_be_bytes());
        Ok(out)
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("The UDP header is truncated")]
    Truncated,
    #[error("The datagram checksum is off by {0:#06x}")]
    Checksum(u16),
    #[error("Length field {0} disagrees with the datagram")]
    Length(u16),
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum BuildHeaderError {
    #[error("The payload does not fit in one datagram")]
    PayloadTooLong,
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUEST: [u8; 4] = [10, 0, 2, 15];
    const NAMESERVER: [u8; 4] = [10, 0, 2, 3];
    const QUERY: &[u8] = b"\x12\x34\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00";

    /// A DNS query from the guest as etherparse encodes it.
    fn reference_query() -> anyhow::Result<(etherparse::UdpHeader, Vec<u8>)> {
        let ip = etherparse::Ipv4Header::new(QUERY.len() as u16, 64, etherparse::IpNumber::Udp as u8, GUEST, NAMESERVER);
        let udp = etherparse::UdpHeader::with_ipv4_checksum(40000, 53, &ip, QUERY)?;
        let mut bytes = vec![];
        udp.write(&mut bytes)?;
        Ok((udp, bytes))
    }

    #[test]
    fn reads_a_query() -> anyhow::Result<()> {
        let (reference, bytes) = reference_query()?;
        let mut packet = Chain::new(QUERY);
        packet.prepend(bytes);
        let header = UdpHeader::from_chain(&packet, GUEST.into(), NAMESERVER.into())?;
        assert_eq!((header.source, header.destination), (40000, 53));
        assert_eq!(header.length, reference.length);
        assert_eq!(header.checksum, reference.checksum);
        Ok(())
    }

    #[test]
    fn writes_a_query() -> anyhow::Result<()> {
        let (_, expected) = reference_query()?;
        let actual = UdpHeader::to_bytes(
            Endpoint::new(GUEST.into(), 40000),
            Endpoint::new(NAMESERVER.into(), 53),
            &Chain::new(QUERY),
        )?;
        assert_eq!(actual, expected);
        Ok(())
    }

    #[test]
    fn missing_checksum_is_not_checked() -> anyhow::Result<()> {
        let mut packet = Chain::new(QUERY);
        let length = (HEADER_LEN + QUERY.len()) as u16;
        let mut header = vec![0x9c, 0x40, 0, 53];
        header.extend_from_slice(&length.to_be_bytes());
        header.extend_from_slice(&[0, 0]);
        packet.prepend(header);
        let parsed = UdpHeader::from_chain(&packet, GUEST.into(), NAMESERVER.into())?;
        assert_eq!(parsed.checksum, 0);
        Ok(())
    }

    #[test]
    fn bad_length_and_checksum_are_caught() -> anyhow::Result<()> {
        let (_, bytes) = reference_query()?;

        let mut corrupted = Chain::new(b"\x12\x35\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00");
        corrupted.prepend(bytes.clone());
        assert!(matches!(
            UdpHeader::from_chain(&corrupted, GUEST.into(), NAMESERVER.into()),
            Err(ParseError::Checksum(_))
        ));

        // Claims more bytes than arrived
        let mut short = Chain::new(&QUERY[..4]);
        short.prepend(bytes);
        assert!(matches!(
            UdpHeader::from_chain(&short, GUEST.into(), NAMESERVER.into()),
            Err(ParseError::Length(_))
        ));
        Ok(())
    }
}
