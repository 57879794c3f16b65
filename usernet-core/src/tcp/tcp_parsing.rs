use crate::{checksum::Checksum, ipv4::Ipv4Address, mbuf::Chain};
use std::{
    fmt::{self, Debug, Formatter},
    ops::BitOr,
};
use thiserror::Error as ThisError;

/// Header bytes when no options are present
pub const MIN_HEADER_LEN: usize = 20;
const PROTOCOL: u8 = 6;
const CHECKSUM_AT: usize = 16;

const OPTION_END: u8 = 0;
const OPTION_NOOP: u8 = 1;
const OPTION_MSS: u8 = 2;
const MSS_OPTION_LEN: u8 = 4;

/// A TCP header (RFC 9293 section 3.1). Of the options only the maximum
/// segment size is understood.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    /// Meaningful only with [`Control::ACK`]
    pub ack: u32,
    /// Header length in 32-bit words, options included
    pub data_offset: u8,
    pub ctl: Control,
    pub wnd: u16,
    pub urg: u16,
    /// As received. Recomputed when writing.
    pub checksum: u16,
    pub mss: Option<u16>,
}

impl TcpHeader {
    /// A header with no options and no urgent data. The ack number is only
    /// written when `ctl` carries ACK.
    pub fn new(src_port: u16, dst_port: u16, seq: u32, ack: u32, ctl: Control, wnd: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack: if ctl.ack() { ack } else { 0 },
            data_offset: (MIN_HEADER_LEN / 4) as u8,
            ctl,
            wnd,
            urg: 0,
            checksum: 0,
            mss: None,
        }
    }

    /// Reads the header at the front of `segment`, checking the checksum
    /// over the whole segment and the IPv4 pseudo-header.
    pub fn from_chain(
        segment: &Chain,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
    ) -> Result<Self, ParseError> {
        let mut fixed = [0u8; MIN_HEADER_LEN];
        if segment.copy_to(0, &mut fixed) < MIN_HEADER_LEN {
            return Err(ParseError::Truncated);
        }
        let data_offset = fixed[12] >> 4;
        let header_len = data_offset as usize * 4;
        if header_len < MIN_HEADER_LEN {
            return Err(ParseError::DataOffset(data_offset));
        }
        if header_len > segment.len() {
            return Err(ParseError::Truncated);
        }

        let length = u16::try_from(segment.len()).map_err(|_| ParseError::TooLong)?;
        let mut checksum = Checksum::new();
        checksum.add_pseudo_header(src_address, dst_address, PROTOCOL, length);
        checksum.add_chain(segment, segment.len());
        let residue = checksum.as_u16();
        if residue != 0 {
            return Err(ParseError::Checksum(residue));
        }

        let mut options = vec![0u8; header_len - MIN_HEADER_LEN];
        segment.copy_to(MIN_HEADER_LEN, &mut options);
        let half = |at: usize| u16::from_be_bytes([fixed[at], fixed[at + 1]]);
        let word = |at: usize| u32::from_be_bytes([fixed[at], fixed[at + 1], fixed[at + 2], fixed[at + 3]]);
        Ok(Self {
            src_port: half(0),
            dst_port: half(2),
            seq: word(4),
            ack: word(8),
            data_offset,
            ctl: Control(fixed[13] & Control::ALL.0),
            wnd: half(14),
            checksum: half(CHECKSUM_AT),
            urg: half(18),
            mss: find_mss(&options),
        })
    }

    /// Header length in bytes
    pub fn header_len(&self) -> usize {
        self.data_offset as usize * 4
    }

    /// Serializes the header to precede `payload` on the way from `src_address`
    /// to `dst_address`. The data offset follows from the options and the
    /// checksum from everything else.
    pub fn to_bytes(
        &self,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
        payload: &Chain,
    ) -> Result<Vec<u8>, BuildHeaderError> {
        let header_len = MIN_HEADER_LEN + if self.mss.is_some() { MSS_OPTION_LEN as usize } else { 0 };
        let length = u16::try_from(header_len + payload.len()).map_err(|_| BuildHeaderError::PayloadTooLong)?;

        let mut out = Vec::with_capacity(header_len);
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.extend_from_slice(&[((header_len / 4) as u8) << 4, self.ctl.0]);
        out.extend_from_slice(&self.wnd.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.urg.to_be_bytes());
        if let Some(mss) = self.mss {
            out.extend_from_slice(&[OPTION_MSS, MSS_OPTION_LEN]);
            out.extend_from_slice(&mss.to_be_bytes());
        }

        let mut checksum = Checksum::new();
        checksum.add_pseudo_header(src_address, dst_address, PROTOCOL, length);
        checksum.add_bytes(&out);
        checksum.add_chain(payload, payload.len());
        out[CHECKSUM_AT..CHECKSUM_AT + 2].copy_from_slice(&checksum.as_u16().to_be_bytes());
        Ok(out)
    }
}

/// The maximum segment size in an option list, if one is there. A malformed
/// list ends the search without failing the segment.
fn find_mss(options: &[u8]) -> Option<u16> {
    let mut at = 0;
    while let Some(&kind) = options.get(at) {
        match kind {
            OPTION_END => break,
            OPTION_NOOP => at += 1,
            _ => {
                let len = *options.get(at + 1)? as usize;
                let option = options.get(at..at + len).filter(|_| len >= 2)?;
                if kind == OPTION_MSS && len == MSS_OPTION_LEN as usize {
                    return Some(u16::from_be_bytes([option[2], option[3]]));
                }
                at += len;
            }
        }
    }
    None
}

#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    #[error("The TCP header is truncated")]
    Truncated,
    #[error("The segment is longer than a datagram can carry")]
    TooLong,
    #[error("The segment checksum is off by {0:#06x}")]
    Checksum(u16),
    #[error("A data offset of {0} words is below the minimum of 5")]
    DataOffset(u8),
}

#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum BuildHeaderError {
    #[error("The segment is longer than a datagram can carry")]
    PayloadTooLong,
}

/// The control bits of a TCP header
#[derive(Default, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Control(u8);

impl Control {
    pub const FIN: Self = Self(0x01);
    pub const SYN: Self = Self(0x02);
    pub const RST: Self = Self(0x04);
    pub const PSH: Self = Self(0x08);
    pub const ACK: Self = Self(0x10);
    pub const URG: Self = Self(0x20);
    const ALL: Self = Self(0x3f);

    pub const SYN_ACK: Self = Self(Self::SYN.0 | Self::ACK.0);
    pub const FIN_ACK: Self = Self(Self::FIN.0 | Self::ACK.0);
    pub const RST_ACK: Self = Self(Self::RST.0 | Self::ACK.0);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub const fn fin(self) -> bool {
        self.contains(Self::FIN)
    }

    pub const fn syn(self) -> bool {
        self.contains(Self::SYN)
    }

    pub const fn rst(self) -> bool {
        self.contains(Self::RST)
    }

    pub const fn psh(self) -> bool {
        self.contains(Self::PSH)
    }

    pub const fn ack(self) -> bool {
        self.contains(Self::ACK)
    }
}

impl BitOr for Control {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Debug for Control {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        const NAMES: [(Control, &str); 6] = [
            (Control::URG, "URG"),
            (Control::ACK, "ACK"),
            (Control::PSH, "PSH"),
            (Control::RST, "RST"),
            (Control::SYN, "SYN"),
            (Control::FIN, "FIN"),
        ];
        let set: Vec<_> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Control({})", set.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = b"GET / HTTP/1.0\r\n\r\n";
    const GUEST: Ipv4Address = Ipv4Address::new([10, 0, 2, 15]);
    const REMOTE: Ipv4Address = Ipv4Address::new([93, 184, 216, 34]);

    /// The reference encoding of a PSH+ACK data segment from the guest.
    fn reference_segment() -> anyhow::Result<(etherparse::TcpHeader, Vec<u8>)> {
        let mut reference = etherparse::TcpHeader::new(49152, 80, 0x0102_0304, 8192);
        reference.acknowledgment_number = 77;
        reference.ack = true;
        reference.psh = true;
        let ip = etherparse::Ipv4Header::new(
            PAYLOAD.len() as u16,
            64,
            etherparse::IpNumber::Tcp as u8,
            GUEST.into(),
            REMOTE.into(),
        );
        reference.checksum = reference.calc_checksum_ipv4(&ip, PAYLOAD)?;
        let mut bytes = vec![];
        reference.write(&mut bytes)?;
        Ok((reference, bytes))
    }

    #[test]
    fn reads_a_data_segment() -> anyhow::Result<()> {
        let (reference, bytes) = reference_segment()?;
        let mut segment = Chain::new(PAYLOAD);
        segment.prepend(bytes);
        let header = TcpHeader::from_chain(&segment, GUEST, REMOTE)?;
        assert_eq!((header.src_port, header.dst_port), (49152, 80));
        assert_eq!(header.seq, 0x0102_0304);
        assert_eq!(header.ack, 77);
        assert_eq!(header.ctl, Control::ACK | Control::PSH);
        assert_eq!(header.wnd, 8192);
        assert_eq!(header.checksum, reference.checksum);
        assert_eq!(header.header_len(), MIN_HEADER_LEN);
        assert_eq!(header.mss, None);
        Ok(())
    }

    #[test]
    fn writes_a_data_segment() -> anyhow::Result<()> {
        let (_, expected) = reference_segment()?;
        let header = TcpHeader::new(49152, 80, 0x0102_0304, 77, Control::ACK | Control::PSH, 8192);
        assert_eq!(header.to_bytes(GUEST, REMOTE, &Chain::new(PAYLOAD))?, expected);
        Ok(())
    }

    #[test]
    fn syn_carries_its_mss() -> anyhow::Result<()> {
        let header = TcpHeader {
            mss: Some(1460),
            ..TcpHeader::new(80, 49152, 9, 0, Control::SYN, 8192)
        };
        let bytes = header.to_bytes(REMOTE, GUEST, &Chain::default())?;
        assert_eq!(bytes.len(), 24);
        let reference = etherparse::TcpHeaderSlice::from_slice(&bytes)?;
        assert_eq!(reference.options(), &[2, 4, 0x05, 0xb4]);

        let parsed = TcpHeader::from_chain(&Chain::new(bytes), REMOTE, GUEST)?;
        assert_eq!(parsed.mss, Some(1460));
        assert_eq!(parsed.ctl, Control::SYN);
        assert_eq!(parsed.ack, 0);
        Ok(())
    }

    #[test]
    fn mss_search_skips_other_options() {
        assert_eq!(find_mss(&[1, 1, 2, 4, 0x02, 0x18]), Some(536));
        // A timestamp option first
        assert_eq!(find_mss(&[8, 10, 0, 0, 0, 0, 0, 0, 0, 0, 2, 4, 1, 0]), Some(256));
        assert_eq!(find_mss(&[2, 0]), None);
        assert_eq!(find_mss(&[2, 4, 1]), None);
        assert_eq!(find_mss(&[0, 2, 4, 1, 0]), None);
    }

    #[test]
    fn corrupted_payload_fails_the_checksum() -> anyhow::Result<()> {
        let (_, bytes) = reference_segment()?;
        let mut segment = Chain::new(b"GET / HTTP/1.1\r\n\r\n");
        segment.prepend(bytes);
        assert!(matches!(
            TcpHeader::from_chain(&segment, GUEST, REMOTE),
            Err(ParseError::Checksum(_))
        ));
        Ok(())
    }

    #[test]
    fn control_flags() {
        let mut ctl = Control::FIN_ACK;
        assert_eq!(format!("{ctl:?}"), "Control(ACK, FIN)");
        ctl.remove(Control::FIN);
        ctl.insert(Control::PSH);
        assert!(ctl.ack() && ctl.psh() && !ctl.fin());
        assert_eq!(format!("{:?}", Control::default()), "Control()");
    }
}
