//! Splitting outbound datagrams to fit the link MTU (RFC 791 section 3.2).

use super::ipv4_parsing::Ipv4Header;
use crate::mbuf::Chain;

/// A header and the payload bytes it carries
pub type Fragment = (Ipv4Header, Chain);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragments {
    /// The datagram already fits
    Unchanged(Fragment),
    /// The datagram was split, first piece first
    Split(Vec<Fragment>),
    /// The datagram is too large and has DF set
    DontFragmentSet,
}

/// Splits a datagram so every piece, header included, fits in `mtu` bytes.
/// The header's `total_length` must describe `body`. Every piece but the
/// last carries a multiple of 8 payload bytes and has MF set; the last keeps
/// the original MF, so an already fragmented datagram can be split again.
pub fn fragment(header: Ipv4Header, mut body: Chain, mtu: u16) -> Fragments {
    if header.total_length <= mtu {
        return Fragments::Unchanged((header, body));
    }
    if header.dont_fragment {
        return Fragments::DontFragmentSet;
    }

    let header_len = header.header_len();
    // Payload bytes per full piece, rounded down to whole blocks
    let per_piece = (mtu as usize).saturating_sub(header_len) & !7;
    if per_piece == 0 {
        return Fragments::DontFragmentSet;
    }

    let mut pieces = Vec::with_capacity(body.len().div_ceil(per_piece));
    let mut offset_blocks = header.fragment_offset;
    while body.len() > per_piece {
        let piece = body.cut(per_piece);
        pieces.push((
            Ipv4Header {
                total_length: (header_len + per_piece) as u16,
                fragment_offset: offset_blocks,
                more_fragments: true,
                ..header
            },
            piece,
        ));
        offset_blocks += (per_piece / 8) as u16;
    }
    pieces.push((
        Ipv4Header {
            total_length: (header_len + body.len()) as u16,
            fragment_offset: offset_blocks,
            ..header
        },
        body,
    ));
    Fragments::Split(pieces)
}
