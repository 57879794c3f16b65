//! Application-layer emulation for protocols that carry addresses in their
//! payload.
//!
//! When the guest tells a remote party "connect back to me at a.b.c.d:p",
//! that address is on the virtual network and unreachable from outside. The
//! stack finds such offers in data the guest sends, opens a host listener
//! that redirects to the offered guest port, and rewrites the offer to name
//! the listener instead.

use crate::ipv4::Ipv4Address;

/// The protocols whose payloads are inspected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmuKind {
    /// `PORT` commands and passive-mode replies
    Ftp,
    /// DCC offers
    Irc,
}

impl EmuKind {
    /// The emulation that applies to a well-known server port, if any.
    pub fn for_port(port: u16) -> Option<Self> {
        match port {
            21 => Some(Self::Ftp),
            6667 => Some(Self::Irc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notation {
    /// `a,b,c,d,p1,p2`
    Ftp,
    /// `<address as decimal u32> <port>`
    Dcc,
}

/// An address and port the guest offered, and where it sits in the data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    pub address: Ipv4Address,
    pub port: u16,
    start: usize,
    end: usize,
    notation: Notation,
}

impl Offer {
    /// The data with the offer replaced by `address:port`.
    pub fn rewrite(&self, data: &[u8], address: Ipv4Address, port: u16) -> Vec<u8> {
        let replacement = match self.notation {
            Notation::Ftp => {
                let [a, b, c, d] = address.to_bytes();
                format!("{a},{b},{c},{d},{},{}", port >> 8, port & 0xff)
            }
            Notation::Dcc => format!("{} {port}", address.to_u32()),
        };
        let mut out = Vec::with_capacity(data.len() + replacement.len());
        out.extend_from_slice(&data[..self.start]);
        out.extend_from_slice(replacement.as_bytes());
        out.extend_from_slice(&data[self.end..]);
        out
    }
}

/// Looks for the first offer in a chunk of guest data.
pub fn find_offer(kind: EmuKind, data: &[u8]) -> Option<Offer> {
    match kind {
        EmuKind::Ftp => find(data, b"PORT ")
            .or_else(|| find(data, b"227 Entering Passive Mode ("))
            .and_then(|start| ftp_numbers(data, start)),
        EmuKind::Irc => find(data, b"\x01DCC ").and_then(|start| dcc_numbers(data, start)),
    }
}

fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
    data.windows(needle.len())
        .position(|window| window == needle)
        .map(|position| position + needle.len())
}

fn ftp_numbers(data: &[u8], start: usize) -> Option<Offer> {
    let mut cursor = start;
    let mut numbers = [0u8; 6];
    for (i, number) in numbers.iter_mut().enumerate() {
        if i > 0 {
            expect(data, &mut cursor, b',')?;
        }
        *number = u8::try_from(decimal(data, &mut cursor)?).ok()?;
    }
    let [a, b, c, d, high, low] = numbers;
    Some(Offer {
        address: Ipv4Address::new([a, b, c, d]),
        port: u16::from_be_bytes([high, low]),
        start,
        end: cursor,
        notation: Notation::Ftp,
    })
}

fn dcc_numbers(data: &[u8], start: usize) -> Option<Offer> {
    let mut cursor = start;
    // The command, then its argument (a nickname or file name)
    for _ in 0..2 {
        word(data, &mut cursor)?;
        expect(data, &mut cursor, b' ')?;
    }
    let address_start = cursor;
    let address = decimal(data, &mut cursor)?;
    expect(data, &mut cursor, b' ')?;
    let port = u16::try_from(decimal(data, &mut cursor)?).ok()?;
    Some(Offer {
        address: Ipv4Address::from(address),
        port,
        start: address_start,
        end: cursor,
        notation: Notation::Dcc,
    })
}

fn decimal(data: &[u8], cursor: &mut usize) -> Option<u32> {
    let digits = data[*cursor..]
        .iter()
        .take_while(|byte| byte.is_ascii_digit())
        .count();
    if digits == 0 || digits > 10 {
        return None;
    }
    let text = std::str::from_utf8(&data[*cursor..*cursor + digits]).ok()?;
    *cursor += digits;
    text.parse().ok()
}

fn word(data: &[u8], cursor: &mut usize) -> Option<()> {
    let len = data[*cursor..]
        .iter()
        .take_while(|byte| !byte.is_ascii_whitespace() && **byte != 1)
        .count();
    (len > 0).then(|| *cursor += len)
}

fn expect(data: &[u8], cursor: &mut usize, byte: u8) -> Option<()> {
    (data.get(*cursor) == Some(&byte)).then(|| *cursor += 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: Ipv4Address = Ipv4Address::new([192, 168, 1, 20]);

    #[test]
    fn ftp_port_command() {
        let data = b"PORT 10,0,2,15,4,1\r\n";
        let offer = find_offer(EmuKind::Ftp, data).expect("offer");
        assert_eq!(offer.address, Ipv4Address::new([10, 0, 2, 15]));
        assert_eq!(offer.port, 1025);
        assert_eq!(
            offer.rewrite(data, HOST, 40000),
            b"PORT 192,168,1,20,156,64\r\n"
        );
    }

    #[test]
    fn ftp_passive_reply() {
        let data = b"227 Entering Passive Mode (10,0,2,15,200,10).\r\n";
        let offer = find_offer(EmuKind::Ftp, data).expect("offer");
        assert_eq!(offer.port, 200 * 256 + 10);
        assert_eq!(
            offer.rewrite(data, HOST, 2049),
            b"227 Entering Passive Mode (192,168,1,20,8,1).\r\n"
        );
    }

    #[test]
    fn irc_dcc_send() {
        let data = b"PRIVMSG bob :\x01DCC SEND file.txt 167772687 5000 1024\x01\r\n";
        let offer = find_offer(EmuKind::Irc, data).expect("offer");
        assert_eq!(offer.address, Ipv4Address::new([10, 0, 2, 15]));
        assert_eq!(offer.port, 5000);
        let rewritten = offer.rewrite(data, HOST, 6000);
        assert_eq!(
            rewritten,
            format!(
                "PRIVMSG bob :\x01DCC SEND file.txt {} 6000 1024\x01\r\n",
                HOST.to_u32()
            )
            .as_bytes()
        );
    }

    #[test]
    fn ordinary_data_has_no_offer() {
        assert_eq!(find_offer(EmuKind::Ftp, b"RETR PORTS.txt\r\n"), None);
        assert_eq!(find_offer(EmuKind::Ftp, b"PORT 300,0,0,1,0,21\r\n"), None);
        assert_eq!(find_offer(EmuKind::Irc, b"PRIVMSG #chan :hi\r\n"), None);
    }

    #[test]
    fn well_known_ports() {
        assert_eq!(EmuKind::for_port(21), Some(EmuKind::Ftp));
        assert_eq!(EmuKind::for_port(6667), Some(EmuKind::Irc));
        assert_eq!(EmuKind::for_port(80), None);
    }
}
