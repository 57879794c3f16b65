//! Small helpers shared by the wire parsers and the socket layer.

use crate::{ethernet::MacAddress, ipv4::Ipv4Address};
use std::fmt::{self, Display};

/// One end of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoint {
    pub address: Ipv4Address,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(address: Ipv4Address, port: u16) -> Self {
        Self { address, port }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Pulls fixed-size big-endian fields off the front of a byte iterator.
/// Every method gives `None` once the bytes run out.
pub trait ByteReader: Iterator<Item = u8> {
    fn take_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut out = [0; N];
        for slot in out.iter_mut() {
            *slot = self.next()?;
        }
        Some(out)
    }

    fn take_u16(&mut self) -> Option<u16> {
        self.take_array().map(u16::from_be_bytes)
    }

    fn take_mac(&mut self) -> Option<MacAddress> {
        self.take_array().map(MacAddress::new)
    }

    fn take_ipv4(&mut self) -> Option<Ipv4Address> {
        self.take_array().map(Ipv4Address::new)
    }
}

impl<T: Iterator<Item = u8>> ByteReader for T {}
