use std::{fmt, net::Ipv4Addr};

/// An IPv4 address, held in host order so masking and comparison are plain
/// integer operations.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv4Address(u32);

impl Ipv4Address {
    pub const UNSPECIFIED: Self = Self(0);
    pub const LOCALHOST: Self = Self::new([127, 0, 0, 1]);
    /// `255.255.255.255`
    pub const BROADCAST: Self = Self(u32::MAX);

    pub const fn new(octets: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(octets))
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    /// The address in network byte order.
    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub const fn is_unspecified(self) -> bool {
        self.0 == 0
    }

    /// 224.0.0.0/4
    pub const fn is_multicast(self) -> bool {
        self.0 >> 28 == 0xe
    }

    pub const fn masked(self, mask: Ipv4Address) -> Self {
        Self(self.0 & mask.0)
    }

    /// Whether the address lies inside `network`/`mask`.
    pub const fn in_network(self, network: Ipv4Address, mask: Ipv4Address) -> bool {
        (self.0 ^ network.0) & mask.0 == 0
    }

    /// Limited broadcast, or the directed broadcast of `network`/`mask`.
    pub const fn is_broadcast_in(self, network: Ipv4Address, mask: Ipv4Address) -> bool {
        self.0 == u32::MAX || (self.in_network(network, mask) && self.0 | mask.0 == u32::MAX)
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Ipv4Addr::from(*self), f)
    }
}

impl fmt::Debug for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ipv4Address({self})")
    }
}

impl From<u32> for Ipv4Address {
    fn from(n: u32) -> Self {
        Self(n)
    }
}

impl From<Ipv4Address> for u32 {
    fn from(address: Ipv4Address) -> Self {
        address.0
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(octets: [u8; 4]) -> Self {
        Self::new(octets)
    }
}

impl From<Ipv4Address> for [u8; 4] {
    fn from(address: Ipv4Address) -> Self {
        address.to_bytes()
    }
}

impl From<Ipv4Addr> for Ipv4Address {
    fn from(address: Ipv4Addr) -> Self {
        Self(address.into())
    }
}

impl From<Ipv4Address> for Ipv4Addr {
    fn from(address: Ipv4Address) -> Self {
        Ipv4Addr::from(address.0)
    }
}
