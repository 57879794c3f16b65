//! Stack configuration. A [`StackConfig`] is checked once when the stack is
//! created and never changes afterward.

use crate::{ethernet::MacAddress, ipv4::Ipv4Address};
use std::net::{Ipv6Addr, SocketAddrV4};
use thiserror::Error as ThisError;

/// The smallest MTU every IPv4 link must support
pub const MIN_MTU: u16 = 68;
/// The largest MTU the stack accepts
pub const MAX_MTU: u16 = 65521;
/// Longest hostname carried in DHCP replies
pub const MAX_HOSTNAME_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    /// Refuse outbound connections except configured guest forwards
    pub restricted: bool,
    /// The virtual network the guest lives on
    pub network: Ipv4Address,
    pub netmask: Ipv4Address,
    /// The stack's own address as the guest's gateway
    pub host: Ipv4Address,
    /// The stack's hardware address on the virtual link
    pub host_mac: MacAddress,
    /// First address handed out by DHCP, assumed to be the guest's
    pub dhcp_start: Ipv4Address,
    /// Virtual DNS server address
    pub nameserver: Ipv4Address,
    /// Where queries sent to `nameserver` on port 53 are relayed. `None`
    /// drops them.
    pub dns_upstream: Option<SocketAddrV4>,
    pub ipv6_prefix: Ipv6Addr,
    pub ipv6_prefix_len: u8,
    pub ipv6_host: Ipv6Addr,
    pub mtu: u16,
    pub mru: u16,
    pub hostname: Option<String>,
    /// Connections to `host` reach the real loopback unless disabled
    pub disable_host_loopback: bool,
    /// Rewrite embedded addresses in FTP and IRC control traffic
    pub enable_emu: bool,
    /// Probe idle TCP connections
    pub keepalive: bool,
    /// Ceiling on buffers held by the output path
    pub max_mbufs: usize,
    /// Ceiling on concurrent sockets
    pub max_sockets: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            restricted: false,
            network: Ipv4Address::new([10, 0, 2, 0]),
            netmask: Ipv4Address::new([255, 255, 255, 0]),
            host: Ipv4Address::new([10, 0, 2, 2]),
            host_mac: MacAddress::new([0x52, 0x55, 0x0a, 0x00, 0x02, 0x02]),
            dhcp_start: Ipv4Address::new([10, 0, 2, 15]),
            nameserver: Ipv4Address::new([10, 0, 2, 3]),
            dns_upstream: None,
            ipv6_prefix: Ipv6Addr::new(0xfec0, 0, 0, 0, 0, 0, 0, 0),
            ipv6_prefix_len: 64,
            ipv6_host: Ipv6Addr::new(0xfec0, 0, 0, 0, 0, 0, 0, 2),
            mtu: 1500,
            mru: 1500,
            hostname: None,
            disable_host_loopback: false,
            enable_emu: true,
            keepalive: false,
            max_mbufs: 16384,
            max_sockets: 1024,
        }
    }
}

impl StackConfig {
    /// Checks the configuration is internally consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mask = self.netmask.to_u32();
        if mask.leading_ones() + mask.trailing_zeros() != 32 || mask == 0 {
            return Err(ConfigError::NonContiguousNetmask(self.netmask));
        }
        if self.network.masked(self.netmask) != self.network {
            return Err(ConfigError::HostBitsInNetwork(self.network));
        }
        for (role, address) in [
            ("host", self.host),
            ("DHCP start", self.dhcp_start),
            ("nameserver", self.nameserver),
        ] {
            if !address.in_network(self.network, self.netmask) {
                return Err(ConfigError::OutsideNetwork { role, address });
            }
            if address == self.network || address.is_broadcast_in(self.network, self.netmask) {
                return Err(ConfigError::ReservedAddress { role, address });
            }
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::Mtu(self.mtu));
        }
        if self.mru < MIN_MTU {
            return Err(ConfigError::Mru(self.mru));
        }
        if self.ipv6_prefix_len > 126 {
            return Err(ConfigError::Ipv6PrefixLength(self.ipv6_prefix_len));
        }
        if let Some(hostname) = &self.hostname {
            if hostname.len() > MAX_HOSTNAME_LEN {
                return Err(ConfigError::HostnameTooLong(hostname.len()));
            }
        }
        if self.max_mbufs == 0 || self.max_sockets == 0 {
            return Err(ConfigError::ZeroLimit);
        }
        Ok(())
    }

    /// The largest TCP segment that fits both link directions.
    pub fn tcp_mss(&self) -> u16 {
        self.mtu.min(self.mru).saturating_sub(40)
    }

    /// The guest's address on the virtual network
    pub fn guest(&self) -> Ipv4Address {
        self.dhcp_start
    }

    /// Is `address` one the stack answers for itself?
    pub fn is_virtual_address(&self, address: Ipv4Address) -> bool {
        address == self.host || address == self.nameserver
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("The netmask {0} is not contiguous")]
    NonContiguousNetmask(Ipv4Address),
    #[error("The network address {0} has host bits set")]
    HostBitsInNetwork(Ipv4Address),
    #[error("The {role} address {address} is outside the virtual network")]
    OutsideNetwork {
        role: &'static str,
        address: Ipv4Address,
    },
    #[error("The {role} address {address} is the network or broadcast address")]
    ReservedAddress {
        role: &'static str,
        address: Ipv4Address,
    },
    #[error("The MTU {0} is outside 68..=65521")]
    Mtu(u16),
    #[error("The MRU {0} is below 68")]
    Mru(u16),
    #[error("The IPv6 prefix length {0} leaves no room for hosts")]
    Ipv6PrefixLength(u8),
    #[error("The hostname is {0} bytes, more than 32")]
    HostnameTooLong(usize),
    #[error("Buffer and socket limits must be nonzero")]
    ZeroLimit,
}
