//! Sockets tie a guest flow to a host socket.
//!
//! Every TCP connection, UDP flow, and ICMP echo exchange the guest starts
//! gets one [`Socket`], found again by its [`FlowKey`]. A TCP socket owns its
//! control block and both byte buffers; destroying the socket destroys the
//! control block with it, so no timer can outlive its connection.

use crate::{
    callbacks::HostHandle,
    ipv4::ipv4_parsing::TypeOfService,
    tcp::{emu::EmuKind, tcb::Tcb},
    utility::Endpoint,
};
use std::{fmt, io, net::SocketAddrV4};
use thiserror::Error as ThisError;

pub mod sbuf;
use sbuf::SocketBuffers;

mod table;
pub use table::SocketTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u32);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "so#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
        }
    }

    /// The transport an IPv4 protocol number names, if the stack carries it.
    pub const fn from_number(number: u8) -> Option<Self> {
        match number {
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            1 => Some(Self::Icmp),
            _ => None,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Tcp => 0,
            Self::Udp => 1,
            Self::Icmp => 2,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        })
    }
}

/// Identifies a flow from the guest's point of view. For ICMP the guest
/// port holds the echo identifier and the remote port the sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    /// The guest's end
    pub guest: Endpoint,
    /// The address the guest is talking to
    pub remote: Endpoint,
}

impl FlowKey {
    pub const fn new(protocol: Protocol, guest: Endpoint, remote: Endpoint) -> Self {
        Self {
            protocol,
            guest,
            remote,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} <-> {}", self.protocol, self.guest, self.remote)
    }
}

/// Who started the flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The guest sent the first packet
    Guest,
    /// A host connection arrived on a configured forward
    HostForward,
    /// A host connection arrived on a redirect prepared by protocol
    /// emulation
    Redirect,
}

/// Progress flags beyond what the control block tracks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketState {
    /// The host connect has not completed
    pub connecting: bool,
    /// The host will send no more
    pub host_eof: bool,
    /// The guest will send no more. Shut the host's write side once
    /// everything buffered has been written.
    pub guest_eof: bool,
    /// The host's write side has been shut
    pub host_write_shut: bool,
}

#[derive(Debug)]
pub struct Socket {
    pub id: SocketId,
    pub key: FlowKey,
    pub host: Option<HostHandle>,
    /// The host-side address the flow is relayed to, or for a UDP forward
    /// the last sender
    pub peer: Option<SocketAddrV4>,
    pub origin: Origin,
    pub state: SocketState,
    pub buffers: SocketBuffers,
    pub tcb: Option<Tcb>,
    /// Chooses the output queue for this flow's packets
    pub tos: TypeOfService,
    pub emu: Option<EmuKind>,
    /// When an idle UDP or ICMP socket is reclaimed
    pub expires_at_ms: Option<u64>,
    /// The guest's SYN (IP header and eight bytes), quoted in an ICMP error
    /// if the host connect fails
    pub syn_quote: Option<Vec<u8>>,
}

impl Socket {
    pub fn new(id: SocketId, key: FlowKey, origin: Origin) -> Self {
        Self {
            id,
            key,
            host: None,
            peer: None,
            origin,
            state: SocketState::default(),
            buffers: SocketBuffers::default(),
            tcb: None,
            tos: TypeOfService::default(),
            emu: None,
            expires_at_ms: None,
            syn_quote: None,
        }
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    #[error("The socket table is full ({0} sockets)")]
    TableFull(usize),
    #[error("Restricted mode refuses flows to {0}")]
    Restricted(Endpoint),
    #[error("The host refused the socket: {0}")]
    Host(io::ErrorKind),
}

impl From<io::Error> for SocketError {
    fn from(error: io::Error) -> Self {
        Self::Host(error.kind())
    }
}
