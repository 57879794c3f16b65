//! The boundary between the stack and whatever hosts it.
//!
//! The stack never touches the outside world directly. Frames for the guest,
//! timer requests, and every host socket operation go through a
//! [`Callbacks`] implementation owned by the stack. Host operations must not
//! block: an operation that cannot complete yet returns
//! [`io::ErrorKind::WouldBlock`] and is retried on the next poll.

use crate::ipv4::Ipv4Address;
use std::{fmt, io, net::SocketAddrV4};

/// An opaque reference to a host socket, chosen by the callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostHandle(pub u64);

impl fmt::Display for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host#{}", self.0)
    }
}

/// The stack's two periodic timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Every 200 ms, flushes delayed acknowledgments
    Fast,
    /// Every 500 ms, drives retransmission, keepalive, and expiry
    Slow,
}

/// Progress of a non-blocking connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    InProgress,
    Connected,
    Failed(io::ErrorKind),
}

pub trait Callbacks {
    /// Delivers an Ethernet frame to the guest.
    fn send_frame(&mut self, frame: &[u8]);

    /// Asks to be called back through `Stack::timer_expired` at
    /// `deadline_ms`. Hosts that call `Stack::poll` often enough can ignore
    /// this.
    fn timer_mod(&mut self, _kind: TimerKind, _deadline_ms: u64) {}

    /// Starts a non-blocking TCP connect.
    fn tcp_connect(&mut self, target: SocketAddrV4) -> io::Result<HostHandle>;

    fn connect_status(&mut self, handle: HostHandle) -> ConnectStatus;

    /// Opens a listening TCP socket. Returns its handle and the address it
    /// actually bound, which differs from `bind` when port zero was asked
    /// for.
    fn tcp_listen(&mut self, bind: SocketAddrV4) -> io::Result<(HostHandle, SocketAddrV4)>;

    /// Accepts one pending connection on a listener.
    fn tcp_accept(&mut self, listener: HostHandle) -> io::Result<(HostHandle, SocketAddrV4)>;

    fn tcp_send(&mut self, handle: HostHandle, data: &[u8]) -> io::Result<usize>;

    /// Reads what is available. `Ok(0)` means the host peer closed its side.
    fn tcp_recv(&mut self, handle: HostHandle, buf: &mut [u8]) -> io::Result<usize>;

    fn tcp_shutdown_write(&mut self, handle: HostHandle) -> io::Result<()>;

    /// The local address of a connected socket, as the outside world sees
    /// this host.
    fn local_addr(&mut self, handle: HostHandle) -> io::Result<SocketAddrV4>;

    /// Opens a UDP socket bound to `bind`.
    fn udp_bind(&mut self, bind: SocketAddrV4) -> io::Result<(HostHandle, SocketAddrV4)>;

    fn udp_send_to(&mut self, handle: HostHandle, data: &[u8], target: SocketAddrV4) -> io::Result<usize>;

    fn udp_recv_from(&mut self, handle: HostHandle, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)>;

    /// Sends an ICMP echo request from the host. Hosts without unprivileged
    /// ICMP leave this unsupported and the guest gets a host-unreachable
    /// reply instead.
    fn icmp_echo(
        &mut self,
        _target: Ipv4Address,
        _identifier: u16,
        _sequence: u16,
        _payload: &[u8],
    ) -> io::Result<HostHandle> {
        Err(io::ErrorKind::Unsupported.into())
    }

    /// Receives one ICMP message, header included, on a handle from
    /// [`Callbacks::icmp_echo`].
    fn icmp_recv(&mut self, _handle: HostHandle, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    /// Releases a host socket of any kind.
    fn close(&mut self, handle: HostHandle);
}
