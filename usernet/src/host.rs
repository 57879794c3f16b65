//! Host sockets for the stack, over `std::net`.
//!
//! Every socket is non-blocking from the moment it exists. Outbound connects
//! are started with `socket2` and left in progress; the stack polls for the
//! result through [`Callbacks::connect_status`].

use crate::link::FrameWriter;
use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket},
    time::{Duration, Instant},
};
use usernet_core::{Callbacks, ConnectStatus, HostHandle, TimerKind};

/// How long an outbound connect may take before the guest is told it failed
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
enum HostSocket {
    Connecting { socket: Socket, since: Instant },
    Failed(io::ErrorKind),
    Stream(TcpStream),
    Listener(TcpListener),
    Datagram(UdpSocket),
}

/// The stack's view of the host: real sockets, the link back to the
/// emulator, and the timer deadlines the stack asked for.
#[derive(Debug, Default)]
pub struct HostSockets {
    sockets: FxHashMap<HostHandle, HostSocket>,
    next_handle: u64,
    link: FrameWriter,
    fast_deadline: Option<u64>,
    slow_deadline: Option<u64>,
}

impl HostSockets {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, socket: HostSocket) -> HostHandle {
        self.next_handle += 1;
        let handle = HostHandle(self.next_handle);
        self.sockets.insert(handle, socket);
        handle
    }

    fn stream(&mut self, handle: HostHandle) -> io::Result<&mut TcpStream> {
        match self.sockets.get_mut(&handle) {
            Some(HostSocket::Stream(stream)) => Ok(stream),
            Some(HostSocket::Connecting { .. }) => Err(io::ErrorKind::WouldBlock.into()),
            Some(HostSocket::Failed(kind)) => Err((*kind).into()),
            _ => Err(io::ErrorKind::NotFound.into()),
        }
    }

    fn datagram(&mut self, handle: HostHandle) -> io::Result<&mut UdpSocket> {
        match self.sockets.get_mut(&handle) {
            Some(HostSocket::Datagram(socket)) => Ok(socket),
            _ => Err(io::ErrorKind::NotFound.into()),
        }
    }

    /// Sends the frames the stack has produced to the emulator. Returns
    /// whether all of them went out.
    pub fn flush_link(&mut self, out: &mut impl Write) -> io::Result<bool> {
        self.link.flush(out)?;
        Ok(self.link.is_empty())
    }

    /// The earliest timer deadline still wanted.
    pub fn next_deadline(&self) -> Option<u64> {
        match (self.fast_deadline, self.slow_deadline) {
            (Some(fast), Some(slow)) => Some(fast.min(slow)),
            (fast, slow) => fast.or(slow),
        }
    }

    /// Forgets the deadlines that have passed. The stack asks again for
    /// anything it still needs.
    pub fn clear_deadlines(&mut self, now_ms: u64) {
        self.fast_deadline = self.fast_deadline.filter(|&deadline| deadline > now_ms);
        self.slow_deadline = self.slow_deadline.filter(|&deadline| deadline > now_ms);
    }

    pub fn open_sockets(&self) -> usize {
        self.sockets.len()
    }
}

fn v4(address: SocketAddr) -> io::Result<SocketAddrV4> {
    match address {
        SocketAddr::V4(address) => Ok(address),
        SocketAddr::V6(_) => Err(io::ErrorKind::Unsupported.into()),
    }
}

/// Whether a non-blocking connect was started rather than refused.
fn in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    e.kind() == io::ErrorKind::WouldBlock
}

impl Callbacks for HostSockets {
    fn send_frame(&mut self, frame: &[u8]) {
        self.link.push(frame);
    }

    fn timer_mod(&mut self, kind: TimerKind, deadline_ms: u64) {
        match kind {
            TimerKind::Fast => self.fast_deadline = Some(deadline_ms),
            TimerKind::Slow => self.slow_deadline = Some(deadline_ms),
        }
    }

    fn tcp_connect(&mut self, target: SocketAddrV4) -> io::Result<HostHandle> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        let next = match socket.connect(&SockAddr::from(target)) {
            Ok(()) => HostSocket::Stream(socket.into()),
            Err(e) if in_progress(&e) => HostSocket::Connecting {
                socket,
                since: Instant::now(),
            },
            Err(e) => return Err(e),
        };
        tracing::debug!(%target, "connecting");
        Ok(self.insert(next))
    }

    fn connect_status(&mut self, handle: HostHandle) -> ConnectStatus {
        let Some(slot) = self.sockets.get_mut(&handle) else {
            return ConnectStatus::Failed(io::ErrorKind::NotFound);
        };
        let failed = match &*slot {
            HostSocket::Connecting { socket, since } => match socket.take_error() {
                Ok(Some(e)) | Err(e) => Some(e.kind()),
                Ok(None) => match socket.peer_addr() {
                    Ok(_) => None,
                    Err(_) if since.elapsed() >= CONNECT_TIMEOUT => Some(io::ErrorKind::TimedOut),
                    Err(_) => return ConnectStatus::InProgress,
                },
            },
            HostSocket::Failed(kind) => return ConnectStatus::Failed(*kind),
            _ => return ConnectStatus::Connected,
        };
        let previous = std::mem::replace(slot, HostSocket::Failed(io::ErrorKind::Other));
        match (failed, previous) {
            (Some(kind), _) => {
                *slot = HostSocket::Failed(kind);
                ConnectStatus::Failed(kind)
            }
            (None, HostSocket::Connecting { socket, .. }) => {
                *slot = HostSocket::Stream(socket.into());
                ConnectStatus::Connected
            }
            (None, _) => ConnectStatus::Failed(io::ErrorKind::Other),
        }
    }

    fn tcp_listen(&mut self, bind: SocketAddrV4) -> io::Result<(HostHandle, SocketAddrV4)> {
        let listener = TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let bound = v4(listener.local_addr()?)?;
        tracing::info!(%bound, "listening");
        Ok((self.insert(HostSocket::Listener(listener)), bound))
    }

    fn tcp_accept(&mut self, listener: HostHandle) -> io::Result<(HostHandle, SocketAddrV4)> {
        let Some(HostSocket::Listener(listener)) = self.sockets.get(&listener) else {
            return Err(io::ErrorKind::NotFound.into());
        };
        let (stream, from) = listener.accept()?;
        stream.set_nonblocking(true)?;
        let from = v4(from)?;
        Ok((self.insert(HostSocket::Stream(stream)), from))
    }

    fn tcp_send(&mut self, handle: HostHandle, data: &[u8]) -> io::Result<usize> {
        self.stream(handle)?.write(data)
    }

    fn tcp_recv(&mut self, handle: HostHandle, buf: &mut [u8]) -> io::Result<usize> {
        self.stream(handle)?.read(buf)
    }

    fn tcp_shutdown_write(&mut self, handle: HostHandle) -> io::Result<()> {
        self.stream(handle)?.shutdown(Shutdown::Write)
    }

    fn local_addr(&mut self, handle: HostHandle) -> io::Result<SocketAddrV4> {
        v4(self.stream(handle)?.local_addr()?)
    }

    fn udp_bind(&mut self, bind: SocketAddrV4) -> io::Result<(HostHandle, SocketAddrV4)> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        let bound = v4(socket.local_addr()?)?;
        Ok((self.insert(HostSocket::Datagram(socket)), bound))
    }

    fn udp_send_to(&mut self, handle: HostHandle, data: &[u8], target: SocketAddrV4) -> io::Result<usize> {
        self.datagram(handle)?.send_to(data, target)
    }

    fn udp_recv_from(&mut self, handle: HostHandle, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        let (n, from) = self.datagram(handle)?.recv_from(buf)?;
        Ok((n, v4(from)?))
    }

    fn close(&mut self, handle: HostHandle) {
        if self.sockets.remove(&handle).is_none() {
            tracing::warn!(%handle, "closing an unknown host socket");
        }
    }
}
