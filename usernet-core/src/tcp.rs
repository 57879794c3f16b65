//! The Transmission Control Protocol, terminated inside the stack.
//!
//! Each guest connection is answered by a [`tcb::Tcb`] and relayed over a
//! host socket, so the guest's TCP never reaches the outside world. This
//! module is the glue: it demultiplexes segments to sockets, opens host
//! connections for new flows, moves bytes between the socket buffers and the
//! host, and addresses the segments the control blocks produce.

pub mod emu;
pub mod seq;
pub mod tcb;
pub mod tcp_parsing;

use self::{
    emu::{find_offer, EmuKind, Offer},
    tcb::{Disposition, OutSegment, Tcb, TcbConfig, TimerOutcome},
    tcp_parsing::{Control, TcpHeader},
};
use crate::{
    callbacks::{Callbacks, ConnectStatus, HostHandle},
    icmp::icmp_parsing::{unreachable, DESTINATION_UNREACHABLE},
    interface::Queue,
    ipv4::{
        ipv4_parsing::{Ipv4Header, TypeOfService},
        quote, Ipv4Address,
    },
    logging::{drop_event, reply_event, socket_event},
    mbuf::Chain,
    socket::{FlowKey, Origin, Protocol, Socket, SocketError, SocketId},
    stack::{DropReason, InputOutcome, Listener, ListenerKind, Stack},
    utility::Endpoint,
};
use std::{
    io,
    net::{Ipv4Addr, SocketAddrV4},
};

/// ISS advance for each new connection
const TCP_ISSINCR_CONNECT: u32 = 32_000;
/// ISS advance each slow tick
const TCP_ISSINCR_TICK: u32 = 64_000;
/// Interactive services: their segments skip the batch queue
const LOW_DELAY_PORTS: [u16; 3] = [22, 23, 513];
/// Largest single read from a host socket
const READ_CHUNK: usize = 16 * 1024;

/// The service class and emulation for a connection to or from a
/// well-known port.
pub fn tcp_tos(port: u16) -> (TypeOfService, Option<EmuKind>) {
    if LOW_DELAY_PORTS.contains(&port) {
        return (TypeOfService::LOW_DELAY, None);
    }
    match EmuKind::for_port(port) {
        Some(kind) => (TypeOfService::THROUGHPUT, Some(kind)),
        None => (TypeOfService::default(), None),
    }
}

impl<C: Callbacks> Stack<C> {
    pub(crate) fn tcp_input(&mut self, ip: &Ipv4Header, mut segment: Chain) -> InputOutcome {
        self.stats.tcp.segments_in += 1;
        let header = match TcpHeader::from_chain(&segment, ip.source, ip.destination) {
            Ok(header) => header,
            Err(e) => {
                self.stats.tcp.bad_segments += 1;
                drop_event(DropReason::Malformed, &e.to_string());
                return InputOutcome::Dropped(DropReason::Malformed);
            }
        };
        let quoted = quote(ip, &segment);
        segment.remove_front(header.header_len());
        let key = FlowKey::new(
            Protocol::Tcp,
            Endpoint::new(ip.source, header.src_port),
            Endpoint::new(ip.destination, header.dst_port),
        );

        let Some(id) = self.sockets.lookup(&key) else {
            if header.ctl.rst() {
                return InputOutcome::Dropped(DropReason::NoConnection);
            }
            if header.ctl.syn() && !header.ctl.ack() && !header.ctl.fin() {
                return self.tcp_open_from_guest(key, &header, quoted);
            }
            return self.tcp_respond(&key, &header, segment.len());
        };

        let payload_len = segment.len();
        let Some(socket) = self.sockets.get_mut(id) else {
            return InputOutcome::Dropped(DropReason::NoConnection);
        };
        let Socket { tcb, buffers, .. } = socket;
        let Some(tcb) = tcb.as_mut() else {
            return InputOutcome::Dropped(DropReason::NoConnection);
        };
        let arrival = tcb.segment_arrives(&header, segment, buffers);

        if !arrival.retransmitted.is_empty() {
            self.stats.tcp.fast_retransmits += 1;
            self.tcp_emit(id, arrival.retransmitted);
        }
        match arrival.disposition {
            Disposition::Accepted | Disposition::Discarded => {
                if !arrival.delivered.is_empty() {
                    self.tcp_deliver(id, arrival.delivered);
                }
                if arrival.fin {
                    if let Some(socket) = self.sockets.get_mut(id) {
                        socket.state.guest_eof = true;
                    }
                }
                self.tcp_flush_to_host(id);
                self.tcp_output(id);
                InputOutcome::Processed
            }
            Disposition::DropWithReset => self.tcp_respond(&key, &header, payload_len),
            Disposition::Reset => {
                socket_event(id, &key, "reset by guest");
                self.tcp_close(id);
                InputOutcome::Processed
            }
            Disposition::Closed => {
                self.tcp_close(id);
                InputOutcome::Processed
            }
        }
    }

    /// Where a guest connection to `key.remote` goes on the host side, or
    /// `None` when it is refused.
    fn tcp_target(&self, key: &FlowKey) -> Option<SocketAddrV4> {
        let remote = key.remote;
        if let Some(target) = self.guestfwds.get(&remote) {
            return Some(*target);
        }
        let config = &self.config;
        if remote.address == config.nameserver {
            return config.dns_upstream.filter(|_| remote.port == 53);
        }
        if remote.address == config.host {
            return (!config.disable_host_loopback)
                .then(|| SocketAddrV4::new(Ipv4Addr::LOCALHOST, remote.port));
        }
        if config.restricted
            || remote.address.in_network(config.network, config.netmask)
            || remote.address.is_multicast()
            || remote.address.is_unspecified()
        {
            return None;
        }
        Some(SocketAddrV4::new(remote.address.into(), remote.port))
    }

    /// A SYN for a flow with no socket: start the host connect and answer
    /// the guest once it completes.
    fn tcp_open_from_guest(
        &mut self,
        key: FlowKey,
        header: &TcpHeader,
        quoted: Option<Vec<u8>>,
    ) -> InputOutcome {
        let Some(target) = self.tcp_target(&key) else {
            let reason = if self.config.restricted {
                DropReason::Restricted
            } else {
                DropReason::Unreachable
            };
            drop_event(reason, &key.to_string());
            return self.tcp_respond(&key, header, 0);
        };

        let iss = self.next_iss();
        let (tos, emu) = tcp_tos(key.remote.port);
        let emu = emu.filter(|_| self.config.enable_emu);
        let tcb_config = self.tcb_config();
        let callbacks = &mut self.callbacks;
        let syn_quote = quoted.clone();
        let created = self.sockets.insert_with(|id| {
            let host = callbacks.tcp_connect(target)?;
            let mut socket = Socket::new(id, key, Origin::Guest);
            socket.host = Some(host);
            socket.peer = Some(target);
            socket.state.connecting = true;
            socket.tos = tos;
            socket.emu = emu;
            socket.syn_quote = syn_quote;
            let mut tcb = Tcb::passive_open(header.seq, header.wnd, header.mss, iss, tcb_config);
            tcb.set_nodelay(tos.is_low_delay());
            socket.tcb = Some(tcb);
            Ok(socket)
        });

        match created {
            Ok(id) => {
                self.stats.tcp.connects += 1;
                self.stats.sockets.created += 1;
                socket_event(id, &key, "connecting");
                self.tcp_connect_progress(id);
                InputOutcome::Processed
            }
            Err(SocketError::TableFull(_)) => {
                self.stats.sockets.refused += 1;
                drop_event(DropReason::TableFull, &key.to_string());
                InputOutcome::Dropped(DropReason::TableFull)
            }
            Err(SocketError::Host(io::ErrorKind::ConnectionRefused) | SocketError::Restricted(_)) => {
                self.tcp_respond(&key, header, 0)
            }
            Err(SocketError::Host(kind)) => {
                tracing::debug!(%target, ?kind, "host connect failed");
                match quoted {
                    Some(quoted) if self.icmp_send_error(&quoted, DESTINATION_UNREACHABLE, unreachable::HOST) => {
                        InputOutcome::Replied
                    }
                    _ => InputOutcome::Dropped(DropReason::Unreachable),
                }
            }
        }
    }

    /// A host connection accepted on a listener: the stack opens toward the
    /// guest.
    fn tcp_connect_to_guest(&mut self, listener: Listener, host: HostHandle, from: SocketAddrV4) {
        let from_address = Ipv4Address::from(*from.ip());
        let remote_address = if from.ip().is_loopback() || from_address.is_unspecified() {
            self.config.host
        } else {
            from_address
        };
        let key = FlowKey::new(
            Protocol::Tcp,
            listener.guest,
            Endpoint::new(remote_address, from.port()),
        );
        let origin = match listener.kind {
            ListenerKind::Forward => Origin::HostForward,
            ListenerKind::Redirect => Origin::Redirect,
        };
        let iss = self.next_iss();
        let (tos, emu) = tcp_tos(listener.guest.port);
        let emu = emu.filter(|_| self.config.enable_emu);
        let tcb_config = self.tcb_config();
        let created = self.sockets.insert_with(|id| {
            let mut socket = Socket::new(id, key, origin);
            socket.host = Some(host);
            socket.peer = Some(from);
            socket.tos = tos;
            socket.emu = emu;
            let mut tcb = Tcb::active_open(iss, tcb_config);
            tcb.set_nodelay(tos.is_low_delay());
            socket.tcb = Some(tcb);
            Ok(socket)
        });
        match created {
            Ok(id) => {
                self.stats.tcp.accepts += 1;
                self.stats.sockets.created += 1;
                socket_event(id, &key, "accepted");
                self.tcp_output(id);
            }
            Err(e) => {
                tracing::warn!(%from, error = %e, "refusing forwarded connection");
                self.stats.sockets.refused += 1;
                self.callbacks.close(host);
            }
        }
    }

    /// Accepts whatever is pending on the host listeners.
    pub(crate) fn tcp_accept_pending(&mut self) {
        let mut handles: Vec<HostHandle> = self.listeners.keys().copied().collect();
        handles.sort_unstable();
        for handle in handles {
            while let Some(listener) = self.listeners.get(&handle).copied() {
                match self.callbacks.tcp_accept(handle) {
                    Ok((host, from)) => {
                        self.tcp_connect_to_guest(listener, host, from);
                        if listener.kind == ListenerKind::Redirect {
                            self.listeners.remove(&handle);
                            self.callbacks.close(handle);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::warn!(bound = %listener.bound, error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
    }

    /// Services one TCP socket from the poll loop.
    pub(crate) fn tcp_poll_socket(&mut self, id: SocketId) {
        self.tcp_connect_progress(id);
        self.tcp_read_host(id);
        self.tcp_flush_to_host(id);
        self.tcp_output(id);
    }

    /// Checks on a pending host connect. Success releases the SYN,ACK the
    /// control block has been holding.
    fn tcp_connect_progress(&mut self, id: SocketId) {
        let Some(socket) = self.sockets.get_mut(id) else {
            return;
        };
        if !socket.state.connecting {
            return;
        }
        let Some(host) = socket.host else {
            return;
        };
        match self.callbacks.connect_status(host) {
            ConnectStatus::InProgress => {}
            ConnectStatus::Connected => {
                socket.state.connecting = false;
                socket.syn_quote = None;
                tracing::debug!(%id, flow = %socket.key, "host connected");
                self.tcp_output(id);
            }
            ConnectStatus::Failed(kind) => self.tcp_connect_failed(id, kind),
        }
    }

    /// A refused connect becomes a reset to the guest; any other failure an
    /// ICMP host unreachable.
    fn tcp_connect_failed(&mut self, id: SocketId, kind: io::ErrorKind) {
        let Some(socket) = self.sockets.get_mut(id) else {
            return;
        };
        tracing::debug!(%id, flow = %socket.key, ?kind, "host connect failed");
        socket.state.connecting = false;
        match socket.syn_quote.take() {
            Some(quoted) if kind != io::ErrorKind::ConnectionRefused => {
                self.icmp_send_error(&quoted, DESTINATION_UNREACHABLE, unreachable::HOST);
            }
            _ => {
                if let Some(tcb) = socket.tcb.as_mut() {
                    tcb.drop_connection();
                }
                self.tcp_output(id);
            }
        }
        self.stats.tcp.drops += 1;
        self.tcp_close(id);
    }

    /// Reads from the host into the buffer toward the guest.
    fn tcp_read_host(&mut self, id: SocketId) {
        let Some(socket) = self.sockets.get_mut(id) else {
            return;
        };
        if socket.state.connecting || socket.state.host_eof {
            return;
        }
        let Some(host) = socket.host else {
            return;
        };
        let space = socket.buffers.to_guest.space().min(READ_CHUNK);
        if space == 0 {
            return;
        }
        let mut buf = vec![0u8; space];
        match self.callbacks.tcp_recv(host, &mut buf) {
            Ok(0) => self.tcp_sockclosed(id),
            Ok(n) => socket.buffers.to_guest.append(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::debug!(%id, error = %e, "host read failed");
                self.tcp_drop(id);
            }
        }
    }

    /// The host closed its side: send our FIN once the buffered data is out.
    fn tcp_sockclosed(&mut self, id: SocketId) {
        let Some(socket) = self.sockets.get_mut(id) else {
            return;
        };
        socket.state.host_eof = true;
        let finished = socket.tcb.as_mut().map_or(true, Tcb::close_local);
        if finished {
            self.tcp_close(id);
        }
    }

    /// Writes what the guest sent to the host, and passes on the guest's
    /// FIN once everything before it has been written.
    fn tcp_flush_to_host(&mut self, id: SocketId) {
        loop {
            let Some(socket) = self.sockets.get_mut(id) else {
                return;
            };
            let Some(host) = socket.host else {
                return;
            };
            if socket.state.connecting {
                return;
            }
            if socket.buffers.to_host.is_empty() {
                if socket.state.guest_eof && !socket.state.host_write_shut {
                    socket.state.host_write_shut = true;
                    if let Err(e) = self.callbacks.tcp_shutdown_write(host) {
                        tracing::debug!(%id, error = %e, "host shutdown failed");
                    }
                }
                return;
            }
            let sent = self.callbacks.tcp_send(host, socket.buffers.to_host.contiguous());
            match sent {
                Ok(0) => return,
                Ok(n) => socket.buffers.to_host.drop_front(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::debug!(%id, error = %e, "host write failed");
                    self.tcp_drop(id);
                    return;
                }
            }
        }
    }

    /// Puts data from the guest in the buffer toward the host, rewriting
    /// address offers for emulated protocols.
    fn tcp_deliver(&mut self, id: SocketId, data: Chain) {
        let Some(socket) = self.sockets.get(id) else {
            return;
        };
        let mut bytes = data.to_vec();
        if let Some(kind) = socket.emu {
            if let Some(offer) = find_offer(kind, &bytes) {
                if offer.address == socket.key.guest.address {
                    bytes = self.tcp_emu_redirect(id, offer, &bytes);
                }
            }
        }
        if let Some(socket) = self.sockets.get_mut(id) {
            socket.buffers.to_host.append(&bytes);
        }
    }

    /// Opens a host listener that leads to the port the guest offered and
    /// rewrites the offer to name it.
    fn tcp_emu_redirect(&mut self, id: SocketId, offer: Offer, data: &[u8]) -> Vec<u8> {
        let Some((host, guest)) = self.sockets.get(id).and_then(|socket| Some((socket.host?, socket.key.guest))) else {
            return data.to_vec();
        };
        let local = match self.callbacks.local_addr(host) {
            Ok(local) => local,
            Err(e) => {
                tracing::debug!(%id, error = %e, "no local address for emulation");
                return data.to_vec();
            }
        };
        let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        let (listener, bound) = match self.callbacks.tcp_listen(bind) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!(%id, error = %e, "could not listen for a redirect");
                return data.to_vec();
            }
        };
        let guest = Endpoint::new(guest.address, offer.port);
        self.listeners.insert(
            listener,
            Listener {
                bound,
                guest,
                kind: ListenerKind::Redirect,
            },
        );
        tracing::debug!(%id, %guest, port = bound.port(), "offer redirected");
        offer.rewrite(data, Ipv4Address::from(*local.ip()), bound.port())
    }

    /// Runs the control block's output and sends what it produces. Held back
    /// while the host connect is pending.
    pub(crate) fn tcp_output(&mut self, id: SocketId) {
        let Some(socket) = self.sockets.get_mut(id) else {
            return;
        };
        if socket.state.connecting {
            return;
        }
        let Socket { tcb, buffers, .. } = socket;
        let Some(tcb) = tcb.as_mut() else {
            return;
        };
        let segments = tcb.output(buffers);
        self.tcp_emit(id, segments);
    }

    fn tcp_emit(&mut self, id: SocketId, segments: Vec<OutSegment>) {
        let Some((key, tos)) = self.sockets.get(id).map(|socket| (socket.key, socket.tos)) else {
            return;
        };
        for segment in segments {
            self.tcp_send_segment(&key, tos, Some(id), segment);
        }
    }

    /// Addresses, checksums, and queues one segment toward the guest.
    fn tcp_send_segment(&mut self, key: &FlowKey, tos: TypeOfService, session: Option<SocketId>, segment: OutSegment) {
        let ctl = segment.ctl;
        let header = TcpHeader {
            mss: segment.mss,
            ..TcpHeader::new(key.remote.port, key.guest.port, segment.seq, segment.ack, ctl, segment.wnd)
        };
        let bytes = match header.to_bytes(key.remote.address, key.guest.address, &segment.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(flow = %key, error = %e, "could not build a TCP header");
                return;
            }
        };
        if ctl.rst() {
            self.stats.tcp.resets_sent += 1;
        }
        let queue = if tos.is_low_delay() || segment.payload.is_empty() {
            Queue::Fast
        } else {
            Queue::Batch(session)
        };
        let mut packet = segment.payload;
        packet.prepend(bytes);
        self.stats.tcp.segments_out += 1;
        self.ip_output(key.remote.address, key.guest.address, Protocol::Tcp, packet, tos, queue);
    }

    /// Answers a segment that belongs to no connection with a reset shaped
    /// by RFC 9293: the reset takes its sequence number from the segment's
    /// acknowledgment, or acknowledges the segment if it carried none.
    fn tcp_respond(&mut self, key: &FlowKey, header: &TcpHeader, payload_len: usize) -> InputOutcome {
        if header.ctl.rst() {
            return InputOutcome::Dropped(DropReason::NoConnection);
        }
        let segment = if header.ctl.ack() {
            OutSegment::control(header.ack, 0, Control::RST, 0)
        } else {
            let len = payload_len as u32 + header.ctl.syn() as u32 + header.ctl.fin() as u32;
            OutSegment::control(0, header.seq.wrapping_add(len), Control::RST_ACK, 0)
        };
        reply_event(key.guest, "tcp reset");
        self.tcp_send_segment(key, TypeOfService::default(), None, segment);
        InputOutcome::Replied
    }

    /// Abandons a connection after a host error, resetting the guest.
    fn tcp_drop(&mut self, id: SocketId) {
        self.stats.tcp.drops += 1;
        let outcome = self
            .sockets
            .get_mut(id)
            .and_then(|socket| {
                socket.state.connecting = false;
                socket.tcb.as_mut()
            })
            .map(Tcb::drop_connection);
        if outcome == Some(TimerOutcome::Dropped) {
            self.tcp_output(id);
        }
        self.tcp_close(id);
    }

    pub(crate) fn tcp_close(&mut self, id: SocketId) {
        if let Some(state) = self.sockets.get(id).and_then(|socket| socket.tcb.as_ref()).map(Tcb::state) {
            tracing::trace!(%id, %state, "tcp close");
        }
        self.free_socket(id);
    }

    pub(crate) fn tcp_fasttimo(&mut self) {
        for id in self.sockets.ids_for(Protocol::Tcp) {
            let due = self
                .sockets
                .get_mut(id)
                .and_then(|socket| socket.tcb.as_mut())
                .is_some_and(Tcb::fast_tick);
            if due {
                self.tcp_output(id);
            }
        }
    }

    pub(crate) fn tcp_slowtimo(&mut self) {
        self.tcp_iss = self.tcp_iss.wrapping_add(TCP_ISSINCR_TICK);
        for id in self.sockets.ids_for(Protocol::Tcp) {
            let Some(tcb) = self.sockets.get_mut(id).and_then(|socket| socket.tcb.as_mut()) else {
                continue;
            };
            let shift = tcb.rxtshift();
            let outcome = tcb.slow_tick();
            if outcome == TimerOutcome::Output && tcb.rxtshift() > shift && tcb.timers().persist == 0 {
                self.stats.tcp.retransmit_timeouts += 1;
            }
            match outcome {
                TimerOutcome::Idle => {}
                TimerOutcome::Output => self.tcp_output(id),
                TimerOutcome::KeepaliveProbe => {
                    let probe = tcb.keepalive_probe();
                    self.tcp_emit(id, vec![probe]);
                }
                TimerOutcome::Dropped => {
                    self.stats.tcp.drops += 1;
                    if let Some(socket) = self.sockets.get_mut(id) {
                        socket.state.connecting = false;
                    }
                    self.tcp_output(id);
                    self.tcp_close(id);
                }
                TimerOutcome::Closed => self.tcp_close(id),
            }
        }
    }

    fn tcb_config(&self) -> TcbConfig {
        TcbConfig {
            mss: self.config.tcp_mss(),
            keepalive: self.config.keepalive,
        }
    }

    fn next_iss(&mut self) -> u32 {
        self.tcp_iss = self.tcp_iss.wrapping_add(TCP_ISSINCR_CONNECT);
        self.tcp_iss
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_ports_are_low_delay() {
        for port in LOW_DELAY_PORTS {
            let (tos, emu) = tcp_tos(port);
            assert!(tos.is_low_delay());
            assert_eq!(emu, None);
        }
    }

    #[test]
    fn emulated_ports_carry_their_kind() {
        assert_eq!(tcp_tos(21), (TypeOfService::THROUGHPUT, Some(EmuKind::Ftp)));
        assert_eq!(tcp_tos(6667), (TypeOfService::THROUGHPUT, Some(EmuKind::Irc)));
        assert_eq!(tcp_tos(80), (TypeOfService::default(), None));
    }
}
