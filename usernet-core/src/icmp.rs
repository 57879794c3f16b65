//! The Internet Control Message Protocol: echo for the guest, and the error
//! messages the stack sends when it cannot deliver something.

pub mod icmp_parsing;

use self::icmp_parsing::{
    build_icmp_header, unreachable, IcmpHeader, DESTINATION_UNREACHABLE, ECHO_REPLY, ECHO_REQUEST,
    HEADER_OCTETS,
};
use crate::{
    callbacks::Callbacks,
    interface::Queue,
    ipv4::{
        ipv4_parsing::{Ipv4Header, TypeOfService},
        quote, Ipv4Address,
    },
    logging::{drop_event, reply_event, socket_event},
    mbuf::Chain,
    socket::{FlowKey, Origin, Protocol, Socket, SocketId},
    stack::{DropReason, InputOutcome, Stack},
    utility::Endpoint,
};
use std::io;

/// Idle lifetime of an echo waiting for its reply
pub const ICMP_EXPIRE_MS: u64 = 240_000;
/// Payload bytes of the offending datagram quoted in an error
const QUOTED_PAYLOAD: usize = 8;
/// Largest ICMP message read from the host
const MAX_MESSAGE: usize = 65_507;

impl<C: Callbacks> Stack<C> {
    pub(crate) fn icmp_input(&mut self, ip: &Ipv4Header, message: Chain) -> InputOutcome {
        self.stats.icmp.messages_in += 1;
        let header = match IcmpHeader::from_chain(&message) {
            Ok(header) => header,
            Err(e) => {
                self.stats.icmp.bad_messages += 1;
                drop_event(DropReason::Malformed, &e.to_string());
                return InputOutcome::Dropped(DropReason::Malformed);
            }
        };
        if header.icmp_type != ECHO_REQUEST {
            tracing::trace!(icmp_type = header.icmp_type, "ignoring icmp from guest");
            return InputOutcome::Dropped(DropReason::UnsupportedProtocol);
        }
        let quoted = quote(ip, &message);
        let mut payload = message;
        payload.remove_front(HEADER_OCTETS);

        let destination = ip.destination;
        if self.config.is_virtual_address(destination) {
            self.icmp_echo_reply(destination, ip.source, header.rest, payload);
            return InputOutcome::Processed;
        }
        let config = &self.config;
        if destination.in_network(config.network, config.netmask)
            || destination.is_multicast()
            || destination == Ipv4Address::BROADCAST
        {
            drop_event(DropReason::NotForUs, &destination.to_string());
            return InputOutcome::Dropped(DropReason::NotForUs);
        }
        if config.restricted {
            drop_event(DropReason::Restricted, &destination.to_string());
            return InputOutcome::Dropped(DropReason::Restricted);
        }

        let identifier = header.echo_identifier();
        let sequence = header.echo_sequence();
        let key = FlowKey::new(
            Protocol::Icmp,
            Endpoint::new(ip.source, identifier),
            Endpoint::new(destination, sequence),
        );
        let host = match self
            .callbacks
            .icmp_echo(destination, identifier, sequence, &payload.to_vec())
        {
            Ok(host) => host,
            Err(e) => {
                tracing::debug!(%destination, error = %e, "host echo unavailable");
                return match quoted {
                    Some(quoted) if self.icmp_send_error(&quoted, DESTINATION_UNREACHABLE, unreachable::HOST) => {
                        InputOutcome::Replied
                    }
                    _ => InputOutcome::Dropped(DropReason::Unreachable),
                };
            }
        };

        let expires = self.now_ms + ICMP_EXPIRE_MS;
        // A repeated request replaces the earlier exchange
        if let Some(id) = self.sockets.lookup(&key) {
            if let Some(socket) = self.sockets.get_mut(id) {
                let old = socket.host.replace(host);
                socket.expires_at_ms = Some(expires);
                if let Some(old) = old {
                    self.callbacks.close(old);
                }
            }
            return InputOutcome::Processed;
        }
        let created = self.sockets.insert_with(|id| {
            let mut socket = Socket::new(id, key, Origin::Guest);
            socket.host = Some(host);
            socket.expires_at_ms = Some(expires);
            Ok(socket)
        });
        match created {
            Ok(id) => {
                self.stats.sockets.created += 1;
                socket_event(id, &key, "echo sent");
                InputOutcome::Processed
            }
            Err(e) => {
                self.callbacks.close(host);
                self.stats.sockets.refused += 1;
                drop_event(DropReason::TableFull, &e.to_string());
                InputOutcome::Dropped(DropReason::TableFull)
            }
        }
    }

    /// Answers an echo request addressed to the stack itself.
    fn icmp_echo_reply(&mut self, source: Ipv4Address, destination: Ipv4Address, rest: [u8; 4], payload: Chain) {
        let mut message = payload;
        let header = build_icmp_header(ECHO_REPLY, 0, rest, &message);
        message.prepend(header);
        self.stats.icmp.echo_replies += 1;
        reply_event(Endpoint::new(destination, 0), "echo reply");
        self.ip_output(source, destination, Protocol::Icmp, message, TypeOfService::default(), Queue::Fast);
    }

    /// Relays the host's echo reply to the guest under the guest's
    /// identifier, then retires the exchange.
    pub(crate) fn icmp_poll_socket(&mut self, id: SocketId) {
        let Some((host, key)) = self
            .sockets
            .get(id)
            .and_then(|socket| Some((socket.host?, socket.key)))
        else {
            return;
        };
        let mut buf = vec![0u8; MAX_MESSAGE];
        let n = match self.callbacks.icmp_recv(host, &mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::debug!(%id, error = %e, "host echo failed");
                self.free_socket(id);
                return;
            }
        };
        // The host's own stack may have rewritten the identifier and left
        // the checksum unverified, so only the type is trusted
        match buf.get(..n) {
            Some([ECHO_REPLY, _, _, _, _, _, seq_hi, seq_lo, data @ ..]) => {
                let mut rest = [0u8; 4];
                rest[..2].copy_from_slice(&key.guest.port.to_be_bytes());
                rest[2..].copy_from_slice(&[*seq_hi, *seq_lo]);
                let payload = Chain::from(data);
                self.icmp_echo_reply(key.remote.address, key.guest.address, rest, payload);
                self.free_socket(id);
            }
            _ => tracing::trace!(%id, len = n, "ignoring host icmp message"),
        }
    }

    /// Sends an ICMP error about a datagram from the guest, from the virtual
    /// host, since the stack is the gateway that gave up on it. `quoted` holds
    /// the offending IPv4 header and at least the start of its payload.
    /// Returns whether an error was sent: none goes out about fragments
    /// other than the first, ICMP errors, or datagrams without a unicast
    /// source.
    pub(crate) fn icmp_send_error(&mut self, quoted: &[u8], icmp_type: u8, code: u8) -> bool {
        let original = match Ipv4Header::from_bytes(quoted.iter().copied()) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!(error = %e, "cannot quote a malformed header");
                return false;
            }
        };
        if original.fragment_offset != 0 {
            return false;
        }
        let source = original.source;
        let config = &self.config;
        if source.is_unspecified()
            || source.is_multicast()
            || source == Ipv4Address::BROADCAST
            || source.is_broadcast_in(config.network, config.netmask)
        {
            return false;
        }
        let header_len = original.header_len();
        if original.protocol == Protocol::Icmp.number() {
            match quoted.get(header_len) {
                Some(&(ECHO_REQUEST | ECHO_REPLY)) => {}
                _ => return false,
            }
        }
        let end = (header_len + QUOTED_PAYLOAD).min(quoted.len());
        let mut message = Chain::from(&quoted[..end]);
        let header = build_icmp_header(icmp_type, code, [0; 4], &message);
        message.prepend(header);
        self.stats.icmp.errors_sent += 1;
        reply_event(Endpoint::new(source, 0), "icmp error");
        self.ip_output(
            self.config.host,
            source,
            Protocol::Icmp,
            message,
            TypeOfService::default(),
            Queue::Fast,
        )
    }
}
