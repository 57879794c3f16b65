//! The User Datagram Protocol, relayed through host sockets.
//!
//! Each (guest, remote) pair gets its own host socket so replies can be
//! matched back to the flow that caused them. Idle flows are reclaimed by
//! the slow timer.

pub mod udp_parsing;

use self::udp_parsing::{UdpHeader, HEADER_LEN};
use crate::{
    callbacks::Callbacks,
    icmp::icmp_parsing::{unreachable, DESTINATION_UNREACHABLE},
    interface::Queue,
    ipv4::{
        ipv4_parsing::{Ipv4Header, TypeOfService},
        quote, Ipv4Address,
    },
    logging::{drop_event, socket_event},
    mbuf::Chain,
    socket::{FlowKey, Origin, Protocol, Socket, SocketError, SocketId},
    stack::{DropReason, InputOutcome, Stack},
    utility::Endpoint,
};
use std::{
    io,
    net::{Ipv4Addr, SocketAddrV4},
};

/// Idle lifetime of an ordinary flow
pub const UDP_EXPIRE_MS: u64 = 240_000;
/// Idle lifetime of a DNS flow, which rarely sees a second query
pub const DNS_EXPIRE_MS: u64 = 10_000;
/// Largest payload a UDP datagram can carry over IPv4
const MAX_PAYLOAD: usize = 65_507;

impl<C: Callbacks> Stack<C> {
    pub(crate) fn udp_input(&mut self, ip: &Ipv4Header, mut datagram: Chain) -> InputOutcome {
        self.stats.udp.datagrams_in += 1;
        let header = match UdpHeader::from_chain(&datagram, ip.source, ip.destination) {
            Ok(header) => header,
            Err(e) => {
                self.stats.udp.bad_datagrams += 1;
                drop_event(DropReason::Malformed, &e.to_string());
                return InputOutcome::Dropped(DropReason::Malformed);
            }
        };
        let quoted = quote(ip, &datagram);
        datagram.truncate(header.length as usize);
        datagram.remove_front(HEADER_LEN);

        let destination = ip.destination;
        if destination == Ipv4Address::BROADCAST
            || destination.is_multicast()
            || destination.is_broadcast_in(self.config.network, self.config.netmask)
        {
            self.stats.udp.dropped += 1;
            drop_event(DropReason::NotForUs, "broadcast or multicast datagram");
            return InputOutcome::Dropped(DropReason::NotForUs);
        }

        let key = FlowKey::new(
            Protocol::Udp,
            Endpoint::new(ip.source, header.source),
            Endpoint::new(destination, header.destination),
        );
        let id = match self.sockets.lookup(&key) {
            Some(id) => id,
            None => match self.udp_open(key) {
                Ok(id) => id,
                Err(reason) => {
                    self.stats.udp.dropped += 1;
                    drop_event(reason, &key.to_string());
                    return InputOutcome::Dropped(reason);
                }
            },
        };

        let now = self.now_ms;
        let Some(socket) = self.sockets.get_mut(id) else {
            return InputOutcome::Dropped(DropReason::NoConnection);
        };
        if socket.origin != Origin::HostForward {
            socket.expires_at_ms = Some(now + udp_lifetime(&key));
        }
        let (Some(host), Some(peer)) = (socket.host, socket.peer) else {
            self.stats.udp.dropped += 1;
            return InputOutcome::Dropped(DropReason::Unreachable);
        };
        match self.callbacks.udp_send_to(host, &datagram.to_vec(), peer) {
            Ok(_) => InputOutcome::Processed,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.stats.udp.dropped += 1;
                InputOutcome::Dropped(DropReason::HostBusy)
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "host send failed");
                let code = if e.kind() == io::ErrorKind::ConnectionRefused {
                    unreachable::PORT
                } else {
                    unreachable::HOST
                };
                match quoted {
                    Some(quoted) if self.icmp_send_error(&quoted, DESTINATION_UNREACHABLE, code) => {
                        InputOutcome::Replied
                    }
                    _ => InputOutcome::Dropped(DropReason::Unreachable),
                }
            }
        }
    }

    /// Where a guest datagram to `key.remote` goes on the host side.
    fn udp_target(&self, key: &FlowKey) -> Option<SocketAddrV4> {
        let remote = key.remote;
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
            || remote.address.is_unspecified()
        {
            return None;
        }
        Some(SocketAddrV4::new(remote.address.into(), remote.port))
    }

    fn udp_open(&mut self, key: FlowKey) -> Result<SocketId, DropReason> {
        let Some(target) = self.udp_target(&key) else {
            return Err(if self.config.restricted {
                DropReason::Restricted
            } else {
                DropReason::Unreachable
            });
        };
        let callbacks = &mut self.callbacks;
        let created = self.sockets.insert_with(|id| {
            let (host, _) = callbacks.udp_bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
            let mut socket = Socket::new(id, key, Origin::Guest);
            socket.host = Some(host);
            socket.peer = Some(target);
            Ok(socket)
        });
        match created {
            Ok(id) => {
                self.stats.sockets.created += 1;
                socket_event(id, &key, "bound");
                Ok(id)
            }
            Err(SocketError::TableFull(_)) => {
                self.stats.sockets.refused += 1;
                Err(DropReason::TableFull)
            }
            Err(e) => {
                tracing::debug!(flow = %key, error = %e, "host bind failed");
                Err(DropReason::Unreachable)
            }
        }
    }

    /// Relays whatever the host socket has received back to the guest.
    pub(crate) fn udp_poll_socket(&mut self, id: SocketId) {
        let mut buf = vec![0u8; MAX_PAYLOAD];
        loop {
            let Some(socket) = self.sockets.get_mut(id) else {
                return;
            };
            let Some(host) = socket.host else {
                return;
            };
            let (n, from) = match self.callbacks.udp_recv_from(host, &mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::debug!(%id, error = %e, "host receive failed");
                    return;
                }
            };
            match socket.origin {
                Origin::HostForward => socket.peer = Some(from),
                _ if socket.peer != Some(from) => {
                    tracing::trace!(%id, %from, "datagram from a stranger");
                    continue;
                }
                _ => socket.expires_at_ms = Some(self.now_ms + udp_lifetime(&socket.key)),
            }
            let (key, tos) = (socket.key, socket.tos);
            let payload = Chain::from(&buf[..n]);
            self.udp_output(Some(id), key.remote, key.guest, payload, tos);
        }
    }

    /// Sends a datagram to the guest.
    pub(crate) fn udp_output(
        &mut self,
        session: Option<SocketId>,
        source: Endpoint,
        destination: Endpoint,
        payload: Chain,
        tos: TypeOfService,
    ) -> bool {
        let header = match UdpHeader::to_bytes(source, destination, &payload) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(%source, error = %e, "could not build a UDP header");
                return false;
            }
        };
        let mut packet = payload;
        packet.prepend(header);
        self.stats.udp.datagrams_out += 1;
        let queue = if tos.is_low_delay() {
            Queue::Fast
        } else {
            Queue::Batch(session)
        };
        self.ip_output(source.address, destination.address, Protocol::Udp, packet, tos, queue)
    }
}

fn udp_lifetime(key: &FlowKey) -> u64 {
    if key.remote.port == 53 {
        DNS_EXPIRE_MS
    } else {
        UDP_EXPIRE_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_flows_expire_sooner() {
        let guest = Endpoint::new(Ipv4Address::new([10, 0, 2, 15]), 40000);
        let dns = FlowKey::new(Protocol::Udp, guest, Endpoint::new(Ipv4Address::new([10, 0, 2, 3]), 53));
        let ntp = FlowKey::new(Protocol::Udp, guest, Endpoint::new(Ipv4Address::new([1, 2, 3, 4]), 123));
        assert_eq!(udp_lifetime(&dns), DNS_EXPIRE_MS);
        assert_eq!(udp_lifetime(&ntp), UDP_EXPIRE_MS);
    }
}
