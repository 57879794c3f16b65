//! Internet Protocol version 4: validation and dispatch of datagrams from the
//! guest, and header construction and fragmentation for datagrams to it.

pub mod fragmentation;
pub mod ipv4_address;
pub mod ipv4_parsing;
pub mod reassembly;
#[cfg(test)]
pub(crate) mod test_header;

pub use ipv4_address::Ipv4Address;

use self::{
    fragmentation::{fragment, Fragments},
    ipv4_parsing::{BuildHeaderError, Ipv4Header, TypeOfService, MIN_HEADER_LEN, MIN_IHL},
    reassembly::AddFragmentResult,
};
use crate::{
    callbacks::Callbacks,
    icmp::icmp_parsing::TIME_EXCEEDED,
    interface::Queue,
    logging::drop_event,
    mbuf::Chain,
    socket::Protocol,
    stack::{DropReason, InputOutcome, Stack},
};

/// Bytes of the offending datagram's payload an ICMP error carries
const QUOTED_PAYLOAD: usize = 8;

/// The header of a datagram plus the first eight bytes of its payload, as
/// an ICMP error quotes it.
pub(crate) fn quote(header: &Ipv4Header, payload: &Chain) -> Option<Vec<u8>> {
    let payload_len = u16::try_from(payload.len()).ok()?;
    let mut out = header.build(payload_len).ok()?;
    let mut head = [0u8; QUOTED_PAYLOAD];
    let copied = payload.copy_to(0, &mut head);
    out.extend_from_slice(&head[..copied]);
    Some(out)
}

impl<C: Callbacks> Stack<C> {
    /// Validates a datagram from the guest, reassembles it if it is a
    /// fragment, and hands it to its transport.
    pub(crate) fn ip_input(&mut self, mut datagram: Chain) -> InputOutcome {
        self.stats.ip.packets_in += 1;
        let mut header = match Ipv4Header::from_bytes(datagram.iter()) {
            Ok(header) => header,
            Err(e) => {
                self.stats.ip.bad_headers += 1;
                drop_event(DropReason::Malformed, &e.to_string());
                return InputOutcome::Dropped(DropReason::Malformed);
            }
        };
        if header.total_length as usize > datagram.len() {
            self.stats.ip.bad_headers += 1;
            drop_event(DropReason::Malformed, "total length exceeds the frame");
            return InputOutcome::Dropped(DropReason::Malformed);
        }
        // Ethernet padding
        datagram.truncate(header.total_length as usize);

        // Options are not interpreted
        datagram.remove_front(header.header_len());
        header.ihl = MIN_IHL;
        header.total_length = MIN_HEADER_LEN + datagram.len() as u16;

        // Only datagrams relayed off the virtual network use up a hop
        let destination = header.destination;
        let relayed = !self.config.is_virtual_address(destination)
            && !destination.is_multicast()
            && !destination.is_broadcast_in(self.config.network, self.config.netmask);
        if relayed && header.time_to_live <= 1 {
            return match quote(&header, &datagram) {
                Some(quoted) if self.icmp_send_error(&quoted, TIME_EXCEEDED, 0) => InputOutcome::Replied,
                _ => InputOutcome::Dropped(DropReason::Unreachable),
            };
        }

        if header.is_fragment() {
            self.stats.ip.fragments_in += 1;
            match self.reassembly.add_fragment(header, datagram, self.now_ms) {
                AddFragmentResult::Complete(whole, body) => {
                    self.stats.ip.reassembled += 1;
                    tracing::trace!(id = whole.identification, len = body.len(), "reassembled");
                    header = whole;
                    datagram = body;
                }
                AddFragmentResult::Incomplete => return InputOutcome::Processed,
                AddFragmentResult::Dropped => {
                    drop_event(DropReason::Fragment, "fragment rejected by reassembly");
                    return InputOutcome::Dropped(DropReason::Fragment);
                }
            }
        }

        match Protocol::from_number(header.protocol) {
            Some(Protocol::Tcp) => self.tcp_input(&header, datagram),
            Some(Protocol::Udp) => self.udp_input(&header, datagram),
            Some(Protocol::Icmp) => self.icmp_input(&header, datagram),
            None => {
                self.stats.ip.unknown_protocol += 1;
                drop_event(DropReason::UnsupportedProtocol, &header.protocol.to_string());
                InputOutcome::Dropped(DropReason::UnsupportedProtocol)
            }
        }
    }

    /// Wraps `payload` in an IPv4 header, fragments it to the MTU, and
    /// queues the pieces for the guest. Returns whether every piece was
    /// queued.
    pub(crate) fn ip_output(
        &mut self,
        source: Ipv4Address,
        destination: Ipv4Address,
        protocol: Protocol,
        payload: Chain,
        tos: TypeOfService,
        queue: Queue,
    ) -> bool {
        let header = u16::try_from(payload.len())
            .map_err(|_| BuildHeaderError::PayloadTooLong)
            .and_then(|len| Ipv4Header::new(source, destination, protocol.number(), len));
        let mut header = match header {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(len = payload.len(), error = %e, "datagram too long to send");
                return false;
            }
        };
        header.type_of_service = tos;
        header.identification = self.ip_id;
        self.ip_id = self.ip_id.wrapping_add(1);
        let pieces = match fragment(header, payload, self.config.mtu) {
            Fragments::Unchanged(piece) => vec![piece],
            Fragments::Split(pieces) => {
                self.stats.ip.fragments_out += pieces.len() as u64;
                pieces
            }
            Fragments::DontFragmentSet => return false,
        };
        for (header, body) in pieces {
            if !self.queue_datagram(&header, &body, queue) {
                return false;
            }
        }
        self.stats.ip.packets_out += 1;
        true
    }

    fn queue_datagram(&mut self, header: &Ipv4Header, body: &Chain, queue: Queue) -> bool {
        let Ok(body_len) = u16::try_from(body.len()) else {
            return false;
        };
        let bytes = match header.build(body_len) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "could not build an IPv4 header");
                return false;
            }
        };
        let id = match self.pool.allocate(bytes.len() + body.len()) {
            Ok(id) => id,
            Err(e) => {
                self.stats.ip.no_buffers += 1;
                drop_event(DropReason::NoBuffers, &e.to_string());
                return false;
            }
        };
        match self.pool.data_mut(id) {
            Ok(data) => {
                data.extend_from_slice(&bytes);
                data.extend(body.iter());
            }
            Err(e) => {
                tracing::warn!(error = %e, "lost a buffer just allocated");
                return false;
            }
        }
        if let Err(e) = self.interface.if_output(&mut self.pool, id, queue) {
            tracing::warn!(error = %e, "could not queue a datagram");
            let _ = self.pool.release(id);
            return false;
        }
        true
    }
}
