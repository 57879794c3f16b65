//! The stack instance.
//!
//! A [`Stack`] owns every piece of protocol state for one virtual link: the
//! buffer pool, the output queues, the ARP cache, the reassembly table, and
//! the socket table. Nothing is global. The host drives it through three
//! entry points: [`Stack::input`] for each frame the guest sends,
//! [`Stack::poll`] to service host sockets and timers, and
//! [`Stack::timer_expired`] when a timer asked for through
//! [`Callbacks::timer_mod`] comes due.
//!
//! The protocol layers are `impl Stack` blocks in their own modules; this
//! file holds the link layer, the timers, and the forwarding table.

use crate::{
    arp::{ArpPacket, ArpTable, Operation},
    callbacks::{Callbacks, HostHandle, TimerKind},
    config::{ConfigError, StackConfig},
    ethernet::{EtherType, EthernetHeader, MacAddress, HEADER_LEN},
    interface::Interface,
    ipv4::{reassembly::Reassembly, Ipv4Address},
    logging::{drop_event, forward_event, socket_event},
    mbuf::{Chain, MbufPool},
    socket::{FlowKey, Origin, Protocol, Socket, SocketError, SocketId, SocketTable},
    stats::Stats,
    tcp::tcb::timers::{FAST_TICK_MS, SLOW_TICK_MS},
    utility::Endpoint,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::{io, net::SocketAddrV4};
use thiserror::Error as ThisError;

/// The most slow ticks one poll runs to catch up after a long gap
const MAX_CATCHUP_TICKS: u32 = 120;

/// What became of one frame from the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    /// Handled, possibly producing output
    Processed,
    /// Discarded without any reply to the guest
    Dropped(DropReason),
    /// Refused, and the guest was told with a reset or an ICMP error
    Replied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// A header, length, or checksum failed validation
    Malformed,
    UnsupportedEtherType,
    UnsupportedProtocol,
    /// Addressed to something the stack does not answer for
    NotForUs,
    /// Refused by restricted mode
    Restricted,
    /// No host destination exists for the flow
    Unreachable,
    /// A stray segment for a connection that does not exist
    NoConnection,
    /// The socket table is full
    TableFull,
    /// The buffer pool is exhausted
    NoBuffers,
    /// A fragment that could not be queued for reassembly
    Fragment,
    /// The host socket could not take the data right now
    HostBusy,
}

/// Errors from the stack's configuration calls. Per-packet problems never
/// surface here.
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum StackError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("The host refused the binding: {0}")]
    Host(io::ErrorKind),
    #[error("A {0} forward already exists at {1}")]
    DuplicateForward(Protocol, SocketAddrV4),
    #[error("No {0} forward is bound at {1}")]
    NoSuchForward(Protocol, SocketAddrV4),
    #[error("A guest forward already exists for {0}")]
    DuplicateGuestForward(Endpoint),
    #[error("No guest forward exists for {0}")]
    NoSuchGuestForward(Endpoint),
    #[error("{0} is not on the virtual network")]
    OutsideNetwork(Endpoint),
    #[error("{0} cannot be forwarded")]
    UnsupportedForward(Protocol),
}

impl From<io::Error> for StackError {
    fn from(error: io::Error) -> Self {
        Self::Host(error.kind())
    }
}

/// Why a host listener exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenerKind {
    /// A configured host forward, kept until removed
    Forward,
    /// Prepared by protocol emulation for one connection
    Redirect,
}

/// A listening host socket and the guest port its connections reach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Listener {
    pub bound: SocketAddrV4,
    pub guest: Endpoint,
    pub kind: ListenerKind,
}

pub struct Stack<C: Callbacks> {
    pub(crate) config: StackConfig,
    pub(crate) callbacks: C,
    pub(crate) pool: MbufPool,
    pub(crate) interface: Interface,
    pub(crate) arp: ArpTable,
    pub(crate) reassembly: Reassembly,
    pub(crate) sockets: SocketTable,
    pub(crate) listeners: FxHashMap<HostHandle, Listener>,
    /// Virtual endpoints whose TCP connections go to a fixed host address
    pub(crate) guestfwds: FxHashMap<Endpoint, SocketAddrV4>,
    pub(crate) ip_id: u16,
    pub(crate) tcp_iss: u32,
    pub(crate) now_ms: u64,
    next_fast_ms: u64,
    next_slow_ms: u64,
    pub(crate) stats: Stats,
}

impl<C: Callbacks> Stack<C> {
    /// Validates `config` and builds an idle stack around it.
    pub fn new(config: StackConfig, callbacks: C) -> Result<Self, ConfigError> {
        config.validate()?;
        tracing::info!(
            network = %config.network,
            host = %config.host,
            mtu = config.mtu,
            restricted = config.restricted,
            "stack created"
        );
        Ok(Self {
            pool: MbufPool::new(config.max_mbufs),
            interface: Interface::default(),
            arp: ArpTable::new(),
            reassembly: Reassembly::default(),
            sockets: SocketTable::new(config.max_sockets),
            listeners: FxHashMap::default(),
            guestfwds: FxHashMap::default(),
            ip_id: rand::random(),
            tcp_iss: rand::random(),
            now_ms: 0,
            next_fast_ms: FAST_TICK_MS,
            next_slow_ms: SLOW_TICK_MS,
            stats: Stats::default(),
            config,
            callbacks,
        })
    }

    /// Processes one Ethernet frame from the guest, then sends whatever it
    /// produced.
    pub fn input(&mut self, frame: &[u8]) -> InputOutcome {
        self.stats.link.frames_in += 1;
        let outcome = self.link_input(frame);
        self.if_start();
        self.schedule_timers();
        outcome
    }

    fn link_input(&mut self, frame: &[u8]) -> InputOutcome {
        let header = match EthernetHeader::from_bytes(frame.iter().copied()) {
            Ok(header) => header,
            Err(e) => {
                drop_event(DropReason::Malformed, &e.to_string());
                return InputOutcome::Dropped(DropReason::Malformed);
            }
        };
        let payload = &frame[HEADER_LEN..];
        match header.ether_type {
            EtherType::Arp => self.arp_input(payload),
            EtherType::Ipv4 => {
                self.learn_link_address(header.source, payload);
                self.ip_input(Chain::from(payload))
            }
            other => {
                self.stats.link.unsupported += 1;
                tracing::trace!(ether_type = ?other, "unsupported frame");
                InputOutcome::Dropped(DropReason::UnsupportedEtherType)
            }
        }
    }

    /// Remembers the link address of a guest that sends IPv4 before it has
    /// answered any ARP request.
    fn learn_link_address(&mut self, mac: MacAddress, datagram: &[u8]) {
        let Some(&[a, b, c, d]) = datagram.get(12..16) else {
            return;
        };
        let source = Ipv4Address::new([a, b, c, d]);
        if source.in_network(self.config.network, self.config.netmask)
            && !self.config.is_virtual_address(source)
        {
            self.arp.insert(source, mac);
        }
    }

    fn arp_input(&mut self, payload: &[u8]) -> InputOutcome {
        let packet = match ArpPacket::from_bytes(payload.iter().copied()) {
            Ok(packet) => packet,
            Err(e) => {
                drop_event(DropReason::Malformed, &e.to_string());
                return InputOutcome::Dropped(DropReason::Malformed);
            }
        };
        if packet
            .sender_ip
            .in_network(self.config.network, self.config.netmask)
        {
            self.arp.insert(packet.sender_ip, packet.sender_mac);
        }
        match packet.oper {
            Operation::Request if self.answers_arp_for(packet.target_ip) => {
                let reply = packet.reply(self.config.host_mac);
                let mut frame = Vec::with_capacity(HEADER_LEN + 46);
                EthernetHeader {
                    destination: packet.sender_mac,
                    source: self.config.host_mac,
                    ether_type: EtherType::Arp,
                }
                .write(&mut frame);
                frame.extend_from_slice(&reply.to_bytes());
                self.callbacks.send_frame(&frame);
                self.stats.link.frames_out += 1;
                self.stats.link.arp_requests_answered += 1;
                tracing::trace!(ip = %packet.target_ip, to = %packet.sender_mac, "arp reply");
                InputOutcome::Processed
            }
            Operation::Request => InputOutcome::Dropped(DropReason::NotForUs),
            Operation::Reply => InputOutcome::Processed,
        }
    }

    fn answers_arp_for(&self, ip: Ipv4Address) -> bool {
        self.config.is_virtual_address(ip) || self.guestfwds.keys().any(|fwd| fwd.address == ip)
    }

    /// Drains the output queues to the guest, resolving each destination
    /// through the ARP cache. A datagram with no cache entry is dropped; the
    /// first such datagram for each destination sends an ARP request.
    pub(crate) fn if_start(&mut self) {
        let Self {
            interface,
            pool,
            arp,
            callbacks,
            config,
            stats,
            ..
        } = self;
        let mut requested = FxHashSet::default();
        interface.if_start(pool, |datagram| {
            let Some(&[a, b, c, d]) = datagram.get(16..20) else {
                return;
            };
            let destination = Ipv4Address::new([a, b, c, d]);
            let mut frame = Vec::with_capacity(HEADER_LEN + datagram.len());
            match arp.lookup(destination) {
                Some(mac) => {
                    EthernetHeader {
                        destination: mac,
                        source: config.host_mac,
                        ether_type: EtherType::Ipv4,
                    }
                    .write(&mut frame);
                    frame.extend_from_slice(datagram);
                }
                None => {
                    stats.link.arp_misses += 1;
                    if !requested.insert(destination) {
                        tracing::trace!(%destination, "arp request already sent");
                        return;
                    }
                    tracing::debug!(%destination, "no arp entry, requesting");
                    EthernetHeader {
                        destination: MacAddress::BROADCAST,
                        source: config.host_mac,
                        ether_type: EtherType::Arp,
                    }
                    .write(&mut frame);
                    frame.extend_from_slice(
                        &ArpPacket::request(config.host_mac, config.host, destination).to_bytes(),
                    );
                }
            }
            callbacks.send_frame(&frame);
            stats.link.frames_out += 1;
        });
    }

    /// Services host sockets, runs any timers that are due at `now_ms`, and
    /// sends the output. Never blocks.
    pub fn poll(&mut self, now_ms: u64) {
        self.now_ms = self.now_ms.max(now_ms);
        self.tcp_accept_pending();
        for id in self.sockets.ids() {
            let Some(protocol) = self.sockets.get(id).map(|socket| socket.key.protocol) else {
                continue;
            };
            match protocol {
                Protocol::Tcp => self.tcp_poll_socket(id),
                Protocol::Udp => self.udp_poll_socket(id),
                Protocol::Icmp => self.icmp_poll_socket(id),
            }
        }

        if self.now_ms >= self.next_fast_ms {
            self.fasttimo();
            self.next_fast_ms = self.now_ms + FAST_TICK_MS;
        }
        let mut ticks = 0;
        while self.now_ms >= self.next_slow_ms {
            self.slowtimo();
            ticks += 1;
            self.next_slow_ms += SLOW_TICK_MS;
            if ticks == MAX_CATCHUP_TICKS {
                tracing::debug!(now_ms = self.now_ms, "clock jumped, skipping slow ticks");
                self.next_slow_ms = self.now_ms + SLOW_TICK_MS;
            }
        }
        self.if_start();
        self.schedule_timers();
    }

    /// Runs the timer that [`Callbacks::timer_mod`] asked to be woken for.
    pub fn timer_expired(&mut self, kind: TimerKind, now_ms: u64) {
        self.now_ms = self.now_ms.max(now_ms);
        match kind {
            TimerKind::Fast => {
                self.fasttimo();
                self.next_fast_ms = self.now_ms + FAST_TICK_MS;
            }
            TimerKind::Slow => {
                self.slowtimo();
                self.next_slow_ms = self.now_ms + SLOW_TICK_MS;
            }
        }
        self.if_start();
        self.schedule_timers();
    }

    fn fasttimo(&mut self) {
        self.tcp_fasttimo();
    }

    fn slowtimo(&mut self) {
        let purged = self.reassembly.slow_timeout(self.now_ms);
        self.stats.ip.reassembly_timeouts += purged as u64;
        self.tcp_slowtimo();
        self.expire_sockets();
    }

    /// Asks the host for the timers that have work waiting.
    fn schedule_timers(&mut self) {
        let wants_fast = self
            .sockets
            .ids_for(Protocol::Tcp)
            .into_iter()
            .filter_map(|id| self.sockets.get(id)?.tcb.as_ref())
            .any(|tcb| tcb.wants_fast_tick());
        if wants_fast {
            self.callbacks.timer_mod(TimerKind::Fast, self.next_fast_ms);
        }
        if !self.sockets.is_empty() || !self.reassembly.is_empty() {
            self.callbacks.timer_mod(TimerKind::Slow, self.next_slow_ms);
        }
    }

    /// Reclaims UDP and ICMP sockets that have sat idle past their deadline.
    fn expire_sockets(&mut self) {
        let now = self.now_ms;
        let expired: Vec<SocketId> = self
            .sockets
            .ids()
            .into_iter()
            .filter(|&id| {
                self.sockets
                    .get(id)
                    .and_then(|socket| socket.expires_at_ms)
                    .is_some_and(|deadline| deadline <= now)
            })
            .collect();
        for id in expired {
            self.stats.sockets.expired += 1;
            self.free_socket(id);
        }
    }

    /// Destroys a socket, closing its host handle. Packets it already queued
    /// are still sent.
    pub(crate) fn free_socket(&mut self, id: SocketId) {
        let Some(socket) = self.sockets.remove(id) else {
            return;
        };
        self.interface.detach(id);
        if let Some(host) = socket.host {
            self.callbacks.close(host);
        }
        self.stats.sockets.closed += 1;
        socket_event(id, &socket.key, "closed");
    }

    /// Listens on the host at `host` and relays each connection or datagram
    /// to `guest`. An unspecified guest address means the guest's DHCP
    /// address. Returns the address actually bound.
    pub fn add_hostfwd(
        &mut self,
        protocol: Protocol,
        host: SocketAddrV4,
        guest: Endpoint,
    ) -> Result<SocketAddrV4, StackError> {
        let guest = if guest.address.is_unspecified() {
            Endpoint::new(self.config.guest(), guest.port)
        } else {
            guest
        };
        if !guest
            .address
            .in_network(self.config.network, self.config.netmask)
        {
            return Err(StackError::OutsideNetwork(guest));
        }
        if host.port() != 0 && self.find_hostfwd(protocol, host).is_some() {
            return Err(StackError::DuplicateForward(protocol, host));
        }
        let bound = match protocol {
            Protocol::Tcp => {
                let (handle, bound) = self.callbacks.tcp_listen(host)?;
                self.listeners.insert(
                    handle,
                    Listener {
                        bound,
                        guest,
                        kind: ListenerKind::Forward,
                    },
                );
                bound
            }
            Protocol::Udp => {
                let (handle, bound) = self.callbacks.udp_bind(host)?;
                // The guest sees forwarded datagrams come from the virtual
                // host at the bound port
                let key = FlowKey::new(
                    Protocol::Udp,
                    guest,
                    Endpoint::new(self.config.host, bound.port()),
                );
                let created = self.sockets.insert_with(|id| {
                    let mut socket = Socket::new(id, key, Origin::HostForward);
                    socket.host = Some(handle);
                    Ok(socket)
                });
                match created {
                    Ok(id) => {
                        self.stats.sockets.created += 1;
                        socket_event(id, &key, "forwarding");
                    }
                    Err(e) => {
                        self.callbacks.close(handle);
                        return Err(e.into());
                    }
                }
                bound
            }
            Protocol::Icmp => return Err(StackError::UnsupportedForward(protocol)),
        };
        forward_event(bound, guest, "host forward added");
        Ok(bound)
    }

    /// Removes a host forward. Connections already accepted through it are
    /// left alone.
    pub fn remove_hostfwd(&mut self, protocol: Protocol, host: SocketAddrV4) -> Result<(), StackError> {
        match self.find_hostfwd(protocol, host) {
            Some(HostForward::Listener(handle)) => {
                if let Some(listener) = self.listeners.remove(&handle) {
                    forward_event(listener.bound, listener.guest, "host forward removed");
                }
                self.callbacks.close(handle);
                Ok(())
            }
            Some(HostForward::Socket(id)) => {
                self.free_socket(id);
                Ok(())
            }
            None => Err(StackError::NoSuchForward(protocol, host)),
        }
    }

    fn find_hostfwd(&self, protocol: Protocol, host: SocketAddrV4) -> Option<HostForward> {
        let matches = |bound: SocketAddrV4| {
            bound.port() == host.port() && (host.ip().is_unspecified() || bound.ip() == host.ip())
        };
        match protocol {
            Protocol::Tcp => self
                .listeners
                .iter()
                .find(|(_, listener)| listener.kind == ListenerKind::Forward && matches(listener.bound))
                .map(|(handle, _)| HostForward::Listener(*handle)),
            Protocol::Udp => self
                .sockets
                .ids_for(Protocol::Udp)
                .into_iter()
                .find(|&id| {
                    self.sockets.get(id).is_some_and(|socket| {
                        socket.origin == Origin::HostForward && socket.key.remote.port == host.port()
                    })
                })
                .map(HostForward::Socket),
            Protocol::Icmp => None,
        }
    }

    /// Sends TCP connections the guest makes to `virtual_endpoint` on to
    /// `target` on the host side. An unspecified address means the virtual
    /// host.
    pub fn add_guestfwd(&mut self, virtual_endpoint: Endpoint, target: SocketAddrV4) -> Result<(), StackError> {
        let endpoint = if virtual_endpoint.address.is_unspecified() {
            Endpoint::new(self.config.host, virtual_endpoint.port)
        } else {
            virtual_endpoint
        };
        if !endpoint
            .address
            .in_network(self.config.network, self.config.netmask)
            || endpoint.address == self.config.guest()
        {
            return Err(StackError::OutsideNetwork(endpoint));
        }
        if self.guestfwds.contains_key(&endpoint) {
            return Err(StackError::DuplicateGuestForward(endpoint));
        }
        self.guestfwds.insert(endpoint, target);
        forward_event(target, endpoint, "guest forward added");
        Ok(())
    }

    pub fn remove_guestfwd(&mut self, virtual_endpoint: Endpoint) -> Result<(), StackError> {
        match self.guestfwds.remove(&virtual_endpoint) {
            Some(target) => {
                forward_event(target, virtual_endpoint, "guest forward removed");
                Ok(())
            }
            None => Err(StackError::NoSuchGuestForward(virtual_endpoint)),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    /// Buffers currently allocated from the pool
    pub fn mbuf_outstanding(&self) -> usize {
        self.pool.outstanding()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Datagrams partially reassembled
    pub fn reassembly_pending(&self) -> usize {
        self.reassembly.len()
    }

    /// The socket for a flow, if one is live
    pub fn socket(&self, key: &FlowKey) -> Option<&Socket> {
        self.sockets.get(self.sockets.find(key)?)
    }
}

enum HostForward {
    Listener(HostHandle),
    Socket(SocketId),
}

impl<C: Callbacks> Drop for Stack<C> {
    fn drop(&mut self) {
        for socket in self.sockets.drain() {
            if let Some(host) = socket.host {
                self.callbacks.close(host);
            }
        }
        for (handle, _) in self.listeners.drain() {
            self.callbacks.close(handle);
        }
        self.interface.clear(&mut self.pool);
        self.reassembly.clear();
        tracing::info!("stack destroyed");
    }
}
