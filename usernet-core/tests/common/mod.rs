//! A scripted host and frame helpers shared by the integration tests.

#![allow(dead_code)]

use etherparse::{IpNumber, Ipv4Header, TcpHeader, UdpHeader};
use std::{
    collections::{BTreeMap, VecDeque},
    io,
    net::{Ipv4Addr, SocketAddrV4},
};
use usernet_core::{
    Callbacks, ConnectStatus, HostHandle, Ipv4Address, MacAddress, Stack, StackConfig, TimerKind,
};

pub const GUEST_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
pub const GUEST_IP: [u8; 4] = [10, 0, 2, 15];
pub const HOST_IP: [u8; 4] = [10, 0, 2, 2];
pub const REMOTE_IP: [u8; 4] = [93, 184, 216, 34];

#[derive(Debug, Default)]
pub struct MockStream {
    pub written: Vec<u8>,
    pub inbound: VecDeque<u8>,
    /// The host peer has closed; reads return end of stream once `inbound`
    /// is empty
    pub eof: bool,
    pub shut_write: bool,
    pub status: Option<ConnectStatus>,
}

#[derive(Debug, Default)]
pub struct MockDatagrams {
    pub bound: Option<SocketAddrV4>,
    pub sent: Vec<(Vec<u8>, SocketAddrV4)>,
    pub inbound: VecDeque<(Vec<u8>, SocketAddrV4)>,
}

/// Records everything the stack asks of its host and answers from scripts.
#[derive(Debug)]
pub struct MockHost {
    pub frames: Vec<Vec<u8>>,
    pub timers: Vec<(TimerKind, u64)>,
    pub connects: Vec<(HostHandle, SocketAddrV4)>,
    /// What `connect_status` reports for new connections
    pub connect_status: ConnectStatus,
    /// Fail `tcp_connect` immediately
    pub connect_error: Option<io::ErrorKind>,
    pub streams: BTreeMap<HostHandle, MockStream>,
    /// Listeners and the peers waiting to be accepted on each
    pub listeners: BTreeMap<HostHandle, (SocketAddrV4, VecDeque<SocketAddrV4>)>,
    pub datagrams: BTreeMap<HostHandle, MockDatagrams>,
    pub closed: Vec<HostHandle>,
    pub local: SocketAddrV4,
    next_handle: u64,
    next_port: u16,
}

impl Default for MockHost {
    fn default() -> Self {
        Self {
            frames: vec![],
            timers: vec![],
            connects: vec![],
            connect_status: ConnectStatus::Connected,
            connect_error: None,
            streams: BTreeMap::new(),
            listeners: BTreeMap::new(),
            datagrams: BTreeMap::new(),
            closed: vec![],
            local: SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 0),
            next_handle: 1,
            next_port: 40000,
        }
    }
}

impl MockHost {
    fn handle(&mut self) -> HostHandle {
        let handle = HostHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn bind_port(&mut self, bind: SocketAddrV4) -> SocketAddrV4 {
        if bind.port() != 0 {
            return bind;
        }
        self.next_port += 1;
        SocketAddrV4::new(*bind.ip(), self.next_port)
    }

    /// Takes every frame sent so far.
    pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.frames)
    }

    pub fn stream(&mut self, handle: HostHandle) -> &mut MockStream {
        self.streams.entry(handle).or_default()
    }

    pub fn last_connect(&self) -> Option<HostHandle> {
        self.connects.last().map(|(handle, _)| *handle)
    }
}

impl Callbacks for MockHost {
    fn send_frame(&mut self, frame: &[u8]) {
        self.frames.push(frame.to_vec());
    }

    fn timer_mod(&mut self, kind: TimerKind, deadline_ms: u64) {
        self.timers.push((kind, deadline_ms));
    }

    fn tcp_connect(&mut self, target: SocketAddrV4) -> io::Result<HostHandle> {
        if let Some(kind) = self.connect_error {
            return Err(kind.into());
        }
        let handle = self.handle();
        self.connects.push((handle, target));
        let status = self.connect_status;
        self.stream(handle).status = Some(status);
        Ok(handle)
    }

    fn connect_status(&mut self, handle: HostHandle) -> ConnectStatus {
        self.stream(handle).status.unwrap_or(ConnectStatus::Connected)
    }

    fn tcp_listen(&mut self, bind: SocketAddrV4) -> io::Result<(HostHandle, SocketAddrV4)> {
        let handle = self.handle();
        let bound = self.bind_port(bind);
        self.listeners.insert(handle, (bound, VecDeque::new()));
        Ok((handle, bound))
    }

    fn tcp_accept(&mut self, listener: HostHandle) -> io::Result<(HostHandle, SocketAddrV4)> {
        let peer = self
            .listeners
            .get_mut(&listener)
            .and_then(|(_, pending)| pending.pop_front())
            .ok_or(io::ErrorKind::WouldBlock)?;
        let handle = self.handle();
        self.stream(handle).status = Some(ConnectStatus::Connected);
        Ok((handle, peer))
    }

    fn tcp_send(&mut self, handle: HostHandle, data: &[u8]) -> io::Result<usize> {
        self.stream(handle).written.extend_from_slice(data);
        Ok(data.len())
    }

    fn tcp_recv(&mut self, handle: HostHandle, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.stream(handle);
        if stream.inbound.is_empty() {
            return if stream.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(stream.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(stream.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn tcp_shutdown_write(&mut self, handle: HostHandle) -> io::Result<()> {
        self.stream(handle).shut_write = true;
        Ok(())
    }

    fn local_addr(&mut self, _handle: HostHandle) -> io::Result<SocketAddrV4> {
        Ok(self.local)
    }

    fn udp_bind(&mut self, bind: SocketAddrV4) -> io::Result<(HostHandle, SocketAddrV4)> {
        let handle = self.handle();
        let bound = self.bind_port(bind);
        self.datagrams.entry(handle).or_default().bound = Some(bound);
        Ok((handle, bound))
    }

    fn udp_send_to(&mut self, handle: HostHandle, data: &[u8], target: SocketAddrV4) -> io::Result<usize> {
        self.datagrams
            .entry(handle)
            .or_default()
            .sent
            .push((data.to_vec(), target));
        Ok(data.len())
    }

    fn udp_recv_from(&mut self, handle: HostHandle, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        let (data, from) = self
            .datagrams
            .get_mut(&handle)
            .and_then(|socket| socket.inbound.pop_front())
            .ok_or(io::ErrorKind::WouldBlock)?;
        buf[..data.len()].copy_from_slice(&data);
        Ok((data.len(), from))
    }

    fn close(&mut self, handle: HostHandle) {
        self.closed.push(handle);
    }
}

pub fn stack() -> Stack<MockHost> {
    stack_with(StackConfig::default())
}

pub fn stack_with(config: StackConfig) -> Stack<MockHost> {
    match Stack::new(config, MockHost::default()) {
        Ok(stack) => stack,
        Err(e) => panic!("default configuration rejected: {e}"),
    }
}

pub fn host_mac() -> [u8; 6] {
    StackConfig::default().host_mac.to_bytes()
}

/// Wraps an IPv4 datagram in an Ethernet frame from the guest.
pub fn ethernet(ether_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.extend_from_slice(&host_mac());
    frame.extend_from_slice(&GUEST_MAC);
    frame.extend_from_slice(&ether_type.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// A guest ARP request for `target`.
pub fn arp_request(target: [u8; 4]) -> Vec<u8> {
    let mut arp = vec![0, 1, 0x08, 0x00, 6, 4, 0, 1];
    arp.extend_from_slice(&GUEST_MAC);
    arp.extend_from_slice(&GUEST_IP);
    arp.extend_from_slice(&[0; 6]);
    arp.extend_from_slice(&target);
    let mut frame = Vec::with_capacity(42);
    frame.extend_from_slice(&MacAddress::BROADCAST.to_bytes());
    frame.extend_from_slice(&GUEST_MAC);
    frame.extend_from_slice(&0x0806u16.to_be_bytes());
    frame.extend_from_slice(&arp);
    frame
}

/// A segment from the guest, checksummed.
pub fn tcp_frame(
    src: ([u8; 4], u16),
    dst: ([u8; 4], u16),
    seq: u32,
    ack: Option<u32>,
    flags: &str,
    payload: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let mut tcp = TcpHeader::new(src.1, dst.1, seq, 65535);
    if let Some(ack) = ack {
        tcp.ack = true;
        tcp.acknowledgment_number = ack;
    }
    tcp.syn = flags.contains('S');
    tcp.fin = flags.contains('F');
    tcp.rst = flags.contains('R');
    tcp.psh = flags.contains('P');
    let ip = Ipv4Header::new(
        (tcp.header_len() as usize + payload.len()).try_into()?,
        64,
        IpNumber::Tcp as u8,
        src.0,
        dst.0,
    );
    tcp.checksum = tcp.calc_checksum_ipv4(&ip, payload)?;
    let mut datagram = vec![];
    ip.write(&mut datagram)?;
    tcp.write(&mut datagram)?;
    datagram.extend_from_slice(payload);
    Ok(ethernet(0x0800, &datagram))
}

/// The IP payload of a UDP datagram from the guest, header and checksum
/// included, with the IP header that carries it whole.
pub fn udp_datagram(
    src: ([u8; 4], u16),
    dst: ([u8; 4], u16),
    payload: &[u8],
) -> anyhow::Result<(Ipv4Header, Vec<u8>)> {
    let ip = Ipv4Header::new(
        (8 + payload.len()).try_into()?,
        64,
        IpNumber::Udp as u8,
        src.0,
        dst.0,
    );
    let udp = UdpHeader::with_ipv4_checksum(src.1, dst.1, &ip, payload)?;
    let mut body = vec![];
    udp.write(&mut body)?;
    body.extend_from_slice(payload);
    Ok((ip, body))
}

pub fn udp_frame(src: ([u8; 4], u16), dst: ([u8; 4], u16), payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let (ip, body) = udp_datagram(src, dst, payload)?;
    let mut datagram = vec![];
    ip.write(&mut datagram)?;
    datagram.extend_from_slice(&body);
    Ok(ethernet(0x0800, &datagram))
}

/// An ICMP echo request from the guest.
pub fn echo_request(dst: [u8; 4], identifier: u16, sequence: u16, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    echo_request_with_ttl(dst, 64, identifier, sequence, payload)
}

pub fn echo_request_with_ttl(
    dst: [u8; 4],
    ttl: u8,
    identifier: u16,
    sequence: u16,
    payload: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let mut icmp = vec![8, 0, 0, 0];
    icmp.extend_from_slice(&identifier.to_be_bytes());
    icmp.extend_from_slice(&sequence.to_be_bytes());
    icmp.extend_from_slice(payload);
    let checksum = internet_checksum(&icmp);
    icmp[2..4].copy_from_slice(&checksum.to_be_bytes());
    let ip = Ipv4Header::new(icmp.len().try_into()?, ttl, IpNumber::Icmp as u8, GUEST_IP, dst);
    let mut datagram = vec![];
    ip.write(&mut datagram)?;
    datagram.extend_from_slice(&icmp);
    Ok(ethernet(0x0800, &datagram))
}

pub fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)]) as u32)
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// A frame to the guest, split into its IP header and IP payload.
pub fn parse_ipv4(frame: &[u8]) -> anyhow::Result<(Ipv4Header, Vec<u8>)> {
    anyhow::ensure!(frame.len() >= 14, "short frame");
    anyhow::ensure!(frame[12..14] == [0x08, 0x00], "not IPv4");
    let (ip, rest) = Ipv4Header::from_slice(&frame[14..])?;
    let payload_len = ip.payload_len as usize;
    anyhow::ensure!(rest.len() >= payload_len, "truncated datagram");
    Ok((ip, rest[..payload_len].to_vec()))
}

/// A segment to the guest: header and payload, with the checksum verified.
pub fn parse_tcp(frame: &[u8]) -> anyhow::Result<(Ipv4Header, TcpHeader, Vec<u8>)> {
    let (ip, body) = parse_ipv4(frame)?;
    anyhow::ensure!(ip.protocol == IpNumber::Tcp as u8, "not TCP");
    let (tcp, payload) = TcpHeader::from_slice(&body)?;
    anyhow::ensure!(
        tcp.calc_checksum_ipv4(&ip, payload)? == tcp.checksum,
        "bad TCP checksum"
    );
    Ok((ip, tcp, payload.to_vec()))
}

pub fn parse_udp(frame: &[u8]) -> anyhow::Result<(Ipv4Header, UdpHeader, Vec<u8>)> {
    let (ip, body) = parse_ipv4(frame)?;
    anyhow::ensure!(ip.protocol == IpNumber::Udp as u8, "not UDP");
    let (udp, payload) = UdpHeader::from_slice(&body)?;
    anyhow::ensure!(
        udp.calc_checksum_ipv4(&ip, payload)? == udp.checksum,
        "bad UDP checksum"
    );
    Ok((ip, udp, payload.to_vec()))
}

pub fn address(bytes: [u8; 4]) -> Ipv4Address {
    Ipv4Address::new(bytes)
}
