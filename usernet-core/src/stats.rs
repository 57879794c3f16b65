//! Counters kept by a running stack.

/// Per-layer packet counts, read through `Stack::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub link: LinkStats,
    pub ip: IpStats,
    pub tcp: TcpStats,
    pub udp: UdpStats,
    pub icmp: IcmpStats,
    pub sockets: SocketStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub arp_requests_answered: u64,
    /// Requests sent because an outgoing datagram had no cache entry
    pub arp_misses: u64,
    /// Frames that were not Ethernet II, ARP, or IPv4
    pub unsupported: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpStats {
    pub packets_in: u64,
    pub packets_out: u64,
    /// Failed header, length, or checksum validation
    pub bad_headers: u64,
    pub fragments_in: u64,
    pub reassembled: u64,
    pub reassembly_timeouts: u64,
    pub fragments_out: u64,
    /// Could not be queued because the buffer pool was exhausted
    pub no_buffers: u64,
    pub unknown_protocol: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpStats {
    pub segments_in: u64,
    pub segments_out: u64,
    pub bad_segments: u64,
    pub connects: u64,
    pub accepts: u64,
    pub resets_sent: u64,
    pub retransmit_timeouts: u64,
    pub fast_retransmits: u64,
    /// Connections abandoned by timeout or host error
    pub drops: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpStats {
    pub datagrams_in: u64,
    pub datagrams_out: u64,
    pub bad_datagrams: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IcmpStats {
    pub messages_in: u64,
    pub echo_replies: u64,
    pub errors_sent: u64,
    pub bad_messages: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    pub created: u64,
    pub closed: u64,
    pub expired: u64,
    /// Refused because the table was full
    pub refused: u64,
}
