//! The two halves of a connection's sequence state (RFC 9293 section 3.3.1).

/// What has been sent to the guest and what it has acknowledged.
/// Sequence numbers run `una <= nxt <= max`, modulo wraparound.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub struct SendSequenceSpace {
    pub iss: u32,
    /// Oldest byte the guest has not acknowledged
    pub una: u32,
    /// Next byte to send. Backs up to `una` on retransmission.
    pub nxt: u32,
    /// One past the highest byte ever sent
    pub max: u32,
    /// Window the guest last offered
    pub wnd: u32,
    /// Sequence and acknowledgment numbers of the segment that last moved
    /// the window
    pub wl1: u32,
    pub wl2: u32,
}

impl SendSequenceSpace {
    pub fn new(iss: u32) -> Self {
        Self {
            iss,
            una: iss,
            nxt: iss,
            max: iss,
            ..Self::default()
        }
    }
}

/// What has arrived from the guest.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub struct ReceiveSequenceSpace {
    pub irs: u32,
    /// Next byte expected; the left edge of the receive window
    pub nxt: u32,
    pub wnd: u32,
    /// Right edge of the window last advertised
    pub adv: u32,
}
