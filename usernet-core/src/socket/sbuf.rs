use crate::mbuf::Chain;
use std::collections::VecDeque;

/// Default capacity of each direction of a TCP socket. The advertised
/// window is a 16-bit field and window scaling is not negotiated.
pub const DEFAULT_CAPACITY: usize = 64 * 1024 - 1;

/// A byte queue for one direction of a socket.
///
/// Data bound for the guest stays here until the guest acknowledges it, so
/// retransmissions read from the same bytes by offset rather than keeping a
/// copy. Appending never fails; the capacity only shapes the advertised
/// window and how much is read from the host at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sbuf {
    data: VecDeque<u8>,
    capacity: usize,
}

impl Sbuf {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Room left before the buffer reaches its capacity
    pub fn space(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend(bytes);
    }

    pub fn append_chain(&mut self, chain: &Chain) {
        for piece in chain.segments() {
            self.data.extend(piece);
        }
    }

    /// Discards `n` bytes from the front, or everything if fewer are held.
    pub fn drop_front(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    /// Copies up to `len` bytes starting `offset` bytes in.
    pub fn copy_range(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.iter().skip(offset).take(len).copied().collect()
    }

    /// The held bytes as one slice, for handing to a host write.
    pub fn contiguous(&mut self) -> &[u8] {
        self.data.make_contiguous()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl Default for Sbuf {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// The two directions of a TCP socket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketBuffers {
    /// Received from the guest, waiting to be written to the host
    pub to_host: Sbuf,
    /// Read from the host, waiting to be sent to and acknowledged by the
    /// guest
    pub to_guest: Sbuf,
}
