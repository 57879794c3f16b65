//! Fragment reassembly (RFC 791 section 3.2).
//!
//! Pieces of one datagram are keyed by [`DatagramKey`] and stored by byte
//! offset. An entry's deadline is fixed when its first fragment arrives;
//! [`Reassembly::slow_timeout`] discards entries whose deadline has passed.
//! Discarded fragments are never retried.

use super::{ipv4_parsing::Ipv4Header, Ipv4Address};
use crate::mbuf::Chain;
use rustc_hash::FxHashMap;
use std::collections::{btree_map::Entry, BTreeMap};

/// How long a partially assembled datagram is kept, in milliseconds
pub const REASSEMBLY_TIMEOUT_MS: u64 = 30_000;
/// The default cap on datagrams under assembly at once
pub const DEFAULT_MAX_PENDING: usize = 64;

/// Fragments belong together when all four fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatagramKey {
    pub source: Ipv4Address,
    pub destination: Ipv4Address,
    pub protocol: u8,
    pub identification: u16,
}

impl From<&Ipv4Header> for DatagramKey {
    fn from(header: &Ipv4Header) -> Self {
        Self {
            source: header.source,
            destination: header.destination,
            protocol: header.protocol,
            identification: header.identification,
        }
    }
}

#[derive(Debug)]
pub struct Reassembly {
    pending: FxHashMap<DatagramKey, Pending>,
    max_pending: usize,
}

#[derive(Debug)]
struct Pending {
    /// Header of the piece at offset zero
    first: Option<Ipv4Header>,
    /// Byte offset to payload. A repeated offset keeps the earlier piece.
    pieces: BTreeMap<usize, Chain>,
    /// Payload length, learned from the piece without MF
    length: Option<usize>,
    deadline_ms: u64,
}

impl Pending {
    fn new(deadline_ms: u64) -> Self {
        Self {
            first: None,
            pieces: BTreeMap::new(),
            length: None,
            deadline_ms,
        }
    }

    /// Whether the pieces leave no hole below the known length.
    fn is_complete(&self) -> bool {
        let (Some(length), Some(_)) = (self.length, self.first) else {
            return false;
        };
        let mut reach = 0;
        for (&offset, piece) in &self.pieces {
            if offset > reach {
                return false;
            }
            reach = reach.max(offset + piece.len());
            if reach >= length {
                return true;
            }
        }
        false
    }

    /// Joins the pieces in offset order. Where two overlap, the bytes
    /// already placed win.
    fn assemble(self, length: usize) -> Chain {
        let mut out = Chain::default();
        for (offset, mut piece) in self.pieces {
            let placed = out.len();
            if offset + piece.len() <= placed {
                continue;
            }
            piece.remove_front(placed.saturating_sub(offset));
            out.append(piece);
        }
        out.truncate(length);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddFragmentResult {
    /// The fragment completed its datagram. The header describes the whole
    /// datagram and the chain holds its reassembled payload.
    Complete(Ipv4Header, Chain),
    /// More fragments are needed
    Incomplete,
    /// The fragment was unusable or there was no room to track it
    Dropped,
}

impl Reassembly {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: FxHashMap::default(),
            max_pending,
        }
    }

    /// Adds one fragment's payload. `header` must already have its options
    /// stripped and `body` must be exactly the fragment payload.
    pub fn add_fragment(&mut self, header: Ipv4Header, body: Chain, now_ms: u64) -> AddFragmentResult {
        let key = DatagramKey::from(&header);
        let offset = header.fragment_offset as usize * 8;
        let end = offset + body.len();

        if !header.is_fragment() {
            // A whole datagram supersedes any pieces under the same key
            self.pending.remove(&key);
            return AddFragmentResult::Complete(header, body);
        }

        // Only the last piece may end off an 8-byte boundary
        let misaligned = header.more_fragments && body.len() % 8 != 0;
        // The whole datagram, header included, must fit the total length field
        let too_long = end + header.header_len() > u16::MAX as usize;
        if misaligned || body.is_empty() || too_long {
            tracing::debug!(src = %header.source, id = header.identification, "malformed fragment");
            return AddFragmentResult::Dropped;
        }

        if !self.pending.contains_key(&key) && self.pending.len() >= self.max_pending {
            tracing::debug!(limit = self.max_pending, "reassembly table full");
            return AddFragmentResult::Dropped;
        }
        let pending = self
            .pending
            .entry(key)
            .or_insert_with(|| Pending::new(now_ms + REASSEMBLY_TIMEOUT_MS));

        if let Entry::Vacant(slot) = pending.pieces.entry(offset) {
            slot.insert(body);
        }
        if !header.more_fragments {
            pending.length = Some(end);
        }
        if offset == 0 {
            pending.first = Some(header);
        }
        if !pending.is_complete() {
            return AddFragmentResult::Incomplete;
        }

        let Some(pending) = self.pending.remove(&key) else {
            return AddFragmentResult::Incomplete;
        };
        let (Some(mut whole), Some(length)) = (pending.first, pending.length) else {
            return AddFragmentResult::Dropped;
        };
        let payload = pending.assemble(length);
        whole.total_length = (length + whole.header_len()) as u16;
        whole.fragment_offset = 0;
        whole.more_fragments = false;
        tracing::trace!(src = %whole.source, id = whole.identification, len = length, "datagram reassembled");
        AddFragmentResult::Complete(whole, payload)
    }

    /// Discards every entry whose deadline has passed. Returns how many were
    /// discarded.
    pub fn slow_timeout(&mut self, now_ms: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|key, pending| {
            let keep = pending.deadline_ms > now_ms;
            if !keep {
                tracing::debug!(src = %key.source, id = key.identification, "reassembly timed out");
            }
            keep
        });
        before - self.pending.len()
    }

    /// Datagrams currently under assembly.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for Reassembly {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}
