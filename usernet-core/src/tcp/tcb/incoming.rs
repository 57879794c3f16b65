use crate::{mbuf::Chain, tcp::seq::seq_lt};
use std::{cmp::Ordering, collections::BinaryHeap};

/// A segment that arrived ahead of `RCV.NXT`, trimmed to the receive window
#[derive(Debug, Clone)]
pub struct Incoming {
    pub seq: u32,
    pub data: Chain,
    pub fin: bool,
}

impl PartialEq for Incoming {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Incoming {}

impl PartialOrd for Incoming {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Incoming {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.seq == other.seq {
            Ordering::Equal
        } else if seq_lt(self.seq, other.seq) {
            // Reversed so the heap yields the lowest sequence number first
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

/// Out-of-order segments waiting for the gap before them to fill
#[derive(Debug, Clone, Default)]
pub struct OutOfOrder {
    heap: BinaryHeap<Incoming>,
    bytes: usize,
}

impl OutOfOrder {
    pub fn insert(&mut self, incoming: Incoming) {
        self.bytes += incoming.data.len();
        self.heap.push(incoming);
    }

    /// Takes every queued piece that now lines up with `rcv_nxt`, in order.
    /// Bytes already received are trimmed off; a segment carrying a FIN ends
    /// the run. Returns the delivered data and whether a FIN was reached.
    pub fn take_in_order(&mut self, mut rcv_nxt: u32) -> (Chain, bool, u32) {
        let mut delivered = Chain::default();
        let mut fin = false;
        while let Some(next) = self.heap.peek() {
            if seq_lt(rcv_nxt, next.seq) {
                break;
            }
            let Some(Incoming { seq, mut data, fin: has_fin }) = self.heap.pop() else {
                break;
            };
            self.bytes -= data.len();
            let duplicate = rcv_nxt.wrapping_sub(seq) as usize;
            if duplicate >= data.len() && !(has_fin && duplicate == data.len()) {
                continue;
            }
            data.remove_front(duplicate.min(data.len()));
            rcv_nxt = rcv_nxt.wrapping_add(data.len() as u32);
            delivered.append(data);
            if has_fin {
                fin = true;
                break;
            }
        }
        (delivered, fin, rcv_nxt)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Bytes held
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.bytes = 0;
    }
}
