//! The output scheduler.
//!
//! Finished IP datagrams wait here until [`Interface::if_start`] hands them
//! to the link. Interactive traffic goes on the fast queue and always leaves
//! first. Bulk traffic is grouped into sessions, one per socket, and the
//! sessions take turns one packet at a time so a single large transfer
//! cannot starve the others.

use crate::{
    mbuf::{MbufError, MbufId, MbufPool, MbufQueue, Owner},
    socket::SocketId,
};
use std::collections::VecDeque;

/// Which queue a datagram joins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Fast,
    /// The batch session of a socket. Datagrams with no socket each form a
    /// session of their own.
    Batch(Option<SocketId>),
}

#[derive(Debug)]
struct BatchSession {
    socket: Option<SocketId>,
    packets: MbufQueue,
}

#[derive(Debug)]
pub struct Interface {
    fastq: MbufQueue,
    batchq: VecDeque<BatchSession>,
    /// Set while `if_start` is draining
    busy: bool,
}

impl Default for Interface {
    fn default() -> Self {
        Self {
            fastq: MbufQueue::new(Owner::FastQueue),
            batchq: VecDeque::new(),
            busy: false,
        }
    }
}

impl Interface {
    /// Queues an in-flight datagram for the link.
    pub fn if_output(&mut self, pool: &mut MbufPool, id: MbufId, queue: Queue) -> Result<(), MbufError> {
        match queue {
            Queue::Fast => self.fastq.enqueue(pool, id),
            Queue::Batch(Some(socket)) => {
                if let Some(session) = self
                    .batchq
                    .iter_mut()
                    .find(|session| session.socket == Some(socket))
                {
                    return session.packets.enqueue(pool, id);
                }
                self.new_session(pool, id, Some(socket))
            }
            Queue::Batch(None) => self.new_session(pool, id, None),
        }
    }

    fn new_session(&mut self, pool: &mut MbufPool, id: MbufId, socket: Option<SocketId>) -> Result<(), MbufError> {
        let mut packets = MbufQueue::new(Owner::BatchQueue);
        packets.enqueue(pool, id)?;
        self.batchq.push_back(BatchSession { socket, packets });
        Ok(())
    }

    /// Sends everything queued through `send`, releasing each buffer after
    /// it has been handed over. Returns how many datagrams were sent.
    pub fn if_start(&mut self, pool: &mut MbufPool, mut send: impl FnMut(&[u8])) -> usize {
        if self.busy {
            return 0;
        }
        self.busy = true;
        let mut sent = 0;
        while let Some(id) = self.next(pool) {
            if let Ok(datagram) = pool.data(id) {
                send(datagram);
                sent += 1;
            }
            if let Err(e) = pool.release(id) {
                tracing::error!(error = %e, "could not release sent mbuf");
            }
        }
        self.busy = false;
        sent
    }

    /// The next datagram to send: anything on the fast queue, otherwise one
    /// packet from the session at the head of the rotation.
    fn next(&mut self, pool: &mut MbufPool) -> Option<MbufId> {
        if let Some(id) = self.fastq.dequeue(pool) {
            return Some(id);
        }
        while let Some(mut session) = self.batchq.pop_front() {
            let id = session.packets.dequeue(pool);
            if !session.packets.is_empty() {
                self.batchq.push_back(session);
            }
            if id.is_some() {
                return id;
            }
        }
        None
    }

    /// Datagrams waiting
    pub fn len(&self) -> usize {
        self.fastq.len()
            + self
                .batchq
                .iter()
                .map(|session| session.packets.len())
                .sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batch sessions with packets waiting
    pub fn sessions(&self) -> usize {
        self.batchq.len()
    }

    /// Detaches a closed socket from its session. Its packets still go out,
    /// but later traffic no longer joins them.
    pub fn detach(&mut self, socket: SocketId) {
        for session in &mut self.batchq {
            if session.socket == Some(socket) {
                session.socket = None;
            }
        }
    }

    /// Releases everything queued.
    pub fn clear(&mut self, pool: &mut MbufPool) {
        self.fastq.drain_into(pool);
        for mut session in self.batchq.drain(..) {
            session.packets.drain_into(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(interface: &mut Interface, pool: &mut MbufPool, tag: u8, queue: Queue) -> anyhow::Result<()> {
        let id = pool.allocate_from(&[tag])?;
        interface.if_output(pool, id, queue)?;
        Ok(())
    }

    fn drain(interface: &mut Interface, pool: &mut MbufPool) -> Vec<u8> {
        let mut order = vec![];
        interface.if_start(pool, |datagram| order.push(datagram[0]));
        order
    }

    #[test]
    fn fast_first_then_batch_round_robin() -> anyhow::Result<()> {
        let mut pool = MbufPool::new(64);
        let mut interface = Interface::default();
        let a = Queue::Batch(Some(SocketId(1)));
        let b = Queue::Batch(Some(SocketId(2)));
        for tag in [0xa1, 0xa2, 0xa3] {
            queue(&mut interface, &mut pool, tag, a)?;
        }
        for tag in [0xb1, 0xb2] {
            queue(&mut interface, &mut pool, tag, b)?;
        }
        queue(&mut interface, &mut pool, 0xf1, Queue::Fast)?;
        assert_eq!(interface.len(), 6);
        assert_eq!(interface.sessions(), 2);

        assert_eq!(
            drain(&mut interface, &mut pool),
            [0xf1, 0xa1, 0xb1, 0xa2, 0xb2, 0xa3]
        );
        assert!(interface.is_empty());
        assert_eq!(pool.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn drain_in_progress_is_not_restarted() -> anyhow::Result<()> {
        let mut pool = MbufPool::new(64);
        let mut interface = Interface::default();
        queue(&mut interface, &mut pool, 1, Queue::Fast)?;
        queue(&mut interface, &mut pool, 2, Queue::Batch(None))?;

        interface.busy = true;
        assert!(drain(&mut interface, &mut pool).is_empty());
        assert_eq!(interface.len(), 2);
        assert_eq!(pool.outstanding(), 2);

        interface.busy = false;
        assert_eq!(drain(&mut interface, &mut pool), [1, 2]);
        assert!(!interface.busy);
        assert_eq!(pool.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn sessionless_packets_each_get_a_turn() -> anyhow::Result<()> {
        let mut pool = MbufPool::new(64);
        let mut interface = Interface::default();
        let a = Queue::Batch(Some(SocketId(1)));
        queue(&mut interface, &mut pool, 1, a)?;
        queue(&mut interface, &mut pool, 2, a)?;
        queue(&mut interface, &mut pool, 10, Queue::Batch(None))?;
        queue(&mut interface, &mut pool, 11, Queue::Batch(None))?;
        assert_eq!(drain(&mut interface, &mut pool), [1, 10, 11, 2]);
        Ok(())
    }

    #[test]
    fn detached_packets_still_drain() -> anyhow::Result<()> {
        let mut pool = MbufPool::new(64);
        let mut interface = Interface::default();
        let a = Queue::Batch(Some(SocketId(7)));
        queue(&mut interface, &mut pool, 1, a)?;
        interface.detach(SocketId(7));
        // A reused id starts a new session rather than joining the old one
        queue(&mut interface, &mut pool, 2, a)?;
        assert_eq!(interface.sessions(), 2);
        assert_eq!(drain(&mut interface, &mut pool), [1, 2]);
        assert_eq!(pool.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn clear_returns_every_buffer() -> anyhow::Result<()> {
        let mut pool = MbufPool::new(64);
        let mut interface = Interface::default();
        queue(&mut interface, &mut pool, 1, Queue::Fast)?;
        queue(&mut interface, &mut pool, 2, Queue::Batch(None))?;
        interface.clear(&mut pool);
        assert!(interface.is_empty());
        assert_eq!(pool.outstanding(), 0);
        Ok(())
    }
}
