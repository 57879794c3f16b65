//! Packet buffers: the ownership-tracked pool and the FIFO queues that move
//! buffers between layers.
//!
//! The pool owns every buffer's storage. Everything else holds an [`MbufId`],
//! a generation-checked handle, so a released buffer can never be touched
//! through an old handle. Each buffer has exactly one [`Owner`] at a time and
//! ownership only changes on enqueue, dequeue, or release.

use std::collections::VecDeque;
use thiserror::Error as ThisError;

mod chain;
pub use chain::Chain;

mod segment;
pub use segment::Segment;

/// Where a buffer currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// On the free list, storage kept for reuse
    Free,
    /// Allocated and held by whoever is building or sending it
    InFlight,
    /// Waiting on the interactive output queue
    FastQueue,
    /// Waiting on a bulk session's output queue
    BatchQueue,
}

impl Owner {
    fn is_queued(self) -> bool {
        matches!(self, Owner::FastQueue | Owner::BatchQueue)
    }
}

/// A handle to a buffer in an [`MbufPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MbufId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    owner: Owner,
    data: Vec<u8>,
}

/// An arena of packet buffers with a free list and an outstanding-buffer
/// ceiling.
#[derive(Debug)]
pub struct MbufPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    outstanding: usize,
    ceiling: usize,
}

impl MbufPool {
    pub fn new(ceiling: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            outstanding: 0,
            ceiling,
        }
    }

    /// Hands out an empty buffer with room for at least `min_size` bytes.
    /// Storage from the free list is reused before anything new is allocated.
    pub fn allocate(&mut self, min_size: usize) -> Result<MbufId, MbufError> {
        if self.outstanding >= self.ceiling {
            tracing::warn!(ceiling = self.ceiling, "mbuf ceiling reached");
            return Err(MbufError::Exhausted {
                ceiling: self.ceiling,
            });
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len())
                    .map_err(|_| MbufError::Exhausted {
                        ceiling: self.ceiling,
                    })?;
                self.slots.push(Slot {
                    generation: 0,
                    owner: Owner::Free,
                    data: Vec::new(),
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.owner = Owner::InFlight;
        slot.data.clear();
        slot.data.reserve(min_size);
        self.outstanding += 1;
        Ok(MbufId {
            index,
            generation: slot.generation,
        })
    }

    /// Allocates a buffer and fills it with `bytes`.
    pub fn allocate_from(&mut self, bytes: &[u8]) -> Result<MbufId, MbufError> {
        let id = self.allocate(bytes.len())?;
        self.data_mut(id)?.extend_from_slice(bytes);
        Ok(id)
    }

    /// Returns a whole buffer to the free list. Releasing a buffer that is
    /// still sitting on a queue is refused.
    pub fn release(&mut self, id: MbufId) -> Result<(), MbufError> {
        let slot = self.slot_mut(id)?;
        if slot.owner.is_queued() {
            return Err(MbufError::StillQueued(slot.owner));
        }
        slot.owner = Owner::Free;
        slot.generation = slot.generation.wrapping_add(1);
        slot.data.clear();
        self.free.push(id.index);
        self.outstanding -= 1;
        Ok(())
    }

    pub fn data(&self, id: MbufId) -> Result<&[u8], MbufError> {
        Ok(&self.slot(id)?.data)
    }

    pub fn data_mut(&mut self, id: MbufId) -> Result<&mut Vec<u8>, MbufError> {
        Ok(&mut self.slot_mut(id)?.data)
    }

    pub fn owner(&self, id: MbufId) -> Result<Owner, MbufError> {
        Ok(self.slot(id)?.owner)
    }

    /// Buffers handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    fn slot(&self, id: MbufId) -> Result<&Slot, MbufError> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.owner != Owner::Free)
            .ok_or(MbufError::StaleHandle)
    }

    fn slot_mut(&mut self, id: MbufId) -> Result<&mut Slot, MbufError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.owner != Owner::Free)
            .ok_or(MbufError::StaleHandle)
    }

    fn transfer(&mut self, id: MbufId, from: Owner, to: Owner) -> Result<(), MbufError> {
        let slot = self.slot_mut(id)?;
        if slot.owner != from {
            return Err(MbufError::WrongOwner {
                expected: from,
                actual: slot.owner,
            });
        }
        slot.owner = to;
        Ok(())
    }
}

/// A FIFO of buffer handles. Every buffer on the queue is owned by it.
#[derive(Debug)]
pub struct MbufQueue {
    kind: Owner,
    ids: VecDeque<MbufId>,
}

impl MbufQueue {
    pub fn new(kind: Owner) -> Self {
        debug_assert!(kind.is_queued());
        Self {
            kind,
            ids: VecDeque::new(),
        }
    }

    /// Takes ownership of an in-flight buffer.
    pub fn enqueue(&mut self, pool: &mut MbufPool, id: MbufId) -> Result<(), MbufError> {
        pool.transfer(id, Owner::InFlight, self.kind)?;
        self.ids.push_back(id);
        Ok(())
    }

    /// Gives up the oldest buffer. An empty queue yields `None`.
    pub fn dequeue(&mut self, pool: &mut MbufPool) -> Option<MbufId> {
        let id = self.ids.pop_front()?;
        match pool.transfer(id, self.kind, Owner::InFlight) {
            Ok(()) => Some(id),
            Err(e) => {
                tracing::error!(error = %e, "queued mbuf lost its owner");
                None
            }
        }
    }

    /// Releases every buffer on the queue back to the pool.
    pub fn drain_into(&mut self, pool: &mut MbufPool) {
        while let Some(id) = self.dequeue(pool) {
            let _ = pool.release(id);
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum MbufError {
    #[error("Outstanding buffers reached the ceiling of {ceiling}")]
    Exhausted { ceiling: usize },
    #[error("Cannot release a buffer owned by {0:?}")]
    StillQueued(Owner),
    #[error("The buffer handle no longer refers to a live buffer")]
    StaleHandle,
    #[error("Expected the buffer to be owned by {expected:?} but it is owned by {actual:?}")]
    WrongOwner { expected: Owner, actual: Owner },
}
