use super::{FlowKey, Protocol, Socket, SocketError, SocketId};
use rustc_hash::FxHashMap;

/// Every live socket, indexed by id and by flow.
///
/// Lookups first try the socket most recently found for the same protocol,
/// since consecutive packets usually belong to one flow.
#[derive(Debug)]
pub struct SocketTable {
    sockets: FxHashMap<SocketId, Socket>,
    flows: FxHashMap<FlowKey, SocketId>,
    last: [Option<SocketId>; 3],
    next_id: u32,
    capacity: usize,
    cache_hits: u64,
}

impl SocketTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            sockets: FxHashMap::default(),
            flows: FxHashMap::default(),
            last: [None; 3],
            next_id: 1,
            capacity,
            cache_hits: 0,
        }
    }

    pub fn lookup(&mut self, key: &FlowKey) -> Option<SocketId> {
        let slot = key.protocol.index();
        if let Some(id) = self.last[slot] {
            if self.sockets.get(&id).is_some_and(|socket| socket.key == *key) {
                self.cache_hits += 1;
                return Some(id);
            }
        }
        let id = *self.flows.get(key)?;
        self.last[slot] = Some(id);
        Some(id)
    }

    /// Finds a flow without touching the lookup cache.
    pub fn find(&self, key: &FlowKey) -> Option<SocketId> {
        self.flows.get(key).copied()
    }

    /// Finds the socket for a flow, or builds one with `create`. Returns the
    /// id and whether it was just created.
    pub fn find_or_create(
        &mut self,
        key: FlowKey,
        create: impl FnOnce(SocketId) -> Result<Socket, SocketError>,
    ) -> Result<(SocketId, bool), SocketError> {
        if let Some(id) = self.lookup(&key) {
            return Ok((id, false));
        }
        let id = self.insert_with(create)?;
        Ok((id, true))
    }

    /// Adds a socket built by `create` under a fresh id.
    pub fn insert_with(
        &mut self,
        create: impl FnOnce(SocketId) -> Result<Socket, SocketError>,
    ) -> Result<SocketId, SocketError> {
        if self.sockets.len() >= self.capacity {
            return Err(SocketError::TableFull(self.capacity));
        }
        let id = SocketId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let socket = create(id)?;
        tracing::debug!(%id, flow = %socket.key, origin = ?socket.origin, "socket created");
        self.flows.insert(socket.key, id);
        self.last[socket.key.protocol.index()] = Some(id);
        self.sockets.insert(id, socket);
        Ok(id)
    }

    pub fn remove(&mut self, id: SocketId) -> Option<Socket> {
        let socket = self.sockets.remove(&id)?;
        if self.flows.get(&socket.key) == Some(&id) {
            self.flows.remove(&socket.key);
        }
        for slot in &mut self.last {
            if *slot == Some(id) {
                *slot = None;
            }
        }
        tracing::debug!(%id, flow = %socket.key, "socket destroyed");
        Some(socket)
    }

    pub fn get(&self, id: SocketId) -> Option<&Socket> {
        self.sockets.get(&id)
    }

    pub fn get_mut(&mut self, id: SocketId) -> Option<&mut Socket> {
        self.sockets.get_mut(&id)
    }

    /// A snapshot of live ids, in creation order, for walking the table
    /// while it changes.
    pub fn ids(&self) -> Vec<SocketId> {
        let mut ids: Vec<_> = self.sockets.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn ids_for(&self, protocol: Protocol) -> Vec<SocketId> {
        let mut ids: Vec<_> = self
            .sockets
            .values()
            .filter(|socket| socket.key.protocol == protocol)
            .map(|socket| socket.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Lookups answered by the per-protocol cache
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    /// Removes every socket, returning them for cleanup.
    pub fn drain(&mut self) -> Vec<Socket> {
        self.flows.clear();
        self.last = [None; 3];
        let mut sockets: Vec<_> = self.sockets.drain().map(|(_, socket)| socket).collect();
        sockets.sort_unstable_by_key(|socket| socket.id);
        sockets
    }
}
