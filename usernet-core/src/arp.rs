//! The ARP cache and the stack's ARP responder.
//!
//! The cache is a fixed array of [`ARP_TABLE_SIZE`] entries scanned
//! linearly. When it is full and a new address arrives, the slot at
//! `next_victim` is overwritten and the index advances, wrapping around.
//! Entries never expire on their own.

use crate::{ethernet::MacAddress, ipv4::Ipv4Address};

pub mod arp_parsing;
pub use arp_parsing::{ArpPacket, Operation};

pub const ARP_TABLE_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ArpEntry {
    pub ip: Ipv4Address,
    pub mac: MacAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpTable {
    table: [ArpEntry; ARP_TABLE_SIZE],
    next_victim: usize,
}

impl ArpTable {
    pub fn new() -> Self {
        Self {
            table: [ArpEntry::default(); ARP_TABLE_SIZE],
            next_victim: 0,
        }
    }

    /// Records `ip` at `mac`. An existing entry for `ip` is updated in place;
    /// otherwise the victim slot is overwritten. Unspecified and broadcast
    /// addresses are never stored.
    pub fn insert(&mut self, ip: Ipv4Address, mac: MacAddress) {
        if ip.is_unspecified() || ip == Ipv4Address::BROADCAST {
            return;
        }
        if let Some(entry) = self.table.iter_mut().find(|entry| entry.ip == ip) {
            entry.mac = mac;
            return;
        }
        tracing::trace!(%ip, %mac, slot = self.next_victim, "arp entry added");
        self.table[self.next_victim] = ArpEntry { ip, mac };
        self.next_victim = (self.next_victim + 1) % ARP_TABLE_SIZE;
    }

    /// Finds the link address for `ip`. The broadcast address always
    /// resolves to the broadcast link address.
    pub fn lookup(&self, ip: Ipv4Address) -> Option<MacAddress> {
        if ip == Ipv4Address::BROADCAST {
            return Some(MacAddress::BROADCAST);
        }
        if ip.is_unspecified() {
            return None;
        }
        self.table
            .iter()
            .find(|entry| entry.ip == ip)
            .map(|entry| entry.mac)
    }

    /// The number of occupied slots.
    pub fn len(&self) -> usize {
        self.table
            .iter()
            .filter(|entry| !entry.ip.is_unspecified())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ArpTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(n: u32) -> Ipv4Address {
        Ipv4Address::from(0x0a00_0200 + n)
    }

    fn mac(n: u8) -> MacAddress {
        MacAddress::new([0x52, 0x54, 0, 0, 0, n])
    }

    #[test]
    fn insert_then_lookup() {
        let mut table = ArpTable::new();
        table.insert(ip(15), mac(15));
        assert_eq!(table.lookup(ip(15)), Some(mac(15)));
        assert_eq!(table.lookup(ip(16)), None);
    }

    #[test]
    fn update_in_place() {
        let mut table = ArpTable::new();
        table.insert(ip(15), mac(1));
        table.insert(ip(15), mac(2));
        assert_eq!(table.lookup(ip(15)), Some(mac(2)));
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_victim, 1);
    }

    #[test]
    fn overflow_never_grows_and_keeps_recent() {
        let mut table = ArpTable::new();
        let size = std::mem::size_of_val(&table);
        for n in 0..40u32 {
            table.insert(ip(n + 1), mac(n as u8));
        }
        assert_eq!(std::mem::size_of_val(&table), size);
        assert_eq!(table.len(), ARP_TABLE_SIZE);
        for n in 24..40u32 {
            assert_eq!(table.lookup(ip(n + 1)), Some(mac(n as u8)));
        }
        assert_eq!(table.lookup(ip(1)), None);
    }

    #[test]
    fn eviction_is_cyclic_not_lru() {
        let mut table = ArpTable::new();
        for n in 0..ARP_TABLE_SIZE as u32 {
            table.insert(ip(n + 1), mac(n as u8));
        }
        // Refreshing the oldest entry does not protect it
        table.insert(ip(1), mac(99));
        table.insert(ip(100), mac(100));
        assert_eq!(table.lookup(ip(1)), None);
        assert_eq!(table.lookup(ip(100)), Some(mac(100)));
    }

    #[test]
    fn broadcast_and_unspecified() {
        let mut table = ArpTable::new();
        table.insert(Ipv4Address::UNSPECIFIED, mac(1));
        table.insert(Ipv4Address::BROADCAST, mac(1));
        assert!(table.is_empty());
        assert_eq!(table.lookup(Ipv4Address::BROADCAST), Some(MacAddress::BROADCAST));
    }
}
