//! MPTCP address-id manager.
//!
//! Maintains the bidirectional mapping between local IP addresses and
//! 8-bit MPTCP address ids. Ids are allocated minimum-first, which keeps
//! them dense and predictable; [`IdManager::map_id`] injects externally
//! established ids so the daemon can reconcile with state the kernel
//! already holds from prior runs or other actors.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::debug;

use crate::addr::{AddrId, SeededMurmur};

/// Bitmap allocation pool over the id range `[1, 255]`.
#[derive(Debug, Default)]
struct IdPool {
    words: [u64; 4],
}

impl IdPool {
    /// Allocate the minimum unused id, if any remains.
    fn alloc_min(&mut self) -> Option<AddrId> {
        for (w, word) in self.words.iter_mut().enumerate() {
            let free = !*word;
            if free == 0 {
                continue;
            }
            let bit = free.trailing_zeros() as u16;
            let id = w as u16 * 64 + bit;
            // Bit 0 of word 0 stands for the reserved id 0 and is never
            // handed out; it is only clear before the first allocation.
            if id == 0 {
                *word |= 1;
                return self.alloc_min();
            }
            *word |= 1 << bit;
            return AddrId::new(id as u8);
        }
        None
    }

    /// Mark an id as used. Returns false if it was already marked.
    fn mark(&mut self, id: AddrId) -> bool {
        let (w, bit) = (id.get() as usize / 64, id.get() as usize % 64);
        if self.words[w] & (1 << bit) != 0 {
            return false;
        }
        self.words[w] |= 1 << bit;
        true
    }

    /// Return an id to the pool. Returns false if it was not marked.
    fn release(&mut self, id: AddrId) -> bool {
        let (w, bit) = (id.get() as usize / 64, id.get() as usize % 64);
        if self.words[w] & (1 << bit) == 0 {
            return false;
        }
        self.words[w] &= !(1 << bit);
        true
    }
}

/// Address-id manager.
///
/// The map's value set always equals the pool's allocated set: no id has
/// two owning addresses, an address has at most one id, and id 0 never
/// appears.
#[derive(Debug)]
pub struct IdManager {
    map: HashMap<IpAddr, AddrId, SeededMurmur>,
    used: IdPool,
}

impl IdManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            map: HashMap::with_hasher(SeededMurmur::default()),
            used: IdPool::default(),
        }
    }

    /// Get the id mapped to `addr`, allocating the minimum unused id if
    /// the address is not yet known. Returns `None` when the pool is
    /// exhausted.
    pub fn get_id(&mut self, addr: IpAddr) -> Option<AddrId> {
        if let Some(id) = self.map.get(&addr) {
            return Some(*id);
        }

        let id = self.used.alloc_min()?;
        self.map.insert(addr, id);
        Some(id)
    }

    /// Insert or replace the mapping for `addr` with a caller-supplied
    /// id, typically one already established in the kernel.
    ///
    /// If `id` currently belongs to a different address, that mapping is
    /// dropped first; if `addr` was mapped to a different id, the old id
    /// is returned to the pool.
    pub fn map_id(&mut self, addr: IpAddr, id: AddrId) {
        if let Some(other) = self
            .map
            .iter()
            .find(|(a, i)| **i == id && **a != addr)
            .map(|(a, _)| *a)
        {
            debug!(%other, %id, "evicting previous owner of address id");
            self.map.remove(&other);
            self.used.release(id);
        }

        self.used.mark(id);
        if let Some(previous) = self.map.insert(addr, id) {
            if previous != id {
                self.used.release(previous);
            }
        }
    }

    /// Drop the mapping for `addr`, returning the released id.
    pub fn remove_id(&mut self, addr: IpAddr) -> Option<AddrId> {
        let id = self.map.remove(&addr)?;
        self.used.release(id);
        Some(id)
    }

    /// Number of mapped addresses.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no address is mapped.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for IdManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn id(raw: u8) -> AddrId {
        AddrId::new(raw).unwrap()
    }

    #[test]
    fn test_minimum_first_allocation() {
        let mut idm = IdManager::new();
        let a = addr("192.0.2.1");
        let b = addr("2001:db8::102");

        assert_eq!(idm.get_id(a), Some(id(1)));
        assert_eq!(idm.get_id(b), Some(id(2)));
        // Idempotent for a known address.
        assert_eq!(idm.get_id(a), Some(id(1)));

        assert_eq!(idm.remove_id(b), Some(id(2)));
        assert_eq!(idm.remove_id(b), None);
    }

    #[test]
    fn test_released_id_reused() {
        let mut idm = IdManager::new();
        let a = addr("192.0.2.1");
        let b = addr("192.0.2.2");
        let c = addr("192.0.2.3");

        assert_eq!(idm.get_id(a), Some(id(1)));
        assert_eq!(idm.get_id(b), Some(id(2)));
        assert_eq!(idm.remove_id(a), Some(id(1)));

        // The freed minimum comes back first.
        assert_eq!(idm.get_id(c), Some(id(1)));
    }

    #[test]
    fn test_external_sync() {
        let mut idm = IdManager::new();
        let c = addr("192.0.2.4");
        let a = addr("192.0.2.1");

        idm.map_id(c, id(245));
        idm.map_id(c, id(222));
        assert_eq!(idm.get_id(c), Some(id(222)));

        // 245 went back to the pool; a fresh address still gets the
        // minimum free id.
        assert_eq!(idm.get_id(a), Some(id(1)));
        assert_eq!(idm.len(), 2);
    }

    #[test]
    fn test_map_id_evicts_other_owner() {
        let mut idm = IdManager::new();
        let a = addr("192.0.2.1");
        let b = addr("192.0.2.2");

        assert_eq!(idm.get_id(a), Some(id(1)));
        idm.map_id(b, id(1));

        assert_eq!(idm.len(), 1);
        assert_eq!(idm.remove_id(a), None);
        assert_eq!(idm.get_id(b), Some(id(1)));
    }

    #[test]
    fn test_map_id_then_get_id() {
        let mut idm = IdManager::new();
        let a = addr("2001:db8::7");
        idm.map_id(a, id(42));
        assert_eq!(idm.get_id(a), Some(id(42)));
    }

    #[test]
    fn test_distinct_addresses_distinct_ids() {
        let mut idm = IdManager::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..50u8 {
            let a = addr(&format!("10.0.0.{}", i));
            let got = idm.get_id(a).unwrap();
            assert!(seen.insert(got), "id {} allocated twice", got);
        }
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut idm = IdManager::new();
        for i in 0..255u32 {
            let a = addr(&format!("10.{}.{}.{}", i / 65536, (i / 256) % 256, i % 256));
            assert!(idm.get_id(a).is_some(), "allocation {} failed", i);
        }
        assert_eq!(idm.len(), 255);
        assert_eq!(idm.get_id(addr("203.0.113.1")), None);

        // Releasing one id makes exactly that id available again.
        let victim = addr("10.0.0.77");
        let freed = idm.remove_id(victim).unwrap();
        assert_eq!(idm.get_id(addr("203.0.113.1")), Some(freed));
    }
}
