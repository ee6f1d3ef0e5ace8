#![forbid(unsafe_code)]

//! Peer-address keyed registry of live transports.

use std::collections::HashMap;

use marlin_core::SocketAddress;

pub struct TransportManager<T> {
    map: HashMap<SocketAddress, T>,
}

impl<T> TransportManager<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn get(&self, addr: &SocketAddress) -> Option<&T> {
        self.map.get(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddress) -> Option<&mut T> {
        self.map.get_mut(addr)
    }

    /// Returns the entry for `addr` plus whether it was just created.
    pub fn get_or_create(
        &mut self,
        addr: SocketAddress,
        create: impl FnOnce() -> T,
    ) -> (&mut T, bool) {
        let mut created = false;
        let entry = self.map.entry(addr).or_insert_with(|| {
            created = true;
            create()
        });
        (entry, created)
    }

    pub fn erase(&mut self, addr: &SocketAddress) -> Option<T> {
        self.map.remove(addr)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SocketAddress, &T)> {
        self.map.iter()
    }
}

impl<T> Default for TransportManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_reports_creation() {
        let mut mgr: TransportManager<u32> = TransportManager::new();
        let addr = SocketAddress::loopback(1);

        let (v, created) = mgr.get_or_create(addr, || 7);
        assert!(created);
        assert_eq!(*v, 7);

        let (v, created) = mgr.get_or_create(addr, || 9);
        assert!(!created);
        assert_eq!(*v, 7);
    }

    #[test]
    fn erase_removes() {
        let mut mgr: TransportManager<u32> = TransportManager::new();
        let addr = SocketAddress::loopback(1);
        mgr.get_or_create(addr, || 1);

        assert_eq!(mgr.erase(&addr), Some(1));
        assert!(mgr.get(&addr).is_none());
        assert!(mgr.is_empty());
    }
}
