#![forbid(unsafe_code)]

//! Peer slot bookkeeping: disjoint solicited / standby / unsolicited
//! transport sets keyed by peer identity, with RTT-based selection for
//! subscription churn.

use std::collections::HashMap;

use marlin_core::ClientKey;
use marlin_stream::StreamTransport;

/// Transports keyed by the peer's 20-byte identity.
#[derive(Default)]
pub struct TransportSet {
    map: HashMap<ClientKey, StreamTransport>,
}

impl TransportSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ClientKey, transport: StreamTransport) {
        self.map.insert(key, transport);
    }

    pub fn remove(&mut self, key: &ClientKey) -> Option<StreamTransport> {
        self.map.remove(key)
    }

    pub fn contains(&self, key: &ClientKey) -> bool {
        self.map.contains_key(key)
    }

    pub fn get(&self, key: &ClientKey) -> Option<&StreamTransport> {
        self.map.get(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientKey, &StreamTransport)> {
        self.map.iter()
    }

    /// Best candidate to promote.
    pub fn find_min_rtt_transport(&self) -> Option<(ClientKey, StreamTransport)> {
        self.map
            .iter()
            .min_by_key(|(_, t)| t.rtt())
            .map(|(k, t)| (*k, t.clone()))
    }

    /// Worst member, first to demote.
    pub fn find_max_rtt_transport(&self) -> Option<(ClientKey, StreamTransport)> {
        self.map
            .iter()
            .max_by_key(|(_, t)| t.rtt())
            .map(|(k, t)| (*k, t.clone()))
    }

    /// Drop peers whose transports have died underneath us.
    pub fn prune_closed(&mut self) {
        self.map.retain(|_, t| !t.is_closed());
    }
}

/// The three disjoint slot sets of §peer management plus heartbeat
/// tracking.
#[derive(Default)]
pub struct ConnMap {
    /// Peers we solicited (we publish to them).
    pub sol_conns: TransportSet,
    /// Solicited candidates parked by RTT.
    pub sol_standby_conns: TransportSet,
    /// Peers that subscribed to us.
    pub unsol_conns: TransportSet,
}

impl ConnMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove_everywhere(&mut self, key: &ClientKey) {
        self.sol_conns.remove(key);
        self.sol_standby_conns.remove(key);
        self.unsol_conns.remove(key);
    }

    /// Look a peer up in any of the three sets.
    pub fn any_transport(&self, key: &ClientKey) -> Option<&StreamTransport> {
        self.sol_conns
            .get(key)
            .or_else(|| self.sol_standby_conns.get(key))
            .or_else(|| self.unsol_conns.get(key))
    }
}
