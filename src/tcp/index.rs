use std::collections::BTreeMap;

use crate::wire::{IpEndpoint, Ipv4Address};

/// Connection lookup key: most-selective component first, so that a
/// server's many connections from one port fan out early in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) struct TupleKey {
    remote_port: u16,
    remote_addr: Ipv4Address,
    local_port: u16,
    local_addr: Ipv4Address,
}

/// The four-tuple of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Tuple {
    pub local: IpEndpoint,
    pub remote: IpEndpoint,
}

impl From<&Tuple> for TupleKey {
    fn from(tuple: &Tuple) -> TupleKey {
        TupleKey {
            remote_port: tuple.remote.port,
            remote_addr: tuple.remote.addr,
            local_port: tuple.local.port,
            local_addr: tuple.local.addr,
        }
    }
}

/// The key is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Occupied;

/// Lookup structures over the live PCBs and the listeners.
///
/// Every PCB in a state other than CLOSED is indexed, under exactly one
/// four-tuple. Listeners are indexed separately by local port and
/// optional local address; a fully-specified listener shadows an
/// any-address listener on the same port.
#[derive(Debug, Default)]
pub(super) struct Index {
    conns: BTreeMap<TupleKey, usize>,
    listeners: BTreeMap<(u16, Option<Ipv4Address>), usize>,
}

impl Index {
    pub(super) fn new() -> Index {
        Index::default()
    }

    pub(super) fn insert(&mut self, tuple: &Tuple, pcb: usize) -> Result<(), Occupied> {
        let key = TupleKey::from(tuple);
        if self.conns.contains_key(&key) {
            return Err(Occupied);
        }
        self.conns.insert(key, pcb);
        Ok(())
    }

    pub(super) fn remove(&mut self, tuple: &Tuple) {
        let removed = self.conns.remove(&TupleKey::from(tuple));
        debug_assert!(removed.is_some());
    }

    pub(super) fn lookup(&self, tuple: &Tuple) -> Option<usize> {
        self.conns.get(&TupleKey::from(tuple)).copied()
    }

    /// Whether a four-tuple is free, used by ephemeral port selection.
    pub(super) fn contains(&self, tuple: &Tuple) -> bool {
        self.conns.contains_key(&TupleKey::from(tuple))
    }

    pub(super) fn insert_listener(
        &mut self,
        port: u16,
        addr: Option<Ipv4Address>,
        listener: usize,
    ) -> Result<(), Occupied> {
        if self.listeners.contains_key(&(port, addr)) {
            return Err(Occupied);
        }
        self.listeners.insert((port, addr), listener);
        Ok(())
    }

    pub(super) fn remove_listener(&mut self, port: u16, addr: Option<Ipv4Address>) {
        let removed = self.listeners.remove(&(port, addr));
        debug_assert!(removed.is_some());
    }

    /// Find the listener for an incoming SYN: an exact local-address
    /// match beats a listener bound to any address.
    pub(super) fn lookup_listener(&self, local_addr: Ipv4Address, local_port: u16) -> Option<usize> {
        self.listeners
            .get(&(local_port, Some(local_addr)))
            .or_else(|| self.listeners.get(&(local_port, None)))
            .copied()
    }
}
