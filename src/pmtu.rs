/*! Path-MTU cache.

A bounded table of per-remote-address estimates of the smallest MTU along
the path, fed by ICMP "fragmentation needed" messages and by local
packet-too-big transmit errors, and periodically probed back up toward
the interface MTU (RFC 1191).

Connections register as observers of the remote they talk to; the handle
returned by [`PmtuCache::observe`] keeps the entry pinned. Entries whose
last observer has been released become eligible for LRU eviction once
the table is full.
*/

use heapless::Vec;

use crate::config::PMTU_CACHE_COUNT;
use crate::ip::Route;
use crate::time::{Duration, Instant};
use crate::wire::{Ipv4Address, IPV4_MIN_MTU};

/// Smallest MTU the estimate may drop to.
pub const MIN_MTU: u16 = IPV4_MIN_MTU as u16;

/// The RFC 1191 §7.1 plateau table, descending. Used when an ICMP
/// fragmentation-needed message does not carry a next-hop MTU, and when
/// stepping an aged estimate back up.
const PLATEAUS: &[u16] = &[65535, 32000, 17914, 8166, 4352, 2002, 1492, 1006, 576];

/// The cache failed to register an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No route to the remote, so no interface MTU to start from.
    NoRoute,
    /// Every slot is taken by an observed entry.
    NoSlot,
}

/// An observer registration on a cache entry.
///
/// The handle pins the entry against eviction. It is deliberately neither
/// `Copy` nor `Clone`: every handle must be given back through
/// [`PmtuCache::release`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct MtuHandle(usize);

#[derive(Debug)]
struct Entry {
    remote: Ipv4Address,
    /// Current estimate, IP header included.
    pmtu: u16,
    /// Ceiling the estimate may be probed back up to.
    iface_mtu: u16,
    observers: u16,
    /// Last time the estimate changed, or the entry was created.
    stamp: Instant,
}

/// A cache of Path-MTU estimates.
#[derive(Debug)]
pub struct PmtuCache {
    entries: Vec<Option<Entry>, PMTU_CACHE_COUNT>,
    refresh_at: Instant,
    refresh_interval: Duration,
}

impl PmtuCache {
    pub fn new(now: Instant, refresh_interval: Duration) -> PmtuCache {
        PmtuCache {
            entries: Vec::new(),
            refresh_at: now + refresh_interval,
            refresh_interval,
        }
    }

    /// Register an observer of `remote` and return the current estimate.
    ///
    /// Creates the entry on first observation, starting from the egress
    /// interface MTU of `route`. Fails with [`Error::NoRoute`] when no
    /// route is given, and with [`Error::NoSlot`] when the table is full
    /// of observed entries.
    pub fn observe(
        &mut self,
        now: Instant,
        remote: Ipv4Address,
        route: Option<&Route>,
    ) -> Result<(MtuHandle, u16), Error> {
        if let Some(index) = self.lookup(remote) {
            let entry = self.entries[index].as_mut().unwrap();
            entry.observers += 1;
            return Ok((MtuHandle(index), entry.pmtu));
        }

        let route = route.ok_or(Error::NoRoute)?;
        let pmtu = route.mtu.max(MIN_MTU);
        let entry = Entry {
            remote,
            pmtu,
            iface_mtu: pmtu,
            observers: 1,
            stamp: now,
        };

        let index = match self.free_slot() {
            Some(index) => index,
            None => return Err(Error::NoSlot),
        };
        if index == self.entries.len() {
            // Full table is rejected by free_slot, so this cannot fail.
            let _ = self.entries.push(Some(entry));
        } else {
            self.entries[index] = Some(entry);
        }
        net_trace!("pmtu: new entry for {} at {}", remote, pmtu);
        Ok((MtuHandle(index), pmtu))
    }

    /// Release an observer registration.
    pub fn release(&mut self, handle: MtuHandle) {
        let entry = self.entries[handle.0]
            .as_mut()
            .expect("released handle of an evicted entry");
        debug_assert!(entry.observers > 0);
        entry.observers -= 1;
    }

    /// Return the current estimate for an observed entry.
    pub fn pmtu(&self, handle: &MtuHandle) -> u16 {
        self.entries[handle.0].as_ref().unwrap().pmtu
    }

    /// Return the remote address an observed entry is keyed by.
    pub fn remote(&self, handle: &MtuHandle) -> Ipv4Address {
        self.entries[handle.0].as_ref().unwrap().remote
    }

    /// Process a fragmentation-needed report for `remote`, either from an
    /// ICMP type 3 code 4 message (which may omit the next-hop MTU) or
    /// from a local packet-too-big transmit error.
    ///
    /// Returns the new estimate when it decreased, so the caller can walk
    /// the observers. Reports about unknown remotes are ignored.
    pub fn report_frag_needed(
        &mut self,
        now: Instant,
        remote: Ipv4Address,
        reported_mtu: Option<u16>,
    ) -> Option<u16> {
        let index = self.lookup(remote)?;
        let entry = self.entries[index].as_mut().unwrap();
        if entry.pmtu <= MIN_MTU {
            return None;
        }

        let new = match reported_mtu {
            // The router cannot ask us to grow; a reported MTU at or above
            // the estimate is stale or nonsense, but the packet did not
            // fit, so step down by at least one.
            Some(reported) => reported.clamp(MIN_MTU, entry.pmtu - 1),
            // Old routers omit the next-hop MTU; fall to the next plateau.
            None => next_plateau_below(entry.pmtu),
        };
        if new >= entry.pmtu {
            return None;
        }

        net_trace!("pmtu: {} lowered {} -> {}", remote, entry.pmtu, new);
        entry.pmtu = new;
        entry.stamp = now;
        Some(new)
    }

    /// Raise aged estimates one plateau back toward the interface MTU.
    ///
    /// Returns whether any estimate changed, in which case the caller
    /// re-derives the segment sizes of affected connections.
    pub fn refresh(&mut self, now: Instant) -> bool {
        if now < self.refresh_at {
            return false;
        }
        self.refresh_at = now + self.refresh_interval;

        let mut changed = false;
        for slot in self.entries.iter_mut() {
            let Some(entry) = slot.as_mut() else { continue };
            if entry.pmtu >= entry.iface_mtu {
                continue;
            }
            if now - entry.stamp < self.refresh_interval {
                continue;
            }
            let new = next_plateau_above(entry.pmtu).min(entry.iface_mtu);
            net_trace!("pmtu: {} probing {} -> {}", entry.remote, entry.pmtu, new);
            entry.pmtu = new;
            entry.stamp = now;
            changed = true;
        }
        changed
    }

    /// The next instant [`refresh`](Self::refresh) wants to run at.
    pub fn poll_at(&self) -> Instant {
        self.refresh_at
    }

    fn lookup(&self, remote: Ipv4Address) -> Option<usize> {
        self.entries
            .iter()
            .position(|slot| matches!(slot, Some(entry) if entry.remote == remote))
    }

    /// An empty slot, or the least recently stamped unobserved entry to
    /// evict, or `None` when every slot is pinned by an observer.
    fn free_slot(&mut self) -> Option<usize> {
        if self.entries.len() < self.entries.capacity() {
            return Some(self.entries.len());
        }
        if let Some(index) = self.entries.iter().position(|slot| slot.is_none()) {
            return Some(index);
        }

        let victim = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|entry| (i, entry)))
            .filter(|(_, entry)| entry.observers == 0)
            .min_by_key(|(_, entry)| entry.stamp)
            .map(|(i, _)| i)?;
        net_trace!(
            "pmtu: evicting {}",
            self.entries[victim].as_ref().unwrap().remote
        );
        self.entries[victim] = None;
        Some(victim)
    }
}

fn next_plateau_below(pmtu: u16) -> u16 {
    for &plateau in PLATEAUS {
        if plateau < pmtu {
            return plateau;
        }
    }
    MIN_MTU
}

fn next_plateau_above(pmtu: u16) -> u16 {
    for &plateau in PLATEAUS.iter().rev() {
        if plateau > pmtu {
            return plateau;
        }
    }
    u16::MAX
}
