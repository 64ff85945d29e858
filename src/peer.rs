//! Per-destination state.
//!
//! One [`Peer`] exists for each host we have exchanged packets with, as
//! client or server. Entries are append-only for the life of the
//! process: once handed out, an `Arc<Peer>` may be retained forever, so
//! nothing is ever removed from the table.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use ahash::RandomState;
use dashmap::DashMap;

use crate::config::HOMA_MAX_PRIORITIES;
use crate::error::HomaError;
use crate::metrics::Metrics;
use crate::transport::PacketSink;
use crate::type_alias::*;

/// State for one remote host.
pub(crate) struct Peer {
    /// IPv4 address of the host.
    pub(crate) addr: Ipv4Addr,

    /// Priorities to use for unscheduled packets sent to this host, as
    /// advertised by its most recent CUTOFFS packet. Entry `i` is the
    /// largest message size using priority `i`.
    cutoffs: RwLock<[u32; HOMA_MAX_PRIORITIES]>,

    /// `cutoff_version` from the most recent CUTOFFS packet received
    /// from this host; 0 until one arrives. Echoed in every DATA packet
    /// we send there.
    pub(crate) cutoff_version: AtomicU16,

    /// Tick at which we last sent this host a CUTOFFS packet; limits
    /// how often staleness triggers another one.
    last_update_tick: AtomicU32,

    /// Tick of the most recent RESEND sent to this host.
    last_resend_tick: AtomicU32,
}

impl Peer {
    fn new(addr: Ipv4Addr) -> Self {
        // Until the host tells us otherwise, everything goes out at the
        // lowest priority.
        let mut cutoffs = [0; HOMA_MAX_PRIORITIES];
        cutoffs[0] = u32::MAX;
        Self {
            addr,
            cutoffs: RwLock::new(cutoffs),
            cutoff_version: AtomicU16::new(0),
            last_update_tick: AtomicU32::new(u32::MAX),
            last_resend_tick: AtomicU32::new(u32::MAX),
        }
    }

    /// Priority for the unscheduled packets of a `length`-byte message
    /// sent to this host: the highest level whose cutoff covers the
    /// length.
    pub(crate) fn unsched_priority(&self, length: u32, num_priorities: u8) -> Priority {
        let cutoffs = self.cutoffs.read().unwrap();
        for i in (0..num_priorities as usize).rev() {
            if length <= cutoffs[i] {
                return i as Priority;
            }
        }
        0
    }

    /// Install cutoffs received in a CUTOFFS packet from this host.
    pub(crate) fn set_cutoffs(&self, new: &[u32; HOMA_MAX_PRIORITIES], version: u16) {
        let mut cutoffs = self.cutoffs.write().unwrap();
        cutoffs[0] = u32::MAX;
        cutoffs[1..].copy_from_slice(&new[1..]);
        self.cutoff_version.store(version, Ordering::Release);
    }

    /// Rate limit for CUTOFFS updates to this host: true at most once
    /// per tick.
    pub(crate) fn cutoffs_update_due(&self, tick: u32) -> bool {
        self.last_update_tick.swap(tick, Ordering::Relaxed) != tick
    }

    /// Rate limit for RESENDs: true if at least `interval` ticks have
    /// passed since the last RESEND to this host.
    pub(crate) fn resend_due(&self, tick: u32, interval: u32) -> bool {
        let last = self.last_resend_tick.load(Ordering::Relaxed);
        last == u32::MAX || tick.wrapping_sub(last) >= interval
    }

    pub(crate) fn note_resend(&self, tick: u32) {
        self.last_resend_tick.store(tick, Ordering::Relaxed);
    }
}

/// Map from IPv4 address to peer. Lookups are lock-free; insertion
/// resolves the route once and then the entry lives forever.
pub(crate) struct PeerTab {
    map: DashMap<Ipv4Addr, Arc<Peer>, RandomState>,
}

impl PeerTab {
    pub(crate) fn new() -> Self {
        Self {
            map: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Return the peer for `addr`, creating it on first contact.
    pub(crate) fn find(
        &self,
        addr: Ipv4Addr,
        sink: &dyn PacketSink,
        metrics: &Metrics,
    ) -> Result<Arc<Peer>, HomaError> {
        if let Some(peer) = self.map.get(&addr) {
            return Ok(peer.value().clone());
        }
        sink.route(addr).map_err(|_| HomaError::Unreachable(addr))?;
        let entry = self.map.entry(addr).or_insert_with(|| {
            metrics.peer_new_entries.inc();
            Arc::new(Peer::new(addr))
        });
        Ok(entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::QueueSink;

    #[test]
    fn find_is_append_only() {
        let tab = PeerTab::new();
        let sink = QueueSink::new(1500, 64000);
        let metrics = Metrics::new();
        let a = tab
            .find(Ipv4Addr::new(10, 0, 0, 1), &sink, &metrics)
            .unwrap();
        let b = tab
            .find(Ipv4Addr::new(10, 0, 0, 1), &sink, &metrics)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(metrics.peer_new_entries.get(), 1);
    }

    #[test]
    fn unsched_priority_uses_cutoffs() {
        let peer = Peer::new(Ipv4Addr::LOCALHOST);
        // Default: everything at priority 0.
        assert_eq!(peer.unsched_priority(100, 8), 0);

        let mut cutoffs = [0u32; HOMA_MAX_PRIORITIES];
        cutoffs[7] = 200;
        cutoffs[6] = 2800;
        cutoffs[5] = 15000;
        cutoffs[4] = 1_000_000;
        peer.set_cutoffs(&cutoffs, 2);
        assert_eq!(peer.unsched_priority(100, 8), 7);
        assert_eq!(peer.unsched_priority(201, 8), 6);
        assert_eq!(peer.unsched_priority(15000, 8), 5);
        assert_eq!(peer.unsched_priority(500_000, 8), 4);
        assert_eq!(peer.unsched_priority(u32::MAX, 8), 0);
        assert_eq!(peer.cutoff_version.load(Ordering::Acquire), 2);
    }

    #[test]
    fn resend_rate_limit() {
        let peer = Peer::new(Ipv4Addr::LOCALHOST);
        assert!(peer.resend_due(0, 5));
        peer.note_resend(10);
        assert!(!peer.resend_due(12, 5));
        assert!(peer.resend_due(15, 5));
    }
}
