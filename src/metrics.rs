//! Free-running performance counters.
//!
//! The kernel implementation keeps one counter block per core and adds
//! without synchronization; here each counter is a relaxed atomic, which
//! costs about the same and never loses updates.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::pkthdr::NUM_PKT_TYPES;

/// A single free-running counter. Never reset.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[inline(always)]
    pub(crate) fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Return the current value.
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters kept by the transport. Indexed arrays follow the wire type
/// order (entry 0 is DATA).
#[derive(Debug, Default)]
pub struct Metrics {
    /// Packets sent, per packet type.
    pub packets_sent: [Counter; NUM_PKT_TYPES],

    /// Packets received, per packet type.
    pub packets_received: [Counter; NUM_PKT_TYPES],

    /// Complete request messages received.
    pub requests_received: Counter,

    /// Complete response messages received.
    pub responses_received: Counter,

    /// DATA packets sent in response to RESENDs.
    pub resent_packets: Counter,

    /// Times the pacer gave up because the head RPC's bucket was busy.
    pub pacer_skipped_rpcs: Counter,

    /// Packets dropped because they referred to a nonexistent RPC.
    pub unknown_rpcs: Counter,

    /// Packets dropped because of an unsupported type byte.
    pub unknown_packet_types: Counter,

    /// Packets dropped because they were shorter than the minimum header.
    pub short_packets: Counter,

    /// Packets dropped because a server RPC could not be created.
    pub server_cant_create_rpcs: Counter,

    /// Client RPCs aborted by timeout.
    pub client_rpc_timeouts: Counter,

    /// Server RPCs discarded by timeout.
    pub server_rpc_timeouts: Counter,

    /// New entries created in the peer table.
    pub peer_new_entries: Counter,

    /// Control packets the sink refused.
    pub control_xmit_errors: Counter,

    /// Data packets the sink refused.
    pub data_xmit_errors: Counter,

    /// Reaper invocations refused because reaping was disabled.
    pub disabled_reaps: Counter,

    /// Reaper invocations that ran.
    pub reaper_calls: Counter,
}

impl Metrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}
