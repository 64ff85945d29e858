//! Per-RPC state and the hash-bucket tables that own it.
//!
//! Each socket keeps two tables of 1024 buckets (client RPCs and server
//! RPCs), keyed by `id mod BUCKETS`. A bucket's mutex protects both the
//! bucket chain and every RPC stored in it, so holding the bucket lock
//! *is* holding the RPC lock; that fusion is what makes deletion safe
//! without per-RPC lifetime counters.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::HomaError;
use crate::msgin::MessageIn;
use crate::msgout::MessageOut;
use crate::peer::Peer;
use crate::sock::Interest;
use crate::type_alias::*;

/// Number of buckets in each per-socket RPC table. Power of two.
pub(crate) const RPC_BUCKETS: usize = 1024;

/// Lifecycle of an RPC.
///
/// Clients move Outgoing → Incoming → Ready → Dead; servers move
/// Incoming → Ready → InService → Outgoing → Dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RpcState {
    /// Waiting for `msgout` to reach the peer.
    Outgoing,

    /// At least one packet of `msgin` has arrived; more are expected.
    Incoming,

    /// `msgin` is complete (or the RPC failed); the application has not
    /// picked it up yet.
    Ready,

    /// Server only: the request was handed to the application, which
    /// has not replied yet.
    InService,

    /// Freed; waiting to be reaped.
    Dead,
}

/// One active RPC. The same structure serves outgoing RPCs on clients
/// and incoming RPCs on servers.
pub(crate) struct Rpc {
    /// Unique among RPCs from one client port; chosen by the client.
    pub(crate) id: RpcId,

    /// True on the issuing side, false on the serving side.
    pub(crate) is_client: bool,

    /// The other machine.
    pub(crate) peer: Arc<Peer>,

    /// Port on `peer` handling the other end.
    pub(crate) dport: Port,

    pub(crate) state: RpcState,

    /// Failure recorded for this RPC; meaningful only on clients.
    pub(crate) error: Option<HomaError>,

    /// Message being received (response on clients, request on
    /// servers). `None` until the first packet arrives.
    pub(crate) msgin: Option<MessageIn>,

    /// Message being sent (request on clients, response on servers).
    pub(crate) msgout: Option<MessageOut>,

    /// Timer ticks since the last packet arrived for this RPC.
    pub(crate) silent_ticks: u32,

    /// RESENDs issued since the last packet from the peer.
    pub(crate) num_resends: u32,

    /// True while this RPC may be linked into the grantable list; lets
    /// teardown skip the grantable lock in the common case.
    pub(crate) possibly_in_grant_queue: bool,

    /// True while this RPC sits on the throttled list.
    pub(crate) in_throttled: bool,

    /// A receiver blocked specifically on this RPC, if any.
    pub(crate) interest: Option<Arc<Interest>>,
}

/// Identity of an RPC as seen from one socket: enough to find the
/// bucket and the entry within it. Client RPCs are keyed by id alone
/// (ids are unique per client port); server RPCs need the peer too,
/// because different clients may pick the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RpcKey {
    pub(crate) id: RpcId,
    pub(crate) is_client: bool,
    pub(crate) peer_addr: Ipv4Addr,
    pub(crate) peer_port: Port,
}

/// One hash bucket: a short chain of RPCs.
#[derive(Default)]
pub(crate) struct RpcBucket {
    rpcs: Vec<Rpc>,
}

impl RpcBucket {
    pub(crate) fn find_client_mut(&mut self, id: RpcId) -> Option<&mut Rpc> {
        self.rpcs.iter_mut().find(|r| r.id == id && r.is_client)
    }

    pub(crate) fn find_server_mut(
        &mut self,
        id: RpcId,
        peer_addr: Ipv4Addr,
        peer_port: Port,
    ) -> Option<&mut Rpc> {
        self.rpcs.iter_mut().find(|r| {
            r.id == id && !r.is_client && r.peer.addr == peer_addr && r.dport == peer_port
        })
    }

    pub(crate) fn find_mut(&mut self, key: &RpcKey) -> Option<&mut Rpc> {
        if key.is_client {
            self.find_client_mut(key.id)
        } else {
            self.find_server_mut(key.id, key.peer_addr, key.peer_port)
        }
    }

    pub(crate) fn insert(&mut self, rpc: Rpc) {
        self.rpcs.push(rpc);
    }

    /// Unlink and return the RPC matching `key`.
    pub(crate) fn remove(&mut self, key: &RpcKey) -> Option<Rpc> {
        let pos = self.rpcs.iter().position(|r| {
            r.id == key.id
                && r.is_client == key.is_client
                && (key.is_client || (r.peer.addr == key.peer_addr && r.dport == key.peer_port))
        })?;
        Some(self.rpcs.swap_remove(pos))
    }
}

/// A table of RPC buckets, one per socket per direction.
pub(crate) struct RpcTable {
    buckets: Box<[Mutex<RpcBucket>]>,
}

impl RpcTable {
    pub(crate) fn new() -> Self {
        let buckets = (0..RPC_BUCKETS)
            .map(|_| Mutex::new(RpcBucket::default()))
            .collect();
        Self { buckets }
    }

    /// Lock the bucket that owns `id`. Ids are allocated sequentially,
    /// so the identity hash spreads them evenly.
    #[inline]
    pub(crate) fn bucket(&self, id: RpcId) -> MutexGuard<'_, RpcBucket> {
        self.buckets[(id & (RPC_BUCKETS as u64 - 1)) as usize]
            .lock()
            .unwrap()
    }

    /// Try to lock the bucket that owns `id` (pacer fast path).
    #[inline]
    pub(crate) fn try_bucket(&self, id: RpcId) -> Option<MutexGuard<'_, RpcBucket>> {
        self.buckets[(id & (RPC_BUCKETS as u64 - 1)) as usize]
            .try_lock()
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::peer::PeerTab;
    use crate::transport::QueueSink;

    fn test_peer(addr: Ipv4Addr) -> Arc<Peer> {
        let tab = PeerTab::new();
        let sink = QueueSink::new(1500, 64000);
        tab.find(addr, &sink, &Metrics::new()).unwrap()
    }

    fn rpc(id: RpcId, is_client: bool, addr: Ipv4Addr, dport: Port) -> Rpc {
        Rpc {
            id,
            is_client,
            peer: test_peer(addr),
            dport,
            state: RpcState::Outgoing,
            error: None,
            msgin: None,
            msgout: None,
            silent_ticks: 0,
            num_resends: 0,
            possibly_in_grant_queue: false,
            in_throttled: false,
            interest: None,
        }
    }

    #[test]
    fn client_and_server_keys_do_not_collide() {
        let table = RpcTable::new();
        let addr = Ipv4Addr::new(10, 0, 0, 9);
        {
            let mut bucket = table.bucket(5);
            bucket.insert(rpc(5, true, addr, 40));
            bucket.insert(rpc(5, false, addr, 0x8000));
        }
        let mut bucket = table.bucket(5);
        assert!(bucket.find_client_mut(5).is_some());
        assert!(bucket.find_server_mut(5, addr, 0x8000).is_some());
        // A server RPC with the same id from a different client port is
        // a different RPC.
        assert!(bucket.find_server_mut(5, addr, 0x8001).is_none());
    }

    #[test]
    fn remove_unlinks() {
        let table = RpcTable::new();
        let addr = Ipv4Addr::new(10, 0, 0, 9);
        table.bucket(77).insert(rpc(77, true, addr, 40));
        let key = RpcKey {
            id: 77,
            is_client: true,
            peer_addr: addr,
            peer_port: 40,
        };
        assert!(table.bucket(77).remove(&key).is_some());
        assert!(table.bucket(77).remove(&key).is_none());
    }

    #[test]
    fn same_bucket_distinct_ids() {
        let table = RpcTable::new();
        let addr = Ipv4Addr::new(10, 0, 0, 9);
        // Ids 3 and 3 + RPC_BUCKETS share a bucket.
        let other = 3 + RPC_BUCKETS as u64;
        {
            let mut bucket = table.bucket(3);
            bucket.insert(rpc(3, true, addr, 40));
            bucket.insert(rpc(other, true, addr, 40));
        }
        let mut bucket = table.bucket(other);
        assert_eq!(bucket.find_client_mut(other).unwrap().id, other);
        assert_eq!(bucket.find_client_mut(3).unwrap().id, 3);
    }
}
