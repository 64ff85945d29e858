//! Sockets, the port table, and receive interests.
//!
//! The port table has 1024 buckets indexed by `port & mask`; lookups
//! take only a bucket read lock, while inserts and port allocation are
//! serialized by a table-wide mutex. Each socket always has a client
//! port (allocated from a monotonic counter) and may gain a server port
//! through `bind`.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use crate::config::HOMA_MIN_CLIENT_PORT;
use crate::error::HomaError;
use crate::metrics::Metrics;
use crate::rpc::{RpcKey, RpcTable};
use crate::type_alias::*;

/// Number of buckets in the port table. Power of two.
const SOCKTAB_BUCKETS: usize = 1024;

/// A blocked receiver.
///
/// The waking thread publishes the matching RPC with a release store of
/// its id *after* filling in the peer fields, so the woken thread can
/// re-look-up and re-lock the RPC itself. If the RPC disappears in
/// between, the receiver simply retries.
pub(crate) struct Interest {
    id: AtomicU64,
    peer_addr: AtomicU32,
    peer_port: AtomicU16,
    is_client: AtomicBool,
    woke: Mutex<bool>,
    cond: Condvar,
}

impl Interest {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: AtomicU64::new(0),
            peer_addr: AtomicU32::new(0),
            peer_port: AtomicU16::new(0),
            is_client: AtomicBool::new(false),
            woke: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    /// Hand a ready RPC to this receiver and wake it.
    pub(crate) fn assign(&self, key: &RpcKey) {
        debug_assert!(key.id != 0);
        self.peer_addr
            .store(u32::from(key.peer_addr), Ordering::Relaxed);
        self.peer_port.store(key.peer_port, Ordering::Relaxed);
        self.is_client.store(key.is_client, Ordering::Relaxed);
        // Publishes the fields above; must come last.
        self.id.store(key.id, Ordering::Release);
        self.wake();
    }

    /// Wake the receiver without assigning an RPC (shutdown).
    pub(crate) fn wake(&self) {
        *self.woke.lock().unwrap() = true;
        self.cond.notify_one();
    }

    /// The assigned RPC, if one has been published.
    pub(crate) fn assigned(&self) -> Option<RpcKey> {
        let id = self.id.load(Ordering::Acquire);
        if id == 0 {
            return None;
        }
        Some(RpcKey {
            id,
            is_client: self.is_client.load(Ordering::Relaxed),
            peer_addr: Ipv4Addr::from(self.peer_addr.load(Ordering::Relaxed)),
            peer_port: self.peer_port.load(Ordering::Relaxed),
        })
    }

    /// Block until assigned an RPC, woken, or the socket shuts down.
    pub(crate) fn wait(&self, shutdown: &AtomicBool) {
        let mut woke = self.woke.lock().unwrap();
        while !*woke && self.id.load(Ordering::Acquire) == 0 && !shutdown.load(Ordering::SeqCst) {
            woke = self.cond.wait(woke).unwrap();
        }
        *woke = false;
    }
}

/// Socket state guarded by the socket lock.
#[derive(Default)]
pub(crate) struct SockState {
    /// Every live RPC on this socket; lets the timer and peer-abort
    /// scans avoid walking all 2048 buckets.
    pub(crate) active: Vec<RpcKey>,

    /// Completed server RPCs nobody has claimed yet (oldest first).
    pub(crate) ready_requests: VecDeque<RpcKey>,

    /// Completed client RPCs nobody has claimed yet (oldest first).
    pub(crate) ready_responses: VecDeque<RpcKey>,

    /// Receivers waiting for any request.
    pub(crate) request_interests: Vec<Arc<Interest>>,

    /// Receivers waiting for any response.
    pub(crate) response_interests: Vec<Arc<Interest>>,

    /// Packet buffers of dead RPCs, awaiting the reaper.
    pub(crate) dead_bufs: VecDeque<Vec<u8>>,
}

impl SockState {
    /// Remove one interest from both waiting lists.
    pub(crate) fn unregister(&mut self, interest: &Arc<Interest>) {
        self.request_interests.retain(|i| !Arc::ptr_eq(i, interest));
        self.response_interests.retain(|i| !Arc::ptr_eq(i, interest));
    }
}

/// An open socket.
pub(crate) struct Sock {
    /// Port for outgoing requests. Always assigned.
    pub(crate) client_port: Port,

    /// Port for incoming requests; 0 until `bind`.
    pub(crate) server_port: AtomicU16,

    /// True once the socket is unusable.
    pub(crate) shutdown: AtomicBool,

    /// Id for the next outgoing RPC. Incremented without the socket
    /// lock. Starts at 1: id 0 means "none" in interest hand-offs.
    pub(crate) next_outgoing_id: AtomicU64,

    /// While nonzero, the reaper leaves this socket's dead buffers
    /// alone; lets scans hold references without the socket lock.
    pub(crate) reap_disable: AtomicU32,

    pub(crate) client_rpcs: RpcTable,
    pub(crate) server_rpcs: RpcTable,

    pub(crate) state: Mutex<SockState>,
}

impl Sock {
    fn new(client_port: Port) -> Self {
        Self {
            client_port,
            server_port: AtomicU16::new(0),
            shutdown: AtomicBool::new(false),
            next_outgoing_id: AtomicU64::new(1),
            reap_disable: AtomicU32::new(0),
            client_rpcs: RpcTable::new(),
            server_rpcs: RpcTable::new(),
            state: Mutex::new(SockState::default()),
        }
    }

    /// The RPC table for one side.
    #[inline]
    pub(crate) fn table(&self, is_client: bool) -> &RpcTable {
        if is_client {
            &self.client_rpcs
        } else {
            &self.server_rpcs
        }
    }

    /// Source port to put in packets for one side of an RPC.
    #[inline]
    pub(crate) fn local_port(&self, is_client: bool) -> Port {
        if is_client {
            self.client_port
        } else {
            self.server_port.load(Ordering::Relaxed)
        }
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Release dead packet buffers, at most `limit` per call. Returns
    /// 1 if buffers were freed, 0 if none were pending, -1 if reaping
    /// is currently disabled.
    pub(crate) fn reap(&self, limit: usize, metrics: &Metrics) -> i32 {
        if self.reap_disable.load(Ordering::SeqCst) != 0 {
            metrics.disabled_reaps.inc();
            return -1;
        }
        metrics.reaper_calls.inc();
        let freed: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            let n = state.dead_bufs.len().min(limit);
            state.dead_bufs.drain(..n).collect()
        };
        if freed.is_empty() {
            return 0;
        }
        // The actual release happens outside the socket lock.
        drop(freed);
        1
    }

    /// Dead buffers currently pending.
    pub(crate) fn dead_buf_count(&self) -> usize {
        self.state.lock().unwrap().dead_bufs.len()
    }
}

struct SockTabBucket {
    entries: Vec<(Port, Arc<Sock>)>,
}

/// The port → socket map.
pub(crate) struct SockTab {
    buckets: Box<[RwLock<SockTabBucket>]>,

    /// Serializes mutation and port allocation; holds the next client
    /// port to consider.
    write_lock: Mutex<Port>,
}

impl SockTab {
    pub(crate) fn new() -> Self {
        let buckets = (0..SOCKTAB_BUCKETS)
            .map(|_| {
                RwLock::new(SockTabBucket {
                    entries: Vec::new(),
                })
            })
            .collect();
        Self {
            buckets,
            write_lock: Mutex::new(HOMA_MIN_CLIENT_PORT),
        }
    }

    #[inline]
    fn bucket(&self, port: Port) -> &RwLock<SockTabBucket> {
        &self.buckets[port as usize & (SOCKTAB_BUCKETS - 1)]
    }

    /// Look up the socket registered under `port`.
    pub(crate) fn find(&self, port: Port) -> Option<Arc<Sock>> {
        self.bucket(port)
            .read()
            .unwrap()
            .entries
            .iter()
            .find(|(p, _)| *p == port)
            .map(|(_, s)| s.clone())
    }

    /// Create a socket, allocating its client port.
    pub(crate) fn create(&self) -> Result<Arc<Sock>, HomaError> {
        let mut next = self.write_lock.lock().unwrap();
        for _ in 0..=(u16::MAX - HOMA_MIN_CLIENT_PORT) {
            let port = *next;
            *next = if port == u16::MAX {
                HOMA_MIN_CLIENT_PORT
            } else {
                port + 1
            };
            if self.find(port).is_some() {
                continue;
            }
            let sock = Arc::new(Sock::new(port));
            self.bucket(port)
                .write()
                .unwrap()
                .entries
                .push((port, sock.clone()));
            return Ok(sock);
        }
        Err(HomaError::PortUnavailable(0))
    }

    /// Register `sock` under an explicit server port.
    pub(crate) fn bind(&self, sock: &Arc<Sock>, port: Port) -> Result<(), HomaError> {
        if port == 0 || port >= HOMA_MIN_CLIENT_PORT {
            return Err(HomaError::PortUnavailable(port));
        }
        let _guard = self.write_lock.lock().unwrap();
        if sock.server_port.load(Ordering::SeqCst) != 0 {
            return Err(HomaError::InvalidArgument("socket is already bound"));
        }
        if self.find(port).is_some() {
            return Err(HomaError::PortUnavailable(port));
        }
        self.bucket(port)
            .write()
            .unwrap()
            .entries
            .push((port, sock.clone()));
        sock.server_port.store(port, Ordering::SeqCst);
        Ok(())
    }

    /// Remove every registration for `sock`.
    pub(crate) fn remove(&self, sock: &Arc<Sock>) {
        let _guard = self.write_lock.lock().unwrap();
        let mut ports = vec![sock.client_port];
        let server_port = sock.server_port.load(Ordering::SeqCst);
        if server_port != 0 {
            ports.push(server_port);
        }
        for port in ports {
            self.bucket(port)
                .write()
                .unwrap()
                .entries
                .retain(|(_, s)| !Arc::ptr_eq(s, sock));
        }
    }

    /// Snapshot of every open socket (for timer and abort scans).
    pub(crate) fn all(&self) -> Vec<Arc<Sock>> {
        let mut out = Vec::new();
        for bucket in self.buckets.iter() {
            for (port, sock) in &bucket.read().unwrap().entries {
                // Sockets bound to a server port appear twice; report
                // them once, under their client port.
                if *port == sock.client_port {
                    out.push(sock.clone());
                }
            }
        }
        out
    }
}
