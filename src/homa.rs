//! The transport engine and its application-facing API.
//!
//! A [`Homa`] instance owns every shared table: the socket table, the
//! peer table, the grant scheduler and the pacer. Hosts drive it from
//! the outside: inbound frames go to [`Homa::pkt_recv`], the recovery
//! clock is [`Homa::tick`], and outbound frames leave through the
//! [`PacketSink`] supplied at construction.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;

use crate::config::{HomaConfig, HOMA_MAX_PRIORITIES};
use crate::error::HomaError;
use crate::grant::GrantEntry;
use crate::metrics::Metrics;
use crate::msgout::{FillParams, MessageOut};
use crate::pacer::ThrottledEntry;
use crate::peer::PeerTab;
use crate::pkthdr::{Control, PktType};
use crate::rpc::{Rpc, RpcKey, RpcState};
use crate::sock::{Interest, Sock, SockTab};
use crate::time::TimeSource;
use crate::transport::PacketSink;
use crate::type_alias::*;

bitflags::bitflags! {
    /// Message classes a receiver is willing to accept.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecvFlags: u32 {
        /// Accept incoming requests.
        const REQUEST = 0x01;
        /// Accept incoming responses.
        const RESPONSE = 0x02;
        /// Fail with [`HomaError::WouldBlock`] instead of sleeping.
        const NONBLOCKING = 0x04;
    }
}

/// A complete message delivered by [`HomaSocket::recv`].
#[derive(Debug)]
pub struct RecvMsg {
    /// The message payload.
    pub data: Vec<u8>,

    /// RPC id. For requests, pass this (and `peer`) to `reply`.
    pub id: RpcId,

    /// The other end of the RPC.
    pub peer: SocketAddrV4,

    /// True if this is a response to one of our requests.
    pub is_response: bool,
}

/// The local advertisement of unscheduled-priority cutoffs.
pub(crate) struct CutoffState {
    pub(crate) cutoffs: [u32; HOMA_MAX_PRIORITIES],
    pub(crate) version: u16,
}

/// The transport engine. Create one per host; share it via [`Arc`].
pub struct Homa {
    pub(crate) config: HomaConfig,

    /// Cutoffs we advertise to peers; version bumps on every change.
    pub(crate) cutoffs: RwLock<CutoffState>,

    pub(crate) socktab: SockTab,
    pub(crate) peers: PeerTab,

    /// RPCs whose inbound messages still need grants, sorted by
    /// `bytes_remaining` ascending. The single grantable lock is held
    /// only for short critical sections.
    pub(crate) grantable: Mutex<Vec<GrantEntry>>,

    /// RPCs with granted bytes the NIC-queue estimator refused, sorted
    /// by remaining bytes ascending.
    pub(crate) throttled: Mutex<Vec<ThrottledEntry>>,

    /// Wakes the pacer when the throttled list gains an entry.
    pub(crate) pacer_wake: Condvar,

    /// Ensures a single `pacer_xmit` instance runs at a time.
    pub(crate) pacer_active: AtomicBool,

    pub(crate) pacer_exit: AtomicBool,
    pacer_thread: Mutex<Option<thread::JoinHandle<()>>>,

    /// Cycle timestamp at which the NIC is expected to go idle.
    pub(crate) link_idle_time: AtomicU64,

    /// Times `tick` has run; the unit for resend rate limiting.
    pub(crate) timer_ticks: AtomicU32,

    pub(crate) metrics: Metrics,
    pub(crate) sink: Arc<dyn PacketSink>,
    pub(crate) time: Arc<dyn TimeSource>,

    /// Cycles to transmit 1000 wire bytes (5% overestimated).
    pub(crate) cycles_per_kbyte: u64,

    /// NIC queue depth limit in cycles.
    pub(crate) max_nic_queue_cycles: u64,
}

// Construction and teardown.
impl Homa {
    /// Build an engine around a packet sink and a time source. Spawns
    /// the pacer thread.
    pub fn new(
        mut config: HomaConfig,
        sink: Arc<dyn PacketSink>,
        time: Arc<dyn TimeSource>,
    ) -> Arc<Self> {
        config.prios_changed();
        let cps = time.cycles_per_sec();
        let homa = Arc::new(Self {
            cutoffs: RwLock::new(CutoffState {
                cutoffs: config.unsched_cutoffs,
                version: config.cutoff_version,
            }),
            socktab: SockTab::new(),
            peers: PeerTab::new(),
            grantable: Mutex::new(Vec::new()),
            throttled: Mutex::new(Vec::new()),
            pacer_wake: Condvar::new(),
            pacer_active: AtomicBool::new(false),
            pacer_exit: AtomicBool::new(false),
            pacer_thread: Mutex::new(None),
            link_idle_time: AtomicU64::new(time.now_cycles()),
            timer_ticks: AtomicU32::new(0),
            metrics: Metrics::new(),
            sink,
            time,
            cycles_per_kbyte: config.cycles_per_kbyte(cps),
            max_nic_queue_cycles: config.max_nic_queue_cycles(cps),
            config,
        });
        let handle = crate::pacer::spawn(&homa);
        *homa.pacer_thread.lock().unwrap() = Some(handle);
        homa
    }

    /// Open a socket. A client port is allocated immediately.
    pub fn socket(self: &Arc<Self>) -> Result<HomaSocket, HomaError> {
        let sock = self.socktab.create()?;
        Ok(HomaSocket {
            homa: self.clone(),
            sock,
        })
    }

    /// Counters kept by the engine.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Replace the advertised unscheduled-priority cutoffs. Peers learn
    /// of the change through the version stamp on future packets.
    pub fn set_cutoffs(&self, cutoffs: [u32; HOMA_MAX_PRIORITIES]) {
        let mut state = self.cutoffs.write().unwrap();
        state.cutoffs = cutoffs;
        state.cutoffs[0] = u32::MAX;
        state.version = state.version.wrapping_add(1).max(1);
    }

    /// Abort every client RPC directed at `addr` with `error`.
    pub fn abort_peer(&self, addr: Ipv4Addr, error: HomaError) {
        for sock in self.socktab.all() {
            let keys: Vec<RpcKey> = {
                let state = sock.state.lock().unwrap();
                if state.active.is_empty() {
                    continue;
                }
                state.active.clone()
            };
            sock.reap_disable.fetch_add(1, Ordering::SeqCst);
            for key in keys {
                if !key.is_client || key.peer_addr != addr {
                    continue;
                }
                let deliver = {
                    let mut bucket = sock.table(true).bucket(key.id);
                    match bucket.find_mut(&key) {
                        Some(rpc) if rpc.state != RpcState::Dead && rpc.state != RpcState::Ready => {
                            self.rpc_abort_locked(rpc, error.clone())
                        }
                        _ => None,
                    }
                };
                if let Some(key) = deliver {
                    self.deliver_ready(&sock, key);
                }
            }
            sock.reap_disable.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// Internal transmission helpers.
impl Homa {
    /// Send a control packet for one end of an RPC. Control packets are
    /// advisory: transmission failures are counted, not retried.
    pub(crate) fn xmit_control(
        &self,
        peer_addr: Ipv4Addr,
        sport: Port,
        dport: Port,
        id: RpcId,
        ctl: Control,
    ) {
        let priority = self.config.num_priorities - 1;
        let frame = ctl.encode(sport, dport, id, priority);
        if self.sink.xmit(peer_addr, &frame).is_err() {
            self.metrics.control_xmit_errors.inc();
            log::warn!(
                "port {}: failed to send {:?} for id {}",
                sport,
                ctl.pkt_type(),
                id
            );
            return;
        }
        self.metrics.packets_sent[ctl.pkt_type().index()].inc();
    }

    /// Transmit whatever the scheduling state permits from an RPC's
    /// outbound message. Caller holds the RPC's bucket lock. `force`
    /// pushes at least one packet past the NIC-queue estimator.
    pub(crate) fn xmit_data(&self, sock: &Arc<Sock>, rpc: &mut Rpc, mut force: bool) {
        loop {
            let msgout = match rpc.msgout.as_ref() {
                Some(m) => m,
                None => return,
            };
            let Some(buf) = msgout.peek() else { break };
            let offset = buf.offset;
            if offset >= msgout.granted {
                break;
            }

            let wire_bytes = buf.wire_bytes();
            if msgout.length - offset >= self.config.throttle_min_bytes
                && !self.check_nic_queue(wire_bytes, force)
            {
                self.add_to_throttled(sock, rpc);
                break;
            }

            let priority = if offset < msgout.unscheduled {
                rpc.peer
                    .unsched_priority(msgout.length, self.config.num_priorities)
            } else {
                msgout.sched_priority
            };
            let cutoff_version = rpc.peer.cutoff_version.load(Ordering::Acquire);
            let peer_addr = rpc.peer.addr;

            let msgout = rpc.msgout.as_mut().unwrap();
            let frame = msgout.frame_for_xmit(priority, cutoff_version);
            if self.sink.xmit(peer_addr, frame).is_err() {
                // The timer's RESEND path recovers whatever was lost.
                self.metrics.data_xmit_errors.inc();
            }
            msgout.mark_sent();
            self.metrics.packets_sent[PktType::Data.index()].inc();
            force = false;
        }
    }

    /// Retransmit the packets overlapping `[start, end)`, bypassing the
    /// throttle (retransmitted ranges are small and urgent).
    pub(crate) fn resend_data(&self, rpc: &mut Rpc, start: u32, end: u32, priority: Priority) {
        let Some(msgout) = rpc.msgout.as_ref() else {
            return;
        };
        let cutoff_version = rpc.peer.cutoff_version.load(Ordering::Acquire);
        let frames = msgout.resend_frames(start, end, priority, cutoff_version);
        for buf in frames {
            self.check_nic_queue(buf.wire_bytes(), true);
            if self
                .sink
                .xmit(rpc.peer.addr, &MessageOut::into_frame(buf))
                .is_err()
            {
                self.metrics.data_xmit_errors.inc();
                continue;
            }
            self.metrics.packets_sent[PktType::Data.index()].inc();
            self.metrics.resent_packets.inc();
        }
    }
}

// Internal RPC lifecycle helpers.
impl Homa {
    pub(crate) fn key_for(rpc: &Rpc) -> RpcKey {
        RpcKey {
            id: rpc.id,
            is_client: rpc.is_client,
            peer_addr: rpc.peer.addr,
            peer_port: rpc.dport,
        }
    }

    /// Mark an RPC ready and hand it to a waiting receiver if one is
    /// registered on the RPC itself. Returns the key when the caller
    /// must continue the hand-off through the socket's interest lists
    /// (after dropping the bucket lock).
    pub(crate) fn rpc_ready_locked(&self, rpc: &mut Rpc) -> Option<RpcKey> {
        rpc.state = RpcState::Ready;
        let key = Self::key_for(rpc);
        if let Some(interest) = rpc.interest.take() {
            interest.assign(&key);
            return None;
        }
        Some(key)
    }

    /// Finish a ready hand-off: match a blocked receiver or queue the
    /// RPC on the socket's ready lists. No bucket lock may be held.
    pub(crate) fn deliver_ready(&self, sock: &Arc<Sock>, key: RpcKey) {
        let mut state = sock.state.lock().unwrap();
        let interests = if key.is_client {
            &mut state.response_interests
        } else {
            &mut state.request_interests
        };
        // Prefer the most recent waiter: reusing a hot thread beats
        // round-robining.
        if let Some(interest) = interests.pop() {
            state.unregister(&interest);
            drop(state);
            interest.assign(&key);
            return;
        }
        if key.is_client {
            state.ready_responses.push_back(key);
        } else {
            state.ready_requests.push_back(key);
        }
    }

    /// Abort one RPC with an error, waking any receiver. Caller holds
    /// the bucket lock; the returned key (if any) must go through
    /// [`Self::deliver_ready`] after the lock drops.
    pub(crate) fn rpc_abort_locked(&self, rpc: &mut Rpc, error: HomaError) -> Option<RpcKey> {
        debug_assert!(rpc.is_client);
        if rpc.possibly_in_grant_queue {
            if let Some(msgin) = rpc.msgin.as_ref() {
                self.remove_from_grantable(&msgin.progress);
            }
        }
        rpc.error = Some(error);
        self.rpc_ready_locked(rpc)
    }

    /// Free an RPC: unlink it everywhere and move its buffers to the
    /// socket's dead list for deferred release. Call with no locks
    /// held.
    pub(crate) fn rpc_free(&self, sock: &Arc<Sock>, key: RpcKey) {
        let mut state = sock.state.lock().unwrap();
        let mut bucket = sock.table(key.is_client).bucket(key.id);
        let Some(rpc) = bucket.find_mut(&key) else {
            return;
        };
        if rpc.state == RpcState::Dead {
            return;
        }
        // Synchronize with the grant scheduler before teardown so it
        // never hands out grants for a dying message.
        if rpc.possibly_in_grant_queue {
            if let Some(msgin) = rpc.msgin.as_ref() {
                self.remove_from_grantable(&msgin.progress);
            }
        }
        rpc.state = RpcState::Dead;
        if let Some(interest) = rpc.interest.take() {
            interest.wake();
        }
        let was_throttled = rpc.in_throttled;
        let mut rpc = bucket.remove(&key).expect("rpc vanished under bucket lock");
        drop(bucket);

        state.active.retain(|k| k != &key);
        state.ready_requests.retain(|k| k != &key);
        state.ready_responses.retain(|k| k != &key);
        if let Some(msgin) = rpc.msgin.take() {
            state.dead_bufs.extend(msgin.into_buffers());
        }
        if let Some(msgout) = rpc.msgout.take() {
            state.dead_bufs.extend(msgout.into_buffers());
        }
        drop(state);

        if was_throttled {
            self.remove_from_throttled(sock, &key);
        }
    }
}

// Receive machinery.
impl Homa {
    /// Claim a ready RPC for delivery. Returns `None` if the RPC is
    /// gone or no longer Ready (stale hand-off); the caller retries.
    fn claim_ready(&self, sock: &Arc<Sock>, key: RpcKey) -> Option<Result<RecvMsg, HomaError>> {
        let taken;
        let peer;
        {
            let mut state = sock.state.lock().unwrap();
            let mut bucket = sock.table(key.is_client).bucket(key.id);
            let rpc = bucket.find_mut(&key)?;
            if rpc.state != RpcState::Ready {
                return None;
            }
            peer = SocketAddrV4::new(rpc.peer.addr, rpc.dport);
            if let Some(error) = rpc.error.clone() {
                // Failed client RPC: release it and surface the error.
                drop(bucket);
                drop(state);
                self.rpc_free(sock, key);
                return Some(Err(error));
            }
            taken = rpc.msgin.as_mut().map(|m| m.take_buffers());
            if key.is_client {
                // The response is in hand; nothing left but teardown.
                rpc.state = RpcState::Dead;
                let was_throttled = rpc.in_throttled;
                if rpc.possibly_in_grant_queue {
                    if let Some(msgin) = rpc.msgin.as_ref() {
                        self.remove_from_grantable(&msgin.progress);
                    }
                }
                let mut rpc = bucket.remove(&key).expect("rpc vanished under bucket lock");
                drop(bucket);
                state.active.retain(|k| k != &key);
                state.ready_responses.retain(|k| k != &key);
                if let Some(msgin) = rpc.msgin.take() {
                    state.dead_bufs.extend(msgin.into_buffers());
                }
                if let Some(msgout) = rpc.msgout.take() {
                    state.dead_bufs.extend(msgout.into_buffers());
                }
                drop(state);
                if was_throttled {
                    self.remove_from_throttled(sock, &key);
                }
            } else {
                rpc.state = RpcState::InService;
            }
        }
        // The contiguous copy happens outside every lock.
        let data = taken.map(|t| t.assemble()).unwrap_or_default();
        Some(Ok(RecvMsg {
            data,
            id: key.id,
            peer,
            is_response: key.is_client,
        }))
    }

    /// Drop an interest registration (both lists and any specific-RPC
    /// slot).
    fn cancel_interest(&self, sock: &Arc<Sock>, interest: &Arc<Interest>, specific: Option<RpcId>) {
        sock.state.lock().unwrap().unregister(interest);
        if let Some(id) = specific {
            let mut bucket = sock.client_rpcs.bucket(id);
            if let Some(rpc) = bucket.find_client_mut(id) {
                if rpc
                    .interest
                    .as_ref()
                    .is_some_and(|i| Arc::ptr_eq(i, interest))
                {
                    rpc.interest = None;
                }
            }
        }
    }

    /// Wait for a message matching `flags` (and `id`, if nonzero).
    fn wait_for_message(
        &self,
        sock: &Arc<Sock>,
        flags: RecvFlags,
        id: RpcId,
    ) -> Result<RecvMsg, HomaError> {
        if id == 0 && !flags.intersects(RecvFlags::REQUEST | RecvFlags::RESPONSE) {
            return Err(HomaError::InvalidArgument(
                "recv needs REQUEST, RESPONSE, or an id",
            ));
        }
        // This loop normally runs once; it restarts when a found RPC is
        // deleted out from under us.
        loop {
            if sock.is_shutdown() {
                return Err(HomaError::Shutdown);
            }

            // Too many dead buffers: clean up before anything else.
            while sock.dead_buf_count() > self.config.max_dead_buffs {
                if sock.reap(self.config.reap_limit, &self.metrics) <= 0 {
                    break;
                }
            }

            let interest = Interest::new();
            let mut specific = None;

            if id != 0 {
                let mut bucket = sock.client_rpcs.bucket(id);
                let Some(rpc) = bucket.find_client_mut(id) else {
                    return Err(HomaError::UnknownRpc(id));
                };
                if rpc.state == RpcState::Ready {
                    let key = Self::key_for(rpc);
                    drop(bucket);
                    match self.claim_ready(sock, key) {
                        Some(result) => return result,
                        None => continue,
                    }
                }
                if rpc.interest.is_some() {
                    return Err(HomaError::InvalidArgument(
                        "another receiver is waiting on this RPC",
                    ));
                }
                rpc.interest = Some(interest.clone());
                specific = Some(id);
            } else {
                // Check the ready lists and register the interest under
                // one socket-lock session so no completion slips by in
                // between.
                let candidate = {
                    let mut state = sock.state.lock().unwrap();
                    let mut found = None;
                    if flags.contains(RecvFlags::RESPONSE) {
                        found = state.ready_responses.pop_front();
                    }
                    if found.is_none() && flags.contains(RecvFlags::REQUEST) {
                        found = state.ready_requests.pop_front();
                    }
                    if found.is_none() && !flags.contains(RecvFlags::NONBLOCKING) {
                        if flags.contains(RecvFlags::REQUEST) {
                            state.request_interests.push(interest.clone());
                        }
                        if flags.contains(RecvFlags::RESPONSE) {
                            state.response_interests.push(interest.clone());
                        }
                    }
                    found
                };
                if let Some(key) = candidate {
                    match self.claim_ready(sock, key) {
                        Some(result) => return result,
                        // Stale entry; look again.
                        None => continue,
                    }
                }
                if flags.contains(RecvFlags::NONBLOCKING) {
                    return Err(HomaError::WouldBlock);
                }
            }

            if flags.contains(RecvFlags::NONBLOCKING) {
                self.cancel_interest(sock, &interest, specific);
                return Err(HomaError::WouldBlock);
            }

            // No message yet: reap dead RPCs instead of sleeping right
            // away.
            while interest.assigned().is_none() && !sock.is_shutdown() {
                if sock.reap(self.config.reap_limit, &self.metrics) <= 0 {
                    break;
                }
            }

            interest.wait(&sock.shutdown);
            self.cancel_interest(sock, &interest, specific);

            if sock.is_shutdown() {
                return Err(HomaError::Shutdown);
            }
            if let Some(key) = interest.assigned() {
                match self.claim_ready(sock, key) {
                    Some(result) => return result,
                    // The RPC vanished between wake-up and lookup.
                    None => continue,
                }
            }
            // Spurious wakeup; start over.
        }
    }
}

// Socket operations (called through `HomaSocket`).
impl Homa {
    fn send_request(
        &self,
        sock: &Arc<Sock>,
        dest: SocketAddrV4,
        msg: &[u8],
    ) -> Result<RpcId, HomaError> {
        if sock.is_shutdown() {
            return Err(HomaError::Shutdown);
        }
        if msg.is_empty() || msg.len() > self.config.max_message_length {
            return Err(HomaError::InvalidMessageLength(msg.len()));
        }
        let peer = self
            .peers
            .find(*dest.ip(), self.sink.as_ref(), &self.metrics)?;

        let id = sock.next_outgoing_id.fetch_add(1, Ordering::SeqCst);
        let msgout = MessageOut::new(
            msg,
            &FillParams {
                mtu: self.sink.mtu(),
                gso_max: self.sink.gso_max_size().min(self.config.max_gso_size),
                rtt_bytes: self.config.rtt_bytes,
                sport: sock.client_port,
                dport: dest.port(),
                id,
                cutoff_version: peer.cutoff_version.load(Ordering::Acquire),
            },
        );
        let key = RpcKey {
            id,
            is_client: true,
            peer_addr: *dest.ip(),
            peer_port: dest.port(),
        };
        {
            let mut state = sock.state.lock().unwrap();
            if sock.is_shutdown() {
                return Err(HomaError::Shutdown);
            }
            let mut bucket = sock.client_rpcs.bucket(id);
            bucket.insert(Rpc {
                id,
                is_client: true,
                peer,
                dport: dest.port(),
                state: RpcState::Outgoing,
                error: None,
                msgin: None,
                msgout: Some(msgout),
                silent_ticks: 0,
                num_resends: 0,
                possibly_in_grant_queue: false,
                in_throttled: false,
                interest: None,
            });
            state.active.push(key);
        }
        {
            let mut bucket = sock.client_rpcs.bucket(id);
            if let Some(rpc) = bucket.find_mut(&key) {
                self.xmit_data(sock, rpc, false);
            }
        }
        self.check_pacer();
        log::trace!(
            "port {}: sent request id {} ({} bytes) to {}",
            sock.client_port,
            id,
            msg.len(),
            dest
        );
        Ok(id)
    }

    fn reply(
        &self,
        sock: &Arc<Sock>,
        peer_addr: SocketAddrV4,
        id: RpcId,
        msg: &[u8],
    ) -> Result<(), HomaError> {
        if sock.is_shutdown() {
            return Err(HomaError::Shutdown);
        }
        if msg.is_empty() || msg.len() > self.config.max_message_length {
            return Err(HomaError::InvalidMessageLength(msg.len()));
        }
        let key = RpcKey {
            id,
            is_client: false,
            peer_addr: *peer_addr.ip(),
            peer_port: peer_addr.port(),
        };
        let peer = self
            .peers
            .find(*peer_addr.ip(), self.sink.as_ref(), &self.metrics)?;
        let msgout = MessageOut::new(
            msg,
            &FillParams {
                mtu: self.sink.mtu(),
                gso_max: self.sink.gso_max_size().min(self.config.max_gso_size),
                rtt_bytes: self.config.rtt_bytes,
                sport: sock.local_port(false),
                dport: peer_addr.port(),
                id,
                cutoff_version: peer.cutoff_version.load(Ordering::Acquire),
            },
        );

        let fully_sent = {
            let mut bucket = sock.server_rpcs.bucket(id);
            let Some(rpc) = bucket.find_mut(&key) else {
                return Err(HomaError::UnknownRpc(id));
            };
            if rpc.state != RpcState::InService {
                return Err(HomaError::InvalidArgument("RPC is not awaiting a reply"));
            }
            rpc.state = RpcState::Outgoing;
            rpc.msgout = Some(msgout);
            self.xmit_data(sock, rpc, false);
            rpc.msgout.as_ref().is_some_and(|m| m.fully_sent())
        };
        if fully_sent {
            // Response fully handed to the NIC: the server is done with
            // this RPC.
            self.rpc_free(sock, key);
        }
        self.check_pacer();
        Ok(())
    }

    fn shutdown(&self, sock: &Arc<Sock>) {
        if sock.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("port {}: shutting down", sock.client_port);
        // Wake every blocked receiver; they observe the shutdown flag.
        {
            let mut state = sock.state.lock().unwrap();
            let request_interests: Vec<_> = state.request_interests.drain(..).collect();
            let response_interests: Vec<_> = state.response_interests.drain(..).collect();
            for interest in request_interests.into_iter().chain(response_interests) {
                interest.wake();
            }
            state.ready_requests.clear();
            state.ready_responses.clear();
        }
        // Abort in-flight RPCs.
        let keys: Vec<RpcKey> = sock.state.lock().unwrap().active.clone();
        for key in keys {
            self.rpc_free(sock, key);
        }
        self.socktab.remove(sock);
        // Drain the dead list so nothing outlives the socket.
        while sock.reap(self.config.reap_limit, &self.metrics) > 0 {}
    }
}

impl Drop for Homa {
    fn drop(&mut self) {
        self.pacer_exit.store(true, Ordering::SeqCst);
        self.pacer_wake.notify_all();
        if let Some(handle) = self.pacer_thread.lock().unwrap().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// An open Homa socket. Dropping it shuts the socket down.
pub struct HomaSocket {
    pub(crate) homa: Arc<Homa>,
    pub(crate) sock: Arc<Sock>,
}

impl HomaSocket {
    /// The engine this socket belongs to.
    pub fn homa(&self) -> &Arc<Homa> {
        &self.homa
    }

    /// Port used for outgoing requests.
    pub fn client_port(&self) -> Port {
        self.sock.client_port
    }

    /// Bound server port, or 0.
    pub fn server_port(&self) -> Port {
        self.sock.server_port.load(Ordering::SeqCst)
    }

    /// Bind a server port (1..0x8000) for receiving requests.
    pub fn bind(&self, port: Port) -> Result<(), HomaError> {
        if self.sock.is_shutdown() {
            return Err(HomaError::Shutdown);
        }
        self.homa.socktab.bind(&self.sock, port)
    }

    /// Send a request message; returns the id to wait on.
    pub fn send_request(&self, dest: SocketAddrV4, msg: &[u8]) -> Result<RpcId, HomaError> {
        self.homa.send_request(&self.sock, dest, msg)
    }

    /// Answer a request previously returned by `recv`.
    pub fn reply(&self, peer: SocketAddrV4, id: RpcId, msg: &[u8]) -> Result<(), HomaError> {
        self.homa.reply(&self.sock, peer, id, msg)
    }

    /// Receive one complete message. With `id` set, waits for that
    /// specific response; otherwise `flags` selects the classes to
    /// accept.
    pub fn recv(&self, flags: RecvFlags, id: Option<RpcId>) -> Result<RecvMsg, HomaError> {
        self.homa
            .wait_for_message(&self.sock, flags, id.unwrap_or(0))
    }

    /// Shut the socket down: wake blocked receivers with an error and
    /// abort in-flight RPCs.
    pub fn shutdown(&self) {
        self.homa.shutdown(&self.sock);
    }
}

impl Drop for HomaSocket {
    fn drop(&mut self) {
        self.homa.shutdown(&self.sock);
    }
}
