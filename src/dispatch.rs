//! Inbound packet dispatch.
//!
//! [`Homa::pkt_recv`] is the entry point the host's receive path calls
//! with each inbound frame (one frame may carry several segments). The
//! frame is demultiplexed to a socket by destination port and to an RPC
//! by `(side, id, peer)`; server-bound DATA starting at offset 0
//! creates the server RPC.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::HOMA_MIN_CLIENT_PORT;
use crate::grant::GrantEntry;
use crate::homa::Homa;
use crate::msgin::MessageIn;
use crate::pkthdr::{
    CommonHeader, Control, DataHeader, DataSegment, DecodeError, Packet, HOMA_MAX_HEADER,
};
use crate::rpc::{Rpc, RpcKey, RpcState};
use crate::sock::Sock;

impl Homa {
    /// Process one inbound frame from `src`.
    pub fn pkt_recv(&self, src: Ipv4Addr, frame: &[u8]) {
        if frame.len() < HOMA_MAX_HEADER {
            self.metrics.short_packets.inc();
            log::debug!("dropping {}-byte runt from {}", frame.len(), src);
            return;
        }
        let pkt = match Packet::parse(frame) {
            Ok(pkt) => pkt,
            Err(DecodeError::UnknownType(t)) => {
                self.metrics.unknown_packet_types.inc();
                log::warn!("dropping packet with unknown type {} from {}", t, src);
                return;
            }
            Err(DecodeError::Short) => {
                self.metrics.short_packets.inc();
                return;
            }
        };
        let common = *pkt.common();
        self.metrics.packets_received[common.pkt_type.index()].inc();

        if let Packet::Freeze { .. } = pkt {
            // Trace freezing belongs to the host's debugging story.
            log::debug!("FREEZE received from {}", src);
            return;
        }

        let Some(sock) = self.socktab.find(common.dport) else {
            log::debug!(
                "packet from {} refers to unknown port {}",
                src,
                common.dport
            );
            return;
        };
        if sock.is_shutdown() {
            return;
        }

        match pkt {
            Packet::Data { hdr, segments } => self.data_pkt(&sock, src, &hdr, segments),
            Packet::Grant {
                common,
                offset,
                priority,
            } => self.grant_pkt(&sock, src, &common, offset, priority),
            Packet::Resend {
                common,
                offset,
                length,
                priority,
            } => self.resend_pkt(&sock, src, &common, offset, length, priority),
            Packet::Restart { common } => self.restart_pkt(&sock, src, &common),
            Packet::Busy { common } => self.busy_pkt(&sock, src, &common),
            Packet::Cutoffs {
                cutoffs, version, ..
            } => self.cutoffs_pkt(src, &cutoffs, version),
            Packet::Freeze { .. } => unreachable!("handled above"),
        }

        self.check_pacer();
    }

    /// Key of the RPC a packet refers to, from this host's view.
    fn rpc_key(src: Ipv4Addr, common: &CommonHeader) -> RpcKey {
        RpcKey {
            id: common.id,
            // Packets to a server port belong to server RPCs.
            is_client: common.dport >= HOMA_MIN_CLIENT_PORT,
            peer_addr: src,
            peer_port: common.sport,
        }
    }

    fn data_pkt(
        &self,
        sock: &Arc<Sock>,
        src: Ipv4Addr,
        hdr: &DataHeader,
        segments: Vec<DataSegment<'_>>,
    ) {
        let key = Self::rpc_key(src, &hdr.common);
        let mut new_server_rpc = false;
        let mut became_ready = None;
        let mut grant_candidate = None;
        let mut send_cutoffs = false;

        {
            let mut bucket = sock.table(key.is_client).bucket(key.id);
            if bucket.find_mut(&key).is_none() {
                if key.is_client {
                    self.metrics.unknown_rpcs.inc();
                    log::debug!("DATA from {} for unknown client RPC {}", src, key.id);
                    return;
                }
                // Server side: the first packet of a request creates
                // the RPC.
                if segments.first().map_or(true, |s| s.offset != 0) {
                    self.metrics.unknown_rpcs.inc();
                    return;
                }
                let peer = match self.peers.find(src, self.sink.as_ref(), &self.metrics) {
                    Ok(peer) => peer,
                    Err(e) => {
                        self.metrics.server_cant_create_rpcs.inc();
                        log::warn!("could not create server RPC for {}: {}", src, e);
                        return;
                    }
                };
                let msgin = MessageIn::new(hdr.message_length, hdr.incoming);
                let scheduled = msgin.scheduled;
                bucket.insert(Rpc {
                    id: key.id,
                    is_client: false,
                    peer,
                    dport: key.peer_port,
                    state: RpcState::Incoming,
                    error: None,
                    msgin: Some(msgin),
                    msgout: None,
                    silent_ticks: 0,
                    num_resends: 0,
                    possibly_in_grant_queue: scheduled,
                    in_throttled: false,
                    interest: None,
                });
                new_server_rpc = true;
                self.metrics.requests_received.inc();
            }
            let rpc = bucket.find_mut(&key).expect("rpc just inserted");
            rpc.silent_ticks = 0;
            rpc.num_resends = 0;

            match rpc.state {
                RpcState::Incoming => {
                    if let Some(msgin) = rpc.msgin.as_ref() {
                        msgin.progress.raise_incoming(hdr.incoming);
                    }
                }
                RpcState::Outgoing if rpc.is_client => {
                    // First packet of the response.
                    let msgin = MessageIn::new(hdr.message_length, hdr.incoming);
                    rpc.possibly_in_grant_queue = msgin.scheduled;
                    rpc.msgin = Some(msgin);
                    rpc.state = RpcState::Incoming;
                    self.metrics.responses_received.inc();
                }
                // Late, duplicate, or misdirected data.
                _ => return,
            }

            let msgin = rpc.msgin.as_mut().expect("incoming rpc without msgin");
            for seg in segments {
                msgin.add_segment(seg.offset, seg.data.to_vec());
            }
            if msgin.scheduled {
                grant_candidate = Some(GrantEntry {
                    sock: sock.clone(),
                    key,
                    peer: rpc.peer.clone(),
                    progress: msgin.progress.clone(),
                });
            }
            if msgin.complete() {
                became_ready = self.rpc_ready_locked(rpc);
            }

            // Stale cutoffs at the sender? Tell it ours, at most once
            // per tick per peer, so a burst of stale packets does not
            // become a burst of CUTOFFS.
            let version = self.cutoffs.read().unwrap().version;
            if hdr.cutoff_version != version {
                let tick = self.timer_ticks.load(Ordering::SeqCst);
                send_cutoffs = rpc.peer.cutoffs_update_due(tick);
            }
        }

        if new_server_rpc {
            let mut state = sock.state.lock().unwrap();
            state.active.push(key);
            drop(state);
            if sock.is_shutdown() {
                // Lost the race with shutdown; take the RPC back out.
                self.rpc_free(sock, key);
                return;
            }
        }
        if let Some(entry) = grant_candidate {
            self.manage_grants(Some(entry));
        }
        if let Some(ready_key) = became_ready {
            self.deliver_ready(sock, ready_key);
        }
        if send_cutoffs {
            let state = self.cutoffs.read().unwrap();
            let ctl = Control::Cutoffs {
                cutoffs: state.cutoffs,
                version: state.version,
            };
            drop(state);
            self.xmit_control(
                src,
                hdr.common.dport,
                hdr.common.sport,
                hdr.common.id,
                ctl,
            );
        }
    }

    fn grant_pkt(
        &self,
        sock: &Arc<Sock>,
        src: Ipv4Addr,
        common: &CommonHeader,
        offset: u32,
        priority: u8,
    ) {
        let key = Self::rpc_key(src, common);
        let mut free_server = false;
        {
            let mut bucket = sock.table(key.is_client).bucket(key.id);
            let Some(rpc) = bucket.find_mut(&key) else {
                self.metrics.unknown_rpcs.inc();
                return;
            };
            rpc.silent_ticks = 0;
            rpc.num_resends = 0;
            if rpc.state != RpcState::Outgoing {
                return;
            }
            if let Some(msgout) = rpc.msgout.as_mut() {
                msgout.grant_to(offset, priority);
            }
            self.xmit_data(sock, rpc, false);
            free_server =
                !rpc.is_client && rpc.msgout.as_ref().is_some_and(|m| m.fully_sent());
        }
        if free_server {
            // Response fully sent: the server is done with this RPC.
            self.rpc_free(sock, key);
        }
    }

    fn resend_pkt(
        &self,
        sock: &Arc<Sock>,
        src: Ipv4Addr,
        common: &CommonHeader,
        offset: u32,
        length: u32,
        priority: u8,
    ) {
        let key = Self::rpc_key(src, common);
        let server_side = !key.is_client;
        let mut bucket = sock.table(key.is_client).bucket(key.id);
        let rpc = bucket.find_mut(&key);

        if server_side && rpc.is_none() {
            // Total state loss on our side: tell the client to start
            // the RPC over. Replay may execute the request twice; the
            // protocol permits that.
            drop(bucket);
            log::debug!(
                "RESEND for unknown server RPC {}; sending RESTART to {}:{}",
                key.id,
                src,
                common.sport
            );
            self.xmit_control(src, common.dport, common.sport, common.id, Control::Restart);
            return;
        }
        let Some(rpc) = rpc else {
            // Client side: the RPC is gone, nothing useful to say.
            self.metrics.unknown_rpcs.inc();
            return;
        };
        rpc.silent_ticks = 0;
        rpc.num_resends = 0;

        if rpc.state != RpcState::Outgoing {
            if server_side {
                // Alive but not ready to transmit (still receiving, or
                // the application is thinking).
                self.xmit_control(
                    rpc.peer.addr,
                    common.dport,
                    common.sport,
                    common.id,
                    Control::Busy,
                );
            }
            return;
        }

        if rpc
            .msgout
            .as_ref()
            .is_some_and(|m| m.transmittable())
        {
            // We have granted bytes queued but chose not to send them
            // yet (throttled); the peer just needs to know we're alive.
            self.xmit_control(
                rpc.peer.addr,
                common.dport,
                common.sport,
                common.id,
                Control::Busy,
            );
        } else {
            self.resend_data(rpc, offset, offset.saturating_add(length), priority);
        }
    }

    fn restart_pkt(&self, sock: &Arc<Sock>, src: Ipv4Addr, common: &CommonHeader) {
        let key = Self::rpc_key(src, common);
        if !key.is_client {
            return;
        }
        let mut bucket = sock.table(true).bucket(key.id);
        let Some(rpc) = bucket.find_mut(&key) else {
            self.metrics.unknown_rpcs.inc();
            return;
        };
        rpc.silent_ticks = 0;
        rpc.num_resends = 0;
        if rpc.state == RpcState::Ready {
            return;
        }
        log::debug!(
            "restarting id {} to {}:{} from offset 0",
            rpc.id,
            src,
            rpc.dport
        );
        // Discard any partial response and replay the request from the
        // beginning.
        if rpc.possibly_in_grant_queue {
            if let Some(msgin) = rpc.msgin.as_ref() {
                self.remove_from_grantable(&msgin.progress);
            }
            rpc.possibly_in_grant_queue = false;
        }
        rpc.msgin = None;
        if let Some(msgout) = rpc.msgout.as_mut() {
            msgout.reset();
        }
        rpc.state = RpcState::Outgoing;
        self.xmit_data(sock, rpc, false);
    }

    fn busy_pkt(&self, sock: &Arc<Sock>, src: Ipv4Addr, common: &CommonHeader) {
        let key = Self::rpc_key(src, common);
        let mut bucket = sock.table(key.is_client).bucket(key.id);
        let Some(rpc) = bucket.find_mut(&key) else {
            self.metrics.unknown_rpcs.inc();
            return;
        };
        // Liveness only: the peer is alive but has nothing for us yet.
        rpc.silent_ticks = 0;
        rpc.num_resends = 0;
    }

    fn cutoffs_pkt(
        &self,
        src: Ipv4Addr,
        cutoffs: &[u32; crate::config::HOMA_MAX_PRIORITIES],
        version: u16,
    ) {
        if let Ok(peer) = self.peers.find(src, self.sink.as_ref(), &self.metrics) {
            peer.set_cutoffs(cutoffs, version);
            log::debug!("installed cutoffs v{} from {}", version, src);
        }
    }
}
