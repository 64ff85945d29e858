//! Loss and timeout recovery.
//!
//! [`Homa::tick`] is the recovery clock; hosts call it at a fixed rate
//! (about one millisecond). Each tick walks the active RPCs of every
//! socket: RPCs that have gone silent get RESEND requests, and RPCs
//! that stay silent through the whole resend budget are aborted.

use std::sync::atomic::Ordering;

use crate::error::HomaError;
use crate::homa::Homa;
use crate::pkthdr::Control;
use crate::rpc::RpcState;

impl Homa {
    /// Run one recovery tick.
    pub fn tick(&self) {
        let tick = self.timer_ticks.fetch_add(1, Ordering::SeqCst).wrapping_add(1);

        for sock in self.socktab.all() {
            if sock.is_shutdown() {
                continue;
            }
            // Hold the reaper off while we walk RPCs from a snapshot.
            sock.reap_disable.fetch_add(1, Ordering::SeqCst);
            let keys = sock.state.lock().unwrap().active.clone();

            for key in keys {
                let mut deliver = None;
                let mut free = false;
                {
                    let mut bucket = sock.table(key.is_client).bucket(key.id);
                    let Some(rpc) = bucket.find_mut(&key) else {
                        continue;
                    };
                    match rpc.state {
                        RpcState::Dead | RpcState::Ready | RpcState::InService => continue,
                        RpcState::Outgoing => {
                            if rpc.msgout.as_ref().is_some_and(|m| m.transmittable()) {
                                // Granted bytes are still queued on our
                                // side; the peer is not the laggard.
                                rpc.silent_ticks = 0;
                                continue;
                            }
                            rpc.silent_ticks += 1;
                        }
                        RpcState::Incoming => rpc.silent_ticks += 1,
                    }
                    if rpc.silent_ticks < self.config.resend_ticks {
                        continue;
                    }

                    if rpc.num_resends >= self.config.abort_resends {
                        if rpc.is_client {
                            log::warn!(
                                "port {}: aborting id {} to {} after {} resends",
                                sock.client_port,
                                rpc.id,
                                rpc.peer.addr,
                                rpc.num_resends
                            );
                            self.metrics.client_rpc_timeouts.inc();
                            let error = HomaError::Timeout(rpc.id);
                            deliver = self.rpc_abort_locked(rpc, error);
                        } else {
                            // The client will notice on its own and
                            // either RESTART or give up.
                            self.metrics.server_rpc_timeouts.inc();
                            free = true;
                        }
                    } else if rpc.peer.resend_due(tick, self.config.resend_interval) {
                        let (offset, length) = match rpc.msgin.as_ref() {
                            Some(msgin) => msgin.resend_gap(),
                            // Nothing received yet: ask for the whole
                            // unscheduled window.
                            None => (0, self.config.rtt_bytes),
                        };
                        if length > 0 {
                            self.xmit_control(
                                rpc.peer.addr,
                                sock.local_port(key.is_client),
                                rpc.dport,
                                rpc.id,
                                Control::Resend {
                                    offset,
                                    length,
                                    priority: self.config.num_priorities - 1,
                                },
                            );
                            rpc.num_resends += 1;
                            rpc.peer.note_resend(tick);
                            log::debug!(
                                "port {}: RESEND [{}, {}) for id {}",
                                sock.local_port(key.is_client),
                                offset,
                                offset + length,
                                rpc.id
                            );
                        }
                    }
                }
                if let Some(key) = deliver {
                    self.deliver_ready(&sock, key);
                }
                if free {
                    self.rpc_free(&sock, key);
                }
            }
            sock.reap_disable.fetch_sub(1, Ordering::SeqCst);
        }

        self.check_pacer();
    }
}
