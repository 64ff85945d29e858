//! SRPT grant scheduler.
//!
//! The receiver allocates inbound bandwidth to the messages with the
//! fewest bytes remaining. Up to `max_overcommit` messages hold grants
//! at once; overcommitting hides the idle gaps left when a single
//! sender stalls.
//!
//! Entries reference the RPC's shared [`MsgInProgress`] cell rather
//! than the RPC itself, so the scheduler reads and advances grant state
//! under the grantable lock alone, without touching bucket locks.

use std::sync::Arc;

use crate::homa::Homa;
use crate::msgin::MsgInProgress;
use crate::peer::Peer;
use crate::pkthdr::Control;
use crate::rpc::RpcKey;
use crate::sock::Sock;

/// One grantable inbound message.
pub(crate) struct GrantEntry {
    pub(crate) sock: Arc<Sock>,
    pub(crate) key: RpcKey,
    pub(crate) peer: Arc<Peer>,
    pub(crate) progress: Arc<MsgInProgress>,
}

impl GrantEntry {
    #[inline]
    fn same_message(&self, progress: &Arc<MsgInProgress>) -> bool {
        Arc::ptr_eq(&self.progress, progress)
    }
}

impl Homa {
    /// Re-evaluate grants after `candidate`'s message made progress
    /// (or, with `None`, after a message left the list). Repositions
    /// the candidate in the SRPT order, then issues grants to the top
    /// of the list.
    pub(crate) fn manage_grants(&self, candidate: Option<GrantEntry>) {
        let mut grantable = self.grantable.lock().unwrap();

        if let Some(entry) = candidate {
            let pos = grantable.iter().position(|e| e.same_message(&entry.progress));
            if entry.progress.fully_granted() {
                // Fully authorized; no more grants to schedule.
                if let Some(pos) = pos {
                    grantable.remove(pos);
                }
            } else {
                match pos {
                    None => {
                        // Not yet tracked; insert in SRPT order.
                        let mine = entry.progress.bytes_remaining();
                        let at = grantable
                            .iter()
                            .position(|e| e.progress.bytes_remaining() > mine)
                            .unwrap_or(grantable.len());
                        grantable.insert(at, entry);
                    }
                    Some(mut pos) => {
                        // The new packet can only have raised this
                        // message's priority; bubble it toward the
                        // head. Usually a single compare.
                        let mine = grantable[pos].progress.bytes_remaining();
                        while pos > 0
                            && grantable[pos - 1].progress.bytes_remaining() > mine
                        {
                            grantable.swap(pos - 1, pos);
                            pos -= 1;
                        }
                    }
                }
            }
        }

        self.check_grants(&mut grantable);
    }

    /// Issue grants to the top `max_overcommit` messages that have
    /// less than an RTT of authorized-but-unreceived data.
    fn check_grants(&self, grantable: &mut Vec<GrantEntry>) {
        let rtt = self.config.rtt_bytes;
        for (rank, entry) in grantable
            .iter()
            .take(self.config.max_overcommit)
            .enumerate()
        {
            let received = entry.progress.received();
            let incoming = entry.progress.incoming();
            if incoming.saturating_sub(received) >= rtt {
                continue;
            }
            let new_grant = (incoming + self.config.grant_increment)
                .max(received + rtt)
                .min(entry.progress.total_length);
            let prev = entry.progress.raise_incoming(new_grant);
            if new_grant <= prev {
                continue;
            }

            // Head of the list gets the highest scheduled level, each
            // position below it one level less.
            let priority = self.config.max_sched_prio.saturating_sub(rank as u8);
            self.xmit_control(
                entry.peer.addr,
                entry.sock.local_port(entry.key.is_client),
                entry.key.peer_port,
                entry.key.id,
                Control::Grant {
                    offset: new_grant,
                    priority,
                },
            );
            log::trace!(
                "granted id {} to offset {} at priority {}",
                entry.key.id,
                new_grant,
                priority
            );
        }
    }

    /// Make sure a message is no longer tracked by the scheduler; used
    /// during RPC teardown. Freed capacity is re-granted immediately.
    pub(crate) fn remove_from_grantable(&self, progress: &Arc<MsgInProgress>) {
        let mut grantable = self.grantable.lock().unwrap();
        if let Some(pos) = grantable.iter().position(|e| e.same_message(progress)) {
            grantable.remove(pos);
            self.check_grants(&mut grantable);
        }
    }

    /// Number of messages currently tracked (test hook).
    #[cfg(test)]
    pub(crate) fn num_grantable(&self) -> usize {
        self.grantable.lock().unwrap().len()
    }
}
