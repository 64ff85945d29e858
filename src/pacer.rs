//! Output pacing: the NIC-queue estimator, the throttled list, and the
//! pacer thread.
//!
//! SRPT only works if short messages can preempt long ones at the NIC,
//! which requires the NIC queue to stay short. A single atomic tracks
//! the cycle time at which the queue is expected to drain; senders that
//! would push it past the configured limit park their RPC on the
//! throttled list instead, and the pacer thread drains that list as
//! capacity appears.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::homa::Homa;
use crate::rpc::{Rpc, RpcKey};
use crate::sock::Sock;

/// How long the pacer sleeps between wake checks when idle. The wake
/// condvar cuts this short whenever work arrives.
const PACER_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Packets transmitted per top-level pacer pass; bounds the time the
/// pacer keeps an RPC's bucket locked.
const PACER_BATCH: usize = 5;

/// One RPC parked because the NIC queue was full.
pub(crate) struct ThrottledEntry {
    pub(crate) sock: Arc<Sock>,
    pub(crate) key: RpcKey,

    /// Message bytes left at insertion time; orders the list.
    pub(crate) bytes_left: u32,
}

impl Homa {
    /// Account for a packet of `wire_bytes` in the NIC-queue estimate.
    /// Returns false (and leaves the estimate untouched) if the queue
    /// is over its limit and `force` is not set.
    pub(crate) fn check_nic_queue(&self, wire_bytes: u64, force: bool) -> bool {
        let pkt_cycles = wire_bytes * self.cycles_per_kbyte / 1000;
        loop {
            let clock = self.time.now_cycles();
            let idle = self.link_idle_time.load(Ordering::Relaxed);
            if clock + self.max_nic_queue_cycles < idle && !force {
                return false;
            }
            let new_idle = idle.max(clock) + pkt_cycles;
            if self
                .link_idle_time
                .compare_exchange(idle, new_idle, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Park an RPC with unsent granted bytes on the throttled list
    /// (SRPT order) and wake the pacer. Caller holds the RPC's bucket
    /// lock. No-op if already parked.
    pub(crate) fn add_to_throttled(&self, sock: &Arc<Sock>, rpc: &mut Rpc) {
        if rpc.in_throttled {
            return;
        }
        let Some(msgout) = rpc.msgout.as_ref() else {
            return;
        };
        let bytes_left = msgout.bytes_left();
        rpc.in_throttled = true;
        let entry = ThrottledEntry {
            sock: sock.clone(),
            key: Homa::key_for(rpc),
            bytes_left,
        };
        {
            let mut throttled = self.throttled.lock().unwrap();
            let at = throttled
                .iter()
                .position(|e| e.bytes_left > bytes_left)
                .unwrap_or(throttled.len());
            throttled.insert(at, entry);
        }
        self.pacer_wake.notify_one();
    }

    /// Drop an RPC's throttled entry, if it has one.
    pub(crate) fn remove_from_throttled(&self, sock: &Arc<Sock>, key: &RpcKey) {
        self.throttled
            .lock()
            .unwrap()
            .retain(|e| !(e.key == *key && Arc::ptr_eq(&e.sock, sock)));
    }

    /// Opportunistic pacer invocation. The pacer thread can be held off
    /// the CPU at inconvenient times, so the hot paths call this to
    /// keep the link busy; the thread is only the backstop.
    pub(crate) fn check_pacer(&self) {
        if self.throttled.lock().unwrap().is_empty() {
            return;
        }
        if self.time.now_cycles() + self.max_nic_queue_cycles
            < self.link_idle_time.load(Ordering::Relaxed)
        {
            return;
        }
        self.pacer_xmit();
    }

    /// Transmit packets from the head of the throttled list. Only one
    /// instance runs at a time; extras return immediately.
    pub(crate) fn pacer_xmit(&self) {
        if self.pacer_active.swap(true, Ordering::SeqCst) {
            return;
        }

        'passes: for pass in 0..PACER_BATCH {
            // Wait for the NIC queue to drain below its limit before
            // queueing more. Later passes give up instead of waiting,
            // so one call never monopolizes the caller.
            let idle = self.link_idle_time.load(Ordering::Relaxed);
            let mut now = self.time.now_cycles();
            while now + self.max_nic_queue_cycles < idle {
                if pass != 0 || self.pacer_exit.load(Ordering::SeqCst) {
                    break 'passes;
                }
                std::hint::spin_loop();
                now = self.time.now_cycles();
            }

            // Lock the head RPC's bucket with try-only while holding
            // the throttle lock: the entry keeps the RPC findable, and
            // try-lock avoids inverting the bucket → throttle order.
            // If the bucket is busy, give up; the next invocation will
            // retry.
            let throttled = self.throttled.lock().unwrap();
            let Some(head) = throttled.first() else {
                break;
            };
            let sock = head.sock.clone();
            let key = head.key;
            let bucket = sock.table(key.is_client).try_bucket(key.id);
            drop(throttled);
            let Some(mut bucket) = bucket else {
                self.metrics.pacer_skipped_rpcs.inc();
                break;
            };

            let Some(rpc) = bucket.find_mut(&key) else {
                // The RPC died while parked.
                drop(bucket);
                self.remove_from_throttled(&sock, &key);
                continue;
            };

            // The head RPC earned its slot: push the first packet
            // through even if the estimator disagrees, so the pacer
            // can't starve behind competing senders.
            self.xmit_data(&sock, rpc, true);

            let drained = rpc.msgout.as_ref().map_or(true, |m| !m.transmittable());
            let server_done = !rpc.is_client
                && rpc.msgout.as_ref().is_some_and(|m| m.fully_sent());
            if drained {
                rpc.in_throttled = false;
                drop(bucket);
                self.remove_from_throttled(&sock, &key);
                if server_done {
                    // Response fully sent; the server RPC is finished.
                    self.rpc_free(&sock, key);
                }
            }
        }

        self.pacer_active.store(false, Ordering::SeqCst);
    }
}

/// Start the pacer thread for `homa`. The thread holds only a weak
/// reference between iterations, so dropping the engine shuts it down.
pub(crate) fn spawn(homa: &Arc<Homa>) -> thread::JoinHandle<()> {
    let weak = Arc::downgrade(homa);
    thread::Builder::new()
        .name("homa-pacer".into())
        .spawn(move || loop {
            let Some(homa) = weak.upgrade() else {
                break;
            };
            if homa.pacer_exit.load(Ordering::SeqCst) {
                break;
            }
            homa.pacer_xmit();

            // Sleep while there is nothing to pace; otherwise yield so
            // inbound processing is not locked out.
            let throttled = homa.throttled.lock().unwrap();
            if throttled.is_empty() && !homa.pacer_exit.load(Ordering::SeqCst) {
                let _ = homa.pacer_wake.wait_timeout(throttled, PACER_IDLE_WAIT);
            } else {
                drop(throttled);
                thread::yield_now();
            }
        })
        .expect("failed to spawn pacer thread")
}
