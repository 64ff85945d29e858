//! The boundary between the transport core and the packet I/O layer.
//!
//! The core never touches raw sockets or NIC rings; it hands finished
//! frames to a [`PacketSink`] and receives inbound frames through
//! [`crate::Homa::pkt_recv`]. Hosts provide a sink for their datapath;
//! [`QueueSink`] is an in-memory implementation used by the tests and
//! benchmarks.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use thiserror::Error;

/// The sink refused or failed to transmit a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("packet sink rejected the frame")]
pub struct SinkError;

/// Outbound packet interface the core transmits through.
///
/// Implementations must be cheap to call: `xmit` is invoked with locks
/// held and must only queue, never block.
pub trait PacketSink: Send + Sync + 'static {
    /// Path MTU in bytes of IP payload.
    fn mtu(&self) -> usize;

    /// Largest buffer the device accepts for segmentation offload.
    fn gso_max_size(&self) -> usize;

    /// Verify that the destination is routable. Called once per peer,
    /// when it is first added to the peer table.
    fn route(&self, dst: Ipv4Addr) -> Result<(), SinkError>;

    /// Queue one frame for transmission to `dst`.
    fn xmit(&self, dst: Ipv4Addr, frame: &[u8]) -> Result<(), SinkError>;
}

/// An in-memory sink that records every frame, in order.
pub struct QueueSink {
    mtu: usize,
    gso_max_size: usize,
    frames: Mutex<VecDeque<(Ipv4Addr, Vec<u8>)>>,
}

impl QueueSink {
    pub fn new(mtu: usize, gso_max_size: usize) -> Self {
        Self {
            mtu,
            gso_max_size,
            frames: Mutex::new(VecDeque::new()),
        }
    }

    /// Take every queued frame.
    pub fn drain(&self) -> Vec<(Ipv4Addr, Vec<u8>)> {
        self.frames.lock().unwrap().drain(..).collect()
    }

    /// Number of frames currently queued.
    pub fn len(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PacketSink for QueueSink {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn gso_max_size(&self) -> usize {
        self.gso_max_size
    }

    fn route(&self, _dst: Ipv4Addr) -> Result<(), SinkError> {
        Ok(())
    }

    fn xmit(&self, dst: Ipv4Addr, frame: &[u8]) -> Result<(), SinkError> {
        self.frames.lock().unwrap().push_back((dst, frame.to_vec()));
        Ok(())
    }
}
