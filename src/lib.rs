//! Core engine of a receiver-driven, priority-scheduled RPC transport
//! (the Homa protocol).
//!
//! The engine multiplexes independent request/response RPCs over a
//! datagram network: receivers drive bandwidth allocation by granting
//! the messages with the fewest bytes remaining, and senders pace their
//! output to keep the NIC queue short enough for those priorities to
//! matter. Packet I/O and the clock are abstracted behind
//! [`PacketSink`] and [`TimeSource`]; the host feeds inbound frames to
//! [`Homa::pkt_recv`] and drives recovery with [`Homa::tick`].

mod config;
mod dispatch;
mod error;
mod grant;
mod homa;
mod metrics;
mod msgin;
mod msgout;
mod pacer;
mod peer;
mod pkthdr;
mod rpc;
mod sock;
mod time;
mod timer;
mod transport;
pub mod type_alias;

pub use self::config::{
    HomaConfig, HOMA_MAX_MESSAGE_LENGTH, HOMA_MAX_PRIORITIES, HOMA_MIN_CLIENT_PORT, IPPROTO_HOMA,
};
pub use self::error::HomaError;
pub use self::homa::{Homa, HomaSocket, RecvFlags, RecvMsg};
pub use self::metrics::{Counter, Metrics};
pub use self::pkthdr::NUM_PKT_TYPES;
pub use self::time::{ManualTime, MonotonicTime, TimeSource};
pub use self::transport::{PacketSink, QueueSink, SinkError};

#[cfg(test)]
mod tests;
