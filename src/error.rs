//! Error types surfaced by the transport.

use thiserror::Error;

use crate::type_alias::*;

/// Errors produced by socket operations and stored in failed RPCs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HomaError {
    /// The socket has been shut down.
    #[error("socket has been shut down")]
    Shutdown,

    /// A client RPC was aborted because the peer stayed silent through
    /// the entire resend budget.
    #[error("RPC {0} timed out waiting for the peer")]
    Timeout(RpcId),

    /// Nonblocking receive found no ready message.
    #[error("operation would block")]
    WouldBlock,

    /// Message length is zero or exceeds the configured cap.
    #[error("invalid message length {0}")]
    InvalidMessageLength(usize),

    /// The id passed to `recv` or `reply` does not name a usable RPC.
    #[error("no matching RPC with id {0}")]
    UnknownRpc(RpcId),

    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The requested port is outside the server range or already taken.
    #[error("port {0} is unavailable")]
    PortUnavailable(Port),

    /// No route to the destination host.
    #[error("peer {0} is unreachable")]
    Unreachable(std::net::Ipv4Addr),
}
