//! Type aliases used in this library.

/// [`u64`]: RPC identifier. Chosen by the client; unique among all RPCs
/// issued from one client port. Zero is reserved (it means "no RPC" in
/// receive-interest hand-offs).
pub type RpcId = u64;

/// [`u16`]: Homa port number. Ports below [`crate::HOMA_MIN_CLIENT_PORT`]
/// are bindable server ports; the rest are allocated to sockets as client
/// ports.
pub type Port = u16;

/// [`u8`]: Packet priority level, `0..HOMA_MAX_PRIORITIES`. Larger is
/// more urgent.
pub type Priority = u8;
