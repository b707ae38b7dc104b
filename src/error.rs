//! Error kinds for the RTP/RTCP core.
//!
//! Packet-level parse failures and jitter-buffer status codes are modeled
//! as a typed enum rather than `anyhow::Error` because callers (the
//! listener loop, the jitter buffer's own tests) need to match on the
//! specific kind: jitter overflow/underflow are returned silently,
//! `SocketTimeout` is a loop-continuation signal, and the rest are
//! logged-and-dropped.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("payload of {len} bytes plus header exceeds MTU {mtu}")]
    OversizedPayload { len: usize, mtu: usize },

    #[error("packet truncated: {0} bytes")]
    TruncatedPacket(usize),

    #[error("unsupported RTP/RTCP version: {0}")]
    UnsupportedVersion(u8),

    #[error("RTCP sub-packet declared a length that overruns the buffer")]
    MalformedLength,

    #[error("unrecognized RTCP packet type: {0}")]
    UnknownPacketType(u8),

    #[error("jitter buffer input overflow")]
    InputOverflow,

    #[error("jitter buffer output underflow")]
    OutputUnderflow,

    #[error("socket closed")]
    SocketClosed,

    #[error("socket receive timed out")]
    SocketTimeout,
}
