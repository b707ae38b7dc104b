//! Bit-exact wire codec for RTP and RTCP (RFC 3550).

pub mod rtcp;
pub mod rtp;
