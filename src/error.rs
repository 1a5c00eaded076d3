//! Error taxonomy for the swarm core.
//!
//! One `thiserror` enum per failure domain, matching the semantic error
//! kinds of the wire protocol and lifecycle rather than wrapping a single
//! catch-all type. Internal invariant violations (unknown message tag,
//! forbidden null sender) are not representable here — they are bugs and
//! are raised with `debug_assert!`/`unreachable!` at the call site.

use std::net::SocketAddr;

/// Failures while parsing or authenticating an inbound frame sequence.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame count {got} below header minimum {min}")]
    TooFewFrames { got: usize, min: usize },
    #[error("unknown message type tag {0:#04x}")]
    UnknownTag(u8),
    #[error("signature verification failed")]
    BadSignature,
    #[error("malformed public key")]
    BadPublicKey,
    #[error("payload frame does not match schema for this message type: {0}")]
    BadPayload(String),
}

/// Failures from a single-peer operation (dial, per-peer send, per-peer
/// query). These are swallowed by callers that operate on a whole peer set
/// but are surfaced as `Result` here so the caller can decide.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer not found: {0}")]
    PeerNotFound(SocketAddr),
    #[error("peer speaks a different application protocol: local={local} remote={remote}")]
    DifferentAppProtocolVersion { local: i32, remote: i32 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation timed out")]
    Timeout,
}

/// Fatal errors raised by swarm-level operations.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("swarm already running")]
    AlreadyRunning,
    #[error("operation requires a running swarm")]
    NoSwarmContext,
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("relay error: {0}")]
    Relay(String),
}
