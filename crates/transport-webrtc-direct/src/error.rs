//! Error types for the transport layers.

use thiserror::Error;

use crate::identity::PeerId;

/// Errors from the certhash / fingerprint codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("multiaddr is missing a certhash component")]
    BadMultiaddr,
    #[error("unsupported multihash code 0x{0:x}")]
    UnsupportedHash(u64),
    #[error("hash algorithm {0} is not available")]
    HashUnavailable(&'static str),
    #[error("malformed fingerprint: {0}")]
    Malformed(String),
}

/// Errors surfaced by dial, listen, and accept.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bad multiaddr: {0}")]
    BadMultiaddr(String),
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
    #[error("peer connection setup: {0}")]
    PeerConnectionSetup(String),
    #[error("peer connection did not open before the deadline")]
    HandshakeTimeout,
    #[error("ice connection has no selected candidate pair")]
    NoSelectedPair,
    #[error("noise handshake: {0}")]
    Noise(String),
    #[error("peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
    #[error("resource limit: {0}")]
    ResourceLimit(#[from] ResourceLimit),
    #[error("gater rejected connection")]
    GaterRejected,
    #[error("listener closed")]
    ListenerClosed,
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Rejection from the resource manager scope hierarchy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ResourceLimit(pub String);

/// Errors observed by stream users. Terminal errors are sticky: once a stream
/// fails with `Reset` or `ChannelClosed`, every later call returns the same.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream reset")]
    Reset,
    #[error("data channel closed")]
    ChannelClosed,
    #[error("another read is in progress")]
    ConcurrentRead,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("malformed stream message: {0}")]
    Malformed(String),
    #[error("data channel io: {0}")]
    Io(String),
}
