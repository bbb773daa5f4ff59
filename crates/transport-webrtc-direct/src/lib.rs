//! Peer-to-peer transport over WebRTC data channels.
//!
//! Listeners advertise `/ip/../udp/../webrtc/certhash/..` addresses;
//! the certhash pins the listener's DTLS certificate, a stylized local-only
//! SDP exchange brings ICE up without any signalling server, and a Noise
//! handshake over a pre-negotiated data channel binds both DTLS certificates
//! to stable public-key peer identities. The result is a mutually
//! authenticated connection carrying multiplexed byte streams with
//! half-close and reset semantics.

pub mod connection;
pub mod error;
pub mod fingerprint;
pub mod gater;
pub mod identity;
pub mod listener;
pub mod message;
mod mux;
mod noise;
pub mod scope;
pub mod sdp;
pub mod stream;
pub mod transport;

pub use connection::Connection;
pub use error::{FingerprintError, ResourceLimit, StreamError, TransportError};
pub use gater::{AllowAllGater, ConnectionGater};
pub use identity::{Keypair, PeerId, PublicKey};
pub use listener::Listener;
pub use message::{Flag, MAX_MESSAGE_SIZE};
pub use scope::{ConnectionScope, Direction, NullResourceManager, ResourceManager};
pub use stream::{MessageChannel, Stream};
pub use transport::{Config, ConfigError, IceTimeouts, Transport};
