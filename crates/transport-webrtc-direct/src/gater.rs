//! Connection gater seam.

use multiaddr::Multiaddr;

use crate::identity::PeerId;
use crate::scope::Direction;

/// Admission hooks consulted while connections are established. A `false`
/// return discards the connection and releases everything already built.
pub trait ConnectionGater: Send + Sync {
    /// Called for inbound sessions before any handshake work is done.
    fn intercept_accept(&self, _remote: &Multiaddr) -> bool {
        true
    }

    /// Called after Noise has authenticated the remote peer.
    fn intercept_secured(&self, _direction: Direction, _peer: &PeerId, _remote: &Multiaddr) -> bool {
        true
    }
}

/// Gater that admits every connection.
#[derive(Debug, Default)]
pub struct AllowAllGater;

impl ConnectionGater for AllowAllGater {}
