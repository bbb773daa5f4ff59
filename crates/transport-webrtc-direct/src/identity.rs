//! Peer identities: ed25519 keypairs and the peer IDs derived from them.
//!
//! A peer ID is the SHA2-256 multihash of the raw 32-byte public key,
//! rendered base58. It is derived once at transport construction and
//! re-derived from the Noise-authenticated remote key for the post-handshake
//! identity check.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use multihash::Multihash;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Raw length of an ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

const SHA2_256_CODE: u64 = 0x12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid public key")]
    InvalidKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("invalid peer id encoding")]
    InvalidPeerId,
}

/// Stable ed25519 identity keypair of a local peer.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    pub fn peer_id(&self) -> PeerId {
        self.public().to_peer_id()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_vec()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// An ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let raw: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| IdentityError::InvalidKey)?;
        VerifyingKey::from_bytes(&raw)
            .map(Self)
            .map_err(|_| IdentityError::InvalidKey)
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.0.to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), IdentityError> {
        let sig =
            Signature::from_slice(signature).map_err(|_| IdentityError::InvalidSignature)?;
        self.0
            .verify(message, &sig)
            .map_err(|_| IdentityError::VerificationFailed)
    }

    pub fn to_peer_id(&self) -> PeerId {
        PeerId::from_public_key(self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

/// Multihash-based identifier of a peer, derived from its public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(Multihash<64>);

impl PeerId {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = Sha256::digest(key.to_bytes());
        // wrap cannot fail for a 32-byte digest
        let mh = Multihash::wrap(SHA2_256_CODE, &digest).expect("digest fits multihash");
        Self(mh)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        Multihash::from_bytes(bytes)
            .map(Self)
            .map_err(|_| IdentityError::InvalidPeerId)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0.to_bytes()).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_stable_for_a_key() {
        let keypair = Keypair::generate();
        assert_eq!(keypair.peer_id(), keypair.public().to_peer_id());

        let restored = PublicKey::from_bytes(&keypair.public().to_bytes()).unwrap();
        assert_eq!(restored.to_peer_id(), keypair.peer_id());
    }

    #[test]
    fn distinct_keys_have_distinct_peer_ids() {
        assert_ne!(Keypair::generate().peer_id(), Keypair::generate().peer_id());
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"handshake binding");
        keypair.public().verify(b"handshake binding", &sig).unwrap();
        assert_eq!(
            keypair.public().verify(b"tampered", &sig),
            Err(IdentityError::VerificationFailed)
        );
    }

    #[test]
    fn peer_id_round_trips_through_bytes() {
        let id = Keypair::generate().peer_id();
        assert_eq!(PeerId::from_bytes(&id.to_bytes()).unwrap(), id);
    }
}
