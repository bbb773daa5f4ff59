//! Noise handshake over the pre-negotiated handshake stream.
//!
//! The XX pattern runs with a fresh x25519 static key per handshake; the
//! stable ed25519 identity is bound to it by a signed payload carried in the
//! second and third handshake messages. The prologue ties the session to the
//! DTLS certificates on both sides, so a DTLS man-in-the-middle cannot
//! terminate the data channel without failing handshake authentication.
//!
//! Role inversion is deliberate and load-bearing: the transport dialer runs
//! the Noise *responder*, the listener the *initiator*. The dialer already
//! pinned the listener's certificate through the certhash address, and the
//! prologue ordering below assumes exactly this assignment.

use multihash::Multihash;
use prost::Message as _;
use snow::Builder;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::identity::{Keypair, PublicKey};
use crate::stream::Stream;

const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_SHA256";
const PROLOGUE_PREFIX: &[u8] = b"libp2p-webrtc-noise:";
const STATIC_KEY_DOMAIN: &[u8] = b"noise-libp2p-static-key:";

// generous upper bound for one noise handshake frame
const MAX_FRAME_LEN: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandshakeRole {
    Initiator,
    Responder,
}

/// Binds the Noise session to both DTLS certificates. `inbound` refers to the
/// transport direction: an accepting listener feeds `remote ‖ local`, a
/// dialer `local ‖ remote`; both derive the identical byte string.
pub(crate) fn build_prologue(
    local_fingerprint: &Multihash<64>,
    remote_fingerprint: &Multihash<64>,
    inbound: bool,
) -> Vec<u8> {
    let local = local_fingerprint.to_bytes();
    let remote = remote_fingerprint.to_bytes();
    let mut prologue =
        Vec::with_capacity(PROLOGUE_PREFIX.len() + local.len() + remote.len());
    prologue.extend_from_slice(PROLOGUE_PREFIX);
    if inbound {
        prologue.extend_from_slice(&remote);
        prologue.extend_from_slice(&local);
    } else {
        prologue.extend_from_slice(&local);
        prologue.extend_from_slice(&remote);
    }
    prologue
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct HandshakePayload {
    #[prost(bytes = "vec", optional, tag = "1")]
    identity_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    identity_sig: Option<Vec<u8>>,
}

/// Runs the handshake over `stream` and returns the authenticated remote
/// identity key. No peer-ID comparison happens here; the transport re-checks
/// the derived peer ID against its expectation afterwards.
pub(crate) async fn run_handshake(
    role: HandshakeRole,
    stream: &Stream,
    identity: &Keypair,
    prologue: &[u8],
) -> Result<PublicKey, TransportError> {
    trace!(target: "webrtc_direct::noise", ?role, "starting noise handshake");

    let builder = Builder::new(
        NOISE_PARAMS
            .parse()
            .map_err(|err| TransportError::Noise(format!("invalid noise params: {err}")))?,
    );
    let static_keypair = builder.generate_keypair().map_err(map_noise_err)?;
    let builder = builder
        .local_private_key(&static_keypair.private)
        .prologue(prologue);
    let mut state = match role {
        HandshakeRole::Initiator => builder.build_initiator().map_err(map_noise_err)?,
        HandshakeRole::Responder => builder.build_responder().map_err(map_noise_err)?,
    };

    let payload = signed_payload(identity, &static_keypair.public);
    let mut buf = vec![0u8; MAX_FRAME_LEN];

    let remote_identity = match role {
        HandshakeRole::Initiator => {
            // -> e
            let len = state.write_message(&[], &mut buf).map_err(map_noise_err)?;
            write_frame(stream, &buf[..len]).await?;

            // <- e, ee, s, es + payload
            let frame = read_frame(stream).await?;
            let len = state
                .read_message(&frame, &mut buf)
                .map_err(map_noise_err)?;
            let remote = verify_payload(&buf[..len], &state)?;

            // -> s, se + payload
            let len = state
                .write_message(&payload, &mut buf)
                .map_err(map_noise_err)?;
            write_frame(stream, &buf[..len]).await?;
            remote
        }
        HandshakeRole::Responder => {
            // <- e
            let frame = read_frame(stream).await?;
            state
                .read_message(&frame, &mut buf)
                .map_err(map_noise_err)?;

            // -> e, ee, s, es + payload
            let len = state
                .write_message(&payload, &mut buf)
                .map_err(map_noise_err)?;
            write_frame(stream, &buf[..len]).await?;

            // <- s, se + payload
            let frame = read_frame(stream).await?;
            let len = state
                .read_message(&frame, &mut buf)
                .map_err(map_noise_err)?;
            verify_payload(&buf[..len], &state)?
        }
    };

    debug!(
        target: "webrtc_direct::noise",
        ?role,
        remote_peer = %remote_identity.to_peer_id(),
        "noise handshake complete"
    );
    Ok(remote_identity)
}

fn signed_payload(identity: &Keypair, noise_static_pub: &[u8]) -> Vec<u8> {
    let mut bound = Vec::with_capacity(STATIC_KEY_DOMAIN.len() + noise_static_pub.len());
    bound.extend_from_slice(STATIC_KEY_DOMAIN);
    bound.extend_from_slice(noise_static_pub);
    HandshakePayload {
        identity_key: Some(identity.public().to_bytes().to_vec()),
        identity_sig: Some(identity.sign(&bound)),
    }
    .encode_to_vec()
}

fn verify_payload(
    payload: &[u8],
    state: &snow::HandshakeState,
) -> Result<PublicKey, TransportError> {
    let remote_static = state
        .get_remote_static()
        .ok_or_else(|| TransportError::Noise("remote static key missing".into()))?;
    let decoded = HandshakePayload::decode(payload)
        .map_err(|err| TransportError::Noise(format!("malformed identity payload: {err}")))?;
    let key_bytes = decoded
        .identity_key
        .ok_or_else(|| TransportError::Noise("identity key missing".into()))?;
    let sig = decoded
        .identity_sig
        .ok_or_else(|| TransportError::Noise("identity signature missing".into()))?;
    let identity = PublicKey::from_bytes(&key_bytes)
        .map_err(|err| TransportError::Noise(err.to_string()))?;

    let mut bound = Vec::with_capacity(STATIC_KEY_DOMAIN.len() + remote_static.len());
    bound.extend_from_slice(STATIC_KEY_DOMAIN);
    bound.extend_from_slice(remote_static);
    identity
        .verify(&bound, &sig)
        .map_err(|err| TransportError::Noise(format!("identity binding rejected: {err}")))?;
    Ok(identity)
}

async fn write_frame(stream: &Stream, frame: &[u8]) -> Result<(), TransportError> {
    let len = u16::try_from(frame.len())
        .map_err(|_| TransportError::Noise("handshake frame too large".into()))?;
    let mut out = Vec::with_capacity(2 + frame.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(frame);
    stream
        .write(&out)
        .await
        .map_err(|err| TransportError::Noise(format!("handshake write failed: {err}")))?;
    Ok(())
}

async fn read_frame(stream: &Stream) -> Result<Vec<u8>, TransportError> {
    let mut len_bytes = [0u8; 2];
    read_exact(stream, &mut len_bytes).await?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Noise("handshake frame too large".into()));
    }
    let mut frame = vec![0u8; len];
    read_exact(stream, &mut frame).await?;
    Ok(frame)
}

async fn read_exact(stream: &Stream, buf: &mut [u8]) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream
            .read(&mut buf[filled..])
            .await
            .map_err(|err| TransportError::Noise(format!("handshake read failed: {err}")))?;
        if n == 0 {
            return Err(TransportError::Noise(
                "handshake stream closed early".into(),
            ));
        }
        filled += n;
    }
    Ok(())
}

fn map_noise_err(err: snow::Error) -> TransportError {
    TransportError::Noise(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::certhash_multihash;
    use crate::stream::tests_support::memory_stream_pair;
    use sha2::{Digest, Sha256};

    fn fingerprints() -> (Multihash<64>, Multihash<64>) {
        (
            certhash_multihash(&Sha256::digest(b"listener cert")).unwrap(),
            certhash_multihash(&Sha256::digest(b"dialer cert")).unwrap(),
        )
    }

    #[test]
    fn prologues_agree_across_roles() {
        let (listener_fp, dialer_fp) = fingerprints();
        // listener: inbound, sees the dialer as remote
        let inbound = build_prologue(&listener_fp, &dialer_fp, true);
        // dialer: outbound, sees the listener as remote
        let outbound = build_prologue(&dialer_fp, &listener_fp, false);
        assert_eq!(inbound, outbound);
    }

    #[test]
    fn prologue_depends_on_both_certificates() {
        let (a, b) = fingerprints();
        assert_ne!(
            build_prologue(&a, &b, true),
            build_prologue(&b, &a, true)
        );
    }

    #[tokio::test]
    async fn handshake_authenticates_both_identities() {
        let (listener_stream, dialer_stream) = memory_stream_pair();
        let listener_key = Keypair::generate();
        let dialer_key = Keypair::generate();

        let (listener_fp, dialer_fp) = fingerprints();
        let listener_prologue = build_prologue(&listener_fp, &dialer_fp, true);
        let dialer_prologue = build_prologue(&dialer_fp, &listener_fp, false);

        let listener_id = listener_key.peer_id();
        let dialer_id = dialer_key.peer_id();

        let listener_side = tokio::spawn(async move {
            run_handshake(
                HandshakeRole::Initiator,
                &listener_stream,
                &listener_key,
                &listener_prologue,
            )
            .await
        });
        let dialer_remote = run_handshake(
            HandshakeRole::Responder,
            &dialer_stream,
            &dialer_key,
            &dialer_prologue,
        )
        .await
        .unwrap();
        let listener_remote = listener_side.await.unwrap().unwrap();

        assert_eq!(dialer_remote.to_peer_id(), listener_id);
        assert_eq!(listener_remote.to_peer_id(), dialer_id);
    }

    #[tokio::test]
    async fn disagreeing_prologues_fail_the_handshake() {
        let (listener_stream, dialer_stream) = memory_stream_pair();
        let listener_key = Keypair::generate();
        let dialer_key = Keypair::generate();

        let (listener_fp, dialer_fp) = fingerprints();
        let listener_prologue = build_prologue(&listener_fp, &dialer_fp, true);
        // the dialer saw a different certificate, as under a DTLS MITM
        let mitm_fp = certhash_multihash(&Sha256::digest(b"mitm cert")).unwrap();
        let dialer_prologue = build_prologue(&dialer_fp, &mitm_fp, false);

        let listener_side = tokio::spawn(async move {
            run_handshake(
                HandshakeRole::Initiator,
                &listener_stream,
                &listener_key,
                &listener_prologue,
            )
            .await
        });
        let dialer_res = run_handshake(
            HandshakeRole::Responder,
            &dialer_stream,
            &dialer_key,
            &dialer_prologue,
        )
        .await;
        let listener_res = listener_side.await.unwrap();

        assert!(dialer_res.is_err() || listener_res.is_err());
    }
}
