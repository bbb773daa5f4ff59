//! Certificate fingerprints and the certhash multiaddr codec.
//!
//! A listener advertises `/certhash/<multibase(multihash(sha256(der)))>`;
//! dialers decode that component to pin the remote DTLS certificate before
//! Noise binds it to the peer identity. Fingerprints are raw digests here:
//! the interspersed `aa:bb:…` form only appears at the boundary with the
//! WebRTC engine, which reports fingerprints in that shape.

use multiaddr::{Multiaddr, Protocol};
use multibase::Base;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use webrtc::dtls_transport::dtls_fingerprint::RTCDtlsFingerprint;

use crate::error::FingerprintError;

/// Multihash code for SHA2-256, the only hash the SDP table recognises.
pub const SHA2_256_CODE: u64 = 0x12;

const SDP_SHA256: &str = "sha-256";

/// Maps a multihash code to the hash name used on an SDP fingerprint line.
pub fn supported_sdp_hash(code: u64) -> Option<&'static str> {
    match code {
        SHA2_256_CODE => Some(SDP_SHA256),
        _ => None,
    }
}

/// Hashes a certificate in DER form with the algorithm selected by the
/// multihash `code`. The digest is returned raw, without separators.
pub fn fingerprint(cert_der: &[u8], code: u64) -> Result<Vec<u8>, FingerprintError> {
    match code {
        SHA2_256_CODE => Ok(Sha256::digest(cert_der).to_vec()),
        _ => Err(FingerprintError::HashUnavailable("unknown")),
    }
}

/// Wraps a SHA2-256 digest into the multihash carried by certhash components
/// and the Noise prologue.
pub fn certhash_multihash(digest: &[u8]) -> Result<Multihash<64>, FingerprintError> {
    Multihash::wrap(SHA2_256_CODE, digest)
        .map_err(|err| FingerprintError::Malformed(err.to_string()))
}

/// Extracts and decodes the certhash component of a dialable multiaddr.
pub fn decode_remote_fingerprint(addr: &Multiaddr) -> Result<Multihash<64>, FingerprintError> {
    addr.iter()
        .find_map(|p| match p {
            Protocol::Certhash(mh) => Some(mh),
            _ => None,
        })
        .ok_or(FingerprintError::BadMultiaddr)
}

/// Encodes an engine-reported DTLS fingerprint as the multibase string form
/// of a certhash (base64url over a sha2-256 multihash).
pub fn encode_dtls_fingerprint(fp: &RTCDtlsFingerprint) -> Result<String, FingerprintError> {
    let digest = decode_interspersed_hex(&fp.value)?;
    let mh = certhash_multihash(&digest)?;
    Ok(multibase::encode(Base::Base64Url, mh.to_bytes()))
}

/// Parses the `aa:bb:…` fingerprint form into raw digest bytes.
pub fn decode_interspersed_hex(value: &str) -> Result<Vec<u8>, FingerprintError> {
    if value.is_empty() {
        return Err(FingerprintError::Malformed("empty fingerprint".into()));
    }
    value
        .split(':')
        .map(|byte| {
            if byte.len() != 2 {
                return Err(FingerprintError::Malformed(format!(
                    "expected two hex digits per byte, got {byte:?}"
                )));
            }
            let mut out = [0u8; 1];
            hex::decode_to_slice(byte, &mut out)
                .map_err(|err| FingerprintError::Malformed(err.to_string()))?;
            Ok(out[0])
        })
        .collect()
}

/// Renders raw digest bytes in the interspersed `aa:bb:…` form used on SDP
/// fingerprint lines.
pub fn encode_interspersed_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fingerprint() -> RTCDtlsFingerprint {
        let digest = Sha256::digest(b"certificate bytes");
        RTCDtlsFingerprint {
            algorithm: "sha-256".to_owned(),
            value: encode_interspersed_hex(&digest),
        }
    }

    #[test]
    fn interspersed_hex_round_trip() {
        let bytes = Sha256::digest(b"x").to_vec();
        let encoded = encode_interspersed_hex(&bytes);
        assert_eq!(decode_interspersed_hex(&encoded).unwrap(), bytes);
    }

    #[test]
    fn interspersed_hex_rejects_malformed_input() {
        assert!(decode_interspersed_hex("").is_err());
        assert!(decode_interspersed_hex("aab:cc").is_err());
        assert!(decode_interspersed_hex("zz:zz").is_err());
    }

    #[test]
    fn dtls_fingerprint_round_trips_through_certhash() {
        let fp = sample_fingerprint();
        let encoded = encode_dtls_fingerprint(&fp).unwrap();

        let (_, bytes) = multibase::decode(&encoded).unwrap();
        let mh = Multihash::<64>::from_bytes(&bytes).unwrap();
        assert_eq!(mh.code(), SHA2_256_CODE);
        assert_eq!(
            mh.digest(),
            decode_interspersed_hex(&fp.value).unwrap().as_slice()
        );

        let addr: Multiaddr = "/ip4/127.0.0.1/udp/4001/webrtc"
            .parse::<Multiaddr>()
            .unwrap()
            .with(Protocol::Certhash(mh));
        assert_eq!(decode_remote_fingerprint(&addr).unwrap(), mh);
    }

    #[test]
    fn missing_certhash_is_rejected() {
        let addr: Multiaddr = "/ip4/127.0.0.1/udp/4001/webrtc".parse().unwrap();
        assert_eq!(
            decode_remote_fingerprint(&addr),
            Err(FingerprintError::BadMultiaddr)
        );
    }

    #[test]
    fn sdp_hash_table_only_knows_sha256() {
        assert_eq!(supported_sdp_hash(SHA2_256_CODE), Some("sha-256"));
        assert_eq!(supported_sdp_hash(0xff), None);
    }

    #[test]
    fn fingerprint_matches_direct_digest() {
        let der = b"some der bytes";
        assert_eq!(
            fingerprint(der, SHA2_256_CODE).unwrap(),
            Sha256::digest(der).to_vec()
        );
        assert!(fingerprint(der, 0x13).is_err());
    }
}
