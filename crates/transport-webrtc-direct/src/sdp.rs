//! Local SDP synthesis.
//!
//! There is no signalling exchange: both endpoints derive the other side's
//! session description from the multiaddress alone. The rendered text must be
//! byte-identical for identical `(addr, ufrag, fingerprint)` inputs, since
//! the DTLS fingerprint check keys off it deterministically.

use std::net::SocketAddr;

use multihash::Multihash;
use rand::rngs::OsRng;
use rand::Rng;

use crate::error::FingerprintError;
use crate::fingerprint::{encode_interspersed_hex, supported_sdp_hash};

/// Length of the random ICE username fragment; the ufrag doubles as the ICE
/// password and as the listener's demultiplexing key.
pub const UFRAG_LEN: usize = 32;

const UFRAG_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// The maximum data-channel message size both sides advertise.
pub(crate) const MAX_SDP_MESSAGE_SIZE: usize = 16384;

// The listener never pins the dialer's certificate in SDP; the dialer is
// authenticated by Noise. A fixed placeholder keeps the offer parseable.
const DUMMY_FINGERPRINT: &str = "ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff:ff";

/// Generates a cryptographically random ICE username fragment.
pub fn gen_ufrag(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| UFRAG_ALPHABET[rng.gen_range(0..UFRAG_ALPHABET.len())] as char)
        .collect()
}

fn ip_version(addr: &SocketAddr) -> &'static str {
    if addr.is_ipv4() {
        "IP4"
    } else {
        "IP6"
    }
}

/// Renders the ICE-Lite answer a dialer pretends to have received from the
/// listener: certhash-pinned fingerprint, shared ufrag/password, and a single
/// host candidate at the listener's UDP address.
pub fn render_server_sdp(
    addr: SocketAddr,
    ufrag: &str,
    certhash: &Multihash<64>,
) -> Result<String, FingerprintError> {
    let algorithm = supported_sdp_hash(certhash.code())
        .ok_or(FingerprintError::UnsupportedHash(certhash.code()))?;
    let fingerprint = encode_interspersed_hex(certhash.digest());
    let ipv = ip_version(&addr);
    let ip = addr.ip();
    let port = addr.port();
    Ok(format!(
        "v=0\r\n\
         o=- 0 0 IN {ipv} {ip}\r\n\
         s=-\r\n\
         t=0 0\r\n\
         a=ice-lite\r\n\
         m=application {port} UDP/DTLS/SCTP webrtc-datachannel\r\n\
         c=IN {ipv} {ip}\r\n\
         a=mid:0\r\n\
         a=ice-options:ice2\r\n\
         a=ice-ufrag:{ufrag}\r\n\
         a=ice-pwd:{ufrag}\r\n\
         a=fingerprint:{algorithm} {fingerprint}\r\n\
         a=setup:passive\r\n\
         a=sctp-port:5000\r\n\
         a=max-message-size:{MAX_SDP_MESSAGE_SIZE}\r\n\
         a=candidate:1 1 UDP 1 {ip} {port} typ host\r\n\
         a=end-of-candidates\r\n"
    ))
}

/// Renders the offer a listener pretends to have received from a dialer at
/// `addr` with the given ufrag. No candidates are listed; the dialer's
/// address is learned from its STUN binding requests.
pub fn render_client_sdp(addr: SocketAddr, ufrag: &str) -> String {
    let ipv = ip_version(&addr);
    let ip = addr.ip();
    let port = addr.port();
    format!(
        "v=0\r\n\
         o=- 0 0 IN {ipv} {ip}\r\n\
         s=-\r\n\
         c=IN {ipv} {ip}\r\n\
         t=0 0\r\n\
         m=application {port} UDP/DTLS/SCTP webrtc-datachannel\r\n\
         a=mid:0\r\n\
         a=ice-options:ice2\r\n\
         a=ice-ufrag:{ufrag}\r\n\
         a=ice-pwd:{ufrag}\r\n\
         a=fingerprint:sha-256 {DUMMY_FINGERPRINT}\r\n\
         a=setup:actpass\r\n\
         a=sctp-port:5000\r\n\
         a=max-message-size:{MAX_SDP_MESSAGE_SIZE}\r\n"
    )
}
