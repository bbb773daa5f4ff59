//! Transport construction, configuration, and the outbound dial path.
//!
//! A dial runs the stylized no-signalling offer/answer: create a local offer,
//! synthesize the listener's answer from its multiaddress, wait for ICE, then
//! authenticate over the pre-negotiated handshake channel with Noise. The
//! transport holds exactly one certificate for its lifetime — the certhash is
//! part of every advertised address, so regenerating it would invalidate
//! them all.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use multiaddr::{Multiaddr, Protocol};
use multihash::Multihash;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::time::{timeout, Duration};
use tracing::{debug, trace};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::dtls_transport::dtls_role::DTLSRole;
use webrtc::ice::udp_mux::UDPMux;
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::peer_connection::certificate::RTCCertificate;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::connection::Connection;
use crate::error::{FingerprintError, TransportError};
use crate::fingerprint::{
    certhash_multihash, decode_interspersed_hex, decode_remote_fingerprint, fingerprint,
    supported_sdp_hash, SHA2_256_CODE,
};
use crate::gater::{AllowAllGater, ConnectionGater};
use crate::identity::{Keypair, PeerId};
use crate::listener::Listener;
use crate::mux::UdpDemux;
use crate::noise::{build_prologue, run_handshake, HandshakeRole};
use crate::scope::{Direction, NullResourceManager, ResourceManager, ScopeHandle};
use crate::sdp::{gen_ufrag, render_server_sdp, UFRAG_LEN};
use crate::stream::{DetachedChannel, Stream};

pub const DEFAULT_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_FAILED_TIMEOUT: Duration = Duration::from_secs(25);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_IN_FLIGHT_CONNECTIONS: u32 = 128;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// ICE liveness timers handed to the engine. A zero duration disables the
/// corresponding check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IceTimeouts {
    pub disconnect: Duration,
    pub failed: Duration,
    pub keepalive: Duration,
}

impl Default for IceTimeouts {
    fn default() -> Self {
        Self {
            disconnect: DEFAULT_DISCONNECTED_TIMEOUT,
            failed: DEFAULT_FAILED_TIMEOUT,
            keepalive: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("disconnect timeout cannot be greater than failed timeout")]
    DisconnectExceedsFailed,
    #[error("keepalive interval must be less than the disconnect timeout")]
    KeepaliveExceedsDisconnect,
    #[error("max in-flight connections must be positive")]
    ZeroInFlight,
}

/// Immutable transport configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) ice_timeouts: IceTimeouts,
    pub(crate) max_in_flight_connections: u32,
    pub(crate) dial_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_timeouts: IceTimeouts::default(),
            max_in_flight_connections: DEFAULT_MAX_IN_FLIGHT_CONNECTIONS,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

impl Config {
    /// Sets the ICE disconnect, failed, and keepalive timers. Invariants:
    /// `failed >= disconnect` and `disconnect > keepalive`, each applying
    /// only between timers that are actually enabled (non-zero).
    pub fn with_ice_timeouts(mut self, timeouts: IceTimeouts) -> Result<Self, ConfigError> {
        if !timeouts.disconnect.is_zero() {
            if !timeouts.failed.is_zero() && timeouts.failed < timeouts.disconnect {
                return Err(ConfigError::DisconnectExceedsFailed);
            }
            if !timeouts.keepalive.is_zero() && timeouts.disconnect <= timeouts.keepalive {
                return Err(ConfigError::KeepaliveExceedsDisconnect);
            }
        }
        self.ice_timeouts = timeouts;
        Ok(self)
    }

    /// Caps concurrent inbound negotiations; excess STUN requests are
    /// silently dropped.
    pub fn with_max_in_flight_connections(mut self, max: u32) -> Result<Self, ConfigError> {
        if max == 0 {
            return Err(ConfigError::ZeroInFlight);
        }
        self.max_in_flight_connections = max;
        Ok(self)
    }

    /// Bounds the whole dial: ICE connectivity, channel detach, and Noise.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}

pub(crate) struct TransportContext {
    pub(crate) keypair: Keypair,
    pub(crate) local_peer: PeerId,
    pub(crate) certificate: RTCCertificate,
    pub(crate) local_certhash: Multihash<64>,
    pub(crate) config: Config,
    pub(crate) gater: Arc<dyn ConnectionGater>,
    pub(crate) rcmgr: Arc<dyn ResourceManager>,
}

/// The WebRTC transport: dials certhash multiaddresses and listens for
/// browser or server peers on a single UDP socket per listener.
pub struct Transport {
    ctx: Arc<TransportContext>,
}

impl Transport {
    pub fn new(keypair: Keypair, config: Config) -> Result<Self, TransportError> {
        Self::with_hooks(
            keypair,
            config,
            Arc::new(AllowAllGater),
            Arc::new(NullResourceManager),
        )
    }

    /// Constructor wiring in a connection gater and resource manager.
    pub fn with_hooks(
        keypair: Keypair,
        config: Config,
        gater: Arc<dyn ConnectionGater>,
        rcmgr: Arc<dyn ResourceManager>,
    ) -> Result<Self, TransportError> {
        // P-256: Chromium accepts only ECDSA P-256 or RSA certificates for
        // the DTLS handshake.
        let cert_keypair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(pc_setup)?;
        let certificate = RTCCertificate::from_key_pair(cert_keypair).map_err(pc_setup)?;
        let local_certhash = certificate_certhash(&certificate)?;
        let local_peer = keypair.peer_id();
        debug!(
            target: "webrtc_direct",
            %local_peer,
            "transport ready"
        );
        Ok(Self {
            ctx: Arc::new(TransportContext {
                keypair,
                local_peer,
                certificate,
                local_certhash,
                config,
                gater,
                rcmgr,
            }),
        })
    }

    pub fn local_peer(&self) -> PeerId {
        self.ctx.local_peer
    }

    /// The multihash advertised in this transport's listen addresses.
    pub fn certhash(&self) -> Multihash<64> {
        self.ctx.local_certhash
    }

    /// Whether `addr` has the dialable shape
    /// `/ip/../udp/../webrtc/certhash/..`.
    pub fn can_dial(&self, addr: &Multiaddr) -> bool {
        dial_parts(addr).is_ok()
    }

    /// Binds a UDP socket and accepts certhash-addressed sessions on it.
    pub async fn listen(&self, addr: &Multiaddr) -> Result<Listener, TransportError> {
        let socket_addr = listen_socket_addr(addr)?;
        Listener::bind(Arc::clone(&self.ctx), socket_addr).await
    }

    /// Dials `addr` and authenticates the remote as `peer`.
    pub async fn dial(&self, addr: &Multiaddr, peer: PeerId) -> Result<Connection, TransportError> {
        let (raddr, certhash) = dial_parts(addr)?;
        supported_sdp_hash(certhash.code())
            .ok_or(FingerprintError::UnsupportedHash(certhash.code()))?;

        let scope = ScopeHandle::new(
            self.ctx
                .rcmgr
                .open_connection(Direction::Outbound, addr)?,
        );
        if let Err(err) = scope.set_peer(&peer) {
            scope.done();
            return Err(err.into());
        }

        match self.dial_inner(addr, raddr, &certhash, peer, &scope).await {
            Ok(conn) => Ok(conn),
            Err(err) => {
                scope.done();
                Err(err)
            }
        }
    }

    async fn dial_inner(
        &self,
        remote_maddr: &Multiaddr,
        raddr: SocketAddr,
        certhash: &Multihash<64>,
        peer: PeerId,
        scope: &ScopeHandle,
    ) -> Result<Connection, TransportError> {
        let ufrag = gen_ufrag(UFRAG_LEN);
        let npc = new_peer_connection(&self.ctx, PeerConnectionRole::Dialer, &ufrag).await?;
        let pc = Arc::clone(&npc.pc);
        let result =
            dial_negotiate(&self.ctx, npc, remote_maddr, raddr, certhash, peer, scope).await;
        if result.is_err() {
            let _ = pc.close().await;
        }
        result
    }
}

async fn dial_negotiate(
    ctx: &Arc<TransportContext>,
    npc: NewPeerConnection,
    remote_maddr: &Multiaddr,
    raddr: SocketAddr,
    certhash: &Multihash<64>,
    peer: PeerId,
    scope: &ScopeHandle,
) -> Result<Connection, TransportError> {
    let NewPeerConnection {
        pc,
        ufrag,
        handshake_channel,
        connected,
        handshake_open,
    } = npc;

    let offer = pc.create_offer(None).await.map_err(pc_setup)?;
    pc.set_local_description(offer).await.map_err(pc_setup)?;

    // Nothing crosses the wire here: the listener's answer is synthesized
    // from its multiaddress, with the certhash as the pinned fingerprint.
    let answer = RTCSessionDescription::answer(render_server_sdp(raddr, &ufrag, certhash)?)
        .map_err(pc_setup)?;
    pc.set_remote_description(answer).await.map_err(pc_setup)?;

    trace!(target: "webrtc_direct", %raddr, %ufrag, "dial negotiation started");
    match timeout(ctx.config.dial_timeout, connected).await {
        Err(_) => return Err(TransportError::HandshakeTimeout),
        Ok(Err(_)) => {
            return Err(TransportError::PeerConnectionSetup(
                "connected signal dropped".into(),
            ))
        }
        Ok(Ok(Err(err))) => return Err(err),
        Ok(Ok(Ok(()))) => {}
    }

    let hs_stream =
        detach_handshake_channel(&handshake_channel, &handshake_open, ctx.config.dial_timeout)
            .await?;

    // Different data channels multiplex over one SCTP association, so the
    // selected pair's local address is the connection's local address.
    let laddr = selected_local_addr(&pc).await?;
    let local_maddr = multiaddr_from_socket_addr(laddr).with(Protocol::WebRTC);

    let conn = Connection::new(
        Direction::Outbound,
        Arc::clone(&pc),
        scope.clone(),
        ctx.local_peer,
        local_maddr,
        remote_maddr.clone(),
    );

    let prologue = noise_prologue(ctx, &pc, false).await?;
    let remote_key =
        run_handshake(HandshakeRole::Responder, &hs_stream, &ctx.keypair, &prologue).await?;
    let actual = remote_key.to_peer_id();
    if actual != peer {
        return Err(TransportError::PeerIdMismatch {
            expected: peer,
            actual,
        });
    }
    conn.set_authenticated_remote(remote_key);

    if !ctx
        .gater
        .intercept_secured(Direction::Outbound, &peer, remote_maddr)
    {
        return Err(TransportError::GaterRejected);
    }

    let _ = hs_stream.close().await;
    debug!(target: "webrtc_direct", remote_peer = %peer, %raddr, "dial complete");
    Ok(conn)
}

pub(crate) enum PeerConnectionRole {
    Dialer,
    Listener { demux: Arc<UdpDemux> },
}

pub(crate) struct NewPeerConnection {
    pub(crate) pc: Arc<RTCPeerConnection>,
    pub(crate) ufrag: String,
    pub(crate) handshake_channel: Arc<RTCDataChannel>,
    pub(crate) connected: oneshot::Receiver<Result<(), TransportError>>,
    pub(crate) handshake_open: Arc<Notify>,
}

/// Builds a configured peer connection with deterministic ICE credentials
/// and the pre-negotiated handshake channel (`negotiated = true, id = 0`).
/// Both sides declare the channel identically so no DCEP is exchanged.
pub(crate) async fn new_peer_connection(
    ctx: &TransportContext,
    role: PeerConnectionRole,
    ufrag: &str,
) -> Result<NewPeerConnection, TransportError> {
    let mut setting = SettingEngine::default();
    setting.set_ice_credentials(ufrag.to_owned(), ufrag.to_owned());
    setting.detach_data_channels();
    let timeouts = ctx.config.ice_timeouts;
    setting.set_ice_timeouts(
        Some(timeouts.disconnect),
        Some(timeouts.failed),
        Some(timeouts.keepalive),
    );
    setting.set_include_loopback_candidate(true);
    if let PeerConnectionRole::Listener { demux } = &role {
        setting.set_lite(true);
        setting.set_udp_network(UDPNetwork::Muxed(
            Arc::clone(demux) as Arc<dyn UDPMux + Send + Sync>
        ));
        // Dialers pin `a=setup:passive` in the answer they synthesize, so
        // the listener must take the DTLS server role.
        setting
            .set_answering_dtls_role(DTLSRole::Server)
            .map_err(pc_setup)?;
        // The dialer's certificate is authenticated by the Noise prologue,
        // not by an SDP-pinned fingerprint.
        setting.disable_certificate_fingerprint_verification(true);
    }

    let api = APIBuilder::new().with_setting_engine(setting).build();
    let rtc_config = RTCConfiguration {
        certificates: vec![ctx.certificate.clone()],
        ..Default::default()
    };
    let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(pc_setup)?);

    let (connected_tx, connected) = oneshot::channel();
    let signal = Arc::new(Mutex::new(Some(connected_tx)));
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let signal = Arc::clone(&signal);
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Connected => {
                    if let Some(tx) = signal.lock().take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                RTCPeerConnectionState::Failed => {
                    if let Some(tx) = signal.lock().take() {
                        let _ = tx.send(Err(TransportError::PeerConnectionSetup(
                            "peer connection failed".into(),
                        )));
                    }
                }
                _ => {}
            }
        })
    }));

    let init = RTCDataChannelInit {
        negotiated: Some(0),
        ..Default::default()
    };
    let handshake_channel = pc
        .create_data_channel("", Some(init))
        .await
        .map_err(pc_setup)?;
    let handshake_open = Arc::new(Notify::new());
    let open_signal = Arc::clone(&handshake_open);
    handshake_channel.on_open(Box::new(move || {
        let notify = Arc::clone(&open_signal);
        Box::pin(async move {
            notify.notify_waiters();
            notify.notify_one();
        })
    }));

    Ok(NewPeerConnection {
        pc,
        ufrag: ufrag.to_owned(),
        handshake_channel,
        connected,
        handshake_open,
    })
}

/// Waits for the handshake channel to open, then detaches it from the
/// engine's callback API into a raw message stream.
pub(crate) async fn detach_handshake_channel(
    channel: &Arc<RTCDataChannel>,
    open: &Arc<Notify>,
    wait: Duration,
) -> Result<Stream, TransportError> {
    if channel.ready_state() != RTCDataChannelState::Open {
        timeout(wait, open.notified())
            .await
            .map_err(|_| TransportError::HandshakeTimeout)?;
    }
    let detached = channel.detach().await.map_err(pc_setup)?;
    Ok(Stream::new(0, Arc::new(DetachedChannel::new(detached))))
}

/// The effective local UDP address, read from the nominated candidate pair.
pub(crate) async fn selected_local_addr(
    pc: &Arc<RTCPeerConnection>,
) -> Result<SocketAddr, TransportError> {
    let pair = pc
        .sctp()
        .transport()
        .ice_transport()
        .get_selected_candidate_pair()
        .await
        .ok_or(TransportError::NoSelectedPair)?;
    let ip: IpAddr = pair
        .local
        .address
        .parse()
        .map_err(|_| TransportError::NoSelectedPair)?;
    Ok(SocketAddr::new(ip, pair.local.port))
}

/// Computes the Noise prologue binding both DTLS certificates; the remote
/// certificate is read from the SCTP transport after DTLS completes.
pub(crate) async fn noise_prologue(
    ctx: &TransportContext,
    pc: &Arc<RTCPeerConnection>,
    inbound: bool,
) -> Result<Vec<u8>, TransportError> {
    let remote_der = pc.sctp().transport().get_remote_certificate().await;
    if remote_der.is_empty() {
        return Err(TransportError::Noise("remote certificate unavailable".into()));
    }
    let digest = fingerprint(&remote_der, SHA2_256_CODE)?;
    let remote_certhash = certhash_multihash(&digest)?;
    Ok(build_prologue(&ctx.local_certhash, &remote_certhash, inbound))
}

fn certificate_certhash(certificate: &RTCCertificate) -> Result<Multihash<64>, TransportError> {
    let fp = certificate
        .get_fingerprints()
        .into_iter()
        .find(|fp| fp.algorithm == "sha-256")
        .ok_or_else(|| {
            TransportError::PeerConnectionSetup("certificate has no sha-256 fingerprint".into())
        })?;
    let digest = decode_interspersed_hex(&fp.value)?;
    Ok(certhash_multihash(&digest)?)
}

pub(crate) fn pc_setup<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::PeerConnectionSetup(err.to_string())
}

pub(crate) fn multiaddr_from_socket_addr(addr: SocketAddr) -> Multiaddr {
    let mut maddr = Multiaddr::empty();
    match addr.ip() {
        IpAddr::V4(ip) => maddr.push(Protocol::Ip4(ip)),
        IpAddr::V6(ip) => maddr.push(Protocol::Ip6(ip)),
    }
    maddr.push(Protocol::Udp(addr.port()));
    maddr
}

fn host_port(addr: &Multiaddr) -> Result<SocketAddr, TransportError> {
    let mut iter = addr.iter();
    let ip: IpAddr = match iter.next() {
        Some(Protocol::Ip4(ip)) => ip.into(),
        Some(Protocol::Ip6(ip)) => ip.into(),
        other => {
            return Err(TransportError::BadMultiaddr(format!(
                "expected ip component, got {other:?}"
            )))
        }
    };
    let port = match iter.next() {
        Some(Protocol::Udp(port)) => port,
        other => {
            return Err(TransportError::BadMultiaddr(format!(
                "expected udp component, got {other:?}"
            )))
        }
    };
    Ok(SocketAddr::new(ip, port))
}

fn require_webrtc(addr: &Multiaddr) -> Result<(), TransportError> {
    if addr.iter().any(|p| matches!(p, Protocol::WebRTC)) {
        Ok(())
    } else {
        Err(TransportError::BadMultiaddr(
            "missing webrtc component".into(),
        ))
    }
}

pub(crate) fn listen_socket_addr(addr: &Multiaddr) -> Result<SocketAddr, TransportError> {
    require_webrtc(addr)?;
    host_port(addr)
}

fn dial_parts(addr: &Multiaddr) -> Result<(SocketAddr, Multihash<64>), TransportError> {
    require_webrtc(addr)?;
    let socket_addr = host_port(addr)?;
    let certhash = decode_remote_fingerprint(addr)?;
    Ok((socket_addr, certhash))
}
