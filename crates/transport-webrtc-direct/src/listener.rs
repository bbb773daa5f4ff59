//! ICE-Lite listener: one UDP socket, many in-flight sessions.
//!
//! The socket reader routes datagrams by STUN ufrag (or, for non-STUN
//! traffic, by source address) into per-session queues. The first binding
//! request with an unknown ufrag admits a session — unless the in-flight cap
//! is reached, in which case the datagram is dropped without a response and
//! the dialer retries. Admitted sessions negotiate ICE and Noise off the
//! reader task; `accept` only ever yields fully authenticated connections.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use multiaddr::{Multiaddr, Protocol};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::connection::Connection;
use crate::error::TransportError;
use crate::identity::PeerId;
use crate::mux::{ufrag_from_stun, MuxedConn, UdpDemux};
use crate::noise::{run_handshake, HandshakeRole};
use crate::scope::{Direction, ScopeHandle};
use crate::sdp::render_client_sdp;
use crate::stream::Stream;
use crate::transport::{
    detach_handshake_channel, multiaddr_from_socket_addr, new_peer_connection, noise_prologue,
    pc_setup, NewPeerConnection, PeerConnectionRole, TransportContext,
};

const ACCEPT_QUEUE_DEPTH: usize = 16;
const INBOUND_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
const RECV_BUFFER_SIZE: usize = 2048;

/// Accepts authenticated connections on one UDP socket.
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    ctx: Arc<TransportContext>,
    demux: Arc<UdpDemux>,
    local_multiaddr: Multiaddr,
    accept_rx: AsyncMutex<mpsc::Receiver<Connection>>,
    accept_tx: mpsc::Sender<Connection>,
    in_flight: AtomicU32,
    closed: AtomicBool,
    close_notify: Notify,
    loop_shutdown: Notify,
}

impl Listener {
    pub(crate) async fn bind(
        ctx: Arc<TransportContext>,
        addr: SocketAddr,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|err| TransportError::PeerConnectionSetup(format!("bind udp: {err}")))?;
        let socket = Arc::new(socket);
        let demux = UdpDemux::new(Arc::clone(&socket)).map_err(pc_setup)?;

        let local_multiaddr = multiaddr_from_socket_addr(demux.local_addr())
            .with(Protocol::WebRTC)
            .with(Protocol::Certhash(ctx.local_certhash));

        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        let inner = Arc::new(ListenerInner {
            ctx,
            demux,
            local_multiaddr,
            accept_rx: AsyncMutex::new(accept_rx),
            accept_tx,
            in_flight: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            loop_shutdown: Notify::new(),
        });
        debug!(
            target: "webrtc_direct::listener",
            addr = %inner.local_multiaddr,
            "listener bound"
        );
        tokio::spawn(socket_loop(Arc::clone(&inner), socket));
        Ok(Self { inner })
    }

    /// The listen address, certhash included.
    pub fn multiaddr(&self) -> Multiaddr {
        self.inner.local_multiaddr.clone()
    }

    /// Yields the next connection that passed ICE, Noise, and the gater.
    pub async fn accept(&self) -> Result<Connection, TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::ListenerClosed);
        }
        let mut rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            conn = rx.recv() => conn.ok_or(TransportError::ListenerClosed),
            _ = self.inner.close_notify.notified() => Err(TransportError::ListenerClosed),
        }
    }

    /// Shuts the socket fan-out and every in-flight session.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.demux.close_all();
        self.inner.loop_shutdown.notify_waiters();
        self.inner.loop_shutdown.notify_one();
        self.inner.close_notify.notify_waiters();
        // stored permit for a waiter that has not polled yet
        self.inner.close_notify.notify_one();
        debug!(
            target: "webrtc_direct::listener",
            addr = %self.inner.local_multiaddr,
            "listener closed"
        );
    }
}

impl ListenerInner {
    /// Admission decision for a STUN binding request with an unknown ufrag.
    /// Returns the freshly registered session conn, or `None` to drop the
    /// datagram (no response; the dialer retransmits).
    fn try_admit(&self, ufrag: &str) -> Option<Arc<MuxedConn>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let max = self.ctx.config.max_in_flight_connections;
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= max {
                trace!(
                    target: "webrtc_direct::listener",
                    ufrag,
                    in_flight = current,
                    "in-flight cap reached, dropping binding request"
                );
                return None;
            }
            match self.in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        Some(self.demux.conn_for_ufrag(ufrag))
    }
}

async fn socket_loop(inner: Arc<ListenerInner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = inner.loop_shutdown.notified() => break,
        };
        let (len, src) = match received {
            Ok(received) => received,
            Err(err) => {
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                warn!(target: "webrtc_direct::listener", error = %err, "udp recv failed");
                continue;
            }
        };
        let packet = &buf[..len];

        match ufrag_from_stun(packet) {
            Some(ufrag) => {
                if let Some(conn) = inner.demux.lookup_by_ufrag(&ufrag) {
                    inner.demux.register_address(&conn, src);
                    conn.push_packet(packet, src);
                } else if let Some(conn) = inner.try_admit(&ufrag) {
                    inner.demux.register_address(&conn, src);
                    conn.push_packet(packet, src);
                    tokio::spawn(handle_inbound(Arc::clone(&inner), ufrag, src));
                }
            }
            None => match inner.demux.lookup_by_addr(&src) {
                Some(conn) => conn.push_packet(packet, src),
                None => trace!(
                    target: "webrtc_direct::listener",
                    %src,
                    "dropping datagram from unbound address"
                ),
            },
        }
    }
    trace!(target: "webrtc_direct::listener", "socket loop finished");
}

async fn handle_inbound(inner: Arc<ListenerInner>, ufrag: String, src: SocketAddr) {
    let result = inbound_handshake(&inner, &ufrag, src).await;
    inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    match result {
        Ok(conn) => {
            if inner.accept_tx.send(conn.clone()).await.is_err() {
                debug!(
                    target: "webrtc_direct::listener",
                    %ufrag,
                    "listener closed before surfacing connection"
                );
                let _ = conn.close().await;
            }
        }
        Err(err) => {
            debug!(
                target: "webrtc_direct::listener",
                %ufrag,
                %src,
                error = %err,
                "inbound handshake failed"
            );
            inner.demux.remove_ufrag(&ufrag);
        }
    }
}

/// Mirror of the dial sequence with roles reversed: the remote ufrag is
/// already known from STUN, the synthesized SDP is the dialer's offer, and
/// Noise runs in the initiator role.
async fn inbound_handshake(
    inner: &Arc<ListenerInner>,
    ufrag: &str,
    src: SocketAddr,
) -> Result<Connection, TransportError> {
    let ctx = &inner.ctx;
    let remote_maddr = multiaddr_from_socket_addr(src).with(Protocol::WebRTC);
    if !ctx.gater.intercept_accept(&remote_maddr) {
        return Err(TransportError::GaterRejected);
    }

    let scope = ScopeHandle::new(
        ctx.rcmgr
            .open_connection(Direction::Inbound, &remote_maddr)?,
    );
    let npc = match new_peer_connection(
        ctx,
        PeerConnectionRole::Listener {
            demux: Arc::clone(&inner.demux),
        },
        ufrag,
    )
    .await
    {
        Ok(npc) => npc,
        Err(err) => {
            scope.done();
            return Err(err);
        }
    };
    let pc = Arc::clone(&npc.pc);

    match negotiate_inbound(inner, npc, &remote_maddr, &scope, ufrag, src).await {
        Ok(conn) => Ok(conn),
        Err(err) => {
            let _ = pc.close().await;
            scope.done();
            Err(err)
        }
    }
}

async fn negotiate_inbound(
    inner: &Arc<ListenerInner>,
    npc: NewPeerConnection,
    remote_maddr: &Multiaddr,
    scope: &ScopeHandle,
    ufrag: &str,
    src: SocketAddr,
) -> Result<Connection, TransportError> {
    let ctx = &inner.ctx;
    let NewPeerConnection {
        pc,
        ufrag: session_ufrag,
        handshake_channel,
        connected,
        handshake_open,
    } = npc;

    let offer = RTCSessionDescription::offer(render_client_sdp(src, &session_ufrag))
        .map_err(pc_setup)?;
    pc.set_remote_description(offer).await.map_err(pc_setup)?;
    let answer = pc.create_answer(None).await.map_err(pc_setup)?;
    pc.set_local_description(answer).await.map_err(pc_setup)?;

    trace!(target: "webrtc_direct::listener", ufrag, %src, "awaiting ice connectivity");
    match timeout(INBOUND_HANDSHAKE_TIMEOUT, connected).await {
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
        detach_handshake_channel(&handshake_channel, &handshake_open, INBOUND_HANDSHAKE_TIMEOUT)
            .await?;

    let conn = Connection::new(
        Direction::Inbound,
        Arc::clone(&pc),
        scope.clone(),
        ctx.local_peer,
        inner.local_multiaddr.clone(),
        remote_maddr.clone(),
    );

    let remote_peer = secure_inbound(ctx, &pc, &conn, &hs_stream).await?;

    if !ctx
        .gater
        .intercept_secured(Direction::Inbound, &remote_peer, remote_maddr)
    {
        return Err(TransportError::GaterRejected);
    }

    let _ = hs_stream.close().await;

    let demux = Arc::clone(&inner.demux);
    let session_key = ufrag.to_owned();
    conn.set_on_close(Box::new(move || demux.remove_ufrag(&session_key)));

    debug!(
        target: "webrtc_direct::listener",
        remote_peer = %remote_peer,
        %src,
        "inbound connection secured"
    );
    Ok(conn)
}

async fn secure_inbound(
    ctx: &Arc<TransportContext>,
    pc: &Arc<webrtc::peer_connection::RTCPeerConnection>,
    conn: &Connection,
    hs_stream: &Stream,
) -> Result<PeerId, TransportError> {
    let prologue = noise_prologue(ctx, pc, true).await?;
    let remote_key =
        run_handshake(HandshakeRole::Initiator, hs_stream, &ctx.keypair, &prologue).await?;
    let remote_peer = remote_key.to_peer_id();
    conn.scope_set_peer(&remote_peer)?;
    conn.set_authenticated_remote(remote_key);
    Ok(remote_peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gater::AllowAllGater;
    use crate::identity::Keypair;
    use crate::scope::NullResourceManager;
    use crate::transport::Config;

    async fn test_listener(max_in_flight: u32) -> Listener {
        let config = Config::default()
            .with_max_in_flight_connections(max_in_flight)
            .unwrap();
        let ctx = Arc::new(TransportContext {
            keypair: Keypair::generate(),
            local_peer: Keypair::generate().peer_id(),
            certificate: webrtc::peer_connection::certificate::RTCCertificate::from_key_pair(
                rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap(),
            )
            .unwrap(),
            local_certhash: crate::fingerprint::certhash_multihash(&[0u8; 32]).unwrap(),
            config,
            gater: Arc::new(AllowAllGater),
            rcmgr: Arc::new(NullResourceManager),
        });
        Listener::bind(ctx, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn admission_respects_the_in_flight_cap() {
        let listener = test_listener(1).await;
        let inner = &listener.inner;

        let first = inner.try_admit("ufrag-one");
        assert!(first.is_some());
        // cap reached: the second session's datagrams are dropped
        assert!(inner.try_admit("ufrag-two").is_none());

        // completing (here: failing) the first negotiation frees the slot
        inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        inner.demux.remove_ufrag("ufrag-one");
        assert!(inner.try_admit("ufrag-two").is_some());
    }

    #[tokio::test]
    async fn closed_listener_admits_nothing() {
        let listener = test_listener(8).await;
        listener.close().await;
        assert!(listener.inner.try_admit("ufrag").is_none());
        assert!(matches!(
            listener.accept().await,
            Err(TransportError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn listen_multiaddr_carries_the_certhash() {
        let listener = test_listener(8).await;
        let addr = listener.multiaddr();
        assert!(addr.iter().any(|p| matches!(p, Protocol::WebRTC)));
        assert!(addr.iter().any(|p| matches!(p, Protocol::Certhash(_))));
    }
}
