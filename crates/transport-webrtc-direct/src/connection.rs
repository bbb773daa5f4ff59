//! An authenticated connection over one peer connection.
//!
//! Streams are data channels: locally opened ones through `open_stream`,
//! remotely opened ones surfaced by `accept_stream`. The remote public key
//! is set exactly once, when the Noise handshake succeeds; until then the
//! connection exists but is not handed to users. Whatever path closes the
//! connection, the resource scope's `done` runs exactly once and every live
//! stream is torn down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use multiaddr::Multiaddr;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{ResourceLimit, StreamError, TransportError};
use crate::identity::{PeerId, PublicKey};
use crate::scope::{Direction, ScopeHandle};
use crate::stream::{DetachedChannel, Stream};

const OPEN_STREAM_TIMEOUT: Duration = Duration::from_secs(10);
const INCOMING_STREAM_BUFFER: usize = 32;

/// A mutually authenticated, stream-multiplexed connection to one peer.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    direction: Direction,
    pc: Arc<RTCPeerConnection>,
    scope: ScopeHandle,
    local_peer: PeerId,
    local_addr: Multiaddr,
    remote_addr: Multiaddr,
    remote_peer: OnceLock<PeerId>,
    remote_public_key: OnceLock<PublicKey>,
    streams: Mutex<Vec<Arc<Stream>>>,
    incoming_rx: AsyncMutex<mpsc::Receiver<Arc<Stream>>>,
    closed: AtomicBool,
    close_notify: Notify,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Connection {
    pub(crate) fn new(
        direction: Direction,
        pc: Arc<RTCPeerConnection>,
        scope: ScopeHandle,
        local_peer: PeerId,
        local_addr: Multiaddr,
        remote_addr: Multiaddr,
    ) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_STREAM_BUFFER);
        let inner = Arc::new(ConnectionInner {
            direction,
            pc,
            scope,
            local_peer,
            local_addr,
            remote_addr,
            remote_peer: OnceLock::new(),
            remote_public_key: OnceLock::new(),
            streams: Mutex::new(Vec::new()),
            incoming_rx: AsyncMutex::new(incoming_rx),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            on_close: Mutex::new(None),
        });
        register_callbacks(&inner, incoming_tx);
        Self { inner }
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    /// The authenticated remote peer. `None` only while the handshake is
    /// still in flight; connections surfaced by dial/accept always carry it.
    pub fn remote_peer(&self) -> Option<PeerId> {
        self.inner.remote_peer.get().copied()
    }

    /// The remote identity key authenticated by Noise.
    pub fn remote_public_key(&self) -> Option<PublicKey> {
        self.inner.remote_public_key.get().copied()
    }

    pub fn local_multiaddr(&self) -> Multiaddr {
        self.inner.local_addr.clone()
    }

    pub fn remote_multiaddr(&self) -> Multiaddr {
        self.inner.remote_addr.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Opens a new outgoing stream on a fresh data channel.
    pub async fn open_stream(&self) -> Result<Arc<Stream>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let dc = self
            .inner
            .pc
            .create_data_channel("", None)
            .await
            .map_err(|err| TransportError::PeerConnectionSetup(err.to_string()))?;

        let opened = Arc::new(Notify::new());
        let open_signal = Arc::clone(&opened);
        dc.on_open(Box::new(move || {
            let notify = Arc::clone(&open_signal);
            Box::pin(async move {
                notify.notify_waiters();
                notify.notify_one();
            })
        }));
        if dc.ready_state() != RTCDataChannelState::Open {
            timeout(OPEN_STREAM_TIMEOUT, opened.notified())
                .await
                .map_err(|_| {
                    TransportError::PeerConnectionSetup("stream open timed out".into())
                })?;
        }

        let detached = dc
            .detach()
            .await
            .map_err(|err| TransportError::PeerConnectionSetup(err.to_string()))?;
        let stream = Arc::new(Stream::new(
            dc.id(),
            Arc::new(DetachedChannel::new(detached)),
        ));
        self.inner.register_stream(&stream);
        trace!(
            target: "webrtc_direct::connection",
            stream_id = stream.id(),
            remote = ?self.remote_peer(),
            "opened stream"
        );
        Ok(stream)
    }

    /// Waits for the next stream opened by the remote peer.
    pub async fn accept_stream(&self) -> Result<Arc<Stream>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut rx = self.inner.incoming_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream.ok_or(TransportError::ConnectionClosed),
            _ = self.inner.close_notify.notified() => Err(TransportError::ConnectionClosed),
        }
    }

    /// Closes the connection, all its streams, and releases the scope.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.inner.shutdown(StreamError::ChannelClosed).await;
        Ok(())
    }

    pub(crate) fn set_authenticated_remote(&self, key: PublicKey) {
        let _ = self.inner.remote_public_key.set(key);
        let _ = self.inner.remote_peer.set(key.to_peer_id());
    }

    pub(crate) fn scope_set_peer(&self, peer: &PeerId) -> Result<(), ResourceLimit> {
        self.inner.scope.set_peer(peer)
    }

    /// Hook run once on close; the listener uses it to drop the session's
    /// demux entry so the ufrag becomes reusable.
    pub(crate) fn set_on_close(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.inner.on_close.lock() = Some(hook);
    }
}

impl ConnectionInner {
    fn register_stream(&self, stream: &Arc<Stream>) {
        let mut streams = self.streams.lock();
        streams.retain(|s| !s.is_terminated());
        streams.push(Arc::clone(stream));
    }

    async fn shutdown(&self, stream_err: StreamError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            target: "webrtc_direct::connection",
            remote = ?self.remote_peer.get(),
            "closing connection"
        );
        let streams: Vec<_> = self.streams.lock().drain(..).collect();
        for stream in streams {
            stream.close_for_shutdown(stream_err.clone()).await;
        }
        if let Err(err) = self.pc.close().await {
            warn!(
                target: "webrtc_direct::connection",
                error = %err,
                "peer connection close failed"
            );
        }
        self.scope.done();
        self.close_notify.notify_waiters();
        // stored permit for a waiter that has not polled yet
        self.close_notify.notify_one();
        let hook = self.on_close.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

fn register_callbacks(inner: &Arc<ConnectionInner>, incoming_tx: mpsc::Sender<Arc<Stream>>) {
    let weak = Arc::downgrade(inner);
    inner.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let weak = weak.clone();
        let incoming_tx = incoming_tx.clone();
        Box::pin(async move {
            // guards against the channel reporting open both via callback
            // and via the ready-state check below
            let announced = Arc::new(AtomicBool::new(false));
            let channel = Arc::clone(&dc);
            let open_guard = Arc::clone(&announced);
            let open_weak = weak.clone();
            let open_tx = incoming_tx.clone();
            dc.on_open(Box::new(move || {
                let weak = open_weak.clone();
                let incoming_tx = open_tx.clone();
                let channel = Arc::clone(&channel);
                let announced = Arc::clone(&open_guard);
                Box::pin(async move {
                    if announced.swap(true, Ordering::AcqRel) {
                        return;
                    }
                    let Some(inner) = weak.upgrade() else { return };
                    accept_channel(&inner, channel, &incoming_tx).await;
                })
            }));
            if dc.ready_state() == RTCDataChannelState::Open
                && !announced.swap(true, Ordering::AcqRel)
            {
                let Some(inner) = weak.upgrade() else { return };
                accept_channel(&inner, dc, &incoming_tx).await;
            }
        })
    }));

    let weak = Arc::downgrade(inner);
    inner
        .pc
        .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                trace!(
                    target: "webrtc_direct::connection",
                    ?state,
                    "peer connection state changed"
                );
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    if let Some(inner) = weak.upgrade() {
                        // a dead peer connection aborts every stream
                        inner.shutdown(StreamError::Reset).await;
                    }
                }
            })
        }));
}

async fn accept_channel(
    inner: &Arc<ConnectionInner>,
    dc: Arc<RTCDataChannel>,
    incoming_tx: &mpsc::Sender<Arc<Stream>>,
) {
    match dc.detach().await {
        Ok(detached) => {
            let stream = Arc::new(Stream::new(
                dc.id(),
                Arc::new(DetachedChannel::new(detached)),
            ));
            inner.register_stream(&stream);
            if incoming_tx.try_send(Arc::clone(&stream)).is_err() {
                warn!(
                    target: "webrtc_direct::connection",
                    stream_id = stream.id(),
                    "incoming stream queue full, resetting stream"
                );
                stream.reset().await;
            }
        }
        Err(err) => {
            warn!(
                target: "webrtc_direct::connection",
                error = %err,
                "failed to detach incoming data channel"
            );
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // last-resort scope release when a connection is leaked un-closed
        if !self.closed.load(Ordering::Acquire) {
            self.scope.done();
        }
    }
}
