//! UDP demultiplexer: one socket fanned out to many ICE sessions.
//!
//! Inbound STUN binding requests carry the session ufrag in their USERNAME
//! attribute (`ufrag:ufrag`, since ufrag and password are set equal), so a
//! single datagram fully identifies its session. Non-STUN traffic routes by
//! source address once a session has bound one. Each session reads from a
//! virtual [`Conn`] backed by a bounded queue; the ICE engine pulls packets
//! from it exactly as it would from a private socket.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::trace;
use webrtc::ice::udp_mux::UDPMux;
use webrtc::stun::attributes::ATTR_USERNAME;
use webrtc::stun::message::{is_message as is_stun_message, Message as StunMessage};
use webrtc::util::{Conn, Error as UtilError};

/// Buffered datagrams per session; overflow drops the oldest unread packet.
/// Backpressure is ICE's job, not the demultiplexer's.
const SESSION_QUEUE_LIMIT: usize = 512;

/// Extracts the ufrag prefix of the USERNAME attribute from a STUN binding
/// request, or `None` for anything that is not a decodable STUN message.
pub(crate) fn ufrag_from_stun(packet: &[u8]) -> Option<String> {
    if !is_stun_message(packet) {
        return None;
    }
    let mut message = StunMessage::new();
    message.raw = packet.to_vec();
    message.decode().ok()?;
    let (attr, found) = message.attributes.get(ATTR_USERNAME);
    if !found {
        return None;
    }
    let username = String::from_utf8(attr.value).ok()?;
    username.split(':').next().map(str::to_owned)
}

pub(crate) struct UdpDemux {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    state: Mutex<DemuxState>,
    closed: AtomicBool,
}

#[derive(Default)]
struct DemuxState {
    by_ufrag: HashMap<String, Arc<MuxedConn>>,
    by_addr: HashMap<SocketAddr, Arc<MuxedConn>>,
}

impl UdpDemux {
    pub(crate) fn new(socket: Arc<UdpSocket>) -> std::io::Result<Arc<Self>> {
        let local_addr = socket.local_addr()?;
        Ok(Arc::new(Self {
            socket,
            local_addr,
            state: Mutex::new(DemuxState::default()),
            closed: AtomicBool::new(false),
        }))
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the session conn for `ufrag`, creating it if absent.
    pub(crate) fn conn_for_ufrag(&self, ufrag: &str) -> Arc<MuxedConn> {
        let mut state = self.state.lock();
        if let Some(conn) = state.by_ufrag.get(ufrag) {
            return Arc::clone(conn);
        }
        let conn = Arc::new(MuxedConn::new(
            ufrag.to_owned(),
            self.local_addr,
            Arc::clone(&self.socket),
        ));
        state.by_ufrag.insert(ufrag.to_owned(), Arc::clone(&conn));
        trace!(target: "webrtc_direct::mux", ufrag, "session registered");
        conn
    }

    pub(crate) fn lookup_by_ufrag(&self, ufrag: &str) -> Option<Arc<MuxedConn>> {
        self.state.lock().by_ufrag.get(ufrag).cloned()
    }

    pub(crate) fn lookup_by_addr(&self, addr: &SocketAddr) -> Option<Arc<MuxedConn>> {
        self.state.lock().by_addr.get(addr).cloned()
    }

    /// Binds `addr` to the session so later non-STUN datagrams route there.
    pub(crate) fn register_address(&self, conn: &Arc<MuxedConn>, addr: SocketAddr) {
        let mut state = self.state.lock();
        state.by_addr.insert(addr, Arc::clone(conn));
        conn.add_address(addr);
    }

    pub(crate) fn remove_ufrag(&self, ufrag: &str) {
        let removed = {
            let mut state = self.state.lock();
            let conn = state.by_ufrag.remove(ufrag);
            if let Some(conn) = &conn {
                for addr in conn.addresses() {
                    state.by_addr.remove(&addr);
                }
            }
            conn
        };
        if let Some(conn) = removed {
            conn.shutdown();
            trace!(target: "webrtc_direct::mux", ufrag, "session removed");
        }
    }

    pub(crate) fn session_count(&self) -> usize {
        self.state.lock().by_ufrag.len()
    }

    pub(crate) fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let drained = {
            let mut state = self.state.lock();
            state.by_addr.clear();
            state.by_ufrag.drain().collect::<Vec<_>>()
        };
        for (_, conn) in drained {
            conn.shutdown();
        }
    }
}

#[async_trait]
impl UDPMux for UdpDemux {
    async fn close(&self) -> Result<(), UtilError> {
        self.close_all();
        Ok(())
    }

    async fn get_conn(
        self: Arc<Self>,
        ufrag: &str,
    ) -> Result<Arc<dyn Conn + Send + Sync>, UtilError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UtilError::Other("demux closed".to_owned()));
        }
        Ok(self.conn_for_ufrag(ufrag))
    }

    async fn remove_conn_by_ufrag(&self, ufrag: &str) {
        self.remove_ufrag(ufrag);
    }
}

/// Virtual connection of one session: reads from the per-session queue,
/// writes through the shared socket.
pub(crate) struct MuxedConn {
    key: String,
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    queue: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    addresses: Mutex<Vec<SocketAddr>>,
    readable: Notify,
    closed: AtomicBool,
}

impl MuxedConn {
    fn new(key: String, local_addr: SocketAddr, socket: Arc<UdpSocket>) -> Self {
        Self {
            key,
            local_addr,
            socket,
            queue: Mutex::new(VecDeque::new()),
            addresses: Mutex::new(Vec::new()),
            readable: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn push_packet(&self, data: &[u8], src: SocketAddr) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= SESSION_QUEUE_LIMIT {
                queue.pop_front();
                trace!(
                    target: "webrtc_direct::mux",
                    ufrag = %self.key,
                    "session queue full, dropping oldest datagram"
                );
            }
            queue.push_back((data.to_vec(), src));
        }
        self.readable.notify_one();
    }

    fn add_address(&self, addr: SocketAddr) {
        let mut addresses = self.addresses.lock();
        if !addresses.contains(&addr) {
            addresses.push(addr);
        }
    }

    pub(crate) fn addresses(&self) -> Vec<SocketAddr> {
        self.addresses.lock().clone()
    }

    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
    }
}

#[async_trait]
impl Conn for MuxedConn {
    async fn connect(&self, _addr: SocketAddr) -> Result<(), UtilError> {
        Err(UtilError::Other("connect unsupported on muxed conn".to_owned()))
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, UtilError> {
        self.recv_from(buf).await.map(|(n, _)| n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), UtilError> {
        loop {
            if let Some((data, src)) = self.queue.lock().pop_front() {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                return Ok((n, src));
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(UtilError::Other("muxed conn closed".to_owned()));
            }
            self.readable.notified().await;
        }
    }

    async fn send(&self, buf: &[u8]) -> Result<usize, UtilError> {
        let target = self.addresses.lock().first().copied();
        match target {
            Some(addr) => self.send_to(buf, addr).await,
            None => Err(UtilError::Other("no remote address bound".to_owned())),
        }
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, UtilError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(UtilError::Other("muxed conn closed".to_owned()));
        }
        self.socket
            .send_to(buf, target)
            .await
            .map_err(|err| UtilError::Other(err.to_string()))
    }

    fn local_addr(&self) -> Result<SocketAddr, UtilError> {
        Ok(self.local_addr)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) -> Result<(), UtilError> {
        self.shutdown();
        Ok(())
    }

    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::stun::message::{TransactionId, BINDING_REQUEST};
    use webrtc::stun::textattrs::TextAttribute;

    fn binding_request(username: &str) -> Vec<u8> {
        let mut message = StunMessage::new();
        message
            .build(&[
                Box::new(BINDING_REQUEST),
                Box::new(TransactionId::new()),
                Box::new(TextAttribute {
                    attr: ATTR_USERNAME,
                    text: username.to_owned(),
                }),
            ])
            .unwrap();
        message.raw
    }

    async fn demux() -> Arc<UdpDemux> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        UdpDemux::new(Arc::new(socket)).unwrap()
    }

    #[tokio::test]
    async fn stun_username_yields_the_ufrag_prefix() {
        let packet = binding_request("someufrag:someufrag");
        assert_eq!(ufrag_from_stun(&packet).as_deref(), Some("someufrag"));
    }

    #[tokio::test]
    async fn non_stun_packets_have_no_ufrag() {
        assert_eq!(ufrag_from_stun(b"not a stun packet"), None);
        assert_eq!(ufrag_from_stun(&[]), None);
    }

    #[tokio::test]
    async fn packets_route_to_the_session_conn() {
        let demux = demux().await;
        let conn = demux.conn_for_ufrag("abc");
        let src: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        demux.register_address(&conn, src);

        conn.push_packet(b"hello", src);
        let mut buf = [0u8; 16];
        let (n, from) = conn.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, src);

        assert!(demux.lookup_by_addr(&src).is_some());
        assert!(demux.lookup_by_ufrag("abc").is_some());
    }

    #[tokio::test]
    async fn queue_overflow_drops_the_oldest_packet() {
        let demux = demux().await;
        let conn = demux.conn_for_ufrag("abc");
        let src: SocketAddr = "127.0.0.1:1234".parse().unwrap();

        for i in 0..(SESSION_QUEUE_LIMIT + 1) {
            conn.push_packet(&(i as u32).to_be_bytes(), src);
        }
        let mut buf = [0u8; 4];
        let (_, _) = conn.recv_from(&mut buf).await.unwrap();
        // packet 0 was dropped; the head is packet 1
        assert_eq!(u32::from_be_bytes(buf), 1);
    }

    #[tokio::test]
    async fn removal_closes_the_conn_and_frees_the_ufrag() {
        let demux = demux().await;
        let conn = demux.conn_for_ufrag("abc");
        let src: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        demux.register_address(&conn, src);

        demux.remove_ufrag("abc");
        assert!(demux.lookup_by_ufrag("abc").is_none());
        assert!(demux.lookup_by_addr(&src).is_none());
        let mut buf = [0u8; 4];
        assert!(conn.recv_from(&mut buf).await.is_err());

        // the ufrag is reusable after removal
        let again = demux.conn_for_ufrag("abc");
        assert_eq!(again.key(), "abc");
        assert_eq!(demux.session_count(), 1);
    }
}
