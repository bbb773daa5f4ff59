//! Stream layer over a raw data channel.
//!
//! Application bytes are framed as length-delimited records with optional
//! FIN / STOP_SENDING / RESET flags (see [`crate::message`]). The state
//! machine is deliberately strict: `receive_state` moves monotonically
//! through `Receiving → {DataRead, Reset}` and `send_state` through
//! `Sending → {Closed, Reset}`; neither ever returns to its initial state.
//!
//! Reads are single-reader by contract. A capacity-1 token excludes
//! concurrent readers; racing readers would interleave flag processing and
//! corrupt the state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::StreamError;
use crate::message::{Flag, StreamMessage, MAX_DATA_LEN, MAX_MESSAGE_SIZE};

/// Message-oriented byte channel carrying stream records. Implemented by the
/// detached WebRTC data channel; tests substitute an in-memory pair.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Receives one whole message into `buf` and returns its length.
    /// `Ok(0)` means the peer closed the channel.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, StreamError>;

    /// Sends one whole message.
    async fn send(&self, data: &[u8]) -> Result<usize, StreamError>;

    async fn close(&self) -> Result<(), StreamError>;
}

/// [`MessageChannel`] over a detached WebRTC data channel.
pub(crate) struct DetachedChannel {
    inner: Arc<webrtc::data::data_channel::DataChannel>,
}

impl DetachedChannel {
    pub(crate) fn new(inner: Arc<webrtc::data::data_channel::DataChannel>) -> Self {
        Self { inner }
    }
}

// The engine reports closure through errors rather than zero-length reads;
// the state machine expects the Unix convention.
fn is_closed_error(err: &webrtc::data::Error) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    text.contains("closed") || text.contains("reset")
}

#[async_trait]
impl MessageChannel for DetachedChannel {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        match self.inner.read(buf).await {
            Ok(n) => Ok(n),
            Err(err) if is_closed_error(&err) => Ok(0),
            Err(err) => Err(StreamError::Io(err.to_string())),
        }
    }

    async fn send(&self, data: &[u8]) -> Result<usize, StreamError> {
        match self.inner.write(&Bytes::copy_from_slice(data)).await {
            Ok(n) => Ok(n),
            Err(err) if is_closed_error(&err) => Err(StreamError::ChannelClosed),
            Err(err) => Err(StreamError::Io(err.to_string())),
        }
    }

    async fn close(&self) -> Result<(), StreamError> {
        match self.inner.close().await {
            Ok(()) => Ok(()),
            Err(err) if is_closed_error(&err) => Ok(()),
            Err(err) => Err(StreamError::Io(err.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SendState {
    Sending,
    Closed,
    Reset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReceiveState {
    Receiving,
    DataRead,
    Reset,
}

struct State {
    send_state: SendState,
    receive_state: ReceiveState,
    next_message: Option<StreamMessage>,
    close_err: Option<StreamError>,
}

impl State {
    fn new() -> Self {
        Self {
            send_state: SendState::Sending,
            receive_state: ReceiveState::Receiving,
            next_message: None,
            close_err: None,
        }
    }

    fn process_incoming_flag(&mut self, flag: Option<Flag>) {
        match flag {
            Some(Flag::Fin) => {
                if self.receive_state == ReceiveState::Receiving {
                    self.receive_state = ReceiveState::DataRead;
                }
            }
            Some(Flag::StopSending) => {
                if self.send_state == SendState::Sending {
                    self.send_state = SendState::Closed;
                }
            }
            Some(Flag::Reset) => {
                if self.receive_state == ReceiveState::Receiving {
                    self.receive_state = ReceiveState::Reset;
                }
            }
            None => {}
        }
    }
}

struct Shared {
    id: u16,
    channel: Arc<dyn MessageChannel>,
    state: Mutex<State>,
    reader_token: Semaphore,
    writer: AsyncMutex<()>,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    control_reader_spawned: AtomicBool,
}

/// One bidirectional application stream over a data channel.
pub struct Stream {
    shared: Arc<Shared>,
}

impl Stream {
    pub(crate) fn new(id: u16, channel: Arc<dyn MessageChannel>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                channel,
                state: Mutex::new(State::new()),
                reader_token: Semaphore::new(1),
                writer: AsyncMutex::new(()),
                read_deadline: Mutex::new(None),
                write_deadline: Mutex::new(None),
                control_reader_spawned: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u16 {
        self.shared.id
    }

    /// Reads up to `buf.len()` bytes. `Ok(0)` is end-of-stream once the
    /// remote sent FIN (or when `buf` is empty).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let _token = self
            .shared
            .reader_token
            .try_acquire()
            .map_err(|_| StreamError::ConcurrentRead)?;

        {
            let st = self.shared.state.lock();
            if let Some(err) = &st.close_err {
                return Err(err.clone());
            }
            match st.receive_state {
                ReceiveState::DataRead => return Ok(0),
                ReceiveState::Reset => return Err(StreamError::Reset),
                ReceiveState::Receiving => {}
            }
        }
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let need_fill = self.shared.state.lock().next_message.is_none();
            if need_fill {
                // The state lock is not held across the channel read so flag
                // writers are never blocked behind a slow reader.
                let mut raw = vec![0u8; MAX_MESSAGE_SIZE];
                match self.recv_with_deadline(&mut raw).await {
                    Ok(0) => {
                        let mut st = self.shared.state.lock();
                        if let Some(err) = &st.close_err {
                            return Err(err.clone());
                        }
                        return match st.receive_state {
                            ReceiveState::DataRead => Ok(0),
                            ReceiveState::Reset => Err(StreamError::Reset),
                            ReceiveState::Receiving => {
                                // Remote closed the channel without a FIN.
                                // Some stacks discard buffered data on close,
                                // so an unflagged close is a reset.
                                st.receive_state = ReceiveState::Reset;
                                Err(StreamError::Reset)
                            }
                        };
                    }
                    Ok(n) => match StreamMessage::decode_framed(&raw[..n]) {
                        Ok(msg) => {
                            trace!(
                                target: "webrtc_direct::stream",
                                stream_id = self.shared.id,
                                len = n,
                                flag = ?msg.flag_value(),
                                "received record"
                            );
                            self.shared.state.lock().next_message = Some(msg);
                        }
                        Err(err) => return self.after_read_failure(err),
                    },
                    Err(err) => return self.after_read_failure(err),
                }
            }

            let mut st = self.shared.state.lock();
            let Some(msg) = st.next_message.as_mut() else {
                continue;
            };
            if let Some(data) = msg.data.as_mut() {
                if !data.is_empty() {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    data.drain(..n);
                    return Ok(n);
                }
            }

            // payload fully drained: the flag applies now
            let flag = msg.flag_value();
            st.next_message = None;
            st.process_incoming_flag(flag);
            if let Some(err) = &st.close_err {
                return Err(err.clone());
            }
            match st.receive_state {
                ReceiveState::DataRead => return Ok(0),
                ReceiveState::Reset => return Err(StreamError::Reset),
                ReceiveState::Receiving => {}
            }
        }
    }

    /// Writes the whole buffer, chunked below the data-channel message
    /// ceiling. Fails once `send_state` has left `Sending`.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, StreamError> {
        let _writer = self.shared.writer.lock().await;
        self.check_writable()?;
        let mut written = 0;
        for chunk in buf.chunks(MAX_DATA_LEN) {
            // re-checked per chunk: a STOP_SENDING may land mid-write
            self.check_writable()?;
            self.send_message(&StreamMessage::data_message(chunk.to_vec())).await?;
            written += chunk.len();
        }
        Ok(written)
    }

    /// Sends FIN and closes the write direction. Further writes fail; the
    /// remote observes end-of-stream after draining buffered data.
    pub async fn close_write(&self) -> Result<(), StreamError> {
        let _writer = self.shared.writer.lock().await;
        let should_send = {
            let st = self.shared.state.lock();
            st.close_err.is_none() && st.send_state == SendState::Sending
        };
        if !should_send {
            return Ok(());
        }
        let sent = self.send_message(&StreamMessage::flag_message(Flag::Fin)).await;
        let mut st = self.shared.state.lock();
        if st.send_state == SendState::Sending {
            st.send_state = SendState::Closed;
        }
        sent
    }

    /// Discards the read direction. Sends STOP_SENDING if the stream was
    /// still receiving, then keeps draining control flags in the background
    /// so late FIN/RESET from the remote are still honored.
    pub async fn close_read(&self) -> Result<(), StreamError> {
        let should_send = {
            let mut st = self.shared.state.lock();
            if st.receive_state == ReceiveState::Receiving && st.close_err.is_none() {
                st.receive_state = ReceiveState::Reset;
                true
            } else {
                false
            }
        };
        let sent = if should_send {
            self.send_flag(Flag::StopSending).await
        } else {
            Ok(())
        };
        self.spawn_control_reader();
        sent
    }

    /// Graceful close of both directions; a second close is a no-op.
    pub async fn close(&self) -> Result<(), StreamError> {
        let write_res = self.close_write().await;
        let read_res = self.close_read().await;
        if write_res.is_err() || read_res.is_err() {
            self.reset().await;
        }
        write_res.and(read_res)
    }

    /// Abortive close. The RESET frame is best-effort; both directions are
    /// marked reset regardless.
    pub async fn reset(&self) {
        let already_reset = {
            let mut st = self.shared.state.lock();
            let already = st.send_state == SendState::Reset
                && st.receive_state == ReceiveState::Reset;
            st.send_state = SendState::Reset;
            st.receive_state = ReceiveState::Reset;
            already
        };
        if already_reset {
            return;
        }
        debug!(target: "webrtc_direct::stream", stream_id = self.shared.id, "resetting stream");
        let _ = self.send_flag(Flag::Reset).await;
        let _ = self.shared.channel.close().await;
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.shared.read_deadline.lock() = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.shared.write_deadline.lock() = deadline;
    }

    /// Terminal teardown from the owning connection: marks the sticky error
    /// and closes the channel underneath blocked readers.
    pub(crate) async fn close_for_shutdown(&self, err: StreamError) {
        {
            let mut st = self.shared.state.lock();
            if st.close_err.is_none() {
                st.close_err = Some(err);
            }
        }
        let _ = self.shared.channel.close().await;
    }

    pub(crate) fn is_terminated(&self) -> bool {
        let st = self.shared.state.lock();
        st.close_err.is_some()
            || (st.send_state != SendState::Sending
                && st.receive_state != ReceiveState::Receiving)
    }

    fn after_read_failure(&self, err: StreamError) -> Result<usize, StreamError> {
        let st = self.shared.state.lock();
        if let Some(sticky) = &st.close_err {
            return Err(sticky.clone());
        }
        match st.receive_state {
            ReceiveState::Reset => Err(StreamError::Reset),
            ReceiveState::DataRead => Ok(0),
            ReceiveState::Receiving => Err(err),
        }
    }

    fn check_writable(&self) -> Result<(), StreamError> {
        let st = self.shared.state.lock();
        if let Some(err) = &st.close_err {
            return Err(err.clone());
        }
        match st.send_state {
            SendState::Sending => Ok(()),
            SendState::Closed => Err(StreamError::ChannelClosed),
            SendState::Reset => Err(StreamError::Reset),
        }
    }

    async fn send_flag(&self, flag: Flag) -> Result<(), StreamError> {
        let _writer = self.shared.writer.lock().await;
        self.send_message(&StreamMessage::flag_message(flag)).await
    }

    async fn send_message(&self, msg: &StreamMessage) -> Result<(), StreamError> {
        let frame = msg.encode_framed();
        let deadline = *self.shared.write_deadline.lock();
        match deadline {
            Some(at) => tokio::time::timeout_at(at, self.shared.channel.send(&frame))
                .await
                .map_err(|_| StreamError::DeadlineExceeded)??,
            None => self.shared.channel.send(&frame).await?,
        };
        Ok(())
    }

    async fn recv_with_deadline(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let deadline = *self.shared.read_deadline.lock();
        match deadline {
            Some(at) => tokio::time::timeout_at(at, self.shared.channel.recv(buf))
                .await
                .map_err(|_| StreamError::DeadlineExceeded)?,
            None => self.shared.channel.recv(buf).await,
        }
    }

    fn spawn_control_reader(&self) {
        if self.shared.control_reader_spawned.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut raw = vec![0u8; MAX_MESSAGE_SIZE];
            loop {
                {
                    let st = shared.state.lock();
                    let send_settled = st.send_state != SendState::Sending;
                    if st.close_err.is_some() || send_settled {
                        break;
                    }
                }
                match shared.channel.recv(&mut raw).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(msg) = StreamMessage::decode_framed(&raw[..n]) {
                            let flag = msg.flag_value();
                            shared.state.lock().process_incoming_flag(flag);
                        }
                    }
                }
            }
            trace!(target: "webrtc_direct::stream", stream_id = shared.id, "control reader done");
        });
    }
}


#[cfg(test)]
mod tests {
    use super::tests_support::channel_pair;
    use super::*;
    use tokio::time::{sleep, Duration};

    fn stream_pair() -> (Stream, Stream) {
        let (a, b) = channel_pair();
        (Stream::new(1, a), Stream::new(1, b))
    }

    #[tokio::test]
    async fn write_then_fin_reads_data_then_eof() {
        let (alice, bob) = stream_pair();

        assert_eq!(alice.write(b"foobar").await.unwrap(), 6);
        alice.close_write().await.unwrap();

        let mut buf = [0u8; 6];
        assert_eq!(bob.read(&mut buf).await.unwrap(), 6);
        assert_eq!(&buf, b"foobar");
        assert_eq!(bob.read(&mut buf).await.unwrap(), 0);
        // terminal state is sticky
        assert_eq!(bob.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn short_reads_drain_a_buffered_record() {
        let (alice, bob) = stream_pair();
        alice.write(b"abcdef").await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(bob.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        let mut rest = [0u8; 4];
        assert_eq!(bob.read(&mut rest).await.unwrap(), 2);
        assert_eq!(&rest[..2], b"ef");
    }

    #[tokio::test]
    async fn large_writes_are_chunked() {
        let (alice, bob) = stream_pair();
        let payload = vec![0x5a; MAX_DATA_LEN * 2 + 100];
        assert_eq!(alice.write(&payload).await.unwrap(), payload.len());
        alice.close_write().await.unwrap();

        let mut collected = Vec::new();
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        loop {
            let n = bob.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, payload);
    }

    #[tokio::test]
    async fn abrupt_close_is_reset_not_eof() {
        let (alice, bob) = stream_pair();
        // closed without a FIN
        alice.shared.channel.close().await.unwrap();
        drop(alice);

        let mut buf = [0u8; 8];
        assert_eq!(bob.read(&mut buf).await, Err(StreamError::Reset));
        assert_eq!(bob.read(&mut buf).await, Err(StreamError::Reset));
    }

    #[tokio::test]
    async fn stop_sending_closes_the_write_side() {
        let (alice, bob) = stream_pair();
        bob.close_read().await.unwrap();

        // alice learns about STOP_SENDING while reading
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            let res = alice.read(&mut buf).await;
            (alice, res)
        });
        // bob half-closes so the reader observes EOF after the flag
        bob.close_write().await.unwrap();
        let (alice, res) = reader.await.unwrap();
        assert_eq!(res.unwrap(), 0);

        assert_eq!(alice.write(b"more").await, Err(StreamError::ChannelClosed));
    }

    #[tokio::test]
    async fn reset_is_observed_and_sticky() {
        let (alice, bob) = stream_pair();
        alice.write(b"partial").await.unwrap();
        alice.reset().await;

        // data queued before the reset may be read; the reset terminates after
        let mut buf = [0u8; 16];
        let first = bob.read(&mut buf).await;
        let second = match first {
            Ok(_) => bob.read(&mut buf).await,
            other => other,
        };
        assert_eq!(second, Err(StreamError::Reset));

        assert_eq!(alice.write(b"nope").await, Err(StreamError::Reset));
        assert!(alice.is_terminated());
    }

    #[tokio::test]
    async fn double_close_is_a_no_op() {
        let (alice, bob) = stream_pair();
        alice.close().await.unwrap();
        alice.close().await.unwrap();
        drop(bob);
    }

    #[tokio::test]
    async fn close_read_after_fin_sends_no_stop_sending() {
        let (a_ch, b_ch) = channel_pair();
        let alice = Stream::new(1, a_ch.clone());
        let bob = Stream::new(1, b_ch);
        alice.close_write().await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(bob.read(&mut buf).await.unwrap(), 0);
        bob.close_read().await.unwrap();

        // receive side already hit DataRead: no STOP_SENDING may be emitted
        sleep(Duration::from_millis(50)).await;
        let pending = a_ch.rx.lock().await.try_recv();
        assert!(pending.is_err(), "unexpected record: {pending:?}");
    }

    #[tokio::test]
    async fn second_concurrent_reader_fails_immediately() {
        let (alice, bob) = stream_pair();
        let alice = Arc::new(alice);
        let blocked = Arc::clone(&alice);
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            blocked.read(&mut buf).await
        });
        sleep(Duration::from_millis(20)).await;

        let mut buf = [0u8; 4];
        assert_eq!(
            alice.read(&mut buf).await,
            Err(StreamError::ConcurrentRead)
        );

        bob.write(b"data").await.unwrap();
        assert_eq!(task.await.unwrap().unwrap(), 4);
    }

    #[tokio::test]
    async fn read_deadline_expires() {
        let (alice, _bob) = stream_pair();
        alice.set_read_deadline(Some(Instant::now() + Duration::from_millis(30)));
        let mut buf = [0u8; 4];
        assert_eq!(
            alice.read(&mut buf).await,
            Err(StreamError::DeadlineExceeded)
        );
    }

    #[tokio::test]
    async fn shutdown_error_is_sticky() {
        let (alice, _bob) = stream_pair();
        alice.close_for_shutdown(StreamError::Reset).await;
        let mut buf = [0u8; 4];
        assert_eq!(alice.read(&mut buf).await, Err(StreamError::Reset));
        assert_eq!(alice.write(b"x").await, Err(StreamError::Reset));
    }
}
