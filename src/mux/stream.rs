//! Multiplexed stream implementation
//!
//! Each stream is a flow-controlled, bidirectional byte pipe identified by a
//! 32-bit id. The stream tracks the SYN/ACK/FIN/RST lifecycle, buffers
//! inbound bytes against the advertised receive window, splits outbound
//! writes against the peer-granted send window, and wakes blocked readers
//! and writers through coalescing one-slot signals.

use super::frame::{Header, FLAG_ACK, FLAG_FIN, FLAG_RST, FLAG_SYN};
use super::session::{Session, SessionCore};
use super::{MuxError, INITIAL_STREAM_WINDOW};
use crate::config::Config;
use bytes::{Buf, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::error;

/// Stream lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created locally, SYN not yet sent
    Init,
    /// SYN sent, awaiting the peer's ACK
    SynSent,
    /// Remote SYN seen, ACK not yet sent
    SynReceived,
    /// Open in both directions
    Established,
    /// Local side has sent FIN
    LocalClose,
    /// Remote side has sent FIN
    RemoteClose,
    /// Both directions closed
    Closed,
    /// Reset by the peer
    Reset,
}

/// Receive-side accounting: the advertised window and the buffered bytes it
/// pairs with live under one lock so their sum stays consistent.
struct RecvState {
    window: u32,
    buf: Option<BytesMut>,
}

/// One deadline slot. The expired flag is sticky: once a deadline fires,
/// every subsequent call on that direction fails fast until the deadline is
/// replaced or cleared.
#[derive(Default)]
struct Deadline {
    instant: Mutex<Option<Instant>>,
    expired: AtomicBool,
}

impl Deadline {
    fn set(&self, deadline: Option<Instant>) {
        let mut slot = self.instant.lock().unwrap();
        match deadline {
            Some(at) if at <= Instant::now() => {
                *slot = None;
                self.expired.store(true, Ordering::Release);
            }
            other => {
                *slot = other;
                self.expired.store(false, Ordering::Release);
            }
        }
    }

    fn instant(&self) -> Option<Instant> {
        *self.instant.lock().unwrap()
    }

    fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    fn mark_expired(&self) {
        self.expired.store(true, Ordering::Release);
    }
}

/// Shared per-stream state, held strongly by the session's routing table and
/// by every user-facing `Stream` handle.
pub(crate) struct StreamCore {
    id: u32,
    session: Weak<SessionCore>,
    config: Arc<Config>,

    state: Mutex<StreamState>,
    recv: Mutex<RecvState>,
    send_window: AtomicU32,

    recv_notify: Notify,
    send_notify: Notify,

    /// Serializes user writes so concurrent callers keep byte order
    write_lock: tokio::sync::Mutex<()>,
    /// Serializes control frames (window updates, FIN) so the
    /// compute/advertise/emit sequence is atomic against concurrent readers
    control_lock: tokio::sync::Mutex<()>,

    read_deadline: Deadline,
    write_deadline: Deadline,
}

impl StreamCore {
    pub(crate) fn new(
        id: u32,
        state: StreamState,
        config: Arc<Config>,
        session: Weak<SessionCore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            session,
            config,
            state: Mutex::new(state),
            recv: Mutex::new(RecvState {
                window: INITIAL_STREAM_WINDOW,
                buf: None,
            }),
            send_window: AtomicU32::new(INITIAL_STREAM_WINDOW),
            recv_notify: Notify::new(),
            send_notify: Notify::new(),
            write_lock: tokio::sync::Mutex::new(()),
            control_lock: tokio::sync::Mutex::new(()),
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn state(&self) -> StreamState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn session(&self) -> Option<Arc<SessionCore>> {
        self.session.upgrade()
    }

    // ---- receive path ----

    pub(crate) async fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        let result = self.read_inner(buf).await;
        // Pass the wake along: the notify is one-slot and another reader may
        // be parked behind this call.
        self.recv_notify.notify_one();
        result
    }

    async fn read_inner(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.read_deadline.is_expired() {
                return Err(MuxError::Timeout);
            }

            match *self.state.lock().unwrap() {
                StreamState::Reset => return Err(MuxError::ConnectionReset),
                StreamState::LocalClose | StreamState::RemoteClose | StreamState::Closed => {
                    let recv = self.recv.lock().unwrap();
                    if recv.buf.as_ref().map_or(true, |b| b.is_empty()) {
                        return Ok(0);
                    }
                }
                _ => {}
            }

            let n = {
                let mut recv = self.recv.lock().unwrap();
                match recv.buf.as_mut() {
                    Some(data) if !data.is_empty() => {
                        let n = data.len().min(buf.len());
                        buf[..n].copy_from_slice(&data[..n]);
                        data.advance(n);
                        n
                    }
                    _ => 0,
                }
            };
            if n > 0 {
                // The consumed bytes may have opened enough room to
                // re-credit the peer.
                if let Err(err) = self.send_window_update().await {
                    error!("stream {}: window update failed: {}", self.id, err);
                }
                return Ok(n);
            }

            self.wait_recv().await?;
        }
    }

    async fn wait_recv(&self) -> Result<(), MuxError> {
        tokio::select! {
            _ = self.recv_notify.notified() => Ok(()),
            _ = expire(self.read_deadline.instant()) => {
                self.read_deadline.mark_expired();
                Err(MuxError::Timeout)
            }
        }
    }

    /// Ingest one inbound data frame from the session
    pub(crate) fn read_data(&self, hdr: &Header, flags: u16, body: Bytes) -> Result<(), MuxError> {
        self.process_flags(flags)?;

        let length = hdr.length;
        if length == 0 {
            return Ok(());
        }
        debug_assert_eq!(length as usize, body.len());

        {
            let mut recv = self.recv.lock().unwrap();
            if length > recv.window {
                error!(
                    "stream {}: receive window exceeded (available: {}, got: {})",
                    self.id, recv.window, length
                );
                return Err(MuxError::RecvWindowExceeded {
                    id: self.id,
                    available: recv.window,
                    length,
                });
            }
            // Size the buffer to the frame on first use so the whole body
            // lands without growing.
            recv.buf
                .get_or_insert_with(|| BytesMut::with_capacity(length as usize))
                .extend_from_slice(&body);
            recv.window -= length;
        }

        self.recv_notify.notify_one();
        Ok(())
    }

    /// Release the receive buffer if it has been fully drained
    pub(crate) fn shrink(&self) {
        let mut recv = self.recv.lock().unwrap();
        if recv.buf.as_ref().map_or(false, |b| b.is_empty()) {
            recv.buf = None;
        }
    }

    // ---- send path ----

    pub(crate) async fn write(&self, buf: &[u8]) -> Result<usize, MuxError> {
        let _guard = self.write_lock.lock().await;
        let mut total = 0;
        while total < buf.len() {
            total += self.write_once(&buf[total..]).await?;
        }
        Ok(total)
    }

    /// One framing step: emit a single data frame bounded by the send
    /// window, or block until credit arrives.
    async fn write_once(&self, buf: &[u8]) -> Result<usize, MuxError> {
        loop {
            if self.write_deadline.is_expired() {
                return Err(MuxError::Timeout);
            }

            match *self.state.lock().unwrap() {
                StreamState::LocalClose | StreamState::Closed => {
                    return Err(MuxError::StreamClosed)
                }
                StreamState::Reset => return Err(MuxError::ConnectionReset),
                _ => {}
            }

            let window = self.send_window.load(Ordering::Acquire);
            if window == 0 {
                self.wait_send().await?;
                continue;
            }

            let flags = self.send_flags();
            let max = (window as usize).min(buf.len());
            let hdr = Header::data(self.id, flags, max as u32);
            self.send_frame(hdr, Some(Bytes::copy_from_slice(&buf[..max])))
                .await?;
            self.send_window.fetch_sub(max as u32, Ordering::AcqRel);
            return Ok(max);
        }
    }

    async fn wait_send(&self) -> Result<(), MuxError> {
        tokio::select! {
            _ = self.send_notify.notified() => Ok(()),
            _ = expire(self.write_deadline.instant()) => {
                self.write_deadline.mark_expired();
                Err(MuxError::Timeout)
            }
        }
    }

    /// Apply a peer credit grant and unblock one writer
    pub(crate) fn incr_send_window(&self, hdr: &Header, flags: u16) -> Result<(), MuxError> {
        self.process_flags(flags)?;
        self.send_window.fetch_add(hdr.length, Ordering::AcqRel);
        self.send_notify.notify_one();
        Ok(())
    }

    // ---- window accounting ----

    /// Re-credit the peer for consumed bytes. Small deltas are suppressed
    /// unless a SYN/ACK flag needs to ride out.
    pub(crate) async fn send_window_update(&self) -> Result<(), MuxError> {
        let _guard = self.control_lock.lock().await;

        let max = self.config.max_stream_window;
        let flags = self.send_flags();

        let delta = {
            let mut recv = self.recv.lock().unwrap();
            let buffered = recv.buf.as_ref().map_or(0, |b| b.len() as u32);
            let delta = match max
                .checked_sub(buffered)
                .and_then(|available| available.checked_sub(recv.window))
            {
                Some(delta) => delta,
                None => {
                    // Outstanding credit already covers the whole window;
                    // advertising more would wrap.
                    debug_assert!(false, "receive credit exceeds the configured window");
                    error!(
                        "stream {}: receive credit exceeds window (buffered: {}, advertised: {}, max: {})",
                        self.id, buffered, recv.window, max
                    );
                    0
                }
            };
            if delta < max / 2 && flags == 0 {
                return Ok(());
            }
            recv.window += delta;
            delta
        };

        self.send_frame(Header::window_update(self.id, flags, delta), None)
            .await
    }

    // ---- state machine ----

    /// Consume any pending SYN/ACK bit for the next outbound frame
    fn send_flags(&self) -> u16 {
        let mut state = self.state.lock().unwrap();
        match *state {
            StreamState::Init => {
                *state = StreamState::SynSent;
                FLAG_SYN
            }
            StreamState::SynReceived => {
                *state = StreamState::Established;
                FLAG_ACK
            }
            _ => 0,
        }
    }

    /// Apply inbound SYN/ACK/FIN/RST transitions. Session callbacks run
    /// after the state lock is released.
    pub(crate) fn process_flags(&self, flags: u16) -> Result<(), MuxError> {
        let mut establish = false;
        let mut remove = false;
        {
            let mut state = self.state.lock().unwrap();
            if flags & FLAG_ACK != 0 {
                if *state == StreamState::SynSent {
                    *state = StreamState::Established;
                }
                establish = true;
            }
            if flags & FLAG_FIN != 0 {
                match *state {
                    StreamState::SynSent
                    | StreamState::SynReceived
                    | StreamState::Established => {
                        *state = StreamState::RemoteClose;
                        self.notify_waiting();
                    }
                    StreamState::LocalClose => {
                        *state = StreamState::Closed;
                        remove = true;
                        self.notify_waiting();
                    }
                    current => {
                        error!("stream {}: unexpected FIN flag in state {:?}", self.id, current);
                        return Err(MuxError::UnexpectedFlag);
                    }
                }
            }
            if flags & FLAG_RST != 0 {
                *state = StreamState::Reset;
                remove = true;
                self.notify_waiting();
            }
        }

        if let Some(session) = self.session.upgrade() {
            if establish {
                session.establish_stream(self.id);
            }
            if remove {
                session.close_stream(self.id);
            }
        }
        Ok(())
    }

    // ---- close / reset ----

    pub(crate) async fn close(&self) -> Result<(), MuxError> {
        let remove = {
            let mut state = self.state.lock().unwrap();
            match *state {
                StreamState::Init
                | StreamState::SynSent
                | StreamState::SynReceived
                | StreamState::Established => {
                    *state = StreamState::LocalClose;
                    false
                }
                StreamState::RemoteClose => {
                    *state = StreamState::Closed;
                    true
                }
                StreamState::LocalClose | StreamState::Closed | StreamState::Reset => {
                    return Ok(())
                }
            }
        };

        let result = self.send_close().await;
        self.notify_waiting();
        if remove {
            if let Some(session) = self.session.upgrade() {
                session.close_stream(self.id);
            }
        }
        result
    }

    /// Emit FIN on a zero-delta window update
    async fn send_close(&self) -> Result<(), MuxError> {
        let _guard = self.control_lock.lock().await;
        let flags = self.send_flags() | FLAG_FIN;
        self.send_frame(Header::window_update(self.id, flags, 0), None)
            .await
    }

    /// Session-teardown close: no frame, just wake everyone
    pub(crate) fn force_close(&self) {
        *self.state.lock().unwrap() = StreamState::Closed;
        self.notify_waiting();
    }

    fn notify_waiting(&self) {
        self.recv_notify.notify_one();
        self.send_notify.notify_one();
    }

    async fn send_frame(&self, hdr: Header, body: Option<Bytes>) -> Result<(), MuxError> {
        match self.session.upgrade() {
            Some(session) => session.send_frame(hdr, body).await,
            None => Err(MuxError::SessionShutdown),
        }
    }

    // ---- deadlines ----

    pub(crate) fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.read_deadline.set(deadline);
        // Re-arm any blocked reader against the new instant.
        self.recv_notify.notify_one();
    }

    pub(crate) fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.write_deadline.set(deadline);
        self.send_notify.notify_one();
    }
}

/// Resolve when the deadline passes; never resolves without one
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// A logical byte stream multiplexed over a shared session transport.
///
/// Handles are cheap to clone; clones share the same underlying stream, so
/// a reader and a writer half can live on different tasks.
#[derive(Clone)]
pub struct Stream {
    core: Arc<StreamCore>,
}

impl Stream {
    pub(crate) fn new(core: Arc<StreamCore>) -> Self {
        Self { core }
    }

    /// Stream id, unique within the session
    pub fn id(&self) -> u32 {
        self.core.id()
    }

    /// Current lifecycle state
    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    /// The owning session, or `None` once the session has been dropped
    pub fn session(&self) -> Option<Session> {
        self.core.session().map(Session::from_core)
    }

    /// Read buffered stream bytes into `buf`.
    ///
    /// Blocks while the stream is open and no data is buffered. Returns
    /// `Ok(0)` once the peer has half-closed and the buffer is drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        self.core.read(buf).await
    }

    /// Write all of `buf` to the stream.
    ///
    /// Blocks whenever the peer's window is exhausted. Bytes may have been
    /// transmitted even when an error is returned.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, MuxError> {
        self.core.write(buf).await
    }

    /// Half-close the local direction; the peer can keep sending until it
    /// closes its own side.
    pub async fn close(&self) -> Result<(), MuxError> {
        self.core.close().await
    }

    /// Release the receive buffer if it is empty, trimming idle memory
    pub fn shrink(&self) {
        self.core.shrink();
    }

    /// Set the deadline for blocked and future `read` calls; `None` clears it
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.core.set_read_deadline(deadline);
    }

    /// Set the deadline for blocked and future `write` calls; `None` clears it
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.core.set_write_deadline(deadline);
    }

    /// Set both direction deadlines at once
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.core.id())
            .field("state", &self.core.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::frame::{FrameType, HEADER_SIZE};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn orphan(state: StreamState) -> Arc<StreamCore> {
        StreamCore::new(1, state, Arc::new(Config::default()), Weak::new())
    }

    fn data_frame(len: u32) -> (Header, Bytes) {
        let hdr = Header::data(1, 0, len);
        (hdr, Bytes::from(vec![0x5a; len as usize]))
    }

    async fn read_frame(peer: &mut DuplexStream) -> (Header, Bytes) {
        let mut hdr_buf = [0u8; HEADER_SIZE];
        peer.read_exact(&mut hdr_buf).await.unwrap();
        let hdr = Header::decode(&hdr_buf).unwrap();
        let mut body = vec![0u8; 0];
        if hdr.frame_type == FrameType::Data {
            body = vec![0u8; hdr.length as usize];
            peer.read_exact(&mut body).await.unwrap();
        }
        (hdr, Bytes::from(body))
    }

    #[test]
    fn test_send_flags_piggyback_syn_then_nothing() {
        let stream = orphan(StreamState::Init);
        assert_eq!(stream.send_flags(), FLAG_SYN);
        assert_eq!(stream.state(), StreamState::SynSent);
        assert_eq!(stream.send_flags(), 0);
    }

    #[test]
    fn test_send_flags_piggyback_ack() {
        let stream = orphan(StreamState::SynReceived);
        assert_eq!(stream.send_flags(), FLAG_ACK);
        assert_eq!(stream.state(), StreamState::Established);
    }

    #[test]
    fn test_ack_establishes_syn_sent() {
        let stream = orphan(StreamState::SynSent);
        stream.process_flags(FLAG_ACK).unwrap();
        assert_eq!(stream.state(), StreamState::Established);
    }

    #[test]
    fn test_fin_transitions() {
        let stream = orphan(StreamState::Established);
        stream.process_flags(FLAG_FIN).unwrap();
        assert_eq!(stream.state(), StreamState::RemoteClose);

        let stream = orphan(StreamState::LocalClose);
        stream.process_flags(FLAG_FIN).unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn test_unexpected_fin_rejected() {
        let stream = orphan(StreamState::Closed);
        assert!(matches!(
            stream.process_flags(FLAG_FIN),
            Err(MuxError::UnexpectedFlag)
        ));
    }

    #[tokio::test]
    async fn test_read_returns_buffered_bytes() {
        let stream = orphan(StreamState::Established);
        let hdr = Header::data(1, 0, 5);
        stream.read_data(&hdr, 0, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(
            stream.recv.lock().unwrap().window,
            INITIAL_STREAM_WINDOW - 5
        );

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_read_drains_then_eof_after_fin() {
        let stream = orphan(StreamState::Established);
        let hdr = Header::data(1, FLAG_FIN, 3);
        stream.read_data(&hdr, FLAG_FIN, Bytes::from_static(b"end")).unwrap();
        assert_eq!(stream.state(), StreamState::RemoteClose);

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn test_zero_length_frame_is_flags_only() {
        let stream = orphan(StreamState::Established);
        let hdr = Header::data(1, 0, 0);
        stream.read_data(&hdr, 0, Bytes::new()).unwrap();
        assert!(stream.recv.lock().unwrap().buf.is_none());
        assert_eq!(stream.recv.lock().unwrap().window, INITIAL_STREAM_WINDOW);
    }

    #[test]
    fn test_recv_window_enforced() {
        let stream = orphan(StreamState::Established);
        let (hdr, body) = data_frame(INITIAL_STREAM_WINDOW + 1);
        let err = stream.read_data(&hdr, 0, body).unwrap_err();
        assert!(matches!(err, MuxError::RecvWindowExceeded { .. }));
        // The violation itself does not change stream state; the session
        // tears the whole connection down.
        assert_eq!(stream.state(), StreamState::Established);
    }

    #[tokio::test]
    async fn test_rst_wakes_blocked_reader() {
        let stream = orphan(StreamState::Established);
        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                stream.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        stream.process_flags(FLAG_RST).unwrap();
        assert!(matches!(
            reader.await.unwrap(),
            Err(MuxError::ConnectionReset)
        ));
        assert!(matches!(
            stream.write(b"x").await,
            Err(MuxError::ConnectionReset)
        ));
    }

    #[tokio::test]
    async fn test_write_rejected_after_local_close() {
        let stream = orphan(StreamState::LocalClose);
        assert!(matches!(
            stream.write(b"nope").await,
            Err(MuxError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_expired_read_deadline_fails_fast() {
        let stream = orphan(StreamState::Established);
        stream.set_read_deadline(Some(Instant::now() - Duration::from_millis(1)));
        let mut buf = [0u8; 8];
        assert!(matches!(
            stream.read(&mut buf).await,
            Err(MuxError::Timeout)
        ));

        // Clearing the deadline resets the sticky expiry.
        stream.set_read_deadline(None);
        let hdr = Header::data(1, 0, 2);
        stream.read_data(&hdr, 0, Bytes::from_static(b"ok")).unwrap();
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_read_deadline_interrupts_blocked_read() {
        let stream = orphan(StreamState::Established);
        stream.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));

        let started = Instant::now();
        let mut buf = [0u8; 8];
        let result = stream.read(&mut buf).await;
        assert!(matches!(result, Err(MuxError::Timeout)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(40), "woke after {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(150), "woke after {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_write_deadline_interrupts_empty_window() {
        let stream = orphan(StreamState::Established);
        stream.send_window.store(0, Ordering::Release);
        stream.set_write_deadline(Some(Instant::now() + Duration::from_millis(50)));
        assert!(matches!(
            stream.write(b"blocked").await,
            Err(MuxError::Timeout)
        ));
    }

    #[test]
    fn test_shrink_releases_drained_buffer() {
        let stream = orphan(StreamState::Established);
        let hdr = Header::data(1, 0, 4);
        stream.read_data(&hdr, 0, Bytes::from_static(b"data")).unwrap();

        stream.shrink();
        assert!(stream.recv.lock().unwrap().buf.is_some());

        stream.recv.lock().unwrap().buf.as_mut().unwrap().clear();
        stream.shrink();
        assert!(stream.recv.lock().unwrap().buf.is_none());
    }

    #[tokio::test]
    async fn test_write_splits_on_send_window() {
        // A 250-byte write against a 100-byte window must emit exactly one
        // 100-byte frame, block, and finish with a 150-byte frame once the
        // peer grants more credit.
        let (local, mut peer) = tokio::io::duplex(64 * 1024);
        let config = Config {
            enable_keepalive: false,
            ..Config::default()
        };
        let session = Session::client(local, config).unwrap();
        let stream = session.open_stream().await.unwrap();

        // The initial window update carries the SYN.
        let (hdr, _) = read_frame(&mut peer).await;
        assert_eq!(hdr.frame_type, FrameType::WindowUpdate);
        assert!(hdr.has_flag(FLAG_SYN));

        stream.core.send_window.store(100, Ordering::Release);
        let payload: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let writer = {
            let stream = stream.clone();
            let payload = payload.clone();
            tokio::spawn(async move { stream.write(&payload).await })
        };

        let (hdr, body) = read_frame(&mut peer).await;
        assert_eq!(hdr.frame_type, FrameType::Data);
        assert_eq!(hdr.length, 100);
        assert_eq!(&body[..], &payload[..100]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stream.core.send_window.load(Ordering::Acquire), 0);
        assert!(!writer.is_finished());

        let grant = Header::window_update(stream.id(), 0, 150);
        peer.write_all(&grant.encode()).await.unwrap();

        let (hdr, body) = read_frame(&mut peer).await;
        assert_eq!(hdr.frame_type, FrameType::Data);
        assert_eq!(hdr.length, 150);
        assert_eq!(&body[..], &payload[100..]);
        assert_eq!(writer.await.unwrap().unwrap(), 250);
    }

    #[tokio::test]
    async fn test_close_sends_single_fin() {
        let (local, mut peer) = tokio::io::duplex(64 * 1024);
        let config = Config {
            enable_keepalive: false,
            ..Config::default()
        };
        let session = Session::client(local, config).unwrap();
        let stream = session.open_stream().await.unwrap();
        let (_, _) = read_frame(&mut peer).await; // SYN window update

        stream.close().await.unwrap();
        let (hdr, _) = read_frame(&mut peer).await;
        assert_eq!(hdr.frame_type, FrameType::WindowUpdate);
        assert!(hdr.has_flag(FLAG_FIN));
        assert_eq!(hdr.length, 0);
        assert_eq!(stream.state(), StreamState::LocalClose);

        // Closing again is a no-op: no second FIN on the wire.
        stream.close().await.unwrap();
        let mut probe = [0u8; 1];
        let raced = tokio::time::timeout(
            Duration::from_millis(50),
            peer.read_exact(&mut probe),
        )
        .await;
        assert!(raced.is_err(), "unexpected second frame after close");
    }
}
