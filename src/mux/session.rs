//! Session management for multiplexed streams
//!
//! The session owns the transport and everything on it:
//! - a send pump that serializes outbound frames and reports per-frame
//!   results back to the emitting stream
//! - a receive loop that validates headers and routes frames to streams
//! - optional keepalive pings
//! - the stream routing table; streams keep only a weak back-reference

use super::frame::{
    FrameType, Header, FLAG_ACK, FLAG_RST, FLAG_SYN, GOAWAY_INTERNAL_ERROR, GOAWAY_NORMAL,
    GOAWAY_PROTOCOL_ERROR, HEADER_SIZE,
};
use super::stream::{Stream, StreamCore, StreamState};
use super::MuxError;
use crate::config::Config;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Outbound frames queued ahead of the send pump
const SEND_QUEUE_DEPTH: usize = 64;

/// How long a ping waits for its reply
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// One outbound frame awaiting serialization, with its completion signal
struct SendRequest {
    hdr: Header,
    body: Option<Bytes>,
    done: oneshot::Sender<Result<(), MuxError>>,
}

/// Session internals shared by the public handle, the stream table, and the
/// pump/demux/keepalive tasks.
pub(crate) struct SessionCore {
    config: Arc<Config>,
    send_tx: mpsc::Sender<SendRequest>,

    streams: Mutex<HashMap<u32, Arc<StreamCore>>>,
    /// Locally initiated streams the peer has not yet acknowledged
    inflight: Mutex<HashSet<u32>>,
    next_stream_id: AtomicU32,

    accept_tx: mpsc::Sender<Stream>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,

    pings: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    next_ping_id: AtomicU32,

    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    local_goaway: AtomicBool,
    remote_goaway: AtomicBool,
}

impl SessionCore {
    /// Queue one frame on the send pump and wait for its write result
    pub(crate) async fn send_frame(
        &self,
        hdr: Header,
        body: Option<Bytes>,
    ) -> Result<(), MuxError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(MuxError::SessionShutdown);
        }
        let (done, done_rx) = oneshot::channel();
        self.send_tx
            .send(SendRequest { hdr, body, done })
            .await
            .map_err(|_| MuxError::SessionShutdown)?;
        done_rx.await.map_err(|_| MuxError::SessionShutdown)?
    }

    pub(crate) async fn accept_stream(&self) -> Result<Stream, MuxError> {
        let mut accept_rx = self.accept_rx.lock().await;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(MuxError::SessionShutdown);
            }
            tokio::select! {
                stream = accept_rx.recv() => {
                    return stream.ok_or(MuxError::SessionShutdown);
                }
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Round-trip a ping through the peer, returning the elapsed time
    pub(crate) async fn ping(&self) -> Result<Duration, MuxError> {
        let id = self.next_ping_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pings.lock().unwrap().insert(id, tx);

        let start = Instant::now();
        if let Err(err) = self.send_frame(Header::ping(FLAG_SYN, id), None).await {
            self.pings.lock().unwrap().remove(&id);
            return Err(err);
        }

        match time::timeout(PING_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(_)) => Err(MuxError::SessionShutdown),
            Err(_) => {
                self.pings.lock().unwrap().remove(&id);
                Err(MuxError::KeepAliveTimeout)
            }
        }
    }

    pub(crate) fn stream(&self, id: u32) -> Option<Arc<StreamCore>> {
        self.streams.lock().unwrap().get(&id).cloned()
    }

    /// Drop a stream from the routing table
    pub(crate) fn close_stream(&self, id: u32) {
        self.inflight.lock().unwrap().remove(&id);
        if self.streams.lock().unwrap().remove(&id).is_some() {
            debug!("removed stream {}", id);
        }
    }

    /// The peer acknowledged a locally initiated stream
    pub(crate) fn establish_stream(&self, id: u32) {
        self.inflight.lock().unwrap().remove(&id);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn num_streams(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Tear the session down: record the cause, stop the pumps, and
    /// force-close every stream so blocked callers wake.
    pub(crate) fn exit(&self, err: Option<MuxError>) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        match &err {
            Some(err) => error!("session terminated: {}", err),
            None => debug!("session shutting down"),
        }
        self.shutdown_tx.send_replace(true);

        let streams: Vec<Arc<StreamCore>> = {
            let mut streams = self.streams.lock().unwrap();
            streams.drain().map(|(_, stream)| stream).collect()
        };
        for stream in streams {
            stream.force_close();
        }
        self.inflight.lock().unwrap().clear();
        self.pings.lock().unwrap().clear();
    }
}

/// A multiplexed session over a single reliable transport.
///
/// Handles are cheap to clone and share the same underlying session.
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    /// Start the client side of a session; client streams use odd ids
    pub fn client<T>(transport: T, config: Config) -> crate::Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(transport, config, true)
    }

    /// Start the server side of a session; server streams use even ids
    pub fn server<T>(transport: T, config: Config) -> crate::Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(transport, config, false)
    }

    fn new<T>(transport: T, config: Config, client: bool) -> crate::Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let (reader, writer) = tokio::io::split(transport);
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
        let (shutdown_tx, _) = watch::channel(false);

        let core = Arc::new(SessionCore {
            config: Arc::new(config),
            send_tx,
            streams: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashSet::new()),
            next_stream_id: AtomicU32::new(if client { 1 } else { 2 }),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            pings: Mutex::new(HashMap::new()),
            next_ping_id: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            shutdown_tx,
            local_goaway: AtomicBool::new(false),
            remote_goaway: AtomicBool::new(false),
        });

        tokio::spawn(send_loop(core.clone(), writer, send_rx));
        tokio::spawn(recv_loop(core.clone(), reader));
        if core.config.enable_keepalive {
            tokio::spawn(keepalive_loop(core.clone()));
        }

        Ok(Self { core })
    }

    pub(crate) fn from_core(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    /// Open a new outbound stream
    pub async fn open_stream(&self) -> Result<Stream, MuxError> {
        let core = &self.core;
        if core.shutdown.load(Ordering::Acquire) {
            return Err(MuxError::SessionShutdown);
        }
        if core.remote_goaway.load(Ordering::Acquire) {
            return Err(MuxError::RemoteGoAway);
        }

        let id = core.next_stream_id.fetch_add(2, Ordering::Relaxed);
        if id > u32::MAX - 2 {
            return Err(MuxError::StreamsExhausted);
        }

        let stream = StreamCore::new(
            id,
            StreamState::Init,
            core.config.clone(),
            Arc::downgrade(core),
        );
        core.streams.lock().unwrap().insert(id, stream.clone());
        core.inflight.lock().unwrap().insert(id);

        // The SYN rides the initial window update; emit it before handing
        // the stream back so the peer learns about the id first.
        if let Err(err) = stream.send_window_update().await {
            core.close_stream(id);
            return Err(err);
        }
        debug!("opened stream {}", id);
        Ok(Stream::new(stream))
    }

    /// Wait for the next stream opened by the peer
    pub async fn accept_stream(&self) -> Result<Stream, MuxError> {
        self.core.accept_stream().await
    }

    /// Round-trip a ping through the peer, returning the elapsed time
    pub async fn ping(&self) -> Result<Duration, MuxError> {
        self.core.ping().await
    }

    /// Announce that no new streams will be accepted, without closing the
    /// session
    pub async fn go_away(&self) -> Result<(), MuxError> {
        self.core.local_goaway.store(true, Ordering::Release);
        self.core.send_frame(Header::go_away(GOAWAY_NORMAL), None).await
    }

    /// Shut the session down: notify the peer, stop the pumps, and
    /// force-close every stream
    pub async fn close(&self) -> Result<(), MuxError> {
        if self.core.is_shutdown() {
            return Ok(());
        }
        self.core.local_goaway.store(true, Ordering::Release);
        let _ = self
            .core
            .send_frame(Header::go_away(GOAWAY_NORMAL), None)
            .await;
        self.core.exit(None);
        Ok(())
    }

    /// Whether the session has shut down
    pub fn is_closed(&self) -> bool {
        self.core.is_shutdown()
    }

    /// Number of streams currently routed by this session
    pub fn num_streams(&self) -> usize {
        self.core.num_streams()
    }

    /// Number of locally opened streams the peer has not yet acknowledged
    pub fn num_pending_streams(&self) -> usize {
        self.core.inflight.lock().unwrap().len()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("streams", &self.core.num_streams())
            .field("closed", &self.core.is_shutdown())
            .finish()
    }
}

/// Serialize outbound frames onto the transport, one at a time, reporting
/// each result through the request's completion signal.
async fn send_loop<W: AsyncWrite + Send + Unpin>(
    core: Arc<SessionCore>,
    mut writer: W,
    mut rx: mpsc::Receiver<SendRequest>,
) {
    let mut shutdown_rx = core.shutdown_tx.subscribe();
    loop {
        let req = tokio::select! {
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        };

        match write_frame(&mut writer, &req).await {
            Ok(()) => {
                let _ = req.done.send(Ok(()));
            }
            Err(err) => {
                error!("send pump: transport write failed: {}", err);
                let _ = req.done.send(Err(MuxError::Io(err)));
                break;
            }
        }
    }

    // Fail anything still queued, then make sure the session is down.
    rx.close();
    while let Ok(req) = rx.try_recv() {
        let _ = req.done.send(Err(MuxError::SessionShutdown));
    }
    core.exit(None);
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, req: &SendRequest) -> io::Result<()> {
    writer.write_all(&req.hdr.encode()).await?;
    if let Some(body) = &req.body {
        writer.write_all(body).await?;
    }
    writer.flush().await
}

/// Read frames off the transport and route them until the peer hangs up,
/// the session shuts down, or the peer violates the protocol.
async fn recv_loop<R: AsyncRead + Send + Unpin>(core: Arc<SessionCore>, mut reader: R) {
    let mut shutdown_rx = core.shutdown_tx.subscribe();
    let result = tokio::select! {
        result = demux(&core, &mut reader) => result,
        _ = shutdown_rx.changed() => Ok(()),
    };
    match result {
        Ok(()) => core.exit(None),
        Err(err) => core.exit(Some(err)),
    }
}

async fn demux<R: AsyncRead + Unpin>(
    core: &Arc<SessionCore>,
    reader: &mut R,
) -> Result<(), MuxError> {
    let mut hdr_buf = [0u8; HEADER_SIZE];
    loop {
        if let Err(err) = reader.read_exact(&mut hdr_buf).await {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                // Peer hung up cleanly.
                return Ok(());
            }
            return Err(MuxError::Io(err));
        }
        let hdr = Header::decode(&hdr_buf)?;

        match hdr.frame_type {
            FrameType::Data => handle_data(core, reader, &hdr).await?,
            FrameType::WindowUpdate => handle_window_update(core, &hdr).await?,
            FrameType::Ping => handle_ping(core, &hdr).await?,
            FrameType::GoAway => handle_go_away(core, &hdr)?,
        }
    }
}

async fn handle_data<R: AsyncRead + Unpin>(
    core: &Arc<SessionCore>,
    reader: &mut R,
    hdr: &Header,
) -> Result<(), MuxError> {
    if hdr.has_flag(FLAG_SYN) {
        incoming_stream(core, hdr.stream_id).await?;
    }

    match core.stream(hdr.stream_id) {
        Some(stream) => {
            let mut body = vec![0u8; hdr.length as usize];
            reader.read_exact(&mut body).await.map_err(MuxError::Io)?;
            stream.read_data(hdr, hdr.flags, Bytes::from(body))
        }
        None => {
            // The stream may have just been removed locally; frames for it
            // can still be in flight. Drain the body and move on.
            warn!(
                "data frame for missing stream {} ({} bytes)",
                hdr.stream_id, hdr.length
            );
            let mut remaining = hdr.length as usize;
            let mut scratch = [0u8; 4096];
            while remaining > 0 {
                let chunk = remaining.min(scratch.len());
                reader
                    .read_exact(&mut scratch[..chunk])
                    .await
                    .map_err(MuxError::Io)?;
                remaining -= chunk;
            }
            Ok(())
        }
    }
}

async fn handle_window_update(core: &Arc<SessionCore>, hdr: &Header) -> Result<(), MuxError> {
    if hdr.has_flag(FLAG_SYN) {
        incoming_stream(core, hdr.stream_id).await?;
    }

    match core.stream(hdr.stream_id) {
        Some(stream) => stream.incr_send_window(hdr, hdr.flags),
        None => {
            warn!("window update for missing stream {}", hdr.stream_id);
            Ok(())
        }
    }
}

/// Register a remotely initiated stream, or refuse it with RST when the
/// accept backlog is full or the session is going away.
async fn incoming_stream(core: &Arc<SessionCore>, id: u32) -> Result<(), MuxError> {
    if core.local_goaway.load(Ordering::Acquire) {
        return core
            .send_frame(Header::window_update(id, FLAG_RST, 0), None)
            .await;
    }

    let stream = StreamCore::new(
        id,
        StreamState::SynReceived,
        core.config.clone(),
        Arc::downgrade(core),
    );
    let duplicate = {
        let mut streams = core.streams.lock().unwrap();
        if streams.contains_key(&id) {
            true
        } else {
            streams.insert(id, stream.clone());
            false
        }
    };
    if duplicate {
        error!("duplicate stream id {}", id);
        let _ = core
            .send_frame(Header::go_away(GOAWAY_PROTOCOL_ERROR), None)
            .await;
        return Err(MuxError::DuplicateStream(id));
    }

    match core.accept_tx.try_send(Stream::new(stream)) {
        Ok(()) => {
            debug!("accepted inbound stream {}", id);
            Ok(())
        }
        Err(_) => {
            warn!("accept backlog full, resetting stream {}", id);
            core.close_stream(id);
            core.send_frame(Header::window_update(id, FLAG_RST, 0), None)
                .await
        }
    }
}

async fn handle_ping(core: &Arc<SessionCore>, hdr: &Header) -> Result<(), MuxError> {
    if hdr.has_flag(FLAG_SYN) {
        // Probe from the peer: echo the opaque value back.
        return core.send_frame(Header::ping(FLAG_ACK, hdr.length), None).await;
    }
    if hdr.has_flag(FLAG_ACK) {
        if let Some(done) = core.pings.lock().unwrap().remove(&hdr.length) {
            let _ = done.send(());
        }
    }
    Ok(())
}

fn handle_go_away(core: &Arc<SessionCore>, hdr: &Header) -> Result<(), MuxError> {
    match hdr.length {
        GOAWAY_NORMAL => {
            debug!("remote side is going away; no new streams");
            core.remote_goaway.store(true, Ordering::Release);
            Ok(())
        }
        GOAWAY_PROTOCOL_ERROR => {
            error!("remote reported a protocol error");
            Err(MuxError::SessionShutdown)
        }
        GOAWAY_INTERNAL_ERROR => {
            error!("remote reported an internal error");
            Err(MuxError::SessionShutdown)
        }
        code => {
            error!("remote goaway with unknown code {}", code);
            Err(MuxError::SessionShutdown)
        }
    }
}

/// Ping the peer on an interval; a failed or timed-out ping kills the
/// session so blocked streams do not hang on a dead transport.
async fn keepalive_loop(core: Arc<SessionCore>) {
    let period = core.config.keepalive_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut shutdown_rx = core.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = core.ping().await {
                    warn!("keepalive ping failed: {}", err);
                    core.exit(Some(MuxError::KeepAliveTimeout));
                    return;
                }
            }
            _ = shutdown_rx.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> Config {
        Config {
            enable_keepalive: false,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_stream_id_spaces() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = Session::client(a, quiet_config()).unwrap();
        let server = Session::server(b, quiet_config()).unwrap();

        let s1 = client.open_stream().await.unwrap();
        let s2 = client.open_stream().await.unwrap();
        assert_eq!(s1.id(), 1);
        assert_eq!(s2.id(), 3);
        assert_eq!(client.num_pending_streams(), 2);

        let s4 = server.open_stream().await.unwrap();
        assert_eq!(s4.id(), 2);
    }

    #[tokio::test]
    async fn test_ping_roundtrip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = Session::client(a, quiet_config()).unwrap();
        let _server = Session::server(b, quiet_config()).unwrap();

        let rtt = client.ping().await.unwrap();
        assert!(rtt < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_open_after_close_fails() {
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let client = Session::client(a, quiet_config()).unwrap();

        client.close().await.unwrap();
        assert!(client.is_closed());
        assert!(matches!(
            client.open_stream().await,
            Err(MuxError::SessionShutdown)
        ));
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let (a, _b) = tokio::io::duplex(1024);
        let config = Config {
            accept_backlog: 0,
            ..Config::default()
        };
        assert!(Session::client(a, config).is_err());
    }
}
