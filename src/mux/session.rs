//! Session - the multiplexer over one physical connection
//!
//! Four tasks run per session:
//! - receive loop: the only reader of the connection; decodes frames and
//!   dispatches them to streams, pausing while the token bucket is empty
//! - shaper: orders write requests by sequence number
//! - send loop: the only writer of the connection; seals and writes frames
//! - keepalive: sends NOP and closes the session when the peer goes quiet
//!
//! They share the stream map, the bucket and the error latches held by
//! [`SessionInner`]. Closing fires the `die` signal every blocking call
//! selects on.

use std::collections::HashMap;
use std::fmt;
use std::future;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::crypto::{Direction, Keyring, NonceCounter, Opener, Sealer, TAG_SIZE};
use crate::error::{Error, Result};

use super::codec::{HeaderCodec, HEADER_SIZE};
use super::config::MuxConfig;
use super::frame::{Cmd, Frame, WindowUpdate, UPD_SIZE};
use super::shaper::{self, WriteRequest};
use super::signal::{ErrorLatch, Signal};
use super::stream::{Stream, StreamShared};

/// Upper bound for opening a stream
const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Which end of the physical connection this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection (tunnel client); opens odd stream ids
    Initiator,
    /// Accepted the connection (tunnel server); opens even stream ids
    Acceptor,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        }
    }

    fn send_direction(self) -> Direction {
        match self {
            Role::Initiator => Direction::ClientToServer,
            Role::Acceptor => Direction::ServerToClient,
        }
    }

    fn recv_direction(self) -> Direction {
        match self {
            Role::Initiator => Direction::ServerToClient,
            Role::Acceptor => Direction::ClientToServer,
        }
    }
}

/// Wait until `deadline`, or forever when there is none
pub(crate) async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

// ============================================================================
// Shared State
// ============================================================================

pub(crate) struct SessionInner {
    pub(crate) config: MuxConfig,
    role: Role,

    streams: Mutex<HashMap<u32, Arc<StreamShared>>>,
    next_stream_id: Mutex<u32>,
    go_away: AtomicBool,

    /// Receive credit in wire bytes; the receive loop pauses at <= 0
    bucket: AtomicI32,
    bucket_notify: Notify,

    die: Signal,
    read_error: ErrorLatch,
    write_error: ErrorLatch,
    proto_error: ErrorLatch,

    accepts_tx: mpsc::Sender<Arc<StreamShared>>,
    accepts_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<StreamShared>>>,

    /// Set by every received frame, cleared by the keepalive check
    data_ready: AtomicBool,

    request_id: AtomicU32,
    shaper_tx: mpsc::Sender<WriteRequest>,

    accept_deadline: Mutex<Option<Instant>>,
}

impl SessionInner {
    /// The error every blocked caller sees once the session is dead
    pub(crate) fn closed_error(&self) -> Error {
        self.proto_error
            .get()
            .or_else(|| self.read_error.get())
            .or_else(|| self.write_error.get())
            .unwrap_or(Error::ConnectionClosed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.die.is_fired()
    }

    /// Tear everything down. Only the first call does any work.
    pub(crate) fn close(&self) {
        if !self.die.fire() {
            return;
        }

        let streams: Vec<Arc<StreamShared>> = self.streams.lock().drain().map(|(_, s)| s).collect();
        let tokens: usize = streams.iter().map(|s| s.session_close()).sum();
        self.return_tokens(tokens);

        self.drain_accepts();
        debug!("session closed ({} streams released)", streams.len());
    }

    /// Drop streams still waiting in the accept backlog, unless an
    /// `accept_stream` call currently holds it
    fn drain_accepts(&self) {
        if let Ok(mut accepts) = self.accepts_rx.try_lock() {
            while accepts.try_recv().is_ok() {}
        }
    }

    fn allocate_stream_id(&self) -> Result<u32> {
        let mut next = self.next_stream_id.lock();
        if self.go_away.load(Ordering::SeqCst) {
            return Err(Error::GoAway);
        }
        let id = *next;
        match id.checked_add(2) {
            Some(following) => *next = following,
            None => self.go_away.store(true, Ordering::SeqCst),
        }
        Ok(id)
    }

    /// Give receive credit back, waking the receive loop if it was paused
    pub(crate) fn return_tokens(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.bucket.fetch_add(n as i32, Ordering::SeqCst);
        self.bucket_notify.notify_waiters();
    }

    /// A stream handle closed; forget it and reclaim its unread credit
    pub(crate) fn stream_closed(&self, id: u32) {
        let removed = self.streams.lock().remove(&id);
        if let Some(shared) = removed {
            self.return_tokens(shared.recycle_tokens());
        }
    }

    fn next_request(&self, frame: Frame, result: Option<oneshot::Sender<Result<usize>>>) -> WriteRequest {
        WriteRequest {
            frame,
            seq: self.request_id.fetch_add(1, Ordering::SeqCst),
            result,
        }
    }

    async fn enqueue(&self, req: WriteRequest) -> Result<()> {
        tokio::select! {
            _ = self.die.fired() => Err(self.closed_error()),
            sent = self.shaper_tx.send(req) => sent.map_err(|_| self.closed_error()),
        }
    }

    /// Queue a frame and wait until the writer has put it on the wire
    pub(crate) async fn write_frame(&self, frame: Frame, deadline: Option<Instant>) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        let req = self.next_request(frame, Some(tx));

        let written = async {
            self.enqueue(req).await?;
            rx.await.unwrap_or_else(|_| Err(self.closed_error()))
        };

        tokio::select! {
            result = written => result,
            _ = until(deadline) => Err(Error::Timeout),
        }
    }

    /// Queue a frame without waiting for the write
    pub(crate) async fn post_frame(&self, frame: Frame) -> Result<()> {
        let req = self.next_request(frame, None);
        self.enqueue(req).await
    }

    /// Queue a frame from synchronous code (poll functions, `Drop`)
    pub(crate) fn post_detached(&self, frame: Frame) {
        let req = self.next_request(frame, None);
        match self.shaper_tx.try_send(req) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(req)) => {
                // The sequence number is already taken, so a late send still
                // lands in order once the shaper has room.
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let tx = self.shaper_tx.clone();
                    handle.spawn(async move {
                        let _ = tx.send(req).await;
                    });
                }
            }
        }
    }

    /// Latch `err` in the slot matching its class and close the session
    fn fail(&self, err: Error, latch: &ErrorLatch) {
        if latch.set(err.clone()) && !self.is_closed() {
            match err {
                Error::ConnectionClosed => debug!("session peer closed the connection"),
                ref e => warn!("session failed: {}", e),
            }
        }
        self.close();
    }

    // ------------------------------------------------------------------------
    // Receive loop
    // ------------------------------------------------------------------------

    async fn recv_loop<R>(self: Arc<Self>, mut reader: R, mut opener: Opener, codec: HeaderCodec)
    where
        R: AsyncRead + Unpin,
    {
        let result = tokio::select! {
            _ = self.die.fired() => Ok(()),
            r = self.recv_frames(&mut reader, &mut opener, &codec) => r,
        };
        if let Err(e) = result {
            if e.is_protocol() {
                self.fail(e, &self.proto_error);
            } else {
                self.fail(e, &self.read_error);
            }
        }
    }

    async fn wait_for_tokens(&self) {
        loop {
            let notified = self.bucket_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.bucket.load(Ordering::SeqCst) > 0 {
                return;
            }
            trace!("session receive paused, bucket exhausted");
            notified.await;
        }
    }

    async fn recv_frames<R>(&self, reader: &mut R, opener: &mut Opener, codec: &HeaderCodec) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut raw = [0u8; HEADER_SIZE];
        loop {
            self.wait_for_tokens().await;

            read_exact(reader, &mut raw).await?;
            self.data_ready.store(true, Ordering::SeqCst);

            let header = codec.decode(&raw)?;
            if header.version != self.config.version {
                return Err(Error::Protocol(format!(
                    "version mismatch: expected {}, got {}",
                    self.config.version, header.version
                )));
            }
            if !header.cmd.carries_payload() && header.length != 0 {
                return Err(Error::Protocol(format!(
                    "{:?} frame with {} byte payload",
                    header.cmd, header.length
                )));
            }
            trace!("recv {:?} sid={} len={}", header.cmd, header.stream_id, header.length);

            match header.cmd {
                Cmd::Nop => {}
                Cmd::Syn => self.handle_syn(header.stream_id).await,
                Cmd::Fin => {
                    let stream = self.streams.lock().get(&header.stream_id).cloned();
                    if let Some(stream) = stream {
                        stream.fin();
                    }
                }
                Cmd::Psh => {
                    if header.length > 0 {
                        let sealed = read_payload(reader, header.length as usize).await?;
                        let plain = opener
                            .open(&sealed)
                            .map_err(|_| Error::Protocol("payload authentication failed".into()))?;
                        self.deliver(header.stream_id, plain, sealed.len());
                    }
                }
                Cmd::Upd => {
                    if header.length as usize != UPD_SIZE + TAG_SIZE {
                        return Err(Error::Protocol(format!(
                            "window update with {} byte payload",
                            header.length
                        )));
                    }
                    let sealed = read_payload(reader, header.length as usize).await?;
                    let plain = opener
                        .open(&sealed)
                        .map_err(|_| Error::Protocol("window update authentication failed".into()))?;
                    let upd = WindowUpdate::decode(&plain)?;
                    let stream = self.streams.lock().get(&header.stream_id).cloned();
                    if let Some(stream) = stream {
                        stream.update(upd);
                    }
                }
            }
        }
    }

    async fn handle_syn(&self, id: u32) {
        let created = {
            let mut streams = self.streams.lock();
            if self.is_closed() || streams.contains_key(&id) {
                None
            } else {
                let shared = Arc::new(StreamShared::new(id));
                streams.insert(id, Arc::clone(&shared));
                Some(shared)
            }
        };

        if let Some(shared) = created {
            debug!("session stream {} opened by peer", id);
            // Backpressure: a full backlog holds the receive loop here.
            let _ = self.accepts_tx.send(shared).await;
        }
    }

    fn deliver(&self, id: u32, plain: Vec<u8>, wire_len: usize) {
        let streams = self.streams.lock();
        // Data for streams already closed locally is dropped without charge.
        if let Some(stream) = streams.get(&id) {
            self.bucket.fetch_sub(wire_len as i32, Ordering::SeqCst);
            let overhead = wire_len - plain.len();
            stream.push(Bytes::from(plain), overhead);
        }
    }

    // ------------------------------------------------------------------------
    // Send loop
    // ------------------------------------------------------------------------

    async fn send_loop<W>(
        self: Arc<Self>,
        mut writer: W,
        mut sealer: Sealer,
        codec: HeaderCodec,
        mut writes: mpsc::Receiver<WriteRequest>,
    ) where
        W: AsyncWrite + Unpin,
    {
        loop {
            let req = tokio::select! {
                _ = self.die.fired() => break,
                req = writes.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
            };

            let n = req.frame.data.len();
            let result = match encode_frame(&mut sealer, &codec, &req.frame) {
                Ok(buf) => {
                    trace!("send {:?} sid={} len={}", req.frame.cmd, req.frame.stream_id, buf.len() - HEADER_SIZE);
                    tokio::select! {
                        _ = self.die.fired() => break,
                        written = write_all(&mut writer, &buf) => written.map(|_| n),
                    }
                }
                Err(e) => Err(e),
            };

            let failed = result.as_ref().err().cloned();
            if let Some(tx) = req.result {
                let _ = tx.send(result);
            }
            if let Some(e) = failed {
                self.fail(e, &self.write_error);
                break;
            }
        }
        let _ = writer.shutdown().await;
    }

    // ------------------------------------------------------------------------
    // Keepalive
    // ------------------------------------------------------------------------

    async fn keepalive(self: Arc<Self>) {
        let interval = self.config.keep_alive_interval();
        let timeout = self.config.keep_alive_timeout();
        let mut ping = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut check = tokio::time::interval_at(Instant::now() + timeout, timeout);

        loop {
            tokio::select! {
                _ = self.die.fired() => return,
                _ = ping.tick() => {
                    let nop = Frame::new(self.config.version, Cmd::Nop, 0);
                    let deadline = Some(Instant::now() + interval);
                    let _ = self.write_frame(nop, deadline).await;
                    self.bucket_notify.notify_waiters();
                }
                _ = check.tick() => {
                    // An exhausted bucket means we stopped reading, not that
                    // the peer went quiet.
                    if !self.data_ready.swap(false, Ordering::SeqCst)
                        && self.bucket.load(Ordering::SeqCst) > 0
                    {
                        warn!("session keepalive timeout, no data for {:?}", timeout);
                        self.close();
                        return;
                    }
                }
            }
        }
    }
}

impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("version", &self.config.version)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn encode_frame(sealer: &mut Sealer, codec: &HeaderCodec, frame: &Frame) -> Result<Vec<u8>> {
    let payload = if frame.cmd.carries_payload() && !frame.data.is_empty() {
        sealer.seal(&frame.data)?
    } else {
        Vec::new()
    };
    let length = u16::try_from(payload.len())
        .map_err(|_| Error::Protocol(format!("{} byte payload does not fit a frame", payload.len())))?;

    let header = codec.encode(frame.version, frame.cmd, frame.stream_id, length);
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
        Err(e) => Err(Error::Io(e)),
    }
}

async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_exact(reader, &mut buf).await?;
    Ok(buf)
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// Session Handle
// ============================================================================

/// A multiplexed session over one physical connection.
///
/// Cheap to clone; every clone drives the same session. Must be created
/// inside a Tokio runtime.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start a session over `conn` with an already derived keyring
    pub fn new<T>(conn: T, keyring: Arc<Keyring>, role: Role, config: MuxConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.verify()?;

        let (shaper_tx, shaper_rx) = mpsc::channel(config.shaper_capacity);
        let (writes_tx, writes_rx) = mpsc::channel(1);
        let (accepts_tx, accepts_rx) = mpsc::channel(config.accept_backlog);

        let inner = Arc::new(SessionInner {
            role,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: Mutex::new(role.first_stream_id()),
            go_away: AtomicBool::new(false),
            bucket: AtomicI32::new(config.max_receive_buffer as i32),
            bucket_notify: Notify::new(),
            die: Signal::new(),
            read_error: ErrorLatch::new(),
            write_error: ErrorLatch::new(),
            proto_error: ErrorLatch::new(),
            accepts_tx,
            accepts_rx: tokio::sync::Mutex::new(accepts_rx),
            data_ready: AtomicBool::new(false),
            request_id: AtomicU32::new(0),
            shaper_tx,
            accept_deadline: Mutex::new(None),
            config,
        });

        let codec = HeaderCodec::new(Arc::clone(&keyring)).with_replay_window(inner.config.replay_window());
        let sealer = Sealer::new(
            keyring.cipher_key(),
            NonceCounter::new(keyring.initial_nonce(role.send_direction())),
        );
        let opener = Opener::new(
            keyring.cipher_key(),
            NonceCounter::new(keyring.initial_nonce(role.recv_direction())),
        );

        let (reader, writer) = tokio::io::split(conn);
        tokio::spawn(Arc::clone(&inner).recv_loop(reader, opener, codec.clone()));
        tokio::spawn(Arc::clone(&inner).send_loop(writer, sealer, codec, writes_rx));
        {
            let inner = Arc::clone(&inner);
            let capacity = inner.config.shaper_capacity;
            tokio::spawn(async move { shaper::run(shaper_rx, writes_tx, &inner.die, capacity).await });
        }
        if !inner.config.keep_alive_disabled {
            tokio::spawn(Arc::clone(&inner).keepalive());
        }

        debug!("session started as {:?} (version {})", role, inner.config.version);
        Ok(Self { inner })
    }

    /// Start a session, deriving the keyring from `secret`
    pub fn open<T>(conn: T, secret: &[u8], role: Role, config: MuxConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::new(conn, Arc::new(Keyring::derive(secret)), role, config)
    }

    /// Session for the dialing side
    pub fn client<T>(conn: T, secret: &[u8], config: MuxConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::open(conn, secret, Role::Initiator, config)
    }

    /// Session for the accepting side
    pub fn server<T>(conn: T, secret: &[u8], config: MuxConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::open(conn, secret, Role::Acceptor, config)
    }

    /// Open a new stream.
    ///
    /// Fails with `GoAway` once the id space is used up; the session and its
    /// existing streams keep working.
    pub async fn open_stream(&self) -> Result<Stream> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(inner.closed_error());
        }

        let id = inner.allocate_stream_id()?;
        let shared = Arc::new(StreamShared::new(id));
        {
            let mut streams = inner.streams.lock();
            if inner.is_closed() {
                return Err(inner.closed_error());
            }
            // The peer opened this id first, on our side of the id space.
            if streams.contains_key(&id) {
                return Err(Error::Protocol(format!("stream {} already opened by peer", id)));
            }
            streams.insert(id, Arc::clone(&shared));
        }
        let mut stream = Stream::new(shared, Arc::clone(inner));

        let syn = Frame::new(inner.config.version, Cmd::Syn, id);
        if let Err(e) = inner.write_frame(syn, Some(Instant::now() + OPEN_TIMEOUT)).await {
            stream.abandon();
            return Err(e);
        }
        debug!("session opened stream {}", id);
        Ok(stream)
    }

    /// Wait for the peer to open a stream
    pub async fn accept_stream(&self) -> Result<Stream> {
        let inner = &self.inner;
        let deadline = *inner.accept_deadline.lock();

        let next = async {
            let mut accepts = inner.accepts_rx.lock().await;
            accepts.recv().await
        };

        let result = tokio::select! {
            biased;
            _ = inner.die.fired() => Err(inner.closed_error()),
            shared = next => match shared {
                Some(shared) => Ok(Stream::new(shared, Arc::clone(inner))),
                None => Err(inner.closed_error()),
            },
            _ = until(deadline) => Err(Error::Timeout),
        };

        // close() skips the backlog while a waiter holds it; the waiter
        // clears it on the way out.
        if inner.is_closed() {
            inner.drain_accepts();
        }
        result
    }

    /// Close the session and every stream. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Resolves once the session has closed
    pub async fn closed(&self) {
        self.inner.die.fired().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// No more streams can be opened on this session
    pub fn is_go_away(&self) -> bool {
        self.inner.go_away.load(Ordering::SeqCst)
    }

    pub fn num_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    /// Deadline for `accept_stream`; `None` waits forever
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        *self.inner.accept_deadline.lock() = deadline;
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    /// The error that closed the session, if any
    pub fn error(&self) -> Option<Error> {
        if self.is_closed() {
            Some(self.inner.closed_error())
        } else {
            None
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

#[cfg(test)]
impl Session {
    pub(crate) fn set_next_stream_id(&self, id: u32) {
        *self.inner.next_stream_id.lock() = id;
    }

    pub(crate) fn bucket(&self) -> i32 {
        self.inner.bucket.load(Ordering::SeqCst)
    }

    pub(crate) fn outstanding_tokens(&self) -> usize {
        self.inner.streams.lock().values().map(|s| s.outstanding_tokens()).sum()
    }
}
