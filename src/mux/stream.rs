//! Multiplexed streams
//!
//! A [`Stream`] is one logical byte stream inside a session. Its receive
//! buffer is filled only by the session's receive loop; writes are handed
//! to the session's shaper as PSH frames and complete once queued.
//!
//! ```text
//! Open --local shutdown--> WriteClosed --peer FIN--> Closed
//!  |                                                   ^
//!  +--peer FIN--> HalfClosed --close()/drop------------+
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll, Waker};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::frame::{Cmd, Frame, WindowUpdate, INITIAL_PEER_WINDOW, VERSION_2};
use super::session::{until, SessionInner};

type WriteFuture = Pin<Box<dyn Future<Output = Result<usize>> + Send>>;
type ShutdownFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

// ============================================================================
// Shared State
// ============================================================================

/// Received payload plus the wire overhead still owed to the token bucket
#[derive(Debug)]
struct Chunk {
    data: Bytes,
    overhead: usize,
}

impl Chunk {
    fn tokens(&self) -> usize {
        self.data.len() + self.overhead
    }
}

#[derive(Debug)]
struct StreamState {
    buffers: VecDeque<Chunk>,
    read_waker: Option<Waker>,

    fin_received: bool,
    fin_sent: bool,
    closed: bool,
    session_closed: bool,

    // Receiver side of the version 2 window
    num_read: u32,
    incr: u32,

    // Sender side of the version 2 window
    num_written: u32,
    peer_consumed: u32,
    peer_window: u32,
}

impl StreamState {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn drain(&mut self) -> usize {
        self.buffers.drain(..).map(|c| c.tokens()).sum()
    }
}

/// State shared between a stream handle and the session's receive loop
pub(crate) struct StreamShared {
    id: u32,
    state: Mutex<StreamState>,
    window_notify: Notify,
}

impl StreamShared {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            state: Mutex::new(StreamState {
                buffers: VecDeque::new(),
                read_waker: None,
                fin_received: false,
                fin_sent: false,
                closed: false,
                session_closed: false,
                num_read: 0,
                incr: 0,
                num_written: 0,
                peer_consumed: 0,
                peer_window: INITIAL_PEER_WINDOW,
            }),
            window_notify: Notify::new(),
        }
    }

    /// Append a decrypted payload. `overhead` is the part of the wire length
    /// the reader never sees but which was charged to the bucket.
    pub(crate) fn push(&self, data: Bytes, overhead: usize) {
        let mut state = self.state.lock();
        state.buffers.push_back(Chunk { data, overhead });
        state.wake_reader();
    }

    /// Peer sent FIN
    pub(crate) fn fin(&self) {
        let mut state = self.state.lock();
        state.fin_received = true;
        state.wake_reader();
        drop(state);
        self.window_notify.notify_waiters();
    }

    /// Apply a peer's window update
    pub(crate) fn update(&self, upd: WindowUpdate) {
        let mut state = self.state.lock();
        state.peer_consumed = upd.consumed;
        state.peer_window = upd.window;
        drop(state);
        self.window_notify.notify_waiters();
    }

    /// The session died. Returns the tokens held by unread data.
    pub(crate) fn session_close(&self) -> usize {
        let mut state = self.state.lock();
        state.session_closed = true;
        let tokens = state.drain();
        state.wake_reader();
        drop(state);
        self.window_notify.notify_waiters();
        tokens
    }

    /// Drop unread data and return the tokens it held
    pub(crate) fn recycle_tokens(&self) -> usize {
        self.state.lock().drain()
    }

    /// Tokens held by data that has arrived but not been read yet
    pub(crate) fn outstanding_tokens(&self) -> usize {
        self.state.lock().buffers.iter().map(|c| c.tokens()).sum()
    }

    pub(crate) fn buffered(&self) -> usize {
        self.state.lock().buffers.iter().map(|c| c.data.len()).sum()
    }
}

impl fmt::Debug for StreamShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamShared").field("id", &self.id).finish_non_exhaustive()
    }
}

// ============================================================================
// Stream Handle
// ============================================================================

/// A write that returned `Pending`, kept for the caller's retry
struct PendingWrite {
    data: Bytes,
    fut: WriteFuture,
}

/// One logical stream of a [`Session`](super::Session).
///
/// Implements `AsyncRead`/`AsyncWrite`. `shutdown()` half-closes (sends FIN,
/// keeps reading); [`Stream::close`] or dropping the handle closes fully.
pub struct Stream {
    shared: Arc<StreamShared>,
    session: Arc<SessionInner>,
    pending_write: Option<PendingWrite>,
    shutdown_fut: Option<ShutdownFuture>,
    write_deadline: Option<Instant>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, session: Arc<SessionInner>) -> Self {
        Self {
            shared,
            session,
            pending_write: None,
            shutdown_fut: None,
            write_deadline: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Bytes received and not yet read
    pub fn buffered(&self) -> usize {
        self.shared.buffered()
    }

    /// Bound how long a write may wait for room in the shaper (and, with
    /// version 2, in the peer's window). `None` waits forever.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    /// Send FIN if it has not been sent, then release the stream.
    ///
    /// Does not wait for the peer. Calling it again is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.shared.state.lock().closed {
            return Ok(());
        }
        let result = std::future::poll_fn(|cx| self.poll_close_write(cx)).await;
        self.release();
        result
    }

    /// Forget the stream without telling the peer
    pub(crate) fn abandon(&mut self) {
        self.shared.state.lock().fin_sent = true;
        self.release();
    }

    fn release(&mut self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.wake_reader();
        drop(state);
        self.shared.window_notify.notify_waiters();
        self.session.stream_closed(self.shared.id);
        debug!("stream {} closed", self.shared.id);
    }

    /// Forget a write whose caller gave up on it. Nothing of it has been
    /// queued: the frame is handed to the shaper in the poll that completes it.
    fn discard_pending_write(&mut self) {
        if let Some(pending) = self.pending_write.take() {
            trace!("stream {} dropped abandoned write of {} bytes", self.shared.id, pending.data.len());
        }
    }

    fn poll_close_write(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.discard_pending_write();

        if self.shutdown_fut.is_none() {
            let mut state = self.shared.state.lock();
            if state.fin_sent {
                return Poll::Ready(Ok(()));
            }
            state.fin_sent = true;
            drop(state);

            let session = Arc::clone(&self.session);
            let frame = Frame::new(session.config.version, Cmd::Fin, self.shared.id);
            self.shutdown_fut = Some(Box::pin(async move { session.post_frame(frame).await }));
        }

        let result = match self.shutdown_fut.as_mut() {
            Some(fut) => ready!(fut.as_mut().poll(cx)),
            None => Ok(()),
        };
        self.shutdown_fut = None;
        Poll::Ready(result)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").field("id", &self.shared.id).finish_non_exhaustive()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let state = self.shared.state.lock();
        if state.closed {
            return;
        }
        let send_fin = !state.fin_sent && !state.session_closed;
        drop(state);

        if send_fin {
            self.shared.state.lock().fin_sent = true;
            let frame = Frame::new(self.session.config.version, Cmd::Fin, self.shared.id);
            self.session.post_detached(frame);
        }
        self.release();
    }
}

// ============================================================================
// AsyncRead Implementation
// ============================================================================

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut state = this.shared.state.lock();
        if state.closed {
            return Poll::Ready(Err(Error::StreamClosed.into()));
        }

        // 1. Buffered data, even after FIN
        if let Some(chunk) = state.buffers.front_mut() {
            let n = chunk.data.len().min(buf.remaining());
            buf.put_slice(&chunk.data[..n]);
            chunk.data.advance(n);

            let mut tokens = n;
            if chunk.data.is_empty() {
                tokens += chunk.overhead;
                state.buffers.pop_front();
            }

            let upd = if this.session.config.version == VERSION_2 {
                let first_read = state.num_read == 0;
                state.num_read = state.num_read.wrapping_add(n as u32);
                state.incr = state.incr.wrapping_add(n as u32);
                // The peer starts from INITIAL_PEER_WINDOW, not our buffer
                // size: announce the real window on the first read and
                // refresh before the smaller of the two runs out.
                let window = this.session.config.max_stream_buffer.min(INITIAL_PEER_WINDOW as usize);
                let threshold = (window / 2).max(1) as u32;
                if first_read || state.incr >= threshold {
                    state.incr = 0;
                    Some(WindowUpdate {
                        consumed: state.num_read,
                        window: this.session.config.max_stream_buffer as u32,
                    })
                } else {
                    None
                }
            } else {
                None
            };
            drop(state);

            trace!("stream {} read {} bytes", this.shared.id, n);
            this.session.return_tokens(tokens);
            if let Some(upd) = upd {
                let frame = Frame::new(VERSION_2, Cmd::Upd, this.shared.id)
                    .with_data(Bytes::copy_from_slice(&upd.encode()));
                this.session.post_detached(frame);
            }
            return Poll::Ready(Ok(()));
        }

        // 2. End of stream
        if state.fin_received {
            return Poll::Ready(Ok(()));
        }

        // 3. Session gone
        if state.session_closed {
            drop(state);
            return Poll::Ready(Err(this.session.closed_error().into()));
        }

        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

// ============================================================================
// AsyncWrite Implementation
// ============================================================================

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Only a retry with the same bytes may pick up the pending write.
        if let Some(pending) = &this.pending_write {
            if !buf.starts_with(&pending.data) {
                this.discard_pending_write();
            }
        }

        if this.pending_write.is_none() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            {
                let state = this.shared.state.lock();
                if state.closed || state.fin_sent {
                    return Poll::Ready(Err(Error::StreamClosed.into()));
                }
                if state.session_closed {
                    drop(state);
                    return Poll::Ready(Err(this.session.closed_error().into()));
                }
            }

            let size = buf.len().min(this.session.config.max_frame_size);
            let data = Bytes::copy_from_slice(&buf[..size]);
            let fut = Box::pin(write_owned(
                Arc::clone(&this.shared),
                Arc::clone(&this.session),
                data.clone(),
                this.write_deadline,
            ));
            this.pending_write = Some(PendingWrite { data, fut });
        }

        let result = match this.pending_write.as_mut() {
            Some(pending) => ready!(pending.fut.as_mut().poll(cx)),
            None => Ok(0),
        };
        this.pending_write = None;
        Poll::Ready(result.map_err(io::Error::from))
    }

    /// Frames are queued by `poll_write`; there is nothing to flush. A write
    /// still pending here was abandoned by its caller.
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().discard_pending_write();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_close_write(cx).map_err(io::Error::from)
    }
}

/// Queue one PSH frame carrying a prefix of `data`; returns its length
async fn write_owned(
    shared: Arc<StreamShared>,
    session: Arc<SessionInner>,
    mut data: Bytes,
    deadline: Option<Instant>,
) -> Result<usize> {
    let windowed = session.config.version == VERSION_2;
    if windowed {
        let allowed = wait_for_window(&shared, &session, deadline).await?;
        data.truncate(allowed.min(data.len()));
    }

    let n = data.len();
    let frame = Frame::new(session.config.version, Cmd::Psh, shared.id).with_data(data);
    tokio::select! {
        queued = session.post_frame(frame) => queued?,
        _ = until(deadline) => return Err(Error::Timeout),
    }
    // Counted only once queued, so a dropped write leaves the window intact.
    if windowed {
        let mut state = shared.state.lock();
        state.num_written = state.num_written.wrapping_add(n as u32);
    }
    trace!("stream {} queued {} bytes", shared.id, n);
    Ok(n)
}

/// Wait until the peer's window has room; returns how many bytes fit
async fn wait_for_window(
    shared: &StreamShared,
    session: &SessionInner,
    deadline: Option<Instant>,
) -> Result<usize> {
    loop {
        let notified = shared.window_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        {
            let state = shared.state.lock();
            if state.closed || state.fin_sent {
                return Err(Error::StreamClosed);
            }
            if state.session_closed {
                drop(state);
                return Err(session.closed_error());
            }
            let inflight = state.num_written.wrapping_sub(state.peer_consumed);
            if inflight < state.peer_window {
                return Ok((state.peer_window - inflight) as usize);
            }
            // The peer will not read any more; its window can never open.
            if state.fin_received {
                return Err(Error::StreamClosed);
            }
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = until(deadline) => return Err(Error::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_include_overhead() {
        let shared = StreamShared::new(1);
        shared.push(Bytes::from_static(b"hello"), 16);
        shared.push(Bytes::from_static(b"world!"), 16);
        assert_eq!(shared.buffered(), 11);
        assert_eq!(shared.outstanding_tokens(), 11 + 32);
        assert_eq!(shared.recycle_tokens(), 43);
        assert_eq!(shared.outstanding_tokens(), 0);
    }

    #[test]
    fn test_session_close_drains_buffers() {
        let shared = StreamShared::new(3);
        shared.push(Bytes::from_static(b"abc"), 16);
        assert_eq!(shared.session_close(), 19);
        assert_eq!(shared.buffered(), 0);
        assert!(shared.state.lock().session_closed);
    }

    #[test]
    fn test_window_update_applies() {
        let shared = StreamShared::new(5);
        shared.update(WindowUpdate { consumed: 100, window: 4096 });
        let state = shared.state.lock();
        assert_eq!(state.peer_consumed, 100);
        assert_eq!(state.peer_window, 4096);
    }
}
