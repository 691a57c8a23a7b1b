//! Pipe - bidirectional relay between two streams
//!
//! Both directions are copied concurrently. When one side reaches EOF the
//! opposite writer is shut down, so a half-close travels through the relay.
//! An error in either direction cancels the other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::debug;

/// Default buffer size for relay operations (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved by [`relay`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    /// From the first stream to the second
    pub uploaded: u64,
    /// From the second stream to the first
    pub downloaded: u64,
}

/// Shared cancellation between the two copy directions
struct PipeState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl PipeState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Copy `reader` into `writer` until EOF, error or cancellation
async fn copy_half<R, W>(mut reader: R, mut writer: W, state: &PipeState, label: &str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = BytesMut::zeroed(RELAY_BUFFER_SIZE);

    loop {
        let read = tokio::select! {
            _ = state.cancelled() => return total,
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("relay {} read failed: {}", label, e);
                state.cancel();
                return total;
            }
        };

        let written = tokio::select! {
            _ = state.cancelled() => return total,
            written = async {
                writer.write_all(&buf[..n]).await?;
                // Flush to ensure data is sent immediately
                writer.flush().await
            } => written,
        };
        if let Err(e) = written {
            debug!("relay {} write failed: {}", label, e);
            state.cancel();
            return total;
        }
        total += n as u64;
    }

    // EOF: pass the half-close on
    let _ = writer.shutdown().await;
    total
}

/// Relay data between `a` and `b` until both directions finish
pub async fn relay<A, B>(a: A, b: B) -> PipeStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_reader, a_writer) = tokio::io::split(a);
    let (b_reader, b_writer) = tokio::io::split(b);
    let state = PipeState::new();

    let (uploaded, downloaded) = tokio::join!(
        copy_half(a_reader, b_writer, &state, "upload"),
        copy_half(b_reader, a_writer, &state, "download"),
    );
    PipeStats {
        uploaded,
        downloaded,
    }
}
