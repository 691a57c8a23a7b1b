//! Tunnel server: one acceptor session per connection, SOCKS5 per stream
//!
//! With `egress` configured the server skips SOCKS5 and forwards every
//! stream to that one address.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::common::{relay, Address, BoxedStream, Result};
use crate::config::Config;
use crate::crypto::Keyring;
use crate::error::Error;
use crate::mux::{MuxConfig, Role, Session, Stream};
use crate::protocol::socks5::{self, Reply};
use crate::transport::{Listener, TcpTransport, Transport};

use super::format_bytes;

/// Terminates tunnel sessions and dials the targets their streams ask for
pub struct TunnelServer {
    listener: Box<dyn Listener>,
    keyring: Arc<Keyring>,
    mux: MuxConfig,
    outbound: Outbound,
}

/// Where the streams of a session are relayed to
#[derive(Clone)]
struct Outbound {
    transport: TcpTransport,
    /// Fixed target; `None` lets each stream pick one over SOCKS5
    egress: Option<Address>,
}

impl TunnelServer {
    pub async fn bind(config: &Config) -> Result<Self> {
        config.validate()?;
        let listen = config.server_address()?;
        let listener = TcpTransport::new().bind(&listen).await?;

        Ok(Self {
            listener,
            keyring: Arc::new(Keyring::derive(config.key.as_bytes())),
            mux: config.mux.clone(),
            outbound: Outbound {
                transport: TcpTransport::new().with_connect_timeout(config.dial_timeout()),
                egress: config.egress_address()?,
            },
        })
    }

    pub fn local_addr(&self) -> Result<Address> {
        self.listener.local_addr()
    }

    /// Accept tunnel connections forever
    pub async fn run(&self) {
        info!(
            "Tunnel server listening on {} (mux version {})",
            self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            self.mux.version
        );
        if let Some(egress) = &self.outbound.egress {
            info!("Forwarding every stream to {}", egress);
        }

        let mut conn_count: u64 = 0;
        loop {
            match self.listener.accept().await {
                Ok((conn, source)) => {
                    conn_count += 1;
                    let conn_id = conn_count;
                    debug!("New tunnel connection #{} from {}", conn_id, source);

                    let keyring = Arc::clone(&self.keyring);
                    let mux = self.mux.clone();
                    let outbound = self.outbound.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_session(conn, keyring, mux, outbound, conn_id).await {
                            warn!("Connection #{} from {} error: {}", conn_id, source, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Accept streams until the session ends
async fn serve_session(
    conn: BoxedStream,
    keyring: Arc<Keyring>,
    mux: MuxConfig,
    outbound: Outbound,
    conn_id: u64,
) -> Result<()> {
    let session = Session::new(conn, keyring, Role::Acceptor, mux)?;
    let mut stream_count: u64 = 0;

    let result = loop {
        match session.accept_stream().await {
            Ok(stream) => {
                stream_count += 1;
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let stream_id = stream.id();
                    if let Err(e) = handle_stream(stream, outbound, conn_id).await {
                        debug!("[#{}] stream {} error: {}", conn_id, stream_id, e);
                    }
                });
            }
            Err(Error::ConnectionClosed) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    session.close();
    debug!("[#{}] Session ended after {} streams", conn_id, stream_count);
    result
}

/// Pick the target for one stream and relay to it
async fn handle_stream(stream: Stream, outbound: Outbound, conn_id: u64) -> Result<()> {
    let start = Instant::now();
    let stream_id = stream.id();

    let (stream, remote, target) = match outbound.egress {
        Some(egress) => {
            let remote = outbound.transport.connect(&egress).await?;
            (stream, remote, egress)
        }
        None => socks5_connect(stream, &outbound.transport).await?,
    };
    debug!("[#{}] stream {} -> {}", conn_id, stream_id, target);

    let stats = relay(stream, remote).await;
    info!(
        "[#{}] Closed: stream {} -> {} (↑{} ↓{} {:?})",
        conn_id,
        stream_id,
        target,
        format_bytes(stats.uploaded),
        format_bytes(stats.downloaded),
        start.elapsed()
    );
    Ok(())
}

/// SOCKS5 handshake on the stream, then dial the requested target
async fn socks5_connect(mut stream: Stream, transport: &TcpTransport) -> Result<(Stream, BoxedStream, Address)> {
    let target = socks5::read_request(&mut stream).await?;

    let remote = match transport.connect(&target).await {
        Ok(remote) => remote,
        Err(e) => {
            let _ = socks5::send_reply(&mut stream, Reply::from_error(&e)).await;
            return Err(e);
        }
    };
    socks5::send_reply(&mut stream, Reply::Succeeded).await?;
    Ok((stream, remote, target))
}
