//! Tunnel client: local listener feeding streams of one shared session

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::common::{relay, Address, BoxedStream, Result};
use crate::config::Config;
use crate::crypto::Keyring;
use crate::error::Error;
use crate::mux::{MuxConfig, Role, Session, Stream};
use crate::transport::{Listener, TcpTransport, Transport};

use super::format_bytes;

/// Accepts local connections and carries each one over its own mux stream.
///
/// The session to the server is dialed on first use and redialed when it
/// dies or runs out of stream ids.
pub struct TunnelClient {
    listener: Box<dyn Listener>,
    connector: Arc<Connector>,
}

impl TunnelClient {
    /// Bind the local listener. The server is not contacted yet.
    pub async fn bind(config: &Config) -> Result<Self> {
        config.validate()?;
        let listen = config.client_address()?;
        let listener = TcpTransport::new().bind(&listen).await?;

        let connector = Connector {
            server: config.server_address()?,
            keyring: Arc::new(Keyring::derive(config.key.as_bytes())),
            mux: config.mux.clone(),
            transport: TcpTransport::new().with_connect_timeout(config.dial_timeout()),
            current: Mutex::new(None),
        };

        Ok(Self {
            listener,
            connector: Arc::new(connector),
        })
    }

    pub fn local_addr(&self) -> Result<Address> {
        self.listener.local_addr()
    }

    /// Accept local connections forever
    pub async fn run(&self) {
        info!(
            "Tunnel client listening on {} (server {})",
            self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            self.connector.server
        );

        let mut conn_count: u64 = 0;
        loop {
            match self.listener.accept().await {
                Ok((conn, source)) => {
                    conn_count += 1;
                    let conn_id = conn_count;
                    debug!("New connection #{} from {}", conn_id, source);

                    let connector = Arc::clone(&self.connector);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(connector, conn, &source, conn_id).await {
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

async fn handle_connection(
    connector: Arc<Connector>,
    conn: BoxedStream,
    source: &Address,
    conn_id: u64,
) -> Result<()> {
    let start = Instant::now();
    let (session, stream) = connector.open_stream().await?;
    let stream_id = stream.id();
    debug!("[#{}] {} -> stream {}", conn_id, source, stream_id);

    let stats = relay(conn, stream).await;
    retire(&session);

    info!(
        "[#{}] Closed: {} via stream {} (↑{} ↓{} {:?})",
        conn_id,
        source,
        stream_id,
        format_bytes(stats.uploaded),
        format_bytes(stats.downloaded),
        start.elapsed()
    );
    Ok(())
}

/// Close a go-away session once its last stream is gone
fn retire(session: &Session) {
    if session.is_go_away() && !session.is_closed() && session.num_streams() == 0 {
        debug!("Closing drained session");
        session.close();
    }
}

/// Owner of the shared session to the tunnel server
struct Connector {
    server: Address,
    keyring: Arc<Keyring>,
    mux: MuxConfig,
    transport: TcpTransport,
    current: Mutex<Option<Session>>,
}

impl Connector {
    /// The live session, dialing a new one if needed
    async fn session(&self) -> Result<Session> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            if !session.is_closed() && !session.is_go_away() {
                return Ok(session.clone());
            }
        }
        if let Some(old) = current.take() {
            retire(&old);
        }

        let conn = self.transport.connect(&self.server).await?;
        let session = Session::new(conn, Arc::clone(&self.keyring), Role::Initiator, self.mux.clone())?;
        info!("Tunnel session established to {}", self.server);

        *current = Some(session.clone());
        Ok(session)
    }

    /// Open a stream, redialing once if the current session can't take it
    async fn open_stream(&self) -> Result<(Session, Stream)> {
        let mut last = Error::ConnectionClosed;
        for _ in 0..2 {
            let session = self.session().await?;
            match session.open_stream().await {
                Ok(stream) => return Ok((session, stream)),
                Err(Error::GoAway) => {
                    debug!("Session ran out of stream ids, redialing");
                    last = Error::GoAway;
                }
                Err(e) if session.is_closed() => {
                    debug!("Session closed ({}), redialing", e);
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }
}
