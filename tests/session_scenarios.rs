//! End-to-end behaviour of sessions and the tunnel over real byte pipes

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use shroud::crypto::Keyring;
use shroud::mux::{Cmd, HeaderCodec, MuxConfig, Session, VERSION_1};
use shroud::{Config, Error, TunnelClient, TunnelServer};

const SECRET: &[u8] = b"integration secret";

fn quiet_config() -> MuxConfig {
    MuxConfig {
        keep_alive_disabled: true,
        ..Default::default()
    }
}

fn session_pair() -> (Session, Session) {
    let (a, b) = duplex(64 * 1024);
    (
        Session::client(a, SECRET, quiet_config()).unwrap(),
        Session::server(b, SECRET, quiet_config()).unwrap(),
    )
}

#[tokio::test]
async fn test_hello_over_one_stream() {
    let (client, server) = session_pair();

    let mut out = client.open_stream().await.unwrap();
    out.write_all(b"hello").await.unwrap();

    let mut inbound = server.accept_stream().await.unwrap();
    assert_eq!(inbound.id(), out.id());
    let mut buf = [0u8; 5];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn test_peer_close_reads_to_eof_and_writes_still_succeed() {
    let (client, server) = session_pair();

    let mut out = client.open_stream().await.unwrap();
    out.write_all(b"hi").await.unwrap();

    let mut inbound = server.accept_stream().await.unwrap();
    let mut buf = [0u8; 2];
    inbound.read_exact(&mut buf).await.unwrap();
    inbound.write_all(b"bye").await.unwrap();
    inbound.close().await.unwrap();

    let mut rest = Vec::new();
    out.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"bye");

    // A half-closed stream can still send.
    out.write_all(b"late").await.unwrap();
    out.flush().await.unwrap();
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_corrupted_header_fails_session_with_protocol_error() {
    let (mut raw, conn) = duplex(64 * 1024);
    let server = Session::server(conn, SECRET, quiet_config()).unwrap();
    let codec = HeaderCodec::new(Arc::new(Keyring::derive(SECRET)));

    raw.write_all(&codec.encode(VERSION_1, Cmd::Syn, 1, 0)).await.unwrap();
    let mut stream = server.accept_stream().await.unwrap();
    assert_eq!(stream.id(), 1);

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        stream.read(&mut buf).await
    });
    let acceptor = {
        let server = server.clone();
        tokio::spawn(async move { server.accept_stream().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut bad = codec.encode(VERSION_1, Cmd::Nop, 0, 0);
    bad[19] ^= 0xFF;
    raw.write_all(&bad).await.unwrap();

    let read_err = reader.await.unwrap().unwrap_err();
    assert!(Error::from_io(&read_err).unwrap().is_protocol());

    let accept_err = acceptor.await.unwrap().unwrap_err();
    assert!(accept_err.is_protocol());
    assert!(server.is_closed());
    assert!(server.error().unwrap().is_protocol());
}

#[tokio::test]
async fn test_open_refuses_id_already_opened_by_peer() {
    let (mut raw, conn) = duplex(64 * 1024);
    let server = Session::server(conn, SECRET, quiet_config()).unwrap();
    let codec = HeaderCodec::new(Arc::new(Keyring::derive(SECRET)));

    // A misbehaving initiator takes the acceptor's first id.
    raw.write_all(&codec.encode(VERSION_1, Cmd::Syn, 2, 0)).await.unwrap();
    let taken = server.accept_stream().await.unwrap();
    assert_eq!(taken.id(), 2);

    assert!(matches!(server.open_stream().await, Err(Error::Protocol(_))));
    assert_eq!(server.num_streams(), 1);

    // The next id is still free.
    let own = server.open_stream().await.unwrap();
    assert_eq!(own.id(), 4);
}

#[tokio::test]
async fn test_keepalive_closes_silent_peer() {
    let (_silent, conn) = duplex(64 * 1024);
    let config = MuxConfig {
        keep_alive_interval_ms: 20,
        keep_alive_timeout_ms: 100,
        ..Default::default()
    };
    let client = Session::client(conn, SECRET, config).unwrap();

    tokio::time::timeout(Duration::from_secs(2), client.closed())
        .await
        .expect("session should close after keepalive timeout");
    assert!(matches!(client.error(), Some(Error::ConnectionClosed)));
    assert!(matches!(client.open_stream().await, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_tunnel_relays_socks5_connect() {
    // Echo target
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = target.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    let mut server_config = Config::default_server();
    server_config.key = "tunnel test".into();
    server_config.server_addr = "127.0.0.1:0".into();
    let server = TunnelServer::bind(&server_config).await.unwrap();
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });

    let mut client_config = Config::default_client();
    client_config.key = "tunnel test".into();
    client_config.server_addr = server_addr.to_string();
    client_config.client_addr = Some("127.0.0.1:0".into());
    let client = TunnelClient::bind(&client_config).await.unwrap();
    let client_addr = client.local_addr().unwrap();
    tokio::spawn(async move { client.run().await });

    for _ in 0..2 {
        let mut local = tokio::net::TcpStream::connect(client_addr.to_string()).await.unwrap();

        local.write_all(&[5, 1, 0]).await.unwrap();
        let mut method = [0u8; 2];
        local.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0]);

        let mut request = vec![5, 1, 0, 1];
        match target_addr.ip() {
            std::net::IpAddr::V4(ip) => request.extend_from_slice(&ip.octets()),
            std::net::IpAddr::V6(_) => unreachable!(),
        }
        request.extend_from_slice(&target_addr.port().to_be_bytes());
        local.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        local.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0, "SOCKS5 reply should be success");

        local.write_all(b"through the tunnel").await.unwrap();
        let mut echoed = [0u8; 18];
        local.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"through the tunnel");
    }
}

#[tokio::test]
async fn test_tunnel_forwards_to_fixed_egress() {
    // Greets, then echoes
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = target.accept().await.unwrap();
            tokio::spawn(async move {
                conn.write_all(b"ready").await.unwrap();
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    let mut server_config = Config::default_server();
    server_config.key = "forward test".into();
    server_config.server_addr = "127.0.0.1:0".into();
    server_config.egress = Some(target_addr.to_string());
    let server = TunnelServer::bind(&server_config).await.unwrap();
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });

    let conn = tokio::net::TcpStream::connect(server_addr.to_string()).await.unwrap();
    let session = Session::client(conn, b"forward test", MuxConfig::default()).unwrap();

    for _ in 0..2 {
        // Raw bytes, no SOCKS5 handshake
        let mut stream = session.open_stream().await.unwrap();
        let mut greeting = [0u8; 5];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"ready");

        stream.write_all(b"straight through").await.unwrap();
        let mut echoed = [0u8; 16];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"straight through");
    }
}

#[tokio::test]
async fn test_tunnel_reports_refused_target() {
    // Reserve a port, then free it so nothing listens there.
    let closed_port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };

    let mut server_config = Config::default_server();
    server_config.server_addr = "127.0.0.1:0".into();
    let server = TunnelServer::bind(&server_config).await.unwrap();
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });

    let conn = tokio::net::TcpStream::connect(server_addr.to_string()).await.unwrap();
    let session = Session::client(conn, server_config.key.as_bytes(), MuxConfig::default()).unwrap();
    let mut stream = session.open_stream().await.unwrap();

    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();

    let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
    request.extend_from_slice(&closed_port.to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x05, "connection refused reply");
}
