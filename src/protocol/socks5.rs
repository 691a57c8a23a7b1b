//! SOCKS5 server-side negotiation (RFC 1928)
//!
//! Spoken on each stream the tunnel server accepts. Only CONNECT with no
//! authentication is supported; the reply is sent by the caller once the
//! outbound dial has finished.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{Address, Result};
use crate::error::Error;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes sent after the request
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Reply matching a failed outbound dial
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Timeout => Reply::TtlExpired,
            Error::Io(e) => match e.kind() {
                io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
                io::ErrorKind::TimedOut => Reply::TtlExpired,
                io::ErrorKind::PermissionDenied => Reply::NotAllowed,
                _ => Reply::HostUnreachable,
            },
            Error::InvalidAddress(_) => Reply::HostUnreachable,
            _ => Reply::GeneralFailure,
        }
    }
}

/// Run the greeting and read a CONNECT request.
///
/// Unsupported commands and address types are answered here before the
/// error is returned.
pub async fn read_request<S>(stream: &mut S) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 1. Version and auth methods
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    if buf[0] != SOCKS5_VERSION {
        return Err(Error::Protocol(format!(
            "Unsupported SOCKS version: {}",
            buf[0]
        )));
    }

    let mut methods = vec![0u8; buf[1] as usize];
    stream.read_exact(&mut methods).await?;

    // 2. Only "no authentication" is offered
    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(Error::Protocol("No acceptable auth method".into()));
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

    // 3. Request header
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(Error::Protocol("Invalid SOCKS version in request".into()));
    }
    let cmd = header[1];
    let atyp = header[3];

    // 4. Destination
    let address = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Address::Socket(SocketAddr::new(Ipv4Addr::from(addr).into(), port))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut domain = vec![0u8; len as usize];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Error::InvalidAddress("domain is not valid UTF-8".into()))?;
            Address::Domain(domain, port)
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Address::Socket(SocketAddr::new(Ipv6Addr::from(addr).into(), port))
        }
        _ => {
            send_reply(stream, Reply::AddressTypeNotSupported).await?;
            return Err(Error::Protocol(format!(
                "Unsupported address type: {}",
                atyp
            )));
        }
    };

    // 5. Command
    match cmd {
        CMD_CONNECT => Ok(address),
        CMD_BIND | CMD_UDP_ASSOCIATE => {
            send_reply(stream, Reply::CommandNotSupported).await?;
            Err(Error::Unsupported(format!("SOCKS5 command 0x{:02x}", cmd)))
        }
        _ => {
            send_reply(stream, Reply::CommandNotSupported).await?;
            Err(Error::Protocol(format!("Unsupported command: {}", cmd)))
        }
    }
}

/// Send a reply with an unspecified bound address
pub async fn send_reply<S>(stream: &mut S, reply: Reply) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let buf = [
        SOCKS5_VERSION,
        reply as u8,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}
