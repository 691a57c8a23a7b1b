//! Error types for Shroud

use std::io;

use thiserror::Error;

/// Main error type for Shroud
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Stream id space exhausted, a new session is required")]
    GoAway,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

/// Result type alias for Shroud
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Framing, authentication and decryption failures.
    ///
    /// These are always fatal to the session that observed them.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::AuthFailed | Error::Crypto(_))
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Recover the crate error carried inside an `io::Error` produced by a stream.
    pub fn from_io(err: &io::Error) -> Option<&Error> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<Error>())
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Error::Io(e) => e.kind(),
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::ConnectionClosed | Error::StreamClosed => io::ErrorKind::BrokenPipe,
            Error::Protocol(_) | Error::AuthFailed | Error::Crypto(_) => io::ErrorKind::InvalidData,
            Error::Config(_) | Error::InvalidAddress(_) => io::ErrorKind::InvalidInput,
            Error::GoAway => io::ErrorKind::ConnectionRefused,
            Error::Unsupported(_) => io::ErrorKind::Unsupported,
        }
    }
}

// Latched session errors are handed out to every blocked caller.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::Config(s) => Error::Config(s.clone()),
            Error::Crypto(s) => Error::Crypto(s.clone()),
            Error::Protocol(s) => Error::Protocol(s.clone()),
            Error::AuthFailed => Error::AuthFailed,
            Error::ConnectionClosed => Error::ConnectionClosed,
            Error::StreamClosed => Error::StreamClosed,
            Error::GoAway => Error::GoAway,
            Error::InvalidAddress(s) => Error::InvalidAddress(s.clone()),
            Error::Timeout => Error::Timeout,
            Error::Unsupported(s) => Error::Unsupported(s.clone()),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_classification() {
        assert!(Error::AuthFailed.is_protocol());
        assert!(Error::Protocol("bad cmd".into()).is_protocol());
        assert!(Error::Crypto("open failed".into()).is_protocol());
        assert!(!Error::Timeout.is_protocol());
        assert!(!Error::GoAway.is_protocol());
    }

    #[test]
    fn test_io_round_trip() {
        let io_err: io::Error = Error::AuthFailed.into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        assert!(matches!(Error::from_io(&io_err), Some(Error::AuthFailed)));

        let io_err: io::Error = Error::Timeout.into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_clone_keeps_io_kind() {
        let err = Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        match err.clone() {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected clone: {:?}", other),
        }
    }
}
