use std::io::ErrorKind;
use thiserror::Error;

/// Reasons for a failed handshake. These are returned (wrapped in `anyhow::Error`) by
///  `connect()`, so callers can downcast to distinguish them.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum HandshakeError {
    #[error("handshake timeout")]
    Timeout,
    #[error("handshake error: response without ACK flag")]
    MissingAck,
    #[error("connection closed during handshake")]
    Closed,
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,
}

/// ICMP errors for earlier datagrams can surface as receive errors on UDP sockets. They say
///  nothing about the socket itself, so receive loops log them and keep going.
pub(crate) fn is_transient_recv_error(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset)
}
