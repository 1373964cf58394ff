use std::io;

use thiserror::Error;

/// Categorized transport failure, reported to status listeners through the `error` callback.
///
/// These are always recoverable: the affected endpoint is reset and retried after a backoff.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NetErrorCode {
    NameResolutionFailed,
    ConnRefused,
    ConnTimeout,
    HostUnreachable,
    SslNoPeerCert,
    SslPeerCertNotTrusted,
    SslHandshake,
    /// some other connection-phase failure
    ConnOther,
    /// the endpoint stayed silent past the receive timeout (with monitoring enabled)
    IoRxDataTimeout,
    Io,
    Internal,
    Other,
}

#[derive(Debug, Error)]
#[error("{message} ({code:?})")]
pub struct TransportError {
    pub code: NetErrorCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: NetErrorCode, message: impl Into<String>) -> TransportError {
        TransportError {
            code,
            message: message.into(),
        }
    }

    /// Categorizes an error returned while establishing a connection
    pub fn from_connect_error(e: io::Error) -> TransportError {
        let code = match e.kind() {
            io::ErrorKind::ConnectionRefused => NetErrorCode::ConnRefused,
            io::ErrorKind::TimedOut => NetErrorCode::ConnTimeout,
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => NetErrorCode::HostUnreachable,
            _ => NetErrorCode::ConnOther,
        };
        TransportError::new(code, format!("connect failed: {}", e))
    }

    pub fn io(e: io::Error) -> TransportError {
        TransportError::new(NetErrorCode::Io, e.to_string())
    }
}

/// Synchronous result codes of the public API: everything that is not a success
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum CommoError {
    #[error("illegal argument")]
    IllegalArgument,
    #[error("invalid client certificate")]
    InvalidCert,
    #[error("invalid CA certificate")]
    InvalidCaCert,
    #[error("invalid client certificate password")]
    InvalidCertPassword,
    #[error("invalid CA certificate password")]
    InvalidCaCertPassword,
    #[error("contact is gone")]
    ContactGone,
}
