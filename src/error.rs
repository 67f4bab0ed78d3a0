//! Error types for the slipgate core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for slipgate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Session-level error taxonomy shared between client and server.
///
/// These codes travel on the wire inside session status and responses, so
/// the discriminants are part of the protocol and must stay stable.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ErrorCode {
    /// No error
    #[default]
    Ok = 0,
    /// Unclassified failure
    GeneralError = 1,
    /// Session exists but is unusable
    SessionError = 2,
    /// Session was closed
    SessionClosed = 3,
    /// Another client of the same token displaced this session
    SessionSuppressedByOther = 4,
    /// A newer connection of the same client displaced this session
    SessionSuppressedBySelf = 5,
    /// Access manager rejected or lost the session
    AccessError = 6,
    /// Token expired
    AccessExpired = 7,
    /// Token traffic quota exhausted
    AccessTrafficOverflow = 8,
    /// Client must retry against another host endpoint
    RedirectHost = 9,
    /// Access manager is in maintenance mode
    Maintenance = 10,
    /// Server protocol version too old for this client
    UnsupportedServer = 11,
    /// Destination rejected by the net filter
    RequestBlocked = 12,
    /// Net-scan heuristic triggered
    NetScan = 13,
    /// Per-session TCP channel quota reached
    MaxTcpChannel = 14,
    /// Per-session pending TCP connect quota reached
    MaxTcpConnectWait = 15,
    /// UDP proxy worker quota reached
    UdpClientQuota = 16,
    /// Request could not be authenticated
    Unauthorized = 17,
    /// Tunnel send queue stayed full past the datagram timeout
    TunnelCongested = 18,
}

impl ErrorCode {
    /// Whether a session carrying this code must be disposed.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorCode::SessionClosed
                | ErrorCode::SessionSuppressedByOther
                | ErrorCode::SessionSuppressedBySelf
                | ErrorCode::AccessError
                | ErrorCode::AccessExpired
                | ErrorCode::AccessTrafficOverflow
                | ErrorCode::RedirectHost
                | ErrorCode::UnsupportedServer
                | ErrorCode::Unauthorized
        )
    }
}

/// Errors that can occur in the slipgate core.
#[derive(Error, Debug)]
pub enum Error {
    /// Failure carrying a session-level error code; becomes a wire response
    /// instead of unwinding the network task.
    #[error("session error {code:?}: {message}")]
    Session {
        /// Code reported to the peer
        code: ErrorCode,
        /// Human-readable detail
        message: String,
    },

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Malformed frame, header or packet
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Operation exceeded its deadline
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Access-manager call failed at the transport level
    #[error("access manager unreachable: {0}")]
    AccessManager(String),

    /// Requested object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IP packet could not be parsed or rewritten
    #[error("packet error: {0}")]
    Packet(String),

    /// The channel or tunnel was disposed
    #[error("object disposed")]
    Disposed,
}

impl Error {
    /// Create a session error with the given code.
    pub fn session(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Session {
            code,
            message: message.into(),
        }
    }

    /// Create a new cryptographic error.
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new invalid-message error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidMessage(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// The session-level code this error maps to on the wire.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::Session { code, .. } => *code,
            Error::NotFound(_) => ErrorCode::AccessError,
            _ => ErrorCode::GeneralError,
        }
    }

    /// Whether the owning session must be disposed because of this error.
    pub fn is_fatal(&self) -> bool {
        self.error_code().is_fatal()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidMessage(e.to_string())
    }
}
