//! Error types for Mariner operations.

use std::fmt;

/// The primary error type for all Mariner operations.
///
/// The variants split along the propagation policy of the wire protocol:
/// `Protocol`, `Connection`, and post-handshake `Tls` failures permanently
/// invalidate the connection; everything else is local to the failing
/// operation and leaves the connection usable for the next command.
#[derive(Debug)]
pub enum Error {
    /// Wire-level framing or handshake violation. Fatal to the connection.
    Protocol(ProtocolError),
    /// Credential or auth-plugin negotiation failure.
    Auth(AuthError),
    /// TLS negotiation or configuration failure.
    Tls(TlsError),
    /// A row, column, or parameter value could not be converted.
    /// Aborts the in-progress fetch; the connection remains usable.
    Decode(DecodeError),
    /// A value is out of the representable range for its target wire type.
    Encode(EncodeError),
    /// Structured server-reported failure (ERR packet).
    Server(ServerError),
    /// I/O failure or timeout. Fatal: protocol state is indeterminate.
    Connection(ConnectionError),
    /// API-shape mismatch, e.g. scrolling a forward-only result.
    Unsupported(&'static str),
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct AuthError {
    pub plugin: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct TlsError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct DecodeError {
    /// Column (or parameter) the failure occurred on, if known.
    pub column: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct EncodeError {
    pub message: String,
}

/// A structured error reported by the server in an ERR packet.
#[derive(Debug, Clone)]
pub struct ServerError {
    /// Vendor error code (e.g. 1062 for a duplicate key).
    pub code: u16,
    /// Five-character SQLSTATE, empty when the server omitted it.
    pub sqlstate: String,
    /// The server's message text, carried verbatim.
    pub message: String,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish the TCP connection
    Connect,
    /// Connection refused by the peer
    Refused,
    /// Connection lost during an operation
    Disconnected,
    /// Socket-level timeout expired
    Timeout,
    /// Connection already poisoned by an earlier fatal error
    Poisoned,
}

/// XA error kinds translated from the server's XA error codes.
///
/// Codes outside the mapped range surface as plain [`ServerError`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaErrorCode {
    /// 1397: the xid is not known to the resource manager
    XaerNota,
    /// 1398: invalid arguments to an XA command
    XaerInval,
    /// 1399: resource manager error, command unusable in this state
    XaerRmfail,
    /// 1400: operation issued outside a global transaction
    XaerOutside,
    /// 1401: resource manager error on the transaction branch
    XaerRmerr,
    /// 1402: the transaction branch was rolled back
    XaRbrollback,
}

impl ServerError {
    /// Does this error mean the prepared-statement handle is stale?
    ///
    /// Raised by the server when an execute references a statement id it no
    /// longer knows (connection was reset, or the handle was closed).
    /// Callers must re-prepare explicitly; the registry never retries.
    pub fn is_stale_statement(&self) -> bool {
        // ER_UNKNOWN_STMT_HANDLER
        self.code == 1243
    }

    /// Translate the vendor code into an XA error kind, if it is one.
    pub fn xa_code(&self) -> Option<XaErrorCode> {
        match self.code {
            1397 => Some(XaErrorCode::XaerNota),
            1398 => Some(XaErrorCode::XaerInval),
            1399 => Some(XaErrorCode::XaerRmfail),
            1400 => Some(XaErrorCode::XaerOutside),
            1401 => Some(XaErrorCode::XaerRmerr),
            1402 => Some(XaErrorCode::XaRbrollback),
            _ => None,
        }
    }

    /// Check if this is a unique constraint violation (ER_DUP_ENTRY).
    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }
}

impl Error {
    /// Does this error permanently invalidate the connection?
    ///
    /// After a fatal error the wire position is indeterminate and the
    /// connection must be discarded, not retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Connection(_) | Error::Tls(_)
        )
    }

    /// Get the server error, if this is one.
    pub fn as_server(&self) -> Option<&ServerError> {
        match self {
            Error::Server(e) => Some(e),
            _ => None,
        }
    }

    /// Get the SQLSTATE if the server reported one.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(e) if !e.sqlstate.is_empty() => Some(&e.sqlstate),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Auth(e) => match &e.plugin {
                Some(plugin) => {
                    write!(f, "Authentication error ({}): {}", plugin, e.message)
                }
                None => write!(f, "Authentication error: {}", e.message),
            },
            Error::Tls(e) => write!(f, "TLS error: {}", e.message),
            Error::Decode(e) => match &e.column {
                Some(col) => write!(f, "Decode error in column '{}': {}", col, e.message),
                None => write!(f, "Decode error: {}", e.message),
            },
            Error::Encode(e) => write!(f, "Encode error: {}", e.message),
            Error::Server(e) => {
                if e.sqlstate.is_empty() {
                    write!(f, "Server error {}: {}", e.code, e.message)
                } else {
                    write!(
                        f,
                        "Server error {} (SQLSTATE {}): {}",
                        e.code, e.sqlstate, e.message
                    )
                }
            }
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Unsupported(what) => write!(f, "Unsupported operation: {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Tls(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sqlstate.is_empty() {
            write!(f, "{} ({})", self.message, self.code)
        } else {
            write!(f, "{} ({}, SQLSTATE {})", self.message, self.code, self.sqlstate)
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ConnectionErrorKind::Refused,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ConnectionErrorKind::Timeout
            }
            _ => ConnectionErrorKind::Disconnected,
        };
        Error::Connection(ConnectionError {
            kind,
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

/// Result type alias for Mariner operations.
pub type Result<T> = std::result::Result<T, Error>;
