//! MariaDB/MySQL wire protocol engine.
//!
//! This crate implements the client side of the MySQL wire protocol over
//! blocking I/O:
//!
//! - packet framing with per-command sequence numbers and 16 MB splitting
//! - handshake and authentication (native password, caching_sha2 with the
//!   RSA full-auth path, clear password over TLS)
//! - optional TLS upgrade via rustls (`tls` feature)
//! - the type codec for both the text and binary sub-protocols
//! - parameter binding with chunked long-data streaming
//! - buffered and streaming result materialization with cursors
//! - prepared statement lifecycle and XA transaction commands
//!
//! # Example
//!
//! ```rust,ignore
//! use mariner_client::{ClientConfig, Connection, QueryOutcome};
//!
//! let config = ClientConfig::new()
//!     .host("localhost")
//!     .user("app")
//!     .password("secret")
//!     .schema("inventory");
//!
//! let mut conn = Connection::connect(config)?;
//! if let QueryOutcome::Rows(rs) = conn.query("SELECT id, name FROM parts")? {
//!     let mut cursor = rs.cursor();
//!     while cursor.next() {
//!         println!("{:?}", cursor.row());
//!     }
//! }
//! ```

pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod params;
pub mod protocol;
pub mod result;
pub mod statement;
pub mod tls;
pub mod xa;

pub use config::{ClientConfig, CodecConfig, SslMode, TlsConfig};
pub use connection::{
    Connection, ConnectionContext, ConnectionState, ServerVendor, ServerVersion, SharedConnection,
};
pub use cursor::{ForwardCursor, RowCursor};
pub use params::{ParamBinder, ParamHolder, StreamLength};
pub use result::{QueryOutcome, ResultSet, StreamingRows};
pub use statement::StatementHandle;
pub use xa::{XaEndMode, XaError, XaSession, XaStartMode, Xid, recover_flags};

// The shared value/row/error types live in mariner-core.
pub use mariner_core::{Date, DateTime, Error, Result, Row, Time, Value};
