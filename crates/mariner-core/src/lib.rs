//! Core types for the Mariner MariaDB/MySQL client.
//!
//! This crate holds the leaf abstractions shared between the protocol
//! engine and whatever database-API facade sits on top of it:
//!
//! - `Value` and its temporal structs for decoded wire values
//! - `Row` / `ColumnInfo` for result rows
//! - the error taxonomy (`Error`, `ServerError`, …)
//! - identifier quoting and the DDL foreign-key lexer

pub mod error;
pub mod identifiers;
pub mod row;
pub mod value;

pub use error::{
    AuthError, ConnectionError, ConnectionErrorKind, DecodeError, EncodeError, Error,
    ProtocolError, Result, ServerError, TlsError, XaErrorCode,
};
pub use identifiers::{ForeignKey, QualifiedName, parse_foreign_keys, parse_qualified_ident, quote_ident};
pub use row::{ColumnInfo, Row};
pub use value::{Date, DateTime, Time, Value};
