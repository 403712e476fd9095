//! Connection establishment and the command channel.
//!
//! The connector walks the handshake: read the server greeting, intersect
//! capabilities, optionally upgrade to TLS, answer the auth challenge
//! (following auth-switch and caching_sha2 full-auth detours), and land in
//! `Ready`. From there the command channel sends exactly one command at a
//! time and reads its response packets, reassembling continuation frames.
//!
//! Fatal errors (framing violations, I/O failures, timeouts) poison the
//! connection: the wire position is unknowable afterwards, so every later
//! call fails fast with a `Poisoned` connection error.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::result_large_err)]

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use tracing::{debug, trace};

use mariner_core::error::{
    AuthError, ConnectionError, ConnectionErrorKind, Error, ProtocolError, Result,
};

use crate::auth;
use crate::config::ClientConfig;
use crate::protocol::{
    Command, ErrPacket, FrameHeader, MAX_FRAME_SIZE, OkPacket, WireReader, WireWriter, capability,
    status, writer,
};
#[cfg(feature = "tls")]
use crate::tls::TlsStream;

/// Vendor of the server we are speaking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerVendor {
    MySql,
    MariaDb,
}

/// Parsed server version, used to gate version-dependent wire behavior.
#[derive(Debug, Clone)]
pub struct ServerVersion {
    pub vendor: ServerVendor,
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    /// The raw version string from the greeting
    pub raw: String,
}

impl ServerVersion {
    /// Parse a greeting version string.
    ///
    /// MariaDB 10+ servers announce themselves as `5.5.5-10.x.y-MariaDB-…`
    /// for replication compatibility; the prefix is stripped before the
    /// real version is read.
    pub fn parse(raw: &str) -> Self {
        let lowered = raw.to_ascii_lowercase();
        let mut vendor = if lowered.contains("mariadb") {
            ServerVendor::MariaDb
        } else {
            ServerVendor::MySql
        };

        let body = match raw.strip_prefix("5.5.5-") {
            Some(rest) => {
                vendor = ServerVendor::MariaDb;
                rest
            }
            None => raw,
        };

        let mut nums = body.split('.');
        let major = leading_digits(nums.next().unwrap_or(""));
        let minor = leading_digits(nums.next().unwrap_or(""));
        let patch = leading_digits(nums.next().unwrap_or(""));

        Self {
            vendor,
            major,
            minor,
            patch,
            raw: raw.to_string(),
        }
    }

    fn at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }

    /// Do temporal values carry fractional seconds on this server?
    ///
    /// MariaDB since 5.3.0, MySQL since 5.6.4. Older servers never put
    /// fraction bytes on the wire and none may be read.
    pub fn supports_fractional_seconds(&self) -> bool {
        match self.vendor {
            ServerVendor::MariaDb => self.at_least(5, 3, 0),
            ServerVendor::MySql => self.at_least(5, 6, 4),
        }
    }
}

fn leading_digits(s: &str) -> u16 {
    let end = s
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(s.len());
    s[..end].parse().unwrap_or(0)
}

/// Negotiated session state, refreshed after every command.
///
/// Owned exclusively by one [`Connection`]; codec functions receive it by
/// reference instead of reading ambient state.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Intersection of requested and advertised capability flags
    pub capabilities: u32,
    pub version: ServerVersion,
    /// Status flags from the most recent OK/EOF/ERR packet
    pub status_flags: u16,
    pub connection_id: u32,
    pub charset: u8,
    /// Schema selected at connect time
    pub schema: Option<String>,
}

impl ConnectionContext {
    pub fn new(capabilities: u32, version: ServerVersion) -> Self {
        Self {
            capabilities,
            version,
            status_flags: 0,
            connection_id: 0,
            charset: crate::protocol::charset::DEFAULT,
            schema: None,
        }
    }

    pub fn has_capability(&self, flag: u32) -> bool {
        self.capabilities & flag != 0
    }

    /// Is the session in NO_BACKSLASH_ESCAPES mode? Decides how string
    /// literals are escaped in the text protocol.
    pub fn no_backslash_escapes(&self) -> bool {
        self.status_flags & status::NO_BACKSLASH_ESCAPES != 0
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & status::IN_TRANS != 0
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,
    /// Auth exchange in progress
    Authenticating,
    /// Idle, a command may be sent
    Ready,
    /// A command's response is being consumed
    InCommand,
    /// Poisoned by a fatal error; unusable
    Failed,
    /// Closed by the client
    Closed,
}

/// The byte stream under the protocol, plain or TLS.
enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.flush(),
        }
    }
}

/// The server's initial handshake packet (protocol version 10).
#[derive(Debug, Clone)]
pub(crate) struct Greeting {
    pub server_version: String,
    pub connection_id: u32,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_seed: Vec<u8>,
    pub auth_plugin: String,
}

impl Greeting {
    pub(crate) fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);

        let protocol_version = r
            .u8()
            .ok_or_else(|| protocol_err("empty greeting"))?;
        if protocol_version != 10 {
            return Err(protocol_err(format!(
                "unsupported handshake protocol version {protocol_version}"
            )));
        }

        let server_version = r
            .cstr()
            .ok_or_else(|| protocol_err("greeting missing server version"))?;
        let connection_id = r
            .u32_le()
            .ok_or_else(|| protocol_err("greeting missing connection id"))?;
        let seed_head = r
            .take(8)
            .ok_or_else(|| protocol_err("greeting missing auth seed"))?
            .to_vec();
        r.skip(1); // filler

        let caps_low = r
            .u16_le()
            .ok_or_else(|| protocol_err("greeting missing capability flags"))?;
        let charset = r.u8().unwrap_or(crate::protocol::charset::DEFAULT);
        let status_flags = r.u16_le().unwrap_or(0);
        let caps_high = r.u16_le().unwrap_or(0);
        let capabilities = u32::from(caps_low) | (u32::from(caps_high) << 16);

        let seed_len = if capabilities & capability::PLUGIN_AUTH != 0 {
            usize::from(r.u8().unwrap_or(0))
        } else {
            0
        };
        r.skip(10); // reserved

        let mut auth_seed = seed_head;
        if capabilities & capability::SECURE_CONNECTION != 0 {
            let tail_len = seed_len.saturating_sub(8).max(13);
            if let Some(tail) = r.take(tail_len) {
                let tail = if tail.last() == Some(&0) {
                    &tail[..tail.len() - 1]
                } else {
                    tail
                };
                auth_seed.extend_from_slice(tail);
            }
        }

        let auth_plugin = if capabilities & capability::PLUGIN_AUTH != 0 {
            r.cstr().unwrap_or_default()
        } else {
            auth::plugin::NATIVE_PASSWORD.to_string()
        };

        Ok(Self {
            server_version,
            connection_id,
            capabilities,
            charset,
            status_flags,
            auth_seed,
            auth_plugin,
        })
    }
}

/// A live connection: the connector's product and the command channel.
pub struct Connection {
    transport: Transport,
    state: ConnectionState,
    context: ConnectionContext,
    config: ClientConfig,
    /// Next expected/used frame sequence number within the current command
    sequence: u8,
    affected_rows: u64,
    last_insert_id: u64,
    warnings: u16,
    /// Set when the last result signalled MORE_RESULTS_EXISTS
    pending_results: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("connection_id", &self.context.connection_id)
            .field("server", &self.context.version.raw)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect and authenticate, producing a ready connection.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let tcp = open_socket(&config)?;
        let mut transport = Transport::Plain(tcp);
        let mut sequence: u8 = 0;

        let payload = read_payload(&mut transport, &mut sequence)?;
        // The greeting itself may be an ERR packet (e.g. host blocked).
        if payload.first() == Some(&0xFF) {
            let mut r = WireReader::new(&payload);
            let err = r
                .err_packet()
                .ok_or_else(|| protocol_err("malformed pre-auth error packet"))?;
            return Err(server_error(err));
        }
        let greeting = Greeting::parse(&payload)?;
        debug!(
            server = %greeting.server_version,
            connection_id = greeting.connection_id,
            plugin = %greeting.auth_plugin,
            "greeting received"
        );

        let client_caps = config.capability_flags() & greeting.capabilities;

        let use_tls = crate::tls::negotiate(config.ssl_mode, greeting.capabilities)?;
        #[cfg(feature = "tls")]
        let mut transport = if use_tls {
            let ssl_request = crate::tls::build_ssl_request(
                client_caps,
                config.max_packet_size,
                config.charset,
                sequence,
            );
            transport.write_all(&ssl_request).map_err(Error::from)?;
            transport.flush().map_err(Error::from)?;
            sequence = sequence.wrapping_add(1);

            match transport {
                Transport::Plain(tcp) => {
                    let tls =
                        TlsStream::connect(tcp, &config.tls, &config.host, config.ssl_mode)?;
                    debug!("TLS upgrade complete");
                    Transport::Tls(Box::new(tls))
                }
                other => other,
            }
        } else {
            transport
        };
        #[cfg(not(feature = "tls"))]
        let _ = use_tls;

        let version = ServerVersion::parse(&greeting.server_version);
        let mut context = ConnectionContext {
            capabilities: client_caps,
            version,
            status_flags: greeting.status_flags,
            connection_id: greeting.connection_id,
            charset: config.charset,
            schema: config.schema.clone(),
        };

        let response = build_handshake_response(&config, &greeting, client_caps);
        write_payload(&mut transport, &mut sequence, &response)?;

        let secure_channel = cfg!(feature = "tls") && use_tls;
        authenticate(
            &mut transport,
            &mut sequence,
            &config,
            &greeting.auth_plugin,
            &greeting.auth_seed,
            secure_channel,
            &mut context,
        )?;

        debug!(connection_id = context.connection_id, "connection ready");
        Ok(Self {
            transport,
            state: ConnectionState::Ready,
            context,
            config,
            sequence: 0,
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
            pending_results: false,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Rows affected by the last data-modifying command.
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    /// Did the last result announce a follow-up result (multi-statement)?
    pub fn has_pending_results(&self) -> bool {
        self.pending_results
    }

    /// Check the server is alive.
    pub fn ping(&mut self) -> Result<()> {
        self.begin_command(Command::Ping, &[])?;
        let payload = self.read_packet()?;
        let ok = self.expect_ok(&payload)?;
        self.finish_command(ok.status_flags);
        Ok(())
    }

    /// Discard session state server-side (also invalidates every prepared
    /// statement handle on this connection).
    pub fn reset_session(&mut self) -> Result<()> {
        self.begin_command(Command::ResetConnection, &[])?;
        let payload = self.read_packet()?;
        let ok = self.expect_ok(&payload)?;
        self.finish_command(ok.status_flags);
        Ok(())
    }

    /// Send COM_QUIT and drop the socket. Errors on the farewell write are
    /// ignored; the connection is gone either way.
    pub fn close(mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.sequence = 0;
        let packet = writer::frame_command(Command::Quit, &[]);
        let _ = self.transport.write_all(&packet);
        let _ = self.transport.flush();
        self.state = ConnectionState::Closed;
        Ok(())
    }

    /// Start a command: reset sequence numbering and send the first packet.
    ///
    /// Exactly one command may be in flight; calling this while a previous
    /// response is undrained is a protocol violation on our side and
    /// poisons the connection.
    pub(crate) fn begin_command(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        match self.state {
            ConnectionState::Ready => {}
            ConnectionState::Failed => {
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Poisoned,
                    message: "connection poisoned by an earlier fatal error".to_string(),
                    source: None,
                }));
            }
            ConnectionState::Closed => {
                return Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Disconnected,
                    message: "connection is closed".to_string(),
                    source: None,
                }));
            }
            _ => {
                return Err(self.fail(protocol_err(
                    "command issued while another command is in flight",
                )));
            }
        }

        self.pending_results = false;
        self.sequence = 0;
        self.state = ConnectionState::InCommand;
        trace!(command = ?command, payload_len = payload.len(), "sending command");

        let mut w = WireWriter::with_capacity(1 + payload.len());
        w.u8(command as u8);
        w.bytes(payload);
        self.write_packet_raw(w.as_bytes())
    }

    /// Send a command the server never answers (COM_STMT_CLOSE,
    /// COM_STMT_SEND_LONG_DATA). The channel is immediately ready for the
    /// next command.
    pub(crate) fn send_command_no_reply(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        self.begin_command(command, payload)?;
        self.state = ConnectionState::Ready;
        Ok(())
    }

    /// Send a follow-up packet within the current command (e.g. long data
    /// is its own command; this is used by the connector and auth only).
    pub(crate) fn write_packet_raw(&mut self, payload: &[u8]) -> Result<()> {
        match write_payload(&mut self.transport, &mut self.sequence, payload) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Read one reassembled response payload.
    pub(crate) fn read_packet(&mut self) -> Result<Vec<u8>> {
        match read_payload(&mut self.transport, &mut self.sequence) {
            Ok(p) => Ok(p),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Re-enter command mode to consume a pending follow-up result.
    /// Sequence numbering continues; the follow-up belongs to the same
    /// command exchange.
    pub(crate) fn resume_pending(&mut self) -> Result<()> {
        if self.state != ConnectionState::Ready {
            return Err(self.fail(protocol_err(
                "follow-up result requested while a command is in flight",
            )));
        }
        self.state = ConnectionState::InCommand;
        Ok(())
    }

    /// Mark the command finished and absorb the closing status flags.
    pub(crate) fn finish_command(&mut self, status_flags: u16) {
        self.context.status_flags = status_flags;
        self.pending_results = status_flags & status::MORE_RESULTS_EXISTS != 0;
        self.state = ConnectionState::Ready;
    }

    /// Record the bookkeeping columns of an OK packet.
    pub(crate) fn absorb_ok(&mut self, ok: &OkPacket) {
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        self.warnings = ok.warnings;
    }

    /// Interpret a payload that must be OK or ERR.
    pub(crate) fn expect_ok(&mut self, payload: &[u8]) -> Result<OkPacket> {
        match payload.first() {
            Some(0x00) => {
                let mut r = WireReader::new(payload);
                let ok = r
                    .ok_packet()
                    .ok_or_else(|| self.fail(protocol_err("malformed OK packet")))?;
                self.absorb_ok(&ok);
                Ok(ok)
            }
            Some(0xFF) => Err(self.take_server_error(payload)),
            _ => Err(self.fail(protocol_err("expected OK or ERR packet"))),
        }
    }

    /// Parse an ERR payload and return to `Ready`: server errors abort the
    /// command but leave the connection usable.
    pub(crate) fn take_server_error(&mut self, payload: &[u8]) -> Error {
        let mut r = WireReader::new(payload);
        match r.err_packet() {
            Some(err) => {
                self.state = ConnectionState::Ready;
                self.pending_results = false;
                server_error(err)
            }
            None => self.fail(protocol_err("malformed ERR packet")),
        }
    }

    /// Poison the connection with a fatal error; non-fatal errors pass
    /// through untouched.
    pub(crate) fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            self.state = ConnectionState::Failed;
        }
        err
    }
}

/// A `Connection` behind a mutex, for callers that must share one session
/// across threads. The lock is the session mutex: it serializes whole
/// commands, never individual packets.
pub struct SharedConnection {
    inner: std::sync::Mutex<Connection>,
}

impl SharedConnection {
    pub fn new(conn: Connection) -> Self {
        Self {
            inner: std::sync::Mutex::new(conn),
        }
    }

    pub fn connect(config: ClientConfig) -> Result<Self> {
        Connection::connect(config).map(Self::new)
    }

    /// Run `f` with exclusive use of the connection.
    pub fn with<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.lock().map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Poisoned,
                message: "connection mutex poisoned".to_string(),
                source: None,
            })
        })?;
        f(&mut guard)
    }

    pub fn into_inner(self) -> Result<Connection> {
        self.inner.into_inner().map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Poisoned,
                message: "connection mutex poisoned".to_string(),
                source: None,
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Connector internals
// ---------------------------------------------------------------------------

fn open_socket(config: &ClientConfig) -> Result<TcpStream> {
    let addrs = config
        .socket_addr()
        .to_socket_addrs()
        .map_err(|e| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("failed to resolve {}: {e}", config.socket_addr()),
                source: Some(Box::new(e)),
            })
        })?
        .collect::<Vec<_>>();

    let mut last_err: Option<std::io::Error> = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                stream.set_read_timeout(config.io_timeout).ok();
                stream.set_write_timeout(config.io_timeout).ok();
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    let (kind, detail) = match last_err {
        Some(e) => {
            let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                ConnectionErrorKind::Refused
            } else {
                ConnectionErrorKind::Connect
            };
            (kind, e.to_string())
        }
        None => (
            ConnectionErrorKind::Connect,
            "no addresses resolved".to_string(),
        ),
    };
    Err(Error::Connection(ConnectionError {
        kind,
        message: format!("failed to connect to {}: {detail}", config.socket_addr()),
        source: None,
    }))
}

/// Build the handshake response payload (sent after any TLS upgrade).
pub(crate) fn build_handshake_response(
    config: &ClientConfig,
    greeting: &Greeting,
    client_caps: u32,
) -> Vec<u8> {
    let password = config.password.as_deref().unwrap_or("");
    let auth_response = initial_auth_response(&greeting.auth_plugin, password, &greeting.auth_seed);

    let mut w = WireWriter::with_capacity(128);
    w.u32_le(client_caps);
    w.u32_le(config.max_packet_size);
    w.u8(config.charset);
    w.zeros(23);
    w.cstr(&config.user);

    if client_caps & capability::PLUGIN_AUTH_LENENC_DATA != 0 {
        w.lenenc_bytes(&auth_response);
    } else if client_caps & capability::SECURE_CONNECTION != 0 {
        w.u8(auth_response.len() as u8);
        w.bytes(&auth_response);
    } else {
        w.bytes(&auth_response);
        w.u8(0);
    }

    if client_caps & capability::CONNECT_WITH_DB != 0 {
        match &config.schema {
            Some(schema) => w.cstr(schema),
            None => w.u8(0),
        }
    }

    if client_caps & capability::PLUGIN_AUTH != 0 {
        w.cstr(&greeting.auth_plugin);
    }

    if client_caps & capability::CONNECT_ATTRS != 0 && !config.attributes.is_empty() {
        let mut attrs = WireWriter::new();
        for (key, value) in &config.attributes {
            attrs.lenenc_str(key);
            attrs.lenenc_str(value);
        }
        w.lenenc_bytes(attrs.as_bytes());
    }

    w.into_bytes()
}

fn initial_auth_response(plugin: &str, password: &str, seed: &[u8]) -> Vec<u8> {
    match plugin {
        auth::plugin::CACHING_SHA2 => auth::caching_sha2_scramble(password, seed),
        auth::plugin::CLEAR_PASSWORD => auth::clear_password_response(password),
        // Unknown plugins get the native scramble; the server will send an
        // auth-switch if it wants something else.
        _ => auth::native_password_scramble(password, seed),
    }
}

/// Drive the post-response auth exchange to OK or failure.
fn authenticate(
    transport: &mut Transport,
    sequence: &mut u8,
    config: &ClientConfig,
    initial_plugin: &str,
    initial_seed: &[u8],
    secure_channel: bool,
    context: &mut ConnectionContext,
) -> Result<()> {
    let password = config.password.as_deref().unwrap_or("");
    let mut plugin = initial_plugin.to_string();
    let mut seed = initial_seed.to_vec();
    // Auth switches are bounded; a server that keeps switching is broken.
    let mut switches_left = 4u8;

    loop {
        let payload = read_payload(transport, sequence)?;
        match payload.first() {
            Some(0x00) => {
                let mut r = WireReader::new(&payload);
                if let Some(ok) = r.ok_packet() {
                    context.status_flags = ok.status_flags;
                }
                return Ok(());
            }
            Some(0xFF) => {
                let mut r = WireReader::new(&payload);
                let err = r
                    .err_packet()
                    .ok_or_else(|| protocol_err("malformed auth error packet"))?;
                return Err(Error::Auth(AuthError {
                    plugin: Some(plugin),
                    message: format!("{} ({})", err.message, err.code),
                }));
            }
            Some(0xFE) => {
                // Auth switch: new plugin name + new seed.
                if switches_left == 0 {
                    return Err(protocol_err("server requested too many auth switches"));
                }
                switches_left -= 1;

                let mut r = WireReader::new(&payload[1..]);
                plugin = r
                    .cstr()
                    .ok_or_else(|| protocol_err("auth switch missing plugin name"))?;
                seed = r.take_rest().to_vec();
                if seed.last() == Some(&0) {
                    seed.pop();
                }
                debug!(plugin = %plugin, "auth switch requested");

                let response = initial_auth_response(&plugin, password, &seed);
                write_payload(transport, sequence, &response)?;
            }
            Some(0x01) => {
                // AuthMoreData, used by the caching_sha2/sha256 plugins.
                handle_auth_more_data(
                    transport,
                    sequence,
                    &payload[1..],
                    password,
                    &seed,
                    secure_channel,
                )?;
            }
            _ => {
                return Err(protocol_err("unrecognized packet during authentication"));
            }
        }
    }
}

fn handle_auth_more_data(
    transport: &mut Transport,
    sequence: &mut u8,
    data: &[u8],
    password: &str,
    seed: &[u8],
    secure_channel: bool,
) -> Result<()> {
    match data.first() {
        Some(&auth::sha2_signal::FAST_AUTH_OK) => {
            // The OK packet follows on its own; the main loop reads it.
            Ok(())
        }
        Some(&auth::sha2_signal::FULL_AUTH) => {
            if secure_channel {
                // The channel is encrypted; plaintext is acceptable.
                write_payload(transport, sequence, &auth::clear_password_response(password))
            } else {
                // Ask for the server's RSA key, then send the encrypted
                // password.
                write_payload(transport, sequence, &[auth::sha2_signal::REQUEST_PUBLIC_KEY])?;
                let key_packet = read_payload(transport, sequence)?;
                let pem = match key_packet.first() {
                    Some(0x01) => &key_packet[1..],
                    _ => &key_packet[..],
                };
                let encrypted = auth::rsa_encrypt_password(password, seed, pem, true)?;
                write_payload(transport, sequence, &encrypted)
            }
        }
        _ => Err(protocol_err("unexpected auth continuation data")),
    }
}

// ---------------------------------------------------------------------------
// Frame I/O
// ---------------------------------------------------------------------------

/// Read one logical payload, reassembling continuation frames.
///
/// `sequence` holds the expected sequence number of the next frame and is
/// advanced past every frame consumed. A sequence mismatch means the wire
/// position is lost, which is fatal.
fn read_payload(stream: &mut impl Read, sequence: &mut u8) -> Result<Vec<u8>> {
    let mut payload = Vec::new();

    loop {
        let mut header_buf = [0u8; FrameHeader::SIZE];
        stream.read_exact(&mut header_buf).map_err(Error::from)?;
        let header = FrameHeader::decode(&header_buf);

        if header.sequence != *sequence {
            return Err(protocol_err(format!(
                "frame sequence mismatch: expected {}, got {}",
                *sequence, header.sequence
            )));
        }
        *sequence = header.sequence.wrapping_add(1);

        let len = header.payload_len as usize;
        let start = payload.len();
        payload.resize(start + len, 0);
        if len > 0 {
            stream
                .read_exact(&mut payload[start..])
                .map_err(Error::from)?;
        }

        if len < MAX_FRAME_SIZE {
            return Ok(payload);
        }
        // Exactly max-size: a continuation (possibly empty) follows.
    }
}

/// Frame and write one logical payload, advancing the sequence counter
/// past every frame emitted.
fn write_payload(stream: &mut impl Write, sequence: &mut u8, payload: &[u8]) -> Result<()> {
    let framed = writer::frame_payload(payload, *sequence);
    let frames = (payload.len() / MAX_FRAME_SIZE + 1) as u8;
    *sequence = sequence.wrapping_add(frames);

    stream.write_all(&framed).map_err(Error::from)?;
    stream.flush().map_err(Error::from)?;
    Ok(())
}

pub(crate) fn protocol_err(message: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: message.into(),
        source: None,
    })
}

pub(crate) fn server_error(err: ErrPacket) -> Error {
    Error::Server(mariner_core::error::ServerError {
        code: err.code,
        sqlstate: err.sqlstate,
        message: err.message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn version_parse_mysql() {
        let v = ServerVersion::parse("8.0.36");
        assert_eq!(v.vendor, ServerVendor::MySql);
        assert_eq!((v.major, v.minor, v.patch), (8, 0, 36));
        assert!(v.supports_fractional_seconds());

        let old = ServerVersion::parse("5.6.3-log");
        assert!(!old.supports_fractional_seconds());
        let just = ServerVersion::parse("5.6.4");
        assert!(just.supports_fractional_seconds());
    }

    #[test]
    fn version_parse_mariadb_prefix() {
        let v = ServerVersion::parse("5.5.5-10.6.12-MariaDB-1:10.6.12+maria~ubu2004");
        assert_eq!(v.vendor, ServerVendor::MariaDb);
        assert_eq!((v.major, v.minor, v.patch), (10, 6, 12));
        assert!(v.supports_fractional_seconds());

        let bare = ServerVersion::parse("10.11.2-MariaDB");
        assert_eq!(bare.vendor, ServerVendor::MariaDb);
        assert_eq!(bare.major, 10);
    }

    #[test]
    fn version_parse_old_mariadb() {
        let v = ServerVersion::parse("5.2.9-MariaDB");
        assert_eq!(v.vendor, ServerVendor::MariaDb);
        assert!(!v.supports_fractional_seconds());
    }

    #[test]
    fn context_status_helpers() {
        let mut ctx = ConnectionContext::new(0, ServerVersion::parse("8.0.36"));
        assert!(!ctx.no_backslash_escapes());
        ctx.status_flags = status::NO_BACKSLASH_ESCAPES | status::IN_TRANS;
        assert!(ctx.no_backslash_escapes());
        assert!(ctx.in_transaction());
    }

    fn greeting_payload(caps: u32, plugin: &str) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.u8(10);
        w.cstr("8.0.36");
        w.u32_le(99);
        w.bytes(&[1, 2, 3, 4, 5, 6, 7, 8]);
        w.u8(0); // filler
        w.u16_le((caps & 0xFFFF) as u16);
        w.u8(255); // charset
        w.u16_le(status::AUTOCOMMIT);
        w.u16_le((caps >> 16) as u16);
        w.u8(21); // seed length
        w.zeros(10);
        w.bytes(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]);
        w.u8(0); // seed tail NUL
        w.cstr(plugin);
        w.into_bytes()
    }

    #[test]
    fn greeting_parse_full() {
        let caps = capability::PROTOCOL_41
            | capability::PLUGIN_AUTH
            | capability::SECURE_CONNECTION
            | capability::SSL;
        let payload = greeting_payload(caps, "caching_sha2_password");
        let g = Greeting::parse(&payload).unwrap();

        assert_eq!(g.server_version, "8.0.36");
        assert_eq!(g.connection_id, 99);
        assert_eq!(g.capabilities, caps);
        assert_eq!(g.status_flags, status::AUTOCOMMIT);
        assert_eq!(g.auth_plugin, "caching_sha2_password");
        assert_eq!(g.auth_seed.len(), 20);
        assert_eq!(&g.auth_seed[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn greeting_rejects_wrong_protocol() {
        let payload = [9u8, 0];
        assert!(matches!(
            Greeting::parse(&payload),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn handshake_response_layout() {
        let caps = capability::PROTOCOL_41
            | capability::PLUGIN_AUTH
            | capability::PLUGIN_AUTH_LENENC_DATA
            | capability::SECURE_CONNECTION
            | capability::CONNECT_WITH_DB;
        let payload = greeting_payload(caps, "mysql_native_password");
        let greeting = Greeting::parse(&payload).unwrap();

        let config = ClientConfig::new()
            .user("svc")
            .password("pw")
            .schema("app");
        let response = build_handshake_response(&config, &greeting, caps);

        let mut r = WireReader::new(&response);
        assert_eq!(r.u32_le(), Some(caps));
        assert_eq!(r.u32_le(), Some(config.max_packet_size));
        assert_eq!(r.u8(), Some(config.charset));
        r.skip(23);
        assert_eq!(r.cstr().as_deref(), Some("svc"));
        // Scramble is 20 bytes, length-encoded
        let scramble = r.lenenc_bytes().unwrap();
        assert_eq!(scramble.len(), 20);
        assert_eq!(r.cstr().as_deref(), Some("app"));
        assert_eq!(r.cstr().as_deref(), Some("mysql_native_password"));
        assert!(r.is_empty());
    }

    #[test]
    fn read_payload_single_frame() {
        let mut framed = vec![3, 0, 0, 0];
        framed.extend_from_slice(b"abc");
        let mut seq = 0u8;
        let payload = read_payload(&mut Cursor::new(framed), &mut seq).unwrap();
        assert_eq!(payload, b"abc");
        assert_eq!(seq, 1);
    }

    #[test]
    fn read_payload_reassembles_continuations() {
        // A max-size frame followed by a 5-byte remainder.
        let mut framed = Vec::new();
        framed.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0]);
        framed.extend_from_slice(&vec![7u8; MAX_FRAME_SIZE]);
        framed.extend_from_slice(&[5, 0, 0, 1]);
        framed.extend_from_slice(&[8u8; 5]);

        let mut seq = 0u8;
        let payload = read_payload(&mut Cursor::new(framed), &mut seq).unwrap();
        assert_eq!(payload.len(), MAX_FRAME_SIZE + 5);
        assert_eq!(payload[MAX_FRAME_SIZE], 8);
        assert_eq!(seq, 2);
    }

    #[test]
    fn read_payload_sequence_mismatch_is_protocol_error() {
        let mut framed = vec![1, 0, 0, 7]; // sequence 7, expected 0
        framed.push(0xAA);
        let mut seq = 0u8;
        let err = read_payload(&mut Cursor::new(framed), &mut seq).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn read_payload_truncation_is_connection_error() {
        let framed = vec![10, 0, 0, 0, 1, 2]; // promises 10 bytes, has 2
        let mut seq = 0u8;
        let err = read_payload(&mut Cursor::new(framed), &mut seq).unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn write_payload_advances_sequence_per_frame() {
        let mut out = Vec::new();
        let mut seq = 0u8;
        write_payload(&mut out, &mut seq, b"tiny").unwrap();
        assert_eq!(seq, 1);

        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        let mut out = Vec::new();
        let mut seq = 0u8;
        write_payload(&mut out, &mut seq, &big).unwrap();
        assert_eq!(seq, 2);

        // Exact multiple emits the empty terminator frame too.
        let exact = vec![0u8; MAX_FRAME_SIZE];
        let mut out = Vec::new();
        let mut seq = 0u8;
        write_payload(&mut out, &mut seq, &exact).unwrap();
        assert_eq!(seq, 2);
    }
}
