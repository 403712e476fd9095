//! Connection and codec configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::{capability, charset};

/// SSL policy for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never negotiate TLS
    #[default]
    Disable,
    /// Use TLS when the server advertises it
    Preferred,
    /// Fail the connection if TLS cannot be negotiated
    Required,
    /// Require TLS and verify the server certificate chain
    VerifyCa,
    /// Require TLS and verify certificate plus hostname
    VerifyIdentity,
}

impl SslMode {
    pub const fn should_try(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

/// Certificate material for TLS connections.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA bundle for server verification (PEM)
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate for mutual TLS (PEM)
    pub client_cert_path: Option<PathBuf>,
    /// Private key matching the client certificate (PEM)
    pub client_key_path: Option<PathBuf>,
    /// SNI override; defaults to the connection host
    pub server_name: Option<String>,
    /// Accept any server certificate. Insecure.
    pub danger_skip_verify: bool,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }
}

/// Codec behavior options, threaded explicitly into decode/encode calls.
///
/// These come from whatever configuration surface sits above the core; the
/// codec itself never reads ambient state.
#[derive(Debug, Clone, Copy)]
pub struct CodecConfig {
    /// Decode `TINYINT(1)` as a boolean instead of a small integer.
    pub tiny_int_one_is_bit: bool,
    /// Decode `YEAR` as a date (January 1st of that year) instead of an
    /// integer.
    pub year_is_date_type: bool,
    /// Decode the zero date `0000-00-00` as NULL instead of failing.
    pub zero_date_is_null: bool,
    /// Report qualified names with "catalog" terminology instead of
    /// "schema". Presentation only; the wire catalog field is always `def`.
    pub use_catalog_term: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            tiny_int_one_is_bit: true,
            year_is_date_type: true,
            zero_date_is_null: false,
            use_catalog_term: false,
        }
    }
}

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Default schema selected at connect time
    pub schema: Option<String>,
    pub charset: u8,
    pub connect_timeout: Duration,
    /// Socket read/write timeout; on expiry the connection is poisoned
    pub io_timeout: Option<Duration>,
    pub ssl_mode: SslMode,
    pub tls: TlsConfig,
    /// Key/value pairs sent in the CONNECT_ATTRS handshake block
    pub attributes: HashMap<String, String>,
    pub max_packet_size: u32,
    pub codec: CodecConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: None,
            schema: None,
            charset: charset::DEFAULT,
            connect_timeout: Duration::from_secs(30),
            io_timeout: None,
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            attributes: HashMap::new(),
            max_packet_size: 64 * 1024 * 1024,
            codec: CodecConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Capability flags requested by this configuration. The connector
    /// intersects these with what the server advertises.
    pub fn capability_flags(&self) -> u32 {
        let mut flags = capability::DEFAULT_CLIENT_FLAGS;

        if self.schema.is_some() {
            flags |= capability::CONNECT_WITH_DB;
        }
        if self.ssl_mode.should_try() {
            flags |= capability::SSL;
        }
        if !self.attributes.is_empty() {
            flags |= capability::CONNECT_ATTRS;
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let config = ClientConfig::new()
            .host("db.internal")
            .port(3307)
            .user("svc")
            .password("hunter2")
            .schema("billing")
            .connect_timeout(Duration::from_secs(5))
            .io_timeout(Duration::from_secs(60))
            .ssl_mode(SslMode::Required)
            .attribute("program_name", "mariner");

        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 3307);
        assert_eq!(config.schema.as_deref(), Some("billing"));
        assert_eq!(config.io_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.socket_addr(), "db.internal:3307");
    }

    #[test]
    fn ssl_mode_ladder() {
        assert!(!SslMode::Disable.should_try());
        assert!(SslMode::Preferred.should_try());
        assert!(!SslMode::Preferred.is_required());
        assert!(SslMode::Required.is_required());
        assert!(SslMode::VerifyCa.is_required());
        assert!(SslMode::VerifyIdentity.is_required());
    }

    #[test]
    fn capability_flags_follow_config() {
        let base = ClientConfig::new();
        let flags = base.capability_flags();
        assert!(flags & capability::PROTOCOL_41 != 0);
        assert!(flags & capability::CONNECT_WITH_DB == 0);
        assert!(flags & capability::SSL == 0);

        let with_db = ClientConfig::new()
            .schema("app")
            .ssl_mode(SslMode::Preferred)
            .attribute("k", "v");
        let flags = with_db.capability_flags();
        assert!(flags & capability::CONNECT_WITH_DB != 0);
        assert!(flags & capability::SSL != 0);
        assert!(flags & capability::CONNECT_ATTRS != 0);
    }

    #[test]
    fn codec_defaults() {
        let codec = CodecConfig::default();
        assert!(codec.tiny_int_one_is_bit);
        assert!(codec.year_is_date_type);
        assert!(!codec.zero_date_is_null);
        assert!(!codec.use_catalog_term);
    }
}
