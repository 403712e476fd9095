//! TLS upgrade for the handshake.
//!
//! When TLS is negotiated, the client answers the greeting with a short
//! SSL-request packet (capabilities, max packet size, charset, 23 reserved
//! bytes), runs the TLS handshake on the raw socket, and only then sends
//! the full handshake response inside the encrypted channel.
//!
//! The rustls-backed stream lives behind the `tls` cargo feature; the
//! policy checks below are always available so a TLS-less build can still
//! fail `Required` modes loudly instead of silently downgrading.

#![allow(clippy::cast_possible_truncation)]

use mariner_core::error::{Error, Result, TlsError};

use crate::config::{SslMode, TlsConfig};
use crate::protocol::{WireWriter, capability, writer};

#[cfg(feature = "tls")]
use std::io::{Read, Write};
#[cfg(feature = "tls")]
use std::sync::Arc;

/// Build the SSL-request packet that precedes the TLS handshake.
pub fn build_ssl_request(
    client_caps: u32,
    max_packet_size: u32,
    charset: u8,
    sequence: u8,
) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(32);
    w.u32_le(client_caps | capability::SSL);
    w.u32_le(max_packet_size);
    w.u8(charset);
    w.zeros(23);
    writer::frame_payload(w.as_bytes(), sequence)
}

/// Decide whether to upgrade, per the SSL-mode ladder and the server's
/// advertised capabilities.
pub fn negotiate(mode: SslMode, server_caps: u32) -> Result<bool> {
    let server_supports = server_caps & capability::SSL != 0;

    let want = match mode {
        SslMode::Disable => false,
        SslMode::Preferred => server_supports,
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if !server_supports {
                return Err(tls_error("TLS required but the server does not offer it"));
            }
            true
        }
    };

    #[cfg(not(feature = "tls"))]
    if want {
        if mode.is_required() {
            return Err(tls_error(
                "TLS required but this build lacks the 'tls' feature",
            ));
        }
        return Ok(false);
    }

    Ok(want)
}

/// Reject configurations that cannot satisfy their verification mode.
pub fn validate_config(mode: SslMode, tls: &TlsConfig) -> Result<()> {
    match mode {
        SslMode::Disable | SslMode::Preferred | SslMode::Required => Ok(()),
        SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if tls.client_cert_path.is_some() && tls.client_key_path.is_none() {
                return Err(tls_error(
                    "client certificate configured without its private key",
                ));
            }
            Ok(())
        }
    }
}

fn tls_error(message: impl Into<String>) -> Error {
    Error::Tls(TlsError {
        message: message.into(),
        source: None,
    })
}

/// A blocking TLS stream over an established socket.
#[cfg(feature = "tls")]
pub struct TlsStream<S: Read + Write> {
    conn: rustls::ClientConnection,
    stream: S,
}

#[cfg(feature = "tls")]
impl<S: Read + Write> std::fmt::Debug for TlsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.conn.protocol_version())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> TlsStream<S> {
    /// Run the TLS handshake and wrap the stream.
    pub fn connect(
        mut stream: S,
        tls: &TlsConfig,
        host: &str,
        mode: SslMode,
    ) -> Result<Self> {
        validate_config(mode, tls)?;
        let config = build_client_config(tls, mode)?;

        let sni = tls.server_name.as_deref().unwrap_or(host);
        let server_name: rustls::pki_types::ServerName<'static> = sni
            .to_string()
            .try_into()
            .map_err(|e| tls_error(format!("invalid server name '{sni}': {e}")))?;

        let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| tls_error(format!("failed to start TLS session: {e}")))?;

        while conn.is_handshaking() {
            while conn.wants_write() {
                conn.write_tls(&mut stream)
                    .map_err(|e| tls_error(format!("TLS handshake write failed: {e}")))?;
            }
            if conn.wants_read() {
                conn.read_tls(&mut stream)
                    .map_err(|e| tls_error(format!("TLS handshake read failed: {e}")))?;
                conn.process_new_packets()
                    .map_err(|e| tls_error(format!("TLS handshake failed: {e}")))?;
            }
        }

        Ok(Self { conn, stream })
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if self.conn.wants_read() {
                let n = self.conn.read_tls(&mut self.stream)?;
                if n == 0 {
                    return Ok(0);
                }
                self.conn
                    .process_new_packets()
                    .map_err(|e| std::io::Error::other(format!("TLS error: {e}")))?;
            } else {
                return Ok(0);
            }
        }
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.conn.writer().flush()?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        self.stream.flush()
    }
}

#[cfg(feature = "tls")]
fn build_client_config(tls: &TlsConfig, mode: SslMode) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    match mode {
        SslMode::Disable => Err(tls_error("TLS stream requested with SslMode::Disable")),
        SslMode::Preferred | SslMode::Required => {
            // Self-signed server certificates are the norm for these modes.
            build_no_verify_config(&provider)
        }
        SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if tls.danger_skip_verify {
                build_no_verify_config(&provider)
            } else if let Some(ca_path) = &tls.ca_cert_path {
                build_custom_ca_config(&provider, tls, ca_path)
            } else {
                build_webpki_config(&provider, tls)
            }
        }
    }
}

#[cfg(feature = "tls")]
fn build_no_verify_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
) -> Result<rustls::ClientConfig> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    #[derive(Debug)]
    struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("failed to set TLS versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();

    Ok(config)
}

#[cfg(feature = "tls")]
fn build_webpki_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls: &TlsConfig,
) -> Result<rustls::ClientConfig> {
    use rustls::RootCertStore;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("failed to set TLS versions: {e}")))?
        .with_root_certificates(roots);

    add_client_auth(builder, tls)
}

#[cfg(feature = "tls")]
fn build_custom_ca_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls: &TlsConfig,
    ca_path: &std::path::Path,
) -> Result<rustls::ClientConfig> {
    use rustls::RootCertStore;
    use std::fs::File;
    use std::io::BufReader;

    let ca_file = File::open(ca_path).map_err(|e| {
        tls_error(format!(
            "failed to open CA certificate '{}': {e}",
            ca_path.display()
        ))
    })?;
    let mut reader = BufReader::new(ca_file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse CA certificate: {e}")))?;
    if certs.is_empty() {
        return Err(tls_error(format!(
            "no certificates in CA file '{}'",
            ca_path.display()
        )));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| tls_error(format!("failed to add CA certificate: {e}")))?;
    }

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("failed to set TLS versions: {e}")))?
        .with_root_certificates(roots);

    add_client_auth(builder, tls)
}

#[cfg(feature = "tls")]
fn add_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    tls: &TlsConfig,
) -> Result<rustls::ClientConfig> {
    use std::fs::File;
    use std::io::BufReader;

    let (Some(cert_path), Some(key_path)) = (&tls.client_cert_path, &tls.client_key_path) else {
        return Ok(builder.with_no_client_auth());
    };

    let cert_file = File::open(cert_path).map_err(|e| {
        tls_error(format!(
            "failed to open client cert '{}': {e}",
            cert_path.display()
        ))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse client certificate: {e}")))?;
    if certs.is_empty() {
        return Err(tls_error(format!(
            "no certificates in client cert file '{}'",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path).map_err(|e| {
        tls_error(format!(
            "failed to open client key '{}': {e}",
            key_path.display()
        ))
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| tls_error(format!("failed to parse client key: {e}")))?
        .ok_or_else(|| tls_error(format!("no private key in '{}'", key_path.display())))?;

    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| tls_error(format!("failed to configure client auth: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssl_request_layout() {
        let packet = build_ssl_request(capability::DEFAULT_CLIENT_FLAGS, 1 << 24, 255, 1);

        // 4-byte header + 32-byte payload
        assert_eq!(packet.len(), 36);
        assert_eq!(&packet[..4], &[32, 0, 0, 1]);

        let caps = u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]);
        assert!(caps & capability::SSL != 0);
        assert_eq!(packet[12], 255);
        assert!(packet[13..36].iter().all(|&b| b == 0));
    }

    #[test]
    fn negotiate_disable_never_upgrades() {
        assert!(!negotiate(SslMode::Disable, capability::SSL).unwrap());
        assert!(!negotiate(SslMode::Disable, 0).unwrap());
    }

    #[test]
    fn negotiate_required_needs_server_support() {
        assert!(negotiate(SslMode::Required, 0).is_err());
        assert!(negotiate(SslMode::VerifyCa, 0).is_err());
        assert!(negotiate(SslMode::VerifyIdentity, 0).is_err());
    }

    #[cfg(feature = "tls")]
    #[test]
    fn negotiate_preferred_follows_server() {
        assert!(!negotiate(SslMode::Preferred, 0).unwrap());
        assert!(negotiate(SslMode::Preferred, capability::SSL).unwrap());
    }

    #[test]
    fn config_validation_needs_matching_key() {
        let lone_cert = TlsConfig::new().client_cert("/tmp/cert.pem");
        assert!(validate_config(SslMode::VerifyCa, &lone_cert).is_err());

        let pair = TlsConfig::new()
            .client_cert("/tmp/cert.pem")
            .client_key("/tmp/key.pem");
        assert!(validate_config(SslMode::VerifyCa, &pair).is_ok());
        assert!(validate_config(SslMode::Required, &lone_cert).is_ok());
    }
}
