//! Authentication plugin support.
//!
//! Scramble computations for the plugins a modern MariaDB/MySQL server may
//! request during the handshake or an auth-switch:
//!
//! - `mysql_native_password`: `SHA1(pw) XOR SHA1(seed + SHA1(SHA1(pw)))`
//! - `caching_sha2_password` fast path:
//!   `SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) + seed)`
//! - `caching_sha2_password` / `sha256_password` full path: the NUL-padded
//!   password XORed with the seed, RSA-encrypted with the server's public
//!   key (or sent as-is over TLS)

use sha1::Sha1;
use sha2::{Digest, Sha256};

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;

use mariner_core::error::{AuthError, Error};

/// Plugin names as they appear on the wire.
pub mod plugin {
    pub const NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Single-byte signals used inside the caching_sha2_password exchange.
pub mod sha2_signal {
    /// Client asks the server for its RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Server: the cached fast path succeeded
    pub const FAST_AUTH_OK: u8 = 0x03;
    /// Server: full authentication is required
    pub const FULL_AUTH: u8 = 0x04;
}

/// `mysql_native_password` scramble.
///
/// Empty passwords send an empty response.
pub fn native_password_scramble(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // Servers send a 20-byte seed, sometimes with a trailing NUL attached.
    let seed = if seed.len() > 20 { &seed[..20] } else { seed };

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut h = Sha1::new();
    h.update(seed);
    h.update(stage2);
    let mask: [u8; 20] = h.finalize().into();

    stage1.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
}

/// `caching_sha2_password` fast-path scramble.
pub fn caching_sha2_scramble(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let seed = if seed.len() == 21 && seed.last() == Some(&0) {
        &seed[..20]
    } else {
        seed
    };

    let digest: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let digest2: [u8; 32] = Sha256::digest(digest).into();

    let mut h = Sha256::new();
    h.update(digest2);
    h.update(seed);
    let mask: [u8; 32] = h.finalize().into();

    digest.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
}

/// Clear-text password response (NUL-terminated). Only legitimate on a
/// channel that is already encrypted.
pub fn clear_password_response(password: &str) -> Vec<u8> {
    let mut out = password.as_bytes().to_vec();
    out.push(0);
    out
}

/// XOR the NUL-terminated password with the seed, repeating the seed.
///
/// This is the plaintext the full-auth path encrypts, and also what gets
/// sent directly when the channel is TLS.
pub fn seed_masked_password(password: &str, seed: &[u8]) -> Vec<u8> {
    let mut out = password.as_bytes().to_vec();
    out.push(0);
    if !seed.is_empty() {
        for (i, b) in out.iter_mut().enumerate() {
            *b ^= seed[i % seed.len()];
        }
    }
    out
}

/// RSA-encrypt the seed-masked password with the server's public key.
///
/// MySQL 8.0.5+ expects OAEP padding for `caching_sha2_password`; older
/// servers and `sha256_password` use PKCS#1 v1.5.
pub fn rsa_encrypt_password(
    password: &str,
    seed: &[u8],
    public_key_pem: &[u8],
    use_oaep: bool,
) -> Result<Vec<u8>, Error> {
    if seed.is_empty() {
        return Err(auth_error("server sent an empty auth seed"));
    }

    let masked = seed_masked_password(password, seed);

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| auth_error(format!("server public key is not valid PEM: {e}")))?;

    // Servers emit either SPKI or PKCS#1 encodings.
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| auth_error(format!("failed to parse server public key: {e}")))?;

    let encrypted = if use_oaep {
        key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &masked)
            .map_err(|e| auth_error(format!("RSA-OAEP encryption failed: {e}")))?
    } else {
        key.encrypt(&mut OsRng, rsa::Pkcs1v15Encrypt, &masked)
            .map_err(|e| auth_error(format!("RSA encryption failed: {e}")))?
    };

    Ok(encrypted)
}

fn auth_error(message: impl Into<String>) -> Error {
    Error::Auth(AuthError {
        plugin: None,
        message: message.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_scramble_shape() {
        let seed = [0u8; 20];
        let out = native_password_scramble("secret", &seed);
        assert_eq!(out.len(), 20);
        // Deterministic
        assert_eq!(out, native_password_scramble("secret", &seed));
        // Password-sensitive
        assert_ne!(out, native_password_scramble("Secret", &seed));
    }

    #[test]
    fn native_scramble_trims_long_seed() {
        let mut seed = vec![7u8; 20];
        let short = native_password_scramble("pw", &seed);
        seed.push(0);
        assert_eq!(native_password_scramble("pw", &seed), short);
    }

    #[test]
    fn native_scramble_empty_password() {
        assert!(native_password_scramble("", &[1u8; 20]).is_empty());
    }

    #[test]
    fn sha2_scramble_shape() {
        let seed = [3u8; 20];
        let out = caching_sha2_scramble("secret", &seed);
        assert_eq!(out.len(), 32);
        assert_eq!(out, caching_sha2_scramble("secret", &seed));
    }

    #[test]
    fn sha2_scramble_strips_trailing_nul() {
        let seed = [9u8; 20];
        let mut seed_with_nul = seed.to_vec();
        seed_with_nul.push(0);
        assert_eq!(
            caching_sha2_scramble("pw", &seed),
            caching_sha2_scramble("pw", &seed_with_nul)
        );
    }

    #[test]
    fn masked_password_is_reversible() {
        let seed = [1u8, 2, 3, 4, 5];
        let masked = seed_masked_password("test", &seed);
        assert_eq!(masked.len(), 5); // four bytes + NUL

        let recovered: Vec<u8> = masked
            .iter()
            .enumerate()
            .map(|(i, &b)| b ^ seed[i % seed.len()])
            .collect();
        assert_eq!(&recovered[..4], b"test");
        assert_eq!(recovered[4], 0);
    }

    #[test]
    fn clear_password_is_nul_terminated() {
        assert_eq!(clear_password_response("abc"), b"abc\0");
        assert_eq!(clear_password_response(""), b"\0");
    }

    #[test]
    fn rsa_encrypt_rejects_empty_seed() {
        let result = rsa_encrypt_password("pw", &[], b"not a key", true);
        assert!(matches!(result, Err(Error::Auth(_))));
    }

    #[test]
    fn rsa_encrypt_rejects_garbage_key() {
        let result = rsa_encrypt_password("pw", &[1, 2, 3], b"-----BEGIN GARBAGE-----", false);
        assert!(matches!(result, Err(Error::Auth(_))));
    }
}
