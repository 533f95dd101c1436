//! Small helpers for secret generation and hashing.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};

/// Raw secret size in bytes.
pub const TOKEN_BYTES: usize = 32;

/// Length of an encoded secret (`base64url`, no padding).
pub const TOKEN_ENCODED_LEN: usize = 43;

/// Create a new session secret for the auth cookie.
/// The raw value is only returned to set the cookie; stores receive a hash.
pub fn generate_session_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session token")?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Hash a secret (session token, API key, user API key) so raw values never
/// touch storage. The hash is used for lookups when the secret is presented.
#[must_use]
pub fn hash_secret(secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}

/// Hex form of [`hash_secret`], used where the hash becomes part of a key string.
#[must_use]
pub fn hash_secret_hex(secret: &str) -> String {
    hash_secret(secret)
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
            out
        })
}

/// Shape check for an encoded session secret.
#[must_use]
pub fn well_formed_token(token: &str) -> bool {
    token.len() == TOKEN_ENCODED_LEN
        && Base64UrlUnpadded::decode_vec(token).is_ok_and(|bytes| bytes.len() == TOKEN_BYTES)
}
