//! Tamper-evident, time-bound session cookie.
//!
//! Wire format: `base64url(json payload) "." base64url(HMAC-SHA256(payload segment))`.
//!
//! Age validation is a separate step: the authoritative expiry check runs against
//! server-side token state, so the resolver decodes with `validate_age = false`
//! and lets the token store enforce the maximum session age.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::{error::InvalidCookie, tokens::well_formed_token};

type HmacSha256 = Hmac<Sha256>;

/// Contents of the session cookie.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCookie {
    /// Unhashed session secret.
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<u8>,
    /// Unix seconds.
    pub issued_at: i64,
    /// Seconds.
    pub valid_for: i64,
}

impl AuthCookie {
    /// Structural and (optionally) age validation.
    ///
    /// # Errors
    /// `InvalidCookie::Token` for a malformed secret, `InvalidCookie::Expired` when
    /// `validate_age` is set and `now >= issued_at + valid_for`.
    pub fn validate(&self, validate_age: bool, now: DateTime<Utc>) -> Result<(), InvalidCookie> {
        if !well_formed_token(&self.token) {
            return Err(InvalidCookie::Token);
        }
        if self.valid_for <= 0 {
            return Err(InvalidCookie::Malformed);
        }
        if validate_age && now.timestamp() >= self.issued_at.saturating_add(self.valid_for) {
            return Err(InvalidCookie::Expired);
        }
        Ok(())
    }
}

/// Signs and verifies [`AuthCookie`] values with a server secret.
pub struct AuthCookieCodec {
    secret: SecretString,
}

impl std::fmt::Debug for AuthCookieCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCookieCodec").finish_non_exhaustive()
    }
}

impl AuthCookieCodec {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    fn mac(&self) -> Result<HmacSha256, InvalidCookie> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| InvalidCookie::Malformed)
    }

    /// Produce the opaque signed cookie value.
    ///
    /// # Errors
    /// Returns `InvalidCookie::Malformed` if the payload cannot be serialized.
    pub fn encode(&self, cookie: &AuthCookie) -> Result<String, InvalidCookie> {
        let payload = serde_json::to_vec(cookie).map_err(|_| InvalidCookie::Malformed)?;
        let payload_b64 = Base64UrlUnpadded::encode_string(&payload);

        let mut mac = self.mac()?;
        mac.update(payload_b64.as_bytes());
        let signature = mac.finalize().into_bytes();
        let signature_b64 = Base64UrlUnpadded::encode_string(&signature);

        Ok(format!("{payload_b64}.{signature_b64}"))
    }

    /// Verify signature and structure, then optionally the embedded age.
    ///
    /// # Errors
    /// Any tamper, malformed structure, or (with `validate_age`) expiry yields an
    /// [`InvalidCookie`].
    pub fn decode(
        &self,
        raw: &str,
        validate_age: bool,
        now: DateTime<Utc>,
    ) -> Result<AuthCookie, InvalidCookie> {
        let mut parts = raw.trim().split('.');
        let payload_b64 = parts.next().ok_or(InvalidCookie::Malformed)?;
        let signature_b64 = parts.next().ok_or(InvalidCookie::Malformed)?;
        if parts.next().is_some() || payload_b64.is_empty() {
            return Err(InvalidCookie::Malformed);
        }

        let signature =
            Base64UrlUnpadded::decode_vec(signature_b64).map_err(|_| InvalidCookie::Base64)?;
        let mut mac = self.mac()?;
        mac.update(payload_b64.as_bytes());
        // Constant-time comparison.
        mac.verify_slice(&signature)
            .map_err(|_| InvalidCookie::Signature)?;

        let payload =
            Base64UrlUnpadded::decode_vec(payload_b64).map_err(|_| InvalidCookie::Base64)?;
        let cookie: AuthCookie =
            serde_json::from_slice(&payload).map_err(|_| InvalidCookie::Malformed)?;
        cookie.validate(validate_age, now)?;
        Ok(cookie)
    }
}
