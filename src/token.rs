//! Bearer token validation and the offline generation utilities
//!
//! Validation is on the hot request path: it parses the Authorization
//! header, checks the revocation set before any cryptography, then verifies
//! the HS256 signature, expiry (with leeway) and issuer. Generation backs
//! the `token` and `secret` subcommands.

use crate::error::AuthError;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Clock-skew tolerance applied to the expiry check
const LEEWAY_SECS: u64 = 5;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    exp: i64,
    iss: String,
    // Audience is informational and may be absent
    #[serde(default)]
    aud: Vec<String>,
}

/// Decoded token contents returned on successful validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub expires_at: DateTime<Utc>,
    pub issuer: String,
    pub audience: Vec<String>,
}

/// Validate the Authorization header of an inbound request.
///
/// Pure function of its inputs: the shared secret, the expected issuer,
/// the revocation set and the header value. Revocation is checked before
/// signature verification so a denylisted token is always rejected as
/// revoked, whatever else is wrong with it.
pub fn validate(
    secret: &[u8],
    issuer: &str,
    revoked: &HashSet<String>,
    auth_header: Option<&str>,
) -> Result<Payload, AuthError> {
    let value = auth_header.ok_or(AuthError::HeaderMissing)?;

    let parts: Vec<&str> = value.split(' ').collect();
    if parts.len() != 2 || parts[0] != "Bearer" || parts[1].is_empty() {
        return Err(AuthError::HeaderInvalid);
    }
    let token = parts[1];

    if revoked.contains(token) {
        return Err(AuthError::Revoked);
    }

    let mut validation = Validation::default();
    validation.leeway = LEEWAY_SECS;
    // Audience is informational here; the gateway only pins the issuer.
    validation.validate_aud = false;

    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation).map_err(
        |e| match e.kind() {
            ErrorKind::InvalidSignature => AuthError::SignatureInvalid,
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Malformed(e.to_string()),
        },
    )?;

    if data.claims.iss != issuer {
        return Err(AuthError::IssuerMismatch);
    }

    let expires_at = DateTime::<Utc>::from_timestamp(data.claims.exp, 0)
        .ok_or_else(|| AuthError::Malformed("expiry out of range".to_string()))?;

    Ok(Payload {
        expires_at,
        issuer: data.claims.iss,
        audience: data.claims.aud,
    })
}

/// Sign a token for `client`, issued by `service`, valid until `expires_at`
pub fn generate(
    secret: &[u8],
    service: &str,
    client: &str,
    expires_at: DateTime<Utc>,
) -> anyhow::Result<String> {
    let claims = Claims {
        exp: expires_at.timestamp(),
        iss: service.to_string(),
        aud: vec![client.to_string()],
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Generate `length` random bytes, hex-encoded
pub fn generate_secret(length: usize) -> String {
    let mut buf = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
