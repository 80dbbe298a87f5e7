//! Token minting, for local deliveries and tests.
//!
//! In production the queue signs every delivery; this produces identical
//! tokens so a workflow endpoint can be exercised without it.

use std::time::Duration;

use jsonwebtoken::{EncodingKey, Header, get_current_timestamp};

use crate::error::SignatureError;
use crate::verifier::{ISSUER, SignatureClaims, body_hash};

/// Sign `body` for delivery to `url`, valid for `ttl` from now.
pub fn sign(key: &str, body: &[u8], url: &str, ttl: Duration) -> Result<String, SignatureError> {
  let now = get_current_timestamp();
  let claims = SignatureClaims {
    iss: ISSUER.to_string(),
    sub: url.to_string(),
    exp: now + ttl.as_secs(),
    nbf: now,
    iat: now,
    jti: format!("jwt_{}", uuid::Uuid::new_v4().simple()),
    body: body_hash(body),
  };

  Ok(jsonwebtoken::encode(
    &Header::default(),
    &claims,
    &EncodingKey::from_secret(key.as_bytes()),
  )?)
}
