//! Signature verifier.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::SignatureError;

/// Issuer claim of every token minted by the queue.
pub const ISSUER: &str = "Upstash";

const CURRENT_KEY_VAR: &str = "QSTASH_CURRENT_SIGNING_KEY";
const NEXT_KEY_VAR: &str = "QSTASH_NEXT_SIGNING_KEY";

/// The pair of keys a request may be signed with.
#[derive(Clone)]
pub struct SigningKeys {
  pub current: String,
  pub next: String,
}

impl SigningKeys {
  pub fn new(current: impl Into<String>, next: impl Into<String>) -> Self {
    Self {
      current: current.into(),
      next: next.into(),
    }
  }

  /// Read both keys from `QSTASH_CURRENT_SIGNING_KEY` and `QSTASH_NEXT_SIGNING_KEY`.
  pub fn from_env() -> Result<Self, SignatureError> {
    let read = |name: &str| {
      std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SignatureError::MissingKey {
          name: name.to_string(),
        })
    };
    Ok(Self::new(read(CURRENT_KEY_VAR)?, read(NEXT_KEY_VAR)?))
  }
}

impl std::fmt::Debug for SigningKeys {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SigningKeys").finish_non_exhaustive()
  }
}

/// Claims carried by a signature token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureClaims {
  pub iss: String,
  /// The URL the message was delivered to.
  pub sub: String,
  pub exp: u64,
  pub nbf: u64,
  pub iat: u64,
  pub jti: String,
  /// URL-safe base64 SHA-256 of the body.
  pub body: String,
}

/// URL-safe, unpadded base64 of the SHA-256 of `body`.
pub fn body_hash(body: &[u8]) -> String {
  URL_SAFE_NO_PAD.encode(Sha256::digest(body))
}

/// Validates that a request was signed by the queue.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
  keys: SigningKeys,
  clock_tolerance: Duration,
}

impl SignatureVerifier {
  pub fn new(keys: SigningKeys) -> Self {
    Self {
      keys,
      clock_tolerance: Duration::ZERO,
    }
  }

  /// Allow `exp`/`nbf` to be off by up to `tolerance`.
  pub fn with_clock_tolerance(mut self, tolerance: Duration) -> Self {
    self.clock_tolerance = tolerance;
    self
  }

  /// Whether `signature` is valid for `body` (and `source_url`, when given).
  ///
  /// Never fails: every problem is reported as `false`.
  pub fn verify(&self, signature: &str, body: &[u8], source_url: Option<&str>) -> bool {
    match self.check(signature, body, source_url) {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "signature rejected");
        false
      }
    }
  }

  /// Check `signature` under the current key, then the next key.
  pub fn check(
    &self,
    signature: &str,
    body: &[u8],
    source_url: Option<&str>,
  ) -> Result<SignatureClaims, SignatureError> {
    let current = match self.check_with_key(&self.keys.current, signature, body, source_url) {
      Ok(claims) => return Ok(claims),
      Err(e) => e,
    };

    self
      .check_with_key(&self.keys.next, signature, body, source_url)
      .map_err(|next| SignatureError::Rejected {
        current: Box::new(current),
        next: Box::new(next),
      })
  }

  fn check_with_key(
    &self,
    key: &str,
    signature: &str,
    body: &[u8],
    source_url: Option<&str>,
  ) -> Result<SignatureClaims, SignatureError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[ISSUER]);
    validation.set_required_spec_claims(&["exp", "nbf", "iss", "sub"]);
    validation.validate_nbf = true;
    validation.validate_aud = false;
    validation.leeway = self.clock_tolerance.as_secs();
    validation.sub = source_url.map(str::to_string);

    let token = jsonwebtoken::decode::<SignatureClaims>(
      signature,
      &DecodingKey::from_secret(key.as_bytes()),
      &validation,
    )?;

    if token.claims.body.trim_end_matches('=') != body_hash(body) {
      return Err(SignatureError::BodyMismatch);
    }

    Ok(token.claims)
  }
}
