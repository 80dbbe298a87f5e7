use thiserror::Error;

/// Errors that can occur while checking a request signature.
#[derive(Debug, Error)]
pub enum SignatureError {
  /// A signing key is not configured.
  #[error("signing key '{name}' is not set")]
  MissingKey { name: String },

  /// The token is malformed, expired, not yet valid, or has the wrong issuer or subject.
  #[error("invalid token: {source}")]
  InvalidToken {
    #[source]
    source: jsonwebtoken::errors::Error,
  },

  /// The token is valid but was issued for a different body.
  #[error("body hash does not match the signed hash")]
  BodyMismatch,

  /// Neither signing key accepted the token.
  #[error("signature rejected by both signing keys (current: {current}, next: {next})")]
  Rejected {
    current: Box<SignatureError>,
    next: Box<SignatureError>,
  },
}

impl From<jsonwebtoken::errors::Error> for SignatureError {
  fn from(source: jsonwebtoken::errors::Error) -> Self {
    Self::InvalidToken { source }
  }
}
