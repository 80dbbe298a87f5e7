//! Request signature verification for stepwise.
//!
//! Every delivery from the queue carries an `Upstash-Signature` header: a
//! compact HS256 token whose `body` claim is the URL-safe base64 SHA-256 of the
//! raw request body. Two signing keys are configured at any time so the queue
//! can rotate keys without downtime; a request is accepted when it validates
//! under either of them.

mod error;
mod signer;
mod verifier;

pub use error::SignatureError;
pub use signer::sign;
pub use verifier::{ISSUER, SignatureClaims, SignatureVerifier, SigningKeys, body_hash};
