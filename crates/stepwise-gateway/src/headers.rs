//! Header names understood by the queue's HTTP API.

/// Signature token attached to every delivery.
pub const SIGNATURE: &str = "Upstash-Signature";

/// HTTP method the queue uses when delivering the message.
pub const METHOD: &str = "Upstash-Method";

/// Relative delay before delivery, e.g. `30s`.
pub const DELAY: &str = "Upstash-Delay";

/// Absolute earliest delivery time, in unix seconds.
pub const NOT_BEFORE: &str = "Upstash-Not-Before";

/// Number of delivery retries.
pub const RETRIES: &str = "Upstash-Retries";

/// URL that receives the response of a delivered message.
pub const CALLBACK: &str = "Upstash-Callback";

/// Headers with this prefix are forwarded (without it) to the destination.
pub const FORWARD_PREFIX: &str = "Upstash-Forward-";

/// Headers with this prefix are forwarded (without it) to the callback.
pub const CALLBACK_FORWARD_PREFIX: &str = "Upstash-Callback-Forward-";
