//! Error types for the peer agent HTTP client.
//!
//! [`ApiError`] separates transport failures from non-success HTTP statuses so
//! callers polling a peer can treat both as "not ready yet" while still
//! logging what actually happened.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The agent answered with a non-success status.
    #[error("agent at {url} returned status {status}: {message}")]
    Status {
        url: String,
        status: u16,
        message: String,
    },

    /// The response body did not match the expected shape.
    #[error("failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    /// Underlying network failure (DNS, connection refused, timeout).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}
