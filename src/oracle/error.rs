//! Error types for oracle calls.

use thiserror::Error;

/// Failures of an external oracle. None of these ever reach a caller of the
/// engine: the adapter turns every one of them into a fallback value.
#[derive(Error, Debug)]
pub enum OracleError {
    /// Network connectivity error (DNS, connection refused, etc.).
    #[error("network error: {0}")]
    Network(String),

    /// Call exceeded its deadline.
    #[error("oracle timeout after {0}ms")]
    Timeout(u64),

    /// Oracle service answered with an error status.
    #[error("oracle error {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Reply could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// No oracle service configured.
    #[error("oracle not configured")]
    NotConfigured,
}
