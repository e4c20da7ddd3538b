//! Oracle abstraction: the three non-deterministic calls the engine makes.
//!
//! [`Oracle`] implementations talk to an external service and may fail in any
//! way. The engine never sees those failures; it only talks to
//! [`OracleAdapter`], which bounds every call with a timeout and substitutes a
//! deterministic fallback when the oracle fails.

use async_trait::async_trait;

pub mod adapter;
pub mod error;
pub mod llm;
pub mod parse;

pub use adapter::{
    FALLBACK_PRIORITY, FALLBACK_WINDOW_MS, OracleAdapter, fallback_intent, fallback_judgment,
};
pub use error::OracleError;
pub use llm::LlmOracle;

use crate::model::{Ms, Reservation, Span};

/// Structured form of a natural-language reservation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIntent {
    pub purpose: String,
    pub span: Span,
    /// Free-form server name hint, matched against server names.
    pub preference: Option<String>,
}

/// Outcome of a pairwise arbitration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Judgment {
    pub prefer_new: bool,
    pub reason: String,
}

/// External intent / priority / judgment service.
///
/// Object-safe; used as `Arc<dyn Oracle>`.
#[async_trait]
pub trait Oracle: Send + Sync + 'static {
    /// Short label for logs.
    fn name(&self) -> &str;

    /// Extract purpose, window and server preference from free text.
    /// `reference` is "now" for relative expressions such as "tomorrow".
    async fn parse_intent(&self, text: &str, reference: Ms) -> Result<ParsedIntent, OracleError>;

    /// Raw priority score; the adapter clamps it into `0..=100`.
    async fn score_priority(&self, purpose: &str, duration_hours: f64) -> Result<i64, OracleError>;

    /// Decide whether `candidate` should displace `incumbent`.
    async fn judge_conflict(
        &self,
        candidate: &Reservation,
        incumbent: &Reservation,
    ) -> Result<Judgment, OracleError>;
}

/// Oracle used when no service is configured: every call fails, so the
/// adapter always takes the deterministic path.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineOracle;

#[async_trait]
impl Oracle for OfflineOracle {
    fn name(&self) -> &str {
        "offline"
    }

    async fn parse_intent(&self, _text: &str, _reference: Ms) -> Result<ParsedIntent, OracleError> {
        Err(OracleError::NotConfigured)
    }

    async fn score_priority(&self, _purpose: &str, _hours: f64) -> Result<i64, OracleError> {
        Err(OracleError::NotConfigured)
    }

    async fn judge_conflict(
        &self,
        _candidate: &Reservation,
        _incumbent: &Reservation,
    ) -> Result<Judgment, OracleError> {
        Err(OracleError::NotConfigured)
    }
}
