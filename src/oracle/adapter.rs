use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::limits::*;
use crate::model::{HOUR_MS, Ms, Reservation, Span};
use crate::observability::{ORACLE_CALLS_TOTAL, ORACLE_DURATION_SECONDS, ORACLE_FALLBACKS_TOTAL};

use super::{Judgment, OfflineOracle, Oracle, OracleError, ParsedIntent};

/// Score used when the priority oracle cannot answer.
pub const FALLBACK_PRIORITY: u8 = 50;

/// Window length assumed when the request cannot be parsed.
pub const FALLBACK_WINDOW_MS: Ms = 2 * HOUR_MS;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Infallible front of an [`Oracle`].
///
/// Every call is bounded by `timeout`; a timeout, an error, or an answer that
/// fails validation all produce the same deterministic fallback.
#[derive(Clone)]
pub struct OracleAdapter {
    oracle: Arc<dyn Oracle>,
    timeout: Duration,
}

impl OracleAdapter {
    pub fn new(oracle: Arc<dyn Oracle>, timeout: Duration) -> Self {
        Self { oracle, timeout }
    }

    /// Adapter that always falls back.
    pub fn offline() -> Self {
        Self::new(Arc::new(OfflineOracle), DEFAULT_TIMEOUT)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn parse_intent(&self, text: &str, reference: Ms) -> ParsedIntent {
        let result = self
            .bounded("parse_intent", self.oracle.parse_intent(text, reference))
            .await
            .and_then(|intent| validate_intent(intent, text));
        match result {
            Ok(intent) => {
                debug!(
                    purpose = %intent.purpose,
                    start = intent.span.start,
                    end = intent.span.end,
                    preference = ?intent.preference,
                    "intent parsed"
                );
                intent
            }
            Err(e) => {
                self.fell_back("parse_intent", &e);
                fallback_intent(text, reference)
            }
        }
    }

    pub async fn score_priority(&self, purpose: &str, duration_hours: f64) -> u8 {
        match self
            .bounded("score_priority", self.oracle.score_priority(purpose, duration_hours))
            .await
        {
            Ok(raw) => raw.clamp(0, 100) as u8,
            Err(e) => {
                self.fell_back("score_priority", &e);
                FALLBACK_PRIORITY
            }
        }
    }

    pub async fn judge_conflict(&self, candidate: &Reservation, incumbent: &Reservation) -> Judgment {
        match self
            .bounded("judge_conflict", self.oracle.judge_conflict(candidate, incumbent))
            .await
        {
            Ok(judgment) if !judgment.reason.trim().is_empty() => judgment,
            Ok(judgment) => Judgment {
                reason: fallback_judgment(candidate.priority, incumbent.priority).reason,
                ..judgment
            },
            Err(e) => {
                self.fell_back("judge_conflict", &e);
                fallback_judgment(candidate.priority, incumbent.priority)
            }
        }
    }

    async fn bounded<T, F>(&self, call: &'static str, fut: F) -> Result<T, OracleError>
    where
        F: Future<Output = Result<T, OracleError>>,
    {
        metrics::counter!(ORACLE_CALLS_TOTAL, "call" => call).increment(1);
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(OracleError::Timeout(self.timeout.as_millis() as u64)),
        };
        metrics::histogram!(ORACLE_DURATION_SECONDS, "call" => call)
            .record(started.elapsed().as_secs_f64());
        result
    }

    fn fell_back(&self, call: &'static str, err: &OracleError) {
        metrics::counter!(ORACLE_FALLBACKS_TOTAL, "call" => call).increment(1);
        match err {
            OracleError::NotConfigured => {
                debug!(oracle = self.oracle.name(), call, "no oracle configured, using fallback")
            }
            _ => warn!(oracle = self.oracle.name(), call, error = %err, "oracle call failed, using fallback"),
        }
    }
}

/// `[reference, reference + 2h)`, raw text as purpose, no preference.
/// The start is pulled into the valid timestamp range first.
pub fn fallback_intent(text: &str, reference: Ms) -> ParsedIntent {
    let start = reference.clamp(
        MIN_VALID_TIMESTAMP_MS,
        MAX_VALID_TIMESTAMP_MS - FALLBACK_WINDOW_MS,
    );
    ParsedIntent {
        purpose: text.to_string(),
        span: Span::new(start, start + FALLBACK_WINDOW_MS),
        preference: None,
    }
}

/// Strictly higher score wins; equal scores keep the incumbent.
pub fn fallback_judgment(candidate_priority: u8, incumbent_priority: u8) -> Judgment {
    let prefer_new = candidate_priority > incumbent_priority;
    Judgment {
        prefer_new,
        reason: format!(
            "decided by priority score: new {candidate_priority} vs existing {incumbent_priority}"
        ),
    }
}

fn validate_intent(intent: ParsedIntent, raw_text: &str) -> Result<ParsedIntent, OracleError> {
    let span = intent.span;
    if span.start >= span.end {
        return Err(OracleError::InvalidResponse("empty or inverted window".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(OracleError::InvalidResponse("window out of range".into()));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(OracleError::InvalidResponse("window too long".into()));
    }
    let purpose = match intent.purpose.trim() {
        "" => raw_text.to_string(),
        p => p.chars().take(MAX_REQUEST_TEXT_LEN).collect(),
    };
    let preference = intent
        .preference
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    Ok(ParsedIntent {
        purpose,
        span,
        preference,
    })
}
