//! Prompt construction and reply parsing for text-completion oracles.
//!
//! Replies are free text that is expected to contain one JSON object (or a
//! bare number for scores). Anything that does not fit is an
//! [`OracleError::InvalidResponse`].

use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;

use crate::model::{Ms, Reservation, Span};

use super::{Judgment, OracleError, ParsedIntent};

/// Timestamp format exchanged with the oracle (UTC).
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

pub fn format_ms(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Also accepted: seconds, a `T` separator, and RFC 3339 with an offset.
const LENIENT_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"];

pub fn parse_time(s: &str) -> Result<Ms, OracleError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    std::iter::once(TIME_FORMAT)
        .chain(LENIENT_FORMATS)
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| OracleError::InvalidResponse(format!("bad timestamp {s:?}")))
}

/// Slice from the first `{` to the last `}`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

pub fn intent_prompt(text: &str, reference: Ms) -> String {
    format!(
        "Extract the GPU server reservation details from the request below.\n\
         Current time (UTC): {now}\n\
         Request: {text}\n\n\
         Reply with JSON only:\n\
         {{\"purpose\": \"what the server is needed for\", \
         \"start_time\": \"YYYY-MM-DD HH:MM\", \
         \"end_time\": \"YYYY-MM-DD HH:MM\", \
         \"server_preference\": \"server name or null\"}}\n\n\
         If no date is given assume today or tomorrow. \
         If no duration is given assume 2 hours. Use 24-hour UTC times.",
        now = format_ms(reference),
    )
}

pub fn priority_prompt(purpose: &str, duration_hours: f64) -> String {
    format!(
        "Rate the priority of this GPU server usage from 0 to 100.\n\
         Purpose: {purpose}\n\
         Duration: {duration_hours:.1} hours\n\n\
         Consider research importance and urgency, project deadlines, \
         learning or testing needs, and efficient use of the hardware.\n\
         Reply with the number only."
    )
}

pub fn judgment_prompt(candidate: &Reservation, incumbent: &Reservation) -> String {
    format!(
        "Two GPU server reservations overlap. Decide which one should proceed.\n\n\
         New reservation:\n- purpose: {np}\n- priority score: {nprio}\n- window: {ns} to {ne}\n\n\
         Existing reservation:\n- purpose: {ep}\n- priority score: {eprio}\n- window: {es} to {ee}\n\n\
         Reply with JSON only:\n\
         {{\"recommend_new\": true or false, \"reason\": \"short explanation\"}}",
        np = candidate.purpose,
        nprio = candidate.priority,
        ns = format_ms(candidate.span.start),
        ne = format_ms(candidate.span.end),
        ep = incumbent.purpose,
        eprio = incumbent.priority,
        es = format_ms(incumbent.span.start),
        ee = format_ms(incumbent.span.end),
    )
}

#[derive(Deserialize)]
struct IntentReply {
    #[serde(default)]
    purpose: Option<String>,
    start_time: String,
    end_time: String,
    #[serde(default)]
    server_preference: Option<String>,
}

pub fn parse_intent_reply(reply: &str) -> Result<ParsedIntent, OracleError> {
    let json = extract_json_object(reply)
        .ok_or_else(|| OracleError::InvalidResponse("no JSON object in reply".into()))?;
    let parsed: IntentReply = serde_json::from_str(json)
        .map_err(|e| OracleError::InvalidResponse(format!("intent JSON: {e}")))?;
    let start = parse_time(&parsed.start_time)?;
    let end = parse_time(&parsed.end_time)?;
    let span = Span::checked(start, end)
        .ok_or_else(|| OracleError::InvalidResponse("end_time not after start_time".into()))?;
    // Models like to spell "no preference" in creative ways.
    let preference = parsed
        .server_preference
        .filter(|p| !matches!(p.trim().to_ascii_lowercase().as_str(), "" | "null" | "none"));
    Ok(ParsedIntent {
        purpose: parsed.purpose.unwrap_or_default(),
        span,
        preference,
    })
}

/// First integer in the reply. A `-` directly before the digits is kept so
/// negative scores reach the clamp instead of flipping sign.
pub fn parse_score_reply(reply: &str) -> Result<i64, OracleError> {
    let first_digit = reply
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| OracleError::InvalidResponse(format!("no score in {reply:?}")))?;
    let start = match reply[..first_digit].strip_suffix('-') {
        Some(_) => first_digit - 1,
        None => first_digit,
    };
    let digits: String = reply[first_digit..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let number = &reply[start..first_digit + digits.len()];
    number
        .parse()
        .map_err(|e| OracleError::InvalidResponse(format!("score {number:?}: {e}")))
}

#[derive(Deserialize)]
struct JudgmentReply {
    #[serde(alias = "prefer_new")]
    recommend_new: bool,
    #[serde(default)]
    reason: String,
}

pub fn parse_judgment_reply(reply: &str) -> Result<Judgment, OracleError> {
    let json = extract_json_object(reply)
        .ok_or_else(|| OracleError::InvalidResponse("no JSON object in reply".into()))?;
    let parsed: JudgmentReply = serde_json::from_str(json)
        .map_err(|e| OracleError::InvalidResponse(format!("judgment JSON: {e}")))?;
    Ok(Judgment {
        prefer_new: parsed.recommend_new,
        reason: parsed.reason,
    })
}
