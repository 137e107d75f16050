//! Pagination codec (`spec.md` §4.9): opaque, tamper-resistant
//! continuation tokens, `base64("<id> <ts>")`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaginationError {
    #[error("continuation token is not valid base64")]
    InvalidBase64,
    #[error("continuation token does not decode to exactly two fields")]
    MalformedFields,
    #[error("continuation token id is not a valid integer")]
    InvalidId,
    #[error("continuation token timestamp is not valid RFC3339")]
    InvalidTimestamp,
    #[error("limit {0} is outside the allowed range {1}..={2}")]
    LimitOutOfRange(i64, i64, i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationCursor {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
}

/// `encode(id, ts) = base64("<id> <ts>")`. The empty token represents
/// "start"/"end" and is never produced by this function — callers return
/// `""` directly when there is no further page.
pub fn encode(cursor: &ContinuationCursor) -> String {
    let raw = format!("{} {}", cursor.id, cursor.timestamp.to_rfc3339());
    BASE64.encode(raw.as_bytes())
}

/// `decode` rejects: non-base64, a non-2-element split, a first element
/// not parseable as int64, and a second element not parseable as
/// RFC3339. The empty string decodes to `None` ("start"/"end").
pub fn decode(token: &str) -> Result<Option<ContinuationCursor>, PaginationError> {
    if token.is_empty() {
        return Ok(None);
    }

    let raw = BASE64.decode(token.as_bytes()).map_err(|_| PaginationError::InvalidBase64)?;
    let text = String::from_utf8(raw).map_err(|_| PaginationError::InvalidBase64)?;

    let mut parts = text.splitn(2, ' ');
    let (Some(id_part), Some(ts_part)) = (parts.next(), parts.next()) else {
        return Err(PaginationError::MalformedFields);
    };
    if parts.next().is_some() {
        return Err(PaginationError::MalformedFields);
    }

    let id: i64 = id_part.parse().map_err(|_| PaginationError::InvalidId)?;
    let timestamp = DateTime::parse_from_rfc3339(ts_part)
        .map_err(|_| PaginationError::InvalidTimestamp)?
        .with_timezone(&Utc);

    Ok(Some(ContinuationCursor { id, timestamp }))
}

/// Normalize and validate the `limit` query parameter
/// (`spec.md` §4.9, open question 2: normalized to `i64`).
pub fn parse_limit(raw: Option<&str>, default: i64, min: i64, max: i64) -> Result<i64, PaginationError> {
    let value = match raw {
        None => return Ok(default),
        Some(s) => s.parse::<i64>().map_err(|_| PaginationError::LimitOutOfRange(0, min, max))?,
    };
    if value < min || value > max {
        return Err(PaginationError::LimitOutOfRange(value, min, max));
    }
    Ok(value)
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips() {
        let cursor = ContinuationCursor { id: 42, timestamp: Utc::now() };
        let token = encode(&cursor);
        let decoded = decode(&token).unwrap().unwrap();
        assert_eq!(decoded.id, 42);
        // Reserialization to RFC3339 truncates sub-nanosecond precision
        // on some platforms; compare at the second.
        assert_eq!(decoded.timestamp.timestamp(), cursor.timestamp.timestamp());
    }

    #[test]
    fn empty_token_is_start_or_end() {
        assert_eq!(decode("").unwrap(), None);
    }

    #[test]
    fn rejects_non_base64() {
        assert_eq!(decode("not valid base64!!!").unwrap_err(), PaginationError::InvalidBase64);
    }

    #[test]
    fn rejects_wrong_field_count() {
        let token = BASE64.encode(b"only-one-field");
        assert_eq!(decode(&token).unwrap_err(), PaginationError::MalformedFields);
    }

    #[test]
    fn rejects_non_integer_id() {
        let token = BASE64.encode(b"abc 2024-01-01T00:00:00Z");
        assert_eq!(decode(&token).unwrap_err(), PaginationError::InvalidId);
    }

    #[test]
    fn rejects_non_rfc3339_timestamp() {
        let token = BASE64.encode(b"42 not-a-timestamp");
        assert_eq!(decode(&token).unwrap_err(), PaginationError::InvalidTimestamp);
    }

    #[test]
    fn limit_defaults_when_absent() {
        assert_eq!(parse_limit(None, 100, 1, 1000).unwrap(), 100);
    }

    #[test]
    fn limit_rejects_out_of_range() {
        assert!(parse_limit(Some("5000"), 100, 1, 1000).is_err());
        assert!(parse_limit(Some("0"), 100, 1, 1000).is_err());
    }

    #[test]
    fn limit_accepts_in_range_value() {
        assert_eq!(parse_limit(Some("250"), 100, 1, 1000).unwrap(), 250);
    }
}
