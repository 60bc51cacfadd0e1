//! Peer Codec: normalizes the identifiers agents pass in (a JSON number, a numeric
//! string, or a username) into a single internal representation. Pure and total — every
//! other component passes user-supplied peer input through [`normalize`] before using it.

use serde_json::Value;

use crate::error::PeerCodecError;

/// Result of normalizing a raw peer identifier.
///
/// Numeric input is preserved verbatim (Telegram's own `-100…` channel-id convention is
/// never stripped or re-added here). Non-numeric input is treated as a username: lowercased,
/// with a leading `@` removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedPeer {
    Id(i64),
    Username(String),
}

impl NormalizedPeer {
    pub fn as_username(&self) -> Option<&str> {
        match self {
            NormalizedPeer::Username(u) => Some(u),
            NormalizedPeer::Id(_) => None,
        }
    }

    pub fn as_id(&self) -> Option<i64> {
        match self {
            NormalizedPeer::Id(id) => Some(*id),
            NormalizedPeer::Username(_) => None,
        }
    }
}

/// Classification of a dialog's Telegram kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    User,
    Channel,
    Chat,
}

/// Normalize a raw JSON peer identifier (number or string) into a [`NormalizedPeer`].
///
/// - A JSON number, or a string consisting solely of an optional leading `-` or `+`
///   followed by digits, is parsed as a signed 64-bit integer and preserved verbatim.
/// - Any other non-empty string is treated as a username: a leading `@` is stripped and
///   the remainder is lowercased.
/// - Empty strings, non-finite/non-integer numbers, and mixed alphanumeric-with-sign
///   strings fail with [`PeerCodecError::InvalidPeerId`].
pub fn normalize(input: &Value) -> Result<NormalizedPeer, PeerCodecError> {
    match input {
        Value::Number(n) => {
            let id = n
                .as_i64()
                .ok_or_else(|| PeerCodecError::InvalidPeerId(format!("not an integer: {n}")))?;
            Ok(NormalizedPeer::Id(id))
        }
        Value::String(s) => normalize_str(s),
        other => Err(PeerCodecError::InvalidPeerId(format!(
            "expected a number or string, got {other}"
        ))),
    }
}

/// As [`normalize`], but for a value already known to be a string (the common case for
/// tool parameters typed `number | string`).
pub fn normalize_str(s: &str) -> Result<NormalizedPeer, PeerCodecError> {
    if s.is_empty() {
        return Err(PeerCodecError::InvalidPeerId("empty peer id".to_string()));
    }

    if is_numeric(s) {
        let id: i64 = s
            .parse()
            .map_err(|_| PeerCodecError::InvalidPeerId(format!("numeric id out of range: {s}")))?;
        return Ok(NormalizedPeer::Id(id));
    }

    let stripped = s.strip_prefix('@').unwrap_or(s);
    if stripped.is_empty() {
        return Err(PeerCodecError::InvalidPeerId("empty username".to_string()));
    }
    // Mixed content like "123abc" or "-12a" is neither a clean integer nor a plausible
    // username; Telegram usernames never start with a digit-sign combination.
    if stripped.chars().next().is_some_and(|c| c.is_ascii_digit()) && stripped.chars().any(|c| c.is_alphabetic()) {
        return Err(PeerCodecError::InvalidPeerId(format!("mixed numeric/alpha input: {s}")));
    }

    Ok(NormalizedPeer::Username(stripped.to_lowercase()))
}

fn is_numeric(s: &str) -> bool {
    let body = s.strip_prefix(['-', '+']).unwrap_or(s);
    !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_positive_integer() {
        assert_eq!(normalize_str("42").unwrap(), NormalizedPeer::Id(42));
    }

    #[test]
    fn preserves_negative_channel_prefix() {
        assert_eq!(normalize_str("-1001234567890").unwrap(), NormalizedPeer::Id(-1001234567890));
    }

    #[test]
    fn normalizes_username_with_at() {
        assert_eq!(
            normalize_str("@SomeChannel").unwrap(),
            NormalizedPeer::Username("somechannel".to_string())
        );
    }

    #[test]
    fn normalizes_username_without_at() {
        assert_eq!(
            normalize_str("SomeChannel").unwrap(),
            NormalizedPeer::Username("somechannel".to_string())
        );
    }

    #[test]
    fn round_trip_integer_number_vs_string() {
        let from_number = normalize(&serde_json::json!(42)).unwrap();
        let from_string = normalize_str("42").unwrap();
        assert_eq!(from_number, from_string);
    }

    #[test]
    fn round_trip_username_at_vs_bare() {
        let with_at = normalize_str("@gamma").unwrap();
        let bare = normalize_str("gamma").unwrap();
        assert_eq!(with_at, bare);
    }

    #[test]
    fn rejects_empty_string() {
        assert!(matches!(normalize_str(""), Err(PeerCodecError::InvalidPeerId(_))));
    }

    #[test]
    fn rejects_mixed_content() {
        assert!(matches!(normalize_str("-12abc"), Err(PeerCodecError::InvalidPeerId(_))));
    }

    #[test]
    fn rejects_lone_at_sign() {
        assert!(matches!(normalize_str("@"), Err(PeerCodecError::InvalidPeerId(_))));
    }
}
