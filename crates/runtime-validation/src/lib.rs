//! Event Validation & Normalization (C13).
//!
//! Universal caps apply to every event regardless of source; the Twitch
//! field rules layer on top, keyed by field name rather than a rigid
//! per-event-type schema, since the same identifier/timestamp/tier fields
//! recur across most EventSub payload shapes.

use bus_protocol::ErrorKind;
use runtime_core::RetryClassify;
use serde_json::Value;

const MAX_PAYLOAD_BYTES: usize = 100 * 1024;
const MAX_UNKNOWN_TOP_LEVEL_KEYS: usize = 50;
const MAX_STRING_BYTES: usize = 2 * 1024;
const MAX_CHAT_TEXT_BYTES: usize = 500;
const MAX_ARRAY_ITEMS: usize = 100;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Raised when an event fails validation; never published (§4.11).
#[derive(Debug, thiserror::Error)]
#[error("validation failed: {}", errors_summary(.errors))]
pub struct ValidationFailure {
    pub errors: Vec<ValidationError>,
}

fn errors_summary(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl RetryClassify for ValidationFailure {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::ValidationFailed
    }
}

/// Validate and (trivially) normalize `payload` for `event_type` from `source`.
///
/// Returns the payload unchanged on success — normalization here is limited
/// to the caps/shape checks below, not value rewriting. `source` gates the
/// Twitch-specific field rules; every other source gets only the universal
/// caps.
pub fn validate_event(source: &str, event_type: &str, payload: &Value) -> Result<Value, ValidationFailure> {
    let mut errors = Vec::new();

    let size = serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(usize::MAX);
    if size > MAX_PAYLOAD_BYTES {
        errors.push(ValidationError::new("$", format!("payload of {size} bytes exceeds cap of {MAX_PAYLOAD_BYTES}")));
    }

    if let Value::Object(obj) = payload {
        if obj.len() > MAX_UNKNOWN_TOP_LEVEL_KEYS {
            errors.push(ValidationError::new(
                "$",
                format!("{} top-level keys exceeds cap of {MAX_UNKNOWN_TOP_LEVEL_KEYS}", obj.len()),
            ));
        }
    }

    walk_caps(payload, "$", &mut errors);

    if source == "twitch" {
        walk_twitch_fields(payload, "$", &mut errors);
    }

    if errors.is_empty() {
        Ok(payload.clone())
    } else {
        tracing::warn!(event_type, source, errors = ?errors, "event failed validation, not publishing");
        Err(ValidationFailure { errors })
    }
}

fn is_chat_text_field(key: &str) -> bool {
    matches!(key, "text" | "message" | "chat_message")
}

fn has_control_chars(s: &str) -> bool {
    s.chars().any(|c| c.is_control() && c != '\t')
}

fn looks_like_identifier_field(key: &str) -> bool {
    key == "id" || key.ends_with("_id") || key.ends_with("Id")
}

fn walk_caps(value: &Value, path: &str, errors: &mut Vec<ValidationError>) {
    match value {
        Value::Object(obj) => {
            for (key, child) in obj {
                let child_path = format!("{path}.{key}");
                if looks_like_identifier_field(key) {
                    if let Value::String(s) = child {
                        if has_control_chars(s) {
                            errors.push(ValidationError::new(&child_path, "identifier contains control characters"));
                        }
                    }
                }
                if let Value::String(s) = child {
                    let cap = if is_chat_text_field(key) { MAX_CHAT_TEXT_BYTES } else { MAX_STRING_BYTES };
                    if s.len() > cap {
                        errors.push(ValidationError::new(&child_path, format!("string of {} bytes exceeds cap of {cap}", s.len())));
                    }
                }
                walk_caps(child, &child_path, errors);
            }
        }
        Value::Array(items) => {
            if items.len() > MAX_ARRAY_ITEMS {
                errors.push(ValidationError::new(path, format!("array of {} items exceeds cap of {MAX_ARRAY_ITEMS}", items.len())));
            }
            for (i, item) in items.iter().enumerate() {
                walk_caps(item, &format!("{path}[{i}]"), errors);
            }
        }
        _ => {}
    }
}

fn is_numeric_string(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn is_valid_username(s: &str) -> bool {
    !s.is_empty() && s.len() <= 25 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn walk_twitch_fields(value: &Value, path: &str, errors: &mut Vec<ValidationError>) {
    let Value::Object(obj) = value else {
        if let Value::Array(items) = value {
            for (i, item) in items.iter().enumerate() {
                walk_twitch_fields(item, &format!("{path}[{i}]"), errors);
            }
        }
        return;
    };
    for (key, child) in obj {
        let child_path = format!("{path}.{key}");
        match key.as_str() {
            k if k == "user_id" || k.ends_with("_user_id") => {
                if let Value::String(s) = child {
                    if !is_numeric_string(s) {
                        errors.push(ValidationError::new(&child_path, "user id must be a numeric string"));
                    }
                }
            }
            k if k == "user_login" || k == "user_name" || k.ends_with("_user_login") || k.ends_with("_user_name") => {
                if let Value::String(s) = child {
                    if !is_valid_username(s) {
                        errors.push(ValidationError::new(&child_path, "username must match [A-Za-z0-9_]{1,25}"));
                    }
                }
            }
            "tier" => {
                let ok = match child {
                    Value::String(s) => matches!(s.as_str(), "1000" | "2000" | "3000"),
                    Value::Number(n) => matches!(n.as_u64(), Some(1000 | 2000 | 3000)),
                    _ => false,
                };
                if !ok {
                    errors.push(ValidationError::new(&child_path, "tier must be one of 1000, 2000, 3000"));
                }
            }
            "bits" => {
                let ok = child.as_u64().is_some_and(|n| n > 0);
                if !ok {
                    errors.push(ValidationError::new(&child_path, "bits must be a positive integer"));
                }
            }
            k if k == "timestamp" || k.ends_with("_at") => {
                if let Value::String(s) = child {
                    if chrono::DateTime::parse_from_rfc3339(s).is_err() {
                        errors.push(ValidationError::new(&child_path, "timestamp must be ISO-8601"));
                    }
                }
            }
            _ => {}
        }
        walk_twitch_fields(child, &child_path, errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn well_formed_twitch_follow_event_passes() {
        let payload = json!({
            "user_id": "1234",
            "user_login": "some_viewer",
            "broadcaster_user_id": "5678",
            "followed_at": "2026-01-01T00:00:00Z",
        });
        assert!(validate_event("twitch", "channel.follow", &payload).is_ok());
    }

    #[test]
    fn non_numeric_user_id_is_rejected() {
        let payload = json!({ "user_id": "not-a-number" });
        let err = validate_event("twitch", "channel.follow", &payload).unwrap_err();
        assert!(err.errors.iter().any(|e| e.field.contains("user_id")));
    }

    #[test]
    fn invalid_username_characters_are_rejected() {
        let payload = json!({ "user_login": "has spaces!" });
        assert!(validate_event("twitch", "channel.follow", &payload).is_err());
    }

    #[test]
    fn tier_out_of_enum_is_rejected() {
        let payload = json!({ "tier": 1500 });
        assert!(validate_event("twitch", "channel.subscribe", &payload).is_err());
    }

    #[test]
    fn negative_bits_rejected() {
        let payload = json!({ "bits": -5 });
        assert!(validate_event("twitch", "channel.cheer", &payload).is_err());
    }

    #[test]
    fn malformed_timestamp_rejected() {
        let payload = json!({ "followed_at": "not-a-date" });
        assert!(validate_event("twitch", "channel.follow", &payload).is_err());
    }

    #[test]
    fn chat_text_over_500_bytes_is_rejected() {
        let payload = json!({ "message": { "text": "x".repeat(600) } });
        let err = validate_event("twitch", "channel.chat.message", &payload).unwrap_err();
        assert!(err.errors.iter().any(|e| e.field.ends_with(".text")));
    }

    #[test]
    fn ordinary_string_under_2kib_is_fine_elsewhere() {
        let payload = json!({ "description": "x".repeat(1024) });
        assert!(validate_event("obs", "scene_changed", &payload).is_ok());
    }

    #[test]
    fn ordinary_string_over_2kib_is_rejected() {
        let payload = json!({ "description": "x".repeat(3000) });
        assert!(validate_event("obs", "scene_changed", &payload).is_err());
    }

    #[test]
    fn array_over_100_items_is_rejected() {
        let payload = json!({ "pokemon": (0..150).collect::<Vec<_>>() });
        assert!(validate_event("ironmon", "pokemon_update", &payload).is_err());
    }

    #[test]
    fn unknown_type_with_too_many_top_level_keys_is_rejected() {
        let mut map = serde_json::Map::new();
        for i in 0..60 {
            map.insert(format!("k{i}"), json!(i));
        }
        let payload = Value::Object(map);
        assert!(validate_event("ironmon", "mystery_type", &payload).is_err());
    }

    #[test]
    fn control_characters_in_identifier_are_rejected() {
        let payload = json!({ "user_id": "123\u{0007}456" });
        assert!(validate_event("twitch", "channel.follow", &payload).is_err());
    }

    #[test]
    fn payload_over_size_cap_is_rejected() {
        let payload = json!({ "blob": "x".repeat(200 * 1024) });
        // The oversized string itself also trips the per-string cap; both
        // failures should surface, but the top-level size check is what we
        // assert on here.
        let err = validate_event("obs", "huge", &payload).unwrap_err();
        assert!(err.errors.iter().any(|e| e.field == "$" && e.message.contains("exceeds cap")));
    }

    #[test]
    fn non_twitch_source_skips_twitch_field_rules() {
        let payload = json!({ "user_id": "not-numeric-but-ok-for-non-twitch" });
        assert!(validate_event("ironmon", "location", &payload).is_ok());
    }
}
