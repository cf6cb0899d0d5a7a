//! Per-message-type validation table (§4.9). A message's `type` field
//! selects which required fields are checked before it is accepted; fields
//! are read at the top level or, if absent there, under `metadata` (the
//! wire actually nests them there).

use bus_protocol::ErrorKind;
use runtime_core::RetryClassify;
use serde_json::Value;

/// Looks a field up at the top level of the message, falling back to
/// `metadata.<field>` (the shape IronMON actually sends fields under).
pub fn field<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    payload.get(key).or_else(|| payload.get("metadata").and_then(|m| m.get(key)))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TypeValidationError {
    #[error("message has no \"type\" field")]
    MissingType,
    #[error("unrecognized message type {0:?}")]
    UnknownType(String),
    #[error("missing required field {field:?} for type {message_type:?}")]
    MissingField { message_type: String, field: &'static str },
    #[error("field {field:?} has the wrong shape for type {message_type:?}")]
    WrongShape { message_type: String, field: &'static str },
}

impl RetryClassify for TypeValidationError {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::ValidationFailed
    }
}

/// Validate `payload` against the required-fields table for `message_type`.
/// Returns whether the message should be published (`heartbeat` never is).
pub fn validate(message_type: &str, payload: &Value) -> Result<bool, TypeValidationError> {
    let mt = message_type.to_owned();
    let require_str = |key: &'static str| -> Result<(), TypeValidationError> {
        if field(payload, key).and_then(Value::as_str).is_some() {
            Ok(())
        } else {
            Err(TypeValidationError::MissingField { message_type: mt.clone(), field: key })
        }
    };
    let require_i64 = |key: &'static str| -> Result<(), TypeValidationError> {
        if field(payload, key).and_then(Value::as_i64).is_some() {
            Ok(())
        } else {
            Err(TypeValidationError::MissingField { message_type: mt.clone(), field: key })
        }
    };
    let require_array = |key: &'static str| -> Result<(), TypeValidationError> {
        if field(payload, key).and_then(Value::as_array).is_some() {
            Ok(())
        } else {
            Err(TypeValidationError::MissingField { message_type: mt.clone(), field: key })
        }
    };
    let require_object = |key: &'static str| -> Result<(), TypeValidationError> {
        if field(payload, key).and_then(Value::as_object).is_some() {
            Ok(())
        } else {
            Err(TypeValidationError::MissingField { message_type: mt.clone(), field: key })
        }
    };

    match message_type {
        "init" => {
            require_str("version")?;
            let game = field(payload, "game").and_then(Value::as_i64);
            match game {
                Some(g) if (1..=3).contains(&g) => {}
                Some(_) => return Err(TypeValidationError::WrongShape { message_type: mt, field: "game" }),
                None => return Err(TypeValidationError::MissingField { message_type: mt, field: "game" }),
            }
            Ok(true)
        }
        "seed" => {
            require_i64("count")?;
            Ok(true)
        }
        "checkpoint" => {
            require_i64("id")?;
            require_str("name")?;
            Ok(true)
        }
        "location" => {
            require_i64("id")?;
            Ok(true)
        }
        "battle_start" => {
            require_str("trainer")?;
            require_array("pokemon")?;
            Ok(true)
        }
        "battle_end" => {
            let result = field(payload, "result").and_then(Value::as_str);
            match result {
                Some("win" | "loss" | "run") => {}
                Some(_) => return Err(TypeValidationError::WrongShape { message_type: mt, field: "result" }),
                None => return Err(TypeValidationError::MissingField { message_type: mt, field: "result" }),
            }
            require_array("pokemon")?;
            Ok(true)
        }
        "pokemon_update" => {
            require_array("team")?;
            Ok(true)
        }
        "item_update" => {
            require_array("items")?;
            Ok(true)
        }
        "stats_update" => {
            require_object("stats")?;
            Ok(true)
        }
        "error" => {
            require_str("code")?;
            require_str("message")?;
            Ok(true)
        }
        "heartbeat" => Ok(false),
        "" => Err(TypeValidationError::MissingType),
        other => Err(TypeValidationError::UnknownType(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_requires_game_in_range() {
        assert!(validate("init", &json!({"version": "1.0", "game": 4})).is_err());
        assert!(validate("init", &json!({"version": "1.0", "game": 2})).unwrap());
    }

    #[test]
    fn seed_starts_new_attempt_and_is_published() {
        assert_eq!(validate("seed", &json!({"count": 3})).unwrap(), true);
    }

    #[test]
    fn heartbeat_is_valid_but_not_published() {
        assert_eq!(validate("heartbeat", &json!({})).unwrap(), false);
    }

    #[test]
    fn battle_end_rejects_unknown_result() {
        assert!(validate("battle_end", &json!({"result": "draw", "pokemon": []})).is_err());
        assert!(validate("battle_end", &json!({"result": "win", "pokemon": []})).unwrap());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(matches!(validate("made_up", &json!({})), Err(TypeValidationError::UnknownType(_))));
    }

    #[test]
    fn fields_nested_under_metadata_are_accepted() {
        let msg = json!({"type": "init", "metadata": {"version": "1.0.0", "game": 1}});
        assert!(validate("init", &msg).unwrap());
        let msg = json!({"type": "seed", "metadata": {"count": 7}});
        assert!(validate("seed", &msg).unwrap());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        assert!(matches!(
            validate("location", &json!({})),
            Err(TypeValidationError::MissingField { field: "id", .. })
        ));
    }
}
