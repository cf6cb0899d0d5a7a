//! EventSub WebSocket message shapes (§6). Closed sum type over
//! `metadata.message_type`; unrecognized variants fall through to `Other`
//! and are logged at debug rather than rejected, per §9.

use bus_protocol::Condition;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct Envelope {
    metadata: Metadata,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    message_type: String,
}

#[derive(Debug, Clone)]
pub struct WelcomeSession {
    pub session_id: String,
    pub keepalive_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct ReconnectSession {
    pub session_id: String,
    pub reconnect_url: String,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub subscription_id: String,
    pub event_type: String,
    pub condition: Condition,
    pub event: Value,
}

#[derive(Debug, Clone)]
pub struct Revocation {
    pub subscription_id: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub enum EventSubMessage {
    Welcome(WelcomeSession),
    Keepalive,
    Notification(Notification),
    Reconnect(ReconnectSession),
    Revocation(Revocation),
    Other(String),
}

pub fn parse(text: &str) -> Result<EventSubMessage, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;
    Ok(match envelope.metadata.message_type.as_str() {
        "session_welcome" => EventSubMessage::Welcome(parse_welcome(&envelope.payload)),
        "session_keepalive" => EventSubMessage::Keepalive,
        "notification" => EventSubMessage::Notification(parse_notification(&envelope.payload)),
        "session_reconnect" => EventSubMessage::Reconnect(parse_reconnect(&envelope.payload)),
        "revocation" => EventSubMessage::Revocation(parse_revocation(&envelope.payload)),
        other => EventSubMessage::Other(other.to_owned()),
    })
}

fn parse_welcome(payload: &Value) -> WelcomeSession {
    let session = &payload["session"];
    WelcomeSession {
        session_id: session["id"].as_str().unwrap_or_default().to_owned(),
        keepalive_timeout_seconds: session["keepalive_timeout_seconds"].as_u64().unwrap_or(10),
    }
}

fn parse_reconnect(payload: &Value) -> ReconnectSession {
    let session = &payload["session"];
    ReconnectSession {
        session_id: session["id"].as_str().unwrap_or_default().to_owned(),
        reconnect_url: session["reconnect_url"].as_str().unwrap_or_default().to_owned(),
    }
}

fn parse_notification(payload: &Value) -> Notification {
    let subscription = &payload["subscription"];
    let condition: Condition = subscription["condition"]
        .as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_owned()))
                .collect()
        })
        .unwrap_or_default();
    Notification {
        subscription_id: subscription["id"].as_str().unwrap_or_default().to_owned(),
        event_type: subscription["type"].as_str().unwrap_or_default().to_owned(),
        condition,
        event: payload["event"].clone(),
    }
}

fn parse_revocation(payload: &Value) -> Revocation {
    let subscription = &payload["subscription"];
    Revocation {
        subscription_id: subscription["id"].as_str().unwrap_or_default().to_owned(),
        status: subscription["status"].as_str().unwrap_or_default().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_welcome() {
        let text = r#"{"metadata":{"message_type":"session_welcome"},"payload":{"session":{"id":"S1","keepalive_timeout_seconds":10}}}"#;
        let EventSubMessage::Welcome(w) = parse(text).unwrap() else { panic!("expected welcome") };
        assert_eq!(w.session_id, "S1");
        assert_eq!(w.keepalive_timeout_seconds, 10);
    }

    #[test]
    fn parses_notification_condition_as_strings() {
        let text = r#"{"metadata":{"message_type":"notification"},"payload":{
            "subscription":{"id":"sub1","type":"channel.follow","condition":{"broadcaster_user_id":"1"}},
            "event":{"user_id":"2"}
        }}"#;
        let EventSubMessage::Notification(n) = parse(text).unwrap() else { panic!("expected notification") };
        assert_eq!(n.event_type, "channel.follow");
        assert_eq!(n.condition.get("broadcaster_user_id").unwrap(), "1");
        assert_eq!(n.event["user_id"], "2");
    }

    #[test]
    fn unknown_message_type_falls_through_to_other() {
        let text = r#"{"metadata":{"message_type":"something_new"},"payload":{}}"#;
        assert!(matches!(parse(text).unwrap(), EventSubMessage::Other(_)));
    }
}
