//! OBS WebSocket v5 opcode shapes (§6, §4.8). Every frame is
//! `{"op": <opcode>, "d": {...}}`; this module parses inbound frames and
//! builds outbound ones.

use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct Hello {
    pub rpc_version: u32,
    pub auth_challenge: Option<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct Identified {
    pub negotiated_rpc_version: u32,
}

#[derive(Debug, Clone)]
pub struct ObsEvent {
    pub event_type: String,
    pub event_data: Value,
}

#[derive(Debug, Clone)]
pub struct RequestResponse {
    pub request_id: String,
    pub request_type: String,
    pub success: bool,
    pub comment: Option<String>,
    pub response_data: Value,
}

#[derive(Debug, Clone)]
pub enum ObsMessage {
    Hello(Hello),
    Identified(Identified),
    Event(ObsEvent),
    RequestResponse(RequestResponse),
    Other(i64),
}

pub fn parse(text: &str) -> Result<ObsMessage, serde_json::Error> {
    let frame: Value = serde_json::from_str(text)?;
    let op = frame["op"].as_i64().unwrap_or(-1);
    let d = &frame["d"];
    Ok(match op {
        0 => ObsMessage::Hello(parse_hello(d)),
        2 => ObsMessage::Identified(Identified {
            negotiated_rpc_version: d["negotiatedRpcVersion"].as_u64().unwrap_or(1) as u32,
        }),
        5 => ObsMessage::Event(ObsEvent {
            event_type: d["eventType"].as_str().unwrap_or_default().to_owned(),
            event_data: d["eventData"].clone(),
        }),
        7 => ObsMessage::RequestResponse(parse_request_response(d)),
        other => ObsMessage::Other(other),
    })
}

fn parse_hello(d: &Value) -> Hello {
    let auth_challenge = d["authentication"].as_object().map(|auth| {
        (
            auth.get("challenge").and_then(Value::as_str).unwrap_or_default().to_owned(),
            auth.get("salt").and_then(Value::as_str).unwrap_or_default().to_owned(),
        )
    });
    Hello { rpc_version: d["rpcVersion"].as_u64().unwrap_or(1) as u32, auth_challenge }
}

fn parse_request_response(d: &Value) -> RequestResponse {
    let status = &d["requestStatus"];
    RequestResponse {
        request_id: d["requestId"].as_str().unwrap_or_default().to_owned(),
        request_type: d["requestType"].as_str().unwrap_or_default().to_owned(),
        success: status["result"].as_bool().unwrap_or(false),
        comment: status["comment"].as_str().map(str::to_owned),
        response_data: d["responseData"].clone(),
    }
}

/// `identify` (opcode 1), optionally authenticating against a Hello
/// challenge/salt pair per the OBS v5 password scheme:
/// `base64(sha256(base64(sha256(password + salt)) + challenge))`.
#[must_use]
pub fn build_identify(rpc_version: u32, event_subscriptions: u32, password: Option<&str>, challenge: Option<&(String, String)>) -> String {
    let mut d = json!({
        "rpcVersion": rpc_version,
        "eventSubscriptions": event_subscriptions,
    });
    if let (Some(password), Some((challenge, salt))) = (password, challenge) {
        d["authentication"] = json!(authentication_string(password, salt, challenge));
    }
    json!({ "op": 1, "d": d }).to_string()
}

fn authentication_string(password: &str, salt: &str, challenge: &str) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    let secret = engine.encode(Sha256::digest(format!("{password}{salt}").as_bytes()));
    engine.encode(Sha256::digest(format!("{secret}{challenge}").as_bytes()))
}

/// `request` (opcode 6).
#[must_use]
pub fn build_request(request_id: &str, request_type: &str, request_data: Option<Value>) -> String {
    let mut d = json!({ "requestId": request_id, "requestType": request_type });
    if let Some(data) = request_data {
        d["requestData"] = data;
    }
    json!({ "op": 6, "d": d }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hello_without_auth() {
        let text = r#"{"op":0,"d":{"obsWebSocketVersion":"5.0.0","rpcVersion":1}}"#;
        let ObsMessage::Hello(h) = parse(text).unwrap() else { panic!("expected hello") };
        assert_eq!(h.rpc_version, 1);
        assert!(h.auth_challenge.is_none());
    }

    #[test]
    fn parses_hello_with_auth_challenge() {
        let text = r#"{"op":0,"d":{"rpcVersion":1,"authentication":{"challenge":"c","salt":"s"}}}"#;
        let ObsMessage::Hello(h) = parse(text).unwrap() else { panic!("expected hello") };
        assert_eq!(h.auth_challenge, Some(("c".to_owned(), "s".to_owned())));
    }

    #[test]
    fn parses_event() {
        let text = r#"{"op":5,"d":{"eventType":"CurrentProgramSceneChanged","eventData":{"sceneName":"Main"}}}"#;
        let ObsMessage::Event(e) = parse(text).unwrap() else { panic!("expected event") };
        assert_eq!(e.event_type, "CurrentProgramSceneChanged");
        assert_eq!(e.event_data["sceneName"], "Main");
    }

    #[test]
    fn parses_request_response() {
        let text = r#"{"op":7,"d":{"requestId":"r1","requestType":"GetStats","requestStatus":{"result":true},"responseData":{"cpuUsage":1.0}}}"#;
        let ObsMessage::RequestResponse(r) = parse(text).unwrap() else { panic!("expected response") };
        assert_eq!(r.request_id, "r1");
        assert!(r.success);
    }

    #[test]
    fn build_identify_without_password_omits_authentication() {
        let text = build_identify(1, 33, None, None);
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["op"], 1);
        assert!(value["d"].get("authentication").is_none());
    }

    #[test]
    fn build_identify_with_password_computes_authentication_string() {
        let challenge = ("chal".to_owned(), "salt".to_owned());
        let text = build_identify(1, 33, Some("secret"), Some(&challenge));
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value["d"]["authentication"].as_str().unwrap().len() > 10);
    }
}
