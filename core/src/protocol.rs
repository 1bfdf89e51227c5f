//! Wire messages for the control socket.
//!
//! One JSON object per line in each direction. Requests carry an opaque
//! `id` that is echoed unchanged in the matching response; notifications
//! pushed to listening sessions carry a `verb` instead.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::store::Commit;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verb {
    Hello,
    Get,
    GetState,
    Set,
    Add,
    Remove,
    Listen,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Hello => "hello",
            Verb::Get => "get",
            Verb::GetState => "get-state",
            Verb::Set => "set",
            Verb::Add => "add",
            Verb::Remove => "remove",
            Verb::Listen => "listen",
        }
    }
}


/// Client-chosen request id: a JSON number or string, never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl Default for RequestId {
    fn default() -> Self {
        RequestId::Number(0)
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Text(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::Text(s) => write!(f, "{:?}", s),
        }
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: RequestId,
    pub verb: Verb,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl Request {
    pub fn new(id: u64, verb: Verb) -> Self {
        Request {
            id: RequestId::Number(id),
            verb,
            path: None,
            value: None,
            schema: None,
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_value(mut self, value: &str) -> Self {
        self.value = Some(value.to_string());
        self
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = Some(schema.to_string());
        self
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Response {
    pub fn ok(id: RequestId, value: Option<String>) -> Self {
        Response {
            id,
            status: "ok".to_string(),
            value,
        }
    }

    pub fn error(id: RequestId, err: &ConfigError) -> Self {
        Response {
            id,
            status: err.status(),
            value: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}


/// A committed mutation pushed to a listening session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub status: String,
    pub verb: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl From<&Commit> for Notification {
    fn from(commit: &Commit) -> Self {
        Notification {
            status: "ok".to_string(),
            verb: commit.verb.as_str().to_string(),
            path: commit.path.to_string(),
            value: commit.value.clone(),
        }
    }
}


/// Anything a client may read from the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
}


/// Serialize one message as a newline-terminated JSON line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    let mut line = serde_json::to_string(msg)
        .map_err(|e| ConfigError::ProtocolError(format!("cannot encode message: {}", e)))?;
    line.push('\n');
    Ok(line)
}


pub fn decode_request(line: &str) -> Result<Request> {
    serde_json::from_str(line.trim())
        .map_err(|e| ConfigError::ProtocolError(format!("bad request: {}", e)))
}


/// Best-effort id of a line that failed to decode as a request, so the
/// error response can still be correlated. Falls back to the default id.
pub fn salvage_id(line: &str) -> RequestId {
    serde_json::from_str::<serde_json::Value>(line.trim())
        .ok()
        .and_then(|v| v.get("id").cloned())
        .and_then(|id| serde_json::from_value(id).ok())
        .unwrap_or_default()
}


pub fn decode_incoming(line: &str) -> Result<Incoming> {
    serde_json::from_str(line.trim())
        .map_err(|e| ConfigError::ProtocolError(format!("bad message from server: {}", e)))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{BoundPath, BoundStep};
    use crate::store::Mutation;

    #[test]
    fn request_uses_kebab_verbs() {
        let req = Request::new(3, Verb::GetState).with_path("/softwire-state");
        let json = encode_line(&req).unwrap();
        assert!(json.contains("\"verb\":\"get-state\""));
        assert!(json.ends_with('\n'));
        assert!(!json.contains("value"));
        assert_eq!(decode_request(&json).unwrap(), req);
    }

    #[test]
    fn request_id_defaults_to_zero() {
        let req = decode_request(r#"{"verb":"get","path":"/"}"#).unwrap();
        assert_eq!(req.id, RequestId::Number(0));
        assert_eq!(req.path.as_deref(), Some("/"));
    }

    #[test]
    fn string_id_is_echoed_unchanged() {
        let req = decode_request(r#"{ "id": "0", "verb": "get", "path": "/softwire-config/name" }"#)
            .unwrap();
        assert_eq!(req.id, RequestId::Text("0".into()));
        let line = encode_line(&Response::ok(req.id, Some("lwaftr".into()))).unwrap();
        assert!(line.contains("\"id\":\"0\""));
        match decode_incoming(&line).unwrap() {
            Incoming::Response(resp) => assert_eq!(resp.id, RequestId::from("0")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn numeric_id_stays_numeric() {
        let line = encode_line(&Response::ok(RequestId::Number(12), None)).unwrap();
        assert!(line.contains("\"id\":12"));
    }

    #[test]
    fn salvage_id_from_undecodable_request() {
        assert_eq!(salvage_id(r#"{"id":"q-7","verb":"explode"}"#), RequestId::from("q-7"));
        assert_eq!(salvage_id(r#"{"id":5}"#), RequestId::Number(5));
        assert_eq!(salvage_id("not json"), RequestId::default());
        assert_eq!(salvage_id(r#"{"id":[1]}"#), RequestId::default());
    }

    #[test]
    fn unknown_verb_is_protocol_error() {
        let err = decode_request(r#"{"id":1,"verb":"explode"}"#).unwrap_err();
        assert!(err.status().starts_with("protocol-error: "));
    }

    #[test]
    fn error_response_carries_kind() {
        let resp = Response::error(
            RequestId::Number(9),
            &ConfigError::NoSuchEntry {
                path: "/softwire-config/name".into(),
            },
        );
        assert!(!resp.is_ok());
        assert_eq!(resp.status, "no-such-entry: no such entry: /softwire-config/name");
    }

    #[test]
    fn incoming_distinguishes_notifications() {
        let commit = Commit {
            seq: 1,
            verb: Mutation::Set,
            path: BoundPath {
                steps: vec![BoundStep::plain("softwire-config"), BoundStep::plain("name")],
            },
            value: Some("x".into()),
        };
        let line = encode_line(&Notification::from(&commit)).unwrap();
        match decode_incoming(&line).unwrap() {
            Incoming::Notification(n) => {
                assert_eq!(n.verb, "set");
                assert_eq!(n.path, "/softwire-config/name");
            }
            other => panic!("unexpected {:?}", other),
        }
        let line = encode_line(&Response::ok(RequestId::Number(4), Some("v".into()))).unwrap();
        assert!(matches!(decode_incoming(&line).unwrap(), Incoming::Response(_)));
    }
}
