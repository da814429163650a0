use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

/// Content encoding stamped on every envelope
pub const CONTENT_ENCODING: &str = "8bit";
/// Content type stamped on every envelope
pub const CONTENT_TYPE: &str = "application/json";

/// Error code carried by the synthesized 500 response of a failing handler
pub const FAULT_ERROR_CODE: &str = "rabbitflux.error";
const FAULT_ERROR_MESSAGE: &str = "An unexpected error occurred";

/// Generate a message id: 32 lowercase hex characters.
pub fn new_message_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Envelope type tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    /// Message sent by a caller, expecting a reply when `reply_to` is set
    Request,
    /// Reply to a request
    Response,
    /// Application-defined tag
    Custom(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Custom(kind) => kind,
        }
    }
}

impl From<&str> for MessageType {
    fn from(kind: &str) -> Self {
        match kind {
            "request" => Self::Request,
            "response" => Self::Response,
            other => Self::Custom(other.to_string()),
        }
    }
}

/// Metadata plus serialized payload, the unit exchanged between services
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Unique message identifier
    pub message_id: String,
    /// Id of the message this one replies to (absent for requests)
    pub correlation_id: Option<String>,
    /// Private response queue of the sender (absent for fire-and-forget)
    pub reply_to: Option<String>,
    /// Type tag
    pub kind: MessageType,
    pub content_encoding: String,
    pub content_type: String,
    /// Broker drops the message once it has waited this long in a queue
    pub expiration: Option<Duration>,
    /// Ask the broker to return the message when nothing is bound to its routing key
    pub mandatory: bool,
    /// Serialized [`Request`] or [`Response`]
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Envelope for an outbound request. Without `reply_to` it is fire-and-forget.
    pub fn new_request(
        message_id: impl Into<String>,
        reply_to: Option<String>,
        expiration: Duration,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            correlation_id: None,
            reply_to,
            kind: MessageType::Request,
            content_encoding: CONTENT_ENCODING.to_string(),
            content_type: CONTENT_TYPE.to_string(),
            expiration: Some(expiration),
            mandatory: true,
            payload,
        }
    }

    /// Envelope for a reply to the message identified by `replying_to`
    pub fn new_response(
        message_id: impl Into<String>,
        replying_to: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            correlation_id: Some(replying_to.into()),
            reply_to: None,
            kind: MessageType::Response,
            content_encoding: CONTENT_ENCODING.to_string(),
            content_type: CONTENT_TYPE.to_string(),
            expiration: None,
            mandatory: false,
            payload,
        }
    }
}

fn default_body() -> Value {
    Value::String(String::new())
}

fn default_verb() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_status_code() -> u16 {
    200
}

/// HTTP-shaped request payload
///
/// Every field has a default, so `Request::default()` is a valid `GET /`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_body")]
    pub body: Value,
    #[serde(default = "default_verb")]
    pub verb: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub query: HashMap<String, Value>,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Opaque session data passed along so services need not re-authenticate
    #[serde(default)]
    pub session: Option<Value>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            body: default_body(),
            verb: default_verb(),
            headers: HashMap::new(),
            path: default_path(),
            query: HashMap::new(),
            scheme: default_scheme(),
            host: default_host(),
            port: default_port(),
            session: None,
            session_id: None,
        }
    }
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request addressed to a resource path
    pub fn to_path(path: impl Into<String>) -> Self {
        Self::default().with_path(path)
    }

    pub fn with_verb(mut self, verb: impl Into<String>) -> Self {
        self.verb = verb.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize any value as the body
    pub fn with_json_body(mut self, body: impl Serialize) -> Result<Self> {
        self.body = serde_json::to_value(body)?;
        Ok(self)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>, session: Value) -> Self {
        self.session_id = Some(session_id.into());
        self.session = Some(session);
        self
    }
}

/// HTTP-shaped response payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default = "default_body")]
    pub body: Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status_code: default_status_code(),
            body: default_body(),
            headers: HashMap::new(),
        }
    }
}

impl Response {
    /// 200 response with the given body
    pub fn ok(body: impl Into<Value>) -> Self {
        Self::default().with_body(body)
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replace a missing (`null`) body with the empty default
    pub fn with_defaults(mut self) -> Self {
        if self.body.is_null() {
            self.body = default_body();
        }
        self
    }

    /// Structured 500 response sent when a handler fails while processing `message_id`
    pub fn fault(message_id: &str) -> Self {
        let body = ErrorBody::unexpected(message_id);
        Self {
            status_code: 500,
            body: serde_json::to_value(body).unwrap_or_else(|_| default_body()),
            headers: HashMap::from([(
                "Content-Type".to_string(),
                "application/json; charset=utf-8".to_string(),
            )]),
        }
    }

    /// Check if the status code is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Body as text when it is a JSON string
    pub fn body_str(&self) -> Option<&str> {
        self.body.as_str()
    }

    /// Deserialize the body to a specific type
    pub fn body_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Standard error document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub id: String,
    pub created_at: String,
    pub errors: Vec<ErrorDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub message_id: String,
}

impl ErrorBody {
    fn unexpected(message_id: &str) -> Self {
        Self {
            kind: "Errors".to_string(),
            id: new_message_id(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            errors: vec![ErrorDetail {
                code: FAULT_ERROR_CODE.to_string(),
                message: FAULT_ERROR_MESSAGE.to_string(),
                message_id: message_id.to_string(),
            }],
        }
    }
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(request)?)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(response)?)
}

/// Decode a reply, filling absent fields with their defaults
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let response: Response = serde_json::from_slice(bytes)?;
    Ok(response.with_defaults())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let request = decode_request(b"{}").unwrap();
        assert_eq!(request, Request::default());
        assert_eq!(request.verb, "GET");
        assert_eq!(request.path, "/");
        assert_eq!(request.scheme, "http");
        assert_eq!(request.host, "localhost");
        assert_eq!(request.port, 8080);
        assert_eq!(request.body, json!(""));
        assert!(request.session.is_none());
    }

    #[test]
    fn test_request_wire_fields() {
        let request = Request::to_path("/v1/users")
            .with_verb("POST")
            .with_body(json!({"name": "Bob"}))
            .with_header("X-Trace", "abc")
            .with_query("search", "flux");
        let wire: Value = serde_json::from_slice(&encode_request(&request).unwrap()).unwrap();

        assert_eq!(wire["verb"], "POST");
        assert_eq!(wire["path"], "/v1/users");
        assert_eq!(wire["body"]["name"], "Bob");
        assert_eq!(wire["headers"]["X-Trace"], "abc");
        assert_eq!(wire["query"]["search"], "flux");
        assert_eq!(wire["port"], 8080);
        assert!(wire["session_id"].is_null());
    }

    #[test]
    fn test_response_defaults_on_receive() {
        let response = decode_response(b"{}").unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, json!(""));
        assert!(response.headers.is_empty());

        let response = decode_response(br#"{"body": null, "status_code": 201}"#).unwrap();
        assert_eq!(response.status_code, 201);
        assert_eq!(response.body_str(), Some(""));
    }

    #[test]
    fn test_fault_response() {
        let response = Response::fault("abc123");
        assert_eq!(response.status_code, 500);
        assert!(!response.is_success());

        let body: ErrorBody = response.body_as().unwrap();
        assert_eq!(body.kind, "Errors");
        assert_eq!(body.id.len(), 32);
        assert!(body.created_at.ends_with('Z'));
        assert_eq!(body.errors.len(), 1);
        assert_eq!(body.errors[0].code, FAULT_ERROR_CODE);
        assert_eq!(body.errors[0].message_id, "abc123");
        assert_eq!(
            response.headers.get("Content-Type").map(String::as_str),
            Some("application/json; charset=utf-8")
        );
    }

    #[test]
    fn test_envelopes() {
        let request = Envelope::new_request("m1", Some("svc.i1".into()), Duration::from_millis(100), vec![]);
        assert_eq!(request.kind, MessageType::Request);
        assert!(request.mandatory);
        assert!(request.correlation_id.is_none());
        assert_eq!(request.expiration, Some(Duration::from_millis(100)));

        let reply = Envelope::new_response("m2", "m1", vec![]);
        assert_eq!(reply.kind.as_str(), "response");
        assert_eq!(reply.correlation_id.as_deref(), Some("m1"));
        assert!(reply.reply_to.is_none());
    }

    #[test]
    fn test_message_type_tags() {
        assert_eq!(MessageType::from("request"), MessageType::Request);
        assert_eq!(MessageType::from("http"), MessageType::Custom("http".into()));
        assert_eq!(MessageType::Custom("http".into()).as_str(), "http");
    }
}
