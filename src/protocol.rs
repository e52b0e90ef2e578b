//! Newline-delimited JSON wire protocol.
//!
//! Every message is one [`Envelope`] per line. `sessionId = -1` addresses
//! the server itself; `toMain = false` requests are forwarded to the
//! session's worker thread. Replies echo the request's `callbackId` so the
//! callback registry can correlate them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `sessionId` value addressing the main server.
pub const SERVER_SESSION_ID: i64 = -1;

/// `callbackId` value meaning "no reply expected".
pub const NO_CALLBACK: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "WRONG_PARAM")]
    WrongParam,
    #[serde(rename = "SESSION_NOT_FOUND")]
    SessionNotFound,
    #[serde(rename = "REPO_NOT_FOUND")]
    RepoNotFound,
    #[serde(rename = "INVALID_PATH")]
    InvalidPath,
    #[serde(rename = "REPO_NAME_EXISTS")]
    RepoNameExists,
    #[serde(rename = "REPO_NAME_NOT_MATCH")]
    RepoNameNotMatch,
    #[serde(rename = "INVALID_TYPE")]
    InvalidType,
    #[serde(rename = "UNKNOWN_ERROR")]
    UnknownError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: StatusCode::Success,
            message: String::new(),
        }
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

fn default_callback_id() -> i64 {
    NO_CALLBACK
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "sessionId")]
    pub session_id: i64,
    #[serde(rename = "toMain", default)]
    pub to_main: bool,
    #[serde(rename = "isReply", default)]
    pub is_reply: bool,
    #[serde(rename = "callbackId", default = "default_callback_id")]
    pub callback_id: i64,
    #[serde(default)]
    pub message: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    /// Outbound server-originated message (e.g. `ready`, progress events).
    pub fn notify(session_id: i64, message: Value) -> Self {
        Self {
            session_id,
            to_main: false,
            is_reply: false,
            callback_id: NO_CALLBACK,
            message,
            status: None,
            data: None,
        }
    }

    /// Successful reply to `request`, carrying optional payload.
    pub fn reply(request: &Envelope, data: Option<Value>) -> Self {
        Self {
            session_id: request.session_id,
            to_main: request.to_main,
            is_reply: true,
            callback_id: request.callback_id,
            message: request.message.clone(),
            status: Some(Status::success()),
            data,
        }
    }

    /// Error reply to `request`.
    pub fn reply_error(request: &Envelope, code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            session_id: request.session_id,
            to_main: request.to_main,
            is_reply: true,
            callback_id: request.callback_id,
            message: request.message.clone(),
            status: Some(Status::error(code, message)),
            data: None,
        }
    }

    /// The request's `message.type`, if present.
    pub fn message_type(&self) -> Option<&str> {
        self.message.get("type").and_then(Value::as_str)
    }

    /// A string field of `message`.
    pub fn message_str(&self, key: &str) -> Option<&str> {
        self.message.get(key).and_then(Value::as_str)
    }

    /// An integer field of `message`.
    pub fn message_i64(&self, key: &str) -> Option<i64> {
        self.message.get(key).and_then(Value::as_i64)
    }
}

type Callback = Box<dyn FnOnce(&Envelope) + Send>;

/// Correlates outbound requests with their eventual replies. Ids are
/// assigned monotonically; a callback fires once and is removed.
#[derive(Default)]
pub struct CallbackRegistry {
    next_id: AtomicI64,
    callbacks: Mutex<HashMap<i64, Callback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback and return its id for the outbound envelope.
    pub fn register(&self, callback: Callback) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .expect("callback registry poisoned")
            .insert(id, callback);
        id
    }

    /// Fire and remove the callback for a reply. Unknown ids are ignored
    /// (the peer may answer late or twice).
    pub fn dispatch(&self, reply: &Envelope) {
        let callback = self
            .callbacks
            .lock()
            .expect("callback registry poisoned")
            .remove(&reply.callback_id);
        if let Some(callback) = callback {
            callback(reply);
        } else {
            tracing::debug!(callback_id = reply.callback_id, "no callback registered for reply");
        }
    }

    pub fn pending(&self) -> usize {
        self.callbacks
            .lock()
            .expect("callback registry poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_round_trip() {
        let line = r#"{"sessionId":-1,"toMain":true,"isReply":false,"callbackId":7,"message":{"type":"openRepo","repoName":"notes"}}"#;
        let env: Envelope = serde_json::from_str(line).unwrap();
        assert_eq!(env.session_id, SERVER_SESSION_ID);
        assert!(env.to_main);
        assert_eq!(env.message_type(), Some("openRepo"));
        assert_eq!(env.message_str("repoName"), Some("notes"));

        let reply = Envelope::reply(&env, Some(json!({"sessionId": 3})));
        let text = serde_json::to_string(&reply).unwrap();
        assert!(text.contains("\"SUCCESS\""));
        assert!(text.contains("\"callbackId\":7"));
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let env: Envelope = serde_json::from_str(r#"{"sessionId":2,"message":{"type":"search"}}"#).unwrap();
        assert!(!env.to_main);
        assert!(!env.is_reply);
        assert_eq!(env.callback_id, NO_CALLBACK);
        assert!(env.status.is_none());
    }

    #[test]
    fn test_status_code_wire_names() {
        assert_eq!(
            serde_json::to_string(&StatusCode::RepoNameNotMatch).unwrap(),
            "\"REPO_NAME_NOT_MATCH\""
        );
        assert_eq!(
            serde_json::to_string(&StatusCode::UnknownError).unwrap(),
            "\"UNKNOWN_ERROR\""
        );
    }

    #[test]
    fn test_callback_registry_fires_once() {
        let registry = CallbackRegistry::new();
        let fired = std::sync::Arc::new(AtomicI64::new(0));
        let fired2 = std::sync::Arc::clone(&fired);
        let id = registry.register(Box::new(move |_| {
            fired2.fetch_add(1, Ordering::Relaxed);
        }));
        assert_eq!(registry.pending(), 1);

        let reply = Envelope {
            session_id: 1,
            to_main: false,
            is_reply: true,
            callback_id: id,
            message: json!({}),
            status: Some(Status::success()),
            data: None,
        };
        registry.dispatch(&reply);
        registry.dispatch(&reply); // second dispatch is a no-op
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let registry = CallbackRegistry::new();
        let a = registry.register(Box::new(|_| {}));
        let b = registry.register(Box::new(|_| {}));
        assert!(b > a);
    }
}
