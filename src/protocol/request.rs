//! Request model shared by both directions of the connection.
//!
//! Outgoing calls and incoming responses use the same shape:
//!
//! ```text
//! {
//!     "id": <u32>,            // correlation id, assigned by the engine
//!     "type": "query" | ...,  // RequestType tag
//!     "parameters": { ... },  // named parameters
//!     "payload": <any>        // opaque payload
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Correlation identifier linking a request to its response.
pub type RequestId = u32;

/// Parameter carrying the name of a stored procedure.
pub const PROCEDURE_NAME: &str = "name";
/// Parameter carrying the user name during authentication.
pub const USERNAME: &str = "username";
/// Parameter carrying the (hashed) password during authentication.
pub const PASSWORD: &str = "password";

/// Type tag of a request or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Message,
    Query,
    Ping,
    Pong,
    Authentication,
    StoreProcedure,
    DeleteProcedure,
    ProcedureCall,
    DirectExecute,
    Result,
    Success,
    Error,
}

impl RequestType {
    /// Whether a pool-routed engine sends this type to a single backend
    /// instead of broadcasting it.
    pub fn is_targeted(self) -> bool {
        matches!(self, RequestType::ProcedureCall | RequestType::DirectExecute)
    }

    /// Whether sending this type changes the procedure registry.
    pub fn is_procedure_change(self) -> bool {
        matches!(
            self,
            RequestType::StoreProcedure | RequestType::DeleteProcedure
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Message => "message",
            RequestType::Query => "query",
            RequestType::Ping => "ping",
            RequestType::Pong => "pong",
            RequestType::Authentication => "authentication",
            RequestType::StoreProcedure => "store_procedure",
            RequestType::DeleteProcedure => "delete_procedure",
            RequestType::ProcedureCall => "procedure_call",
            RequestType::DirectExecute => "direct_execute",
            RequestType::Result => "result",
            RequestType::Success => "success",
            RequestType::Error => "error",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request or response exchanged with the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: RequestId,
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Request {
    pub fn new(kind: RequestType) -> Self {
        Self {
            id: 0,
            kind,
            parameters: Map::new(),
            payload: None,
        }
    }

    /// Create a response-shaped request carrying an existing id.
    pub fn with_id(id: RequestId, kind: RequestType) -> Self {
        Self {
            id,
            ..Self::new(kind)
        }
    }

    pub fn ping() -> Self {
        Self::new(RequestType::Ping)
    }

    /// Set a named parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    /// Copy of this request with id reset, used when replaying it.
    pub fn replay(&self) -> Self {
        Self {
            id: 0,
            kind: self.kind,
            parameters: self.parameters.clone(),
            payload: self.payload.clone(),
        }
    }

    /// Name of the procedure this request registers or deletes.
    ///
    /// Store requests carry it as the `name` parameter, delete requests as
    /// their string payload.
    pub fn procedure_name(&self) -> Option<String> {
        let value = match self.kind {
            RequestType::StoreProcedure => self.parameter(PROCEDURE_NAME)?,
            RequestType::DeleteProcedure => self.payload.as_ref()?,
            _ => return None,
        };
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Text of the payload as reported in error messages.
    pub fn payload_text(&self) -> Option<String> {
        match self.payload.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_tags_are_snake_case() {
        let req = Request::with_id(7, RequestType::StoreProcedure);
        let text = serde_json::to_string(&req).unwrap();
        assert_eq!(text, r#"{"id":7,"type":"store_procedure"}"#);

        let parsed: Request = serde_json::from_str(r#"{"type":"direct_execute"}"#).unwrap();
        assert_eq!(parsed.kind, RequestType::DirectExecute);
        assert_eq!(parsed.id, 0);
        assert!(parsed.parameters.is_empty());
    }

    #[test]
    fn test_targeted_types() {
        assert!(RequestType::ProcedureCall.is_targeted());
        assert!(RequestType::DirectExecute.is_targeted());
        assert!(!RequestType::Query.is_targeted());
        assert!(!RequestType::StoreProcedure.is_targeted());
    }

    #[test]
    fn test_procedure_name() {
        let store = Request::new(RequestType::StoreProcedure)
            .with_parameter(PROCEDURE_NAME, "friends")
            .with_payload("MATCH (n) RETURN n");
        assert_eq!(store.procedure_name(), Some("friends".to_string()));

        let delete = Request::new(RequestType::DeleteProcedure).with_payload("friends");
        assert_eq!(delete.procedure_name(), Some("friends".to_string()));

        assert_eq!(Request::ping().procedure_name(), None);
    }

    #[test]
    fn test_replay_clears_id() {
        let mut req = Request::new(RequestType::StoreProcedure)
            .with_parameter(PROCEDURE_NAME, "p")
            .with_payload(json!({"q": 1}));
        req.id = 42;

        let copy = req.replay();
        assert_eq!(copy.id, 0);
        assert_eq!(copy.parameters, req.parameters);
        assert_eq!(copy.payload, req.payload);
    }

    #[test]
    fn test_payload_text() {
        assert_eq!(
            Request::new(RequestType::Error).with_payload("boom").payload_text(),
            Some("boom".to_string())
        );
        assert_eq!(Request::new(RequestType::Error).payload_text(), None);
        assert_eq!(
            Request::new(RequestType::Error)
                .with_payload(json!({"code": 3}))
                .payload_text(),
            Some(r#"{"code":3}"#.to_string())
        );
    }
}
