//! Request, response and event records, plus the [`Protocol`] builder.
//!
//! Every record gets a fresh random id. A response echoes the id of the
//! request it answers. Errors travel as plain strings; the wire never carries
//! native error objects.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::WireMessage;
use crate::Value;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Keyword arguments.
pub type Kwargs = BTreeMap<String, Value>;

/// A method call on a remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub version: u32,
    /// Target location, as text.
    pub location: String,
    pub method: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    Error,
}

impl Status {
    pub const fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::NotFound => 404,
            Status::Error => 500,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Status::Ok),
            404 => Some(Status::NotFound),
            500 => Some(Status::Error),
            _ => None,
        }
    }
}

/// The answer to exactly one [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers.
    pub id: String,
    pub code: u16,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Response {
    pub fn status(&self) -> Option<Status> {
        Status::from_code(self.code)
    }

    pub fn is_ok(&self) -> bool {
        self.code == Status::Ok.code()
    }
}

/// A notification from a publisher to its subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub version: u32,
    /// Publisher location, as text.
    pub location: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

fn any_objects<'a>(args: &'a [Value], kwargs: &'a Kwargs) -> bool {
    args.iter().any(Value::contains_objects) || kwargs.values().any(Value::contains_objects)
}

impl WireMessage for Request {
    fn contains_objects(&self) -> bool {
        any_objects(&self.args, &self.kwargs)
    }
}

impl WireMessage for Response {
    fn contains_objects(&self) -> bool {
        self.result.as_ref().is_some_and(Value::contains_objects)
    }
}

impl WireMessage for Event {
    fn contains_objects(&self) -> bool {
        any_objects(&self.args, &self.kwargs)
    }
}

/// A failure reduced to data: error kind, message and optional captured trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: String,
    pub message: String,
    pub trace: Option<String>,
}

impl Failure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(trace) = &self.trace {
            write!(f, " (traceback={trace})")?;
        }
        Ok(())
    }
}

/// Builds protocol records with fresh ids.
#[derive(Debug, Clone, Copy)]
pub struct Protocol {
    version: u32,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
        }
    }
}

impl Protocol {
    pub fn new(version: u32) -> Self {
        Self { version }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn request(
        &self,
        location: impl fmt::Display,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Request {
        Request {
            id: Self::new_id(),
            version: self.version,
            location: location.to_string(),
            method: method.to_string(),
            args,
            kwargs,
        }
    }

    pub fn ok(&self, request: &Request, result: Value) -> Response {
        Response {
            id: request.id.clone(),
            code: Status::Ok.code(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(&self, request: &Request, failure: &Failure) -> Response {
        Response {
            id: request.id.clone(),
            code: Status::Error.code(),
            result: None,
            error: Some(failure.to_string()),
        }
    }

    pub fn not_found(&self, request: &Request, message: impl Into<String>) -> Response {
        Response {
            id: request.id.clone(),
            code: Status::NotFound.code(),
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn event(&self, location: impl fmt::Display, args: Vec<Value>, kwargs: Kwargs) -> Event {
        Event {
            id: Self::new_id(),
            version: self.version,
            location: location.to_string(),
            args,
            kwargs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Serializer;

    #[test]
    fn test_request_ids_are_unique() {
        let protocol = Protocol::default();
        let a = protocol.request("h:1/A/a", "m", vec![], Kwargs::new());
        let b = protocol.request("h:1/A/a", "m", vec![], Kwargs::new());
        assert_ne!(a.id, b.id);
        assert_eq!(a.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_responses_echo_request_id() {
        let protocol = Protocol::default();
        let request = protocol.request("h:1/A/a", "m", vec![], Kwargs::new());

        let ok = protocol.ok(&request, Value::Int(5));
        assert_eq!(ok.id, request.id);
        assert_eq!(ok.status(), Some(Status::Ok));

        let nf = protocol.not_found(&request, "method A.m not found");
        assert_eq!(nf.code, 404);
        assert!(nf.result.is_none());

        let err = protocol.error(&request, &Failure::new("ValueError", "bad"));
        assert_eq!(err.code, 500);
        assert_eq!(err.error.as_deref(), Some("ValueError: bad"));
    }

    #[test]
    fn test_failure_text_includes_trace() {
        let failure = Failure::new("IOError", "disk full").with_trace("at write()");
        assert_eq!(failure.to_string(), "IOError: disk full (traceback=at write())");
    }

    #[test]
    fn test_request_survives_both_serializers() {
        let protocol = Protocol::default();
        let request = protocol.request(
            "127.0.0.1:7666/Telescope/0",
            "slew",
            vec![Value::Float(10.0), Value::Float(-5.5)],
            Kwargs::from([("epoch".to_string(), Value::Str("J2000".into()))]),
        );

        for serializer in [Serializer::MsgPack, Serializer::Bincode] {
            let bytes = serializer.dumps(&request).unwrap();
            let back: Request = serializer.loads(&bytes).unwrap();
            assert_eq!(back, request, "{serializer}");
        }
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(Status::from_code(302), None);
    }
}
