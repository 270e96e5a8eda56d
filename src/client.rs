//! Request/response round trips to one remote object.
//!
//! A [`Client`] is bound to a single [`Location`]. Each call builds a fresh
//! [`Request`], sends it over the transport for the location's bus, and
//! waits for the [`Response`] carrying the same id.

use std::sync::Arc;
use std::time::Duration;

use crate::error::CallError;
use crate::protocol::{Kwargs, Protocol, Request, Response, Status};
use crate::transport::Transport;
use crate::{Location, Value};

/// Default round-trip timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends requests to one location. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    location: Location,
    protocol: Protocol,
    timeout: Duration,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, location: Location) -> Self {
        Self {
            transport,
            location,
            protocol: Protocol::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the timeout used when a call gives none.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call `method` and wait for its result.
    pub async fn request(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        let timeout = timeout.unwrap_or(self.timeout);
        let request = self.protocol.request(&self.location, method, args, kwargs);

        tracing::debug!("Calling {}.{} ({})", self.location, method, request.id);

        self.transport.send_request(&request).await?;
        let _outstanding = Outstanding {
            transport: self.transport.as_ref(),
            request: &request,
        };
        match self.transport.recv_response(&request, Some(timeout)).await? {
            Some(response) => unpack(&request, response),
            None => {
                tracing::debug!("{}.{} timed out after {:?}", self.location, method, timeout);
                Err(CallError::Timeout(timeout))
            }
        }
    }
}

/// Releases the transport's slot for a request when the caller stops waiting,
/// including when the call future is dropped mid-flight.
struct Outstanding<'a> {
    transport: &'a dyn Transport,
    request: &'a Request,
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        self.transport.discard(self.request);
    }
}

fn unpack(request: &Request, response: Response) -> Result<Value, CallError> {
    if response.id != request.id {
        return Err(CallError::InvalidResponse(format!(
            "response {} does not answer request {}",
            response.id, request.id
        )));
    }

    match response.status() {
        Some(Status::Ok) => Ok(response.result.unwrap_or_default()),
        Some(Status::NotFound) => Err(CallError::NotFound(
            response.error.unwrap_or_else(|| "not found".to_string()),
        )),
        Some(Status::Error) => Err(CallError::Remote(
            response.error.unwrap_or_else(|| "remote error".to_string()),
        )),
        None => Err(CallError::InvalidResponse(format!(
            "unknown status code {}",
            response.code
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Failure;

    fn request() -> Request {
        Protocol::default().request("127.0.0.1:7666/Calc/calc", "add", vec![], Kwargs::new())
    }

    #[test]
    fn test_unpack_ok_and_null_result() {
        let protocol = Protocol::default();
        let req = request();
        assert_eq!(unpack(&req, protocol.ok(&req, Value::Int(5))).unwrap(), Value::Int(5));

        let mut response = protocol.ok(&req, Value::Null);
        response.result = None;
        assert_eq!(unpack(&req, response).unwrap(), Value::Null);
    }

    #[test]
    fn test_unpack_errors() {
        let protocol = Protocol::default();
        let req = request();

        let err = unpack(&req, protocol.not_found(&req, "method Calc.sub not found")).unwrap_err();
        assert!(matches!(err, CallError::NotFound(msg) if msg == "method Calc.sub not found"));

        let err = unpack(&req, protocol.error(&req, &Failure::new("ValueError", "bad"))).unwrap_err();
        assert!(matches!(err, CallError::Remote(msg) if msg == "ValueError: bad"));
    }

    #[test]
    fn test_unpack_rejects_foreign_or_unknown() {
        let protocol = Protocol::default();
        let req = request();
        let other = request();

        let err = unpack(&req, protocol.ok(&other, Value::Null)).unwrap_err();
        assert!(matches!(err, CallError::InvalidResponse(_)));

        let mut response = protocol.ok(&req, Value::Null);
        response.code = 302;
        assert!(matches!(unpack(&req, response), Err(CallError::InvalidResponse(_))));
    }
}
