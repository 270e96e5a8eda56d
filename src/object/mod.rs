//! Object module - what the broker hosts.
//!
//! - [`RemoteObject`] - the dispatch surface the server calls into
//! - [`MethodTable`] + [`Hosted`] - build a `RemoteObject` from a plain struct
//! - [`ConfigStore`] - declared configuration options of one object
//! - [`ObjectContext`] - what a method sees of the broker around it
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use skywire::object::{Hosted, MethodTable};
//!
//! #[derive(Default)]
//! struct Calculator;
//!
//! let object = Hosted::new(
//!     Calculator,
//!     MethodTable::new()
//!         .method("add", |_calc: Arc<Calculator>, (a, b): (i64, i64), _ctx| async move { Ok(a + b) }),
//! );
//! ```

mod config;
mod context;
mod method;

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub use config::ConfigStore;
pub use context::ObjectContext;
pub use method::{BoxFuture, Method, MethodLock, MethodResult, MethodTable, TypedMethod};

use crate::protocol::{Failure, Kwargs, Request};
use crate::Value;

/// A method invocation, detached from its wire envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Call {
    pub method: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl Call {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            kwargs: Kwargs::new(),
        }
    }

    pub fn with_kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }
}

impl From<Request> for Call {
    fn from(request: Request) -> Self {
        Self {
            method: request.method,
            args: request.args,
            kwargs: request.kwargs,
        }
    }
}

/// Failure raised by a hosted method.
///
/// Any `std::error::Error` converts into it, so methods can use `?` on
/// their own errors. The kind is the error's type name and the trace is
/// captured at the conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError {
    kind: String,
    message: String,
    trace: Option<String>,
}

impl MethodError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    /// An error with the generic `Error` kind.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    pub fn into_failure(self) -> Failure {
        Failure {
            kind: self.kind,
            message: self.message,
            trace: self.trace,
        }
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

fn short_type_name<E>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

impl<E: std::error::Error> From<E> for MethodError {
    fn from(err: E) -> Self {
        Self::new(short_type_name::<E>(), err.to_string())
            .with_trace(Backtrace::force_capture().to_string())
    }
}

/// Why [`RemoteObject::invoke`] produced no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// The object has no method of that name.
    MethodNotFound(String),
    Failed(Failure),
}

impl From<MethodError> for InvokeError {
    fn from(err: MethodError) -> Self {
        InvokeError::Failed(err.into_failure())
    }
}

/// An object the broker can host.
///
/// Most objects are a plain struct wrapped in [`Hosted`]; implement this
/// directly for fully dynamic dispatch.
#[async_trait]
pub trait RemoteObject: Send + Sync + 'static {
    async fn invoke(&self, ctx: &ObjectContext, call: Call) -> Result<Value, InvokeError>;

    /// Names of the callable methods.
    fn methods(&self) -> Vec<String> {
        Vec::new()
    }

    async fn start(&self, _ctx: &ObjectContext) -> Result<(), MethodError> {
        Ok(())
    }

    async fn stop(&self, _ctx: &ObjectContext) -> Result<(), MethodError> {
        Ok(())
    }

    /// Whether [`main`](RemoteObject::main) should be run after start.
    fn has_main(&self) -> bool {
        false
    }

    /// Long-running loop. Aborted when the object is stopped.
    async fn main(&self, _ctx: &ObjectContext) -> Result<(), MethodError> {
        Ok(())
    }
}

/// A plain value served through a [`MethodTable`].
pub struct Hosted<T> {
    inner: Arc<T>,
    table: MethodTable<T>,
}

impl<T: Send + Sync + 'static> Hosted<T> {
    pub fn new(inner: T, table: MethodTable<T>) -> Self {
        Self::from_arc(Arc::new(inner), table)
    }

    pub fn from_arc(inner: Arc<T>, table: MethodTable<T>) -> Self {
        Self { inner, table }
    }

    pub fn inner(&self) -> &Arc<T> {
        &self.inner
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> RemoteObject for Hosted<T> {
    async fn invoke(&self, ctx: &ObjectContext, call: Call) -> Result<Value, InvokeError> {
        let method = self
            .table
            .get(&call.method)
            .ok_or_else(|| InvokeError::MethodNotFound(call.method.clone()))?;
        Ok(method.call(self.inner.clone(), call, ctx.clone()).await?)
    }

    fn methods(&self) -> Vec<String> {
        self.table.names()
    }

    async fn start(&self, ctx: &ObjectContext) -> Result<(), MethodError> {
        match self.table.on_start.as_ref() {
            Some(hook) => hook(self.inner.clone(), ctx.clone()).await,
            None => Ok(()),
        }
    }

    async fn stop(&self, ctx: &ObjectContext) -> Result<(), MethodError> {
        match self.table.on_stop.as_ref() {
            Some(hook) => hook(self.inner.clone(), ctx.clone()).await,
            None => Ok(()),
        }
    }

    fn has_main(&self) -> bool {
        self.table.main.is_some()
    }

    async fn main(&self, ctx: &ObjectContext) -> Result<(), MethodError> {
        match self.table.main.as_ref() {
            Some(hook) => hook(self.inner.clone(), ctx.clone()).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    #[test]
    fn test_method_error_from_std_error() {
        let err: MethodError = ConfigError::UnknownKey("x".into()).into();
        assert_eq!(err.kind(), "ConfigError");
        assert_eq!(err.message(), "unknown option 'x'");
        assert!(err.trace().is_some_and(|trace| !trace.is_empty()));
    }

    #[test]
    fn test_failure_carries_kind_and_message() {
        let failure = MethodError::new("ValueError", "negative exposure").into_failure();
        assert_eq!(failure.to_string(), "ValueError: negative exposure");
        assert!(failure.trace.is_none());
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<std::io::Error>(), "Error");
        assert_eq!(short_type_name::<Vec<u8>>(), "Vec");
    }
}
