//! Local stand-ins for remote objects.
//!
//! A [`Proxy`] wraps a [`Client`] for one location and adds the reserved
//! configuration and subscription methods. [`ProxyMethod`] binds a proxy to
//! one method name, which is also how events are addressed: the method of a
//! publisher names an event, the method of a subscriber names its handler.
//!
//! A proxy is meant for one logical caller at a time; share it between
//! concurrent callers only with external synchronization.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::client::{Client, DEFAULT_REQUEST_TIMEOUT};
use crate::error::CallError;
use crate::protocol::Kwargs;
use crate::transport::TransportRegistry;
use crate::{Location, Value};

/// Names of the methods every hosted object answers.
pub mod reserved {
    pub const GET_ITEM: &str = "__getitem__";
    pub const SET_ITEM: &str = "__setitem__";
    pub const UPDATE: &str = "__iadd__";
    pub const SUBSCRIBE: &str = "__subscribe__";
    pub const UNSUBSCRIBE: &str = "__unsubscribe__";
    pub const PING: &str = "__ping__";
    pub const KEYS: &str = "__keys__";

    pub fn is_reserved(method: &str) -> bool {
        matches!(
            method,
            GET_ITEM | SET_ITEM | UPDATE | SUBSCRIBE | UNSUBSCRIBE | PING | KEYS
        )
    }
}

/// Stand-in for the object at one location.
#[derive(Clone)]
pub struct Proxy {
    client: Client,
    self_location: Location,
}

impl Proxy {
    pub fn new(client: Client, self_location: Location) -> Self {
        Self {
            client,
            self_location,
        }
    }

    /// Location of the remote object.
    pub fn location(&self) -> &Location {
        self.client.location()
    }

    /// Return address for callbacks delivered to this proxy's owner.
    pub fn self_location(&self) -> &Location {
        &self.self_location
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        self.client.request(method, args, Kwargs::new(), None).await
    }

    pub async fn call_with(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        self.client.request(method, args, kwargs, timeout).await
    }

    /// Call `method` and deserialize its result.
    pub async fn invoke_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T, CallError> {
        Ok(self.call(method, args).await?.deserialize_into()?)
    }

    /// Read a configuration option.
    pub async fn get(&self, key: &str) -> Result<Value, CallError> {
        self.call(reserved::GET_ITEM, vec![Value::from(key)]).await
    }

    /// Write a configuration option.
    pub async fn set(&self, key: &str, value: Value) -> Result<(), CallError> {
        self.call(reserved::SET_ITEM, vec![Value::from(key), value])
            .await
            .map(|_| ())
    }

    /// Write several configuration options at once.
    pub async fn configure(&self, values: BTreeMap<String, Value>) -> Result<(), CallError> {
        self.call(reserved::UPDATE, vec![Value::Map(values)])
            .await
            .map(|_| ())
    }

    /// Names of the configuration options.
    pub async fn keys(&self) -> Result<Vec<String>, CallError> {
        self.invoke_as(reserved::KEYS, Vec::new()).await
    }

    /// Whether the object answers at all.
    pub async fn ping(&self) -> bool {
        matches!(self.call(reserved::PING, Vec::new()).await, Ok(Value::Bool(true)))
    }

    pub fn method(&self, name: &str) -> ProxyMethod {
        ProxyMethod {
            proxy: self.clone(),
            name: name.to_string(),
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("location", self.location())
            .field("self_location", &self.self_location)
            .finish()
    }
}

/// One method of a remote object.
#[derive(Clone, Debug)]
pub struct ProxyMethod {
    proxy: Proxy,
    name: String,
}

impl ProxyMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value, CallError> {
        self.proxy.call(&self.name, args).await
    }

    pub async fn call_with(
        &self,
        args: Vec<Value>,
        kwargs: Kwargs,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        self.proxy.call_with(&self.name, args, kwargs, timeout).await
    }

    /// Start the call in the background.
    pub fn begin(&self, args: Vec<Value>) -> PendingCall {
        let method = self.clone();
        PendingCall {
            method: self.name.clone(),
            handle: tokio::spawn(async move { method.call(args).await }),
        }
    }

    fn is_same(&self, other: &ProxyMethod) -> bool {
        self.name == other.name && self.proxy.location() == other.proxy.location()
    }

    /// Have `handler` called whenever this method's event is published.
    ///
    /// Returns `false` without asking the publisher when `handler` is this
    /// very method.
    pub async fn subscribe(&self, handler: &ProxyMethod) -> Result<bool, CallError> {
        if self.is_same(handler) {
            return Ok(false);
        }
        self.subscribe_location(handler.proxy.location(), &handler.name)
            .await
    }

    pub async fn unsubscribe(&self, handler: &ProxyMethod) -> Result<bool, CallError> {
        if self.is_same(handler) {
            return Ok(false);
        }
        self.unsubscribe_location(handler.proxy.location(), &handler.name)
            .await
    }

    /// Subscribe the handler `(location, method)`.
    pub async fn subscribe_location(&self, location: &Location, method: &str) -> Result<bool, CallError> {
        self.subscription(reserved::SUBSCRIBE, location, method)
            .await
    }

    pub async fn unsubscribe_location(&self, location: &Location, method: &str) -> Result<bool, CallError> {
        self.subscription(reserved::UNSUBSCRIBE, location, method)
            .await
    }

    async fn subscription(&self, op: &str, location: &Location, method: &str) -> Result<bool, CallError> {
        let args = vec![
            Value::from(self.name.as_str()),
            Value::from(location.to_string()),
            Value::from(method),
        ];
        let result = self.proxy.call(op, args).await?;
        Ok(result.as_bool().unwrap_or(true))
    }
}

/// A call started with [`ProxyMethod::begin`].
pub struct PendingCall {
    method: String,
    handle: JoinHandle<Result<Value, CallError>>,
}

impl PendingCall {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the result. On timeout the call is left running and its
    /// result is discarded.
    pub async fn end(self, timeout: Option<Duration>) -> Result<Value, CallError> {
        let joined = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.handle).await {
                Ok(joined) => joined,
                Err(_) => return Err(CallError::Timeout(timeout)),
            },
            None => self.handle.await,
        };
        joined.map_err(|e| CallError::Aborted(format!("{}: {}", self.method, e)))?
    }
}

/// Builds proxies that reach other buses through a shared [`TransportRegistry`].
#[derive(Clone)]
pub struct ProxyFactory {
    transports: Arc<TransportRegistry>,
    host: String,
    port: u16,
    timeout: Duration,
}

impl ProxyFactory {
    /// Proxies made here get self locations on `host:port`.
    pub fn new(transports: Arc<TransportRegistry>, host: &str, port: u16) -> Self {
        Self {
            transports,
            host: host.to_string(),
            port,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.transports
    }

    pub fn proxy(&self, location: &Location) -> Proxy {
        let transport = self.transports.for_location(location);
        let client = Client::new(transport, location.without_config()).with_timeout(self.timeout);
        Proxy::new(client, Location::generated(&self.host, self.port, "Proxy"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Serializer;
    use crate::transport::{LinkConfig, TransportKind};

    fn factory() -> ProxyFactory {
        let registry = TransportRegistry::new(TransportKind::Socket, Serializer::MsgPack, LinkConfig::default());
        ProxyFactory::new(Arc::new(registry), "127.0.0.1", 7666)
    }

    #[test]
    fn test_reserved_names() {
        assert!(reserved::is_reserved("__subscribe__"));
        assert!(!reserved::is_reserved("slew"));
    }

    #[tokio::test]
    async fn test_self_location_is_local_and_unique() {
        let factory = factory();
        let target = Location::parse("10.0.0.5:7666/Telescope/0").unwrap();
        let a = factory.proxy(&target);
        let b = factory.proxy(&target);

        assert_eq!(a.location(), &target);
        assert_eq!(a.self_location().bus(), "127.0.0.1:7666");
        assert_eq!(a.self_location().class(), "Proxy");
        assert_ne!(a.self_location(), b.self_location());
    }

    #[tokio::test]
    async fn test_subscribing_a_method_to_itself_is_a_noop() {
        let proxy = factory().proxy(&Location::parse("127.0.0.1:1/Telescope/0").unwrap());
        let method = proxy.method("slewComplete");
        assert!(!method.subscribe(&method.clone()).await.unwrap());
        assert!(!method.unsubscribe(&method).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_call() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let proxy = factory().proxy(&Location::new("127.0.0.1", port, "Dome", "0").unwrap());

        let err = proxy.call("open", vec![]).await.unwrap_err();
        assert!(matches!(err, CallError::Unreachable(_)), "{err}");
        assert!(!proxy.ping().await);

        let pending = proxy.method("open").begin(vec![]);
        assert!(matches!(
            pending.end(Some(Duration::from_secs(5))).await,
            Err(CallError::Unreachable(_))
        ));
    }
}
