//! Event subscriptions and fan-out.
//!
//! A topic is a publisher location plus an event name; a handler is a
//! subscriber location plus the method to call. Handlers of a topic are
//! called in subscription order. A handler that cannot be reached is dropped
//! after the publish that found it dead.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::CallError;
use crate::object::{Call, InvokeError, ObjectContext, RemoteObject};
use crate::protocol::{Event, Kwargs, Protocol};
use crate::proxy::ProxyFactory;
use crate::{Location, Value};

/// What is published: `(publisher, event name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    publisher: Location,
    event: String,
}

impl Topic {
    pub fn new(publisher: Location, event: impl Into<String>) -> Self {
        Self {
            publisher,
            event: event.into(),
        }
    }

    pub fn publisher(&self) -> &Location {
        &self.publisher
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.publisher.path(), self.event)
    }
}

/// Who gets called: `(subscriber, method)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handler {
    location: Location,
    method: String,
}

impl Handler {
    pub fn new(location: Location, method: impl Into<String>) -> Self {
        Self {
            location,
            method: method.into(),
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.location, self.method)
    }
}

/// Calls one handler with one event.
#[async_trait]
pub trait EventDelivery: Send + Sync + 'static {
    async fn deliver(&self, handler: &Handler, event: &Event) -> Result<(), CallError>;
}

/// Delivers events as ordinary method calls through proxies.
pub struct ProxyDelivery {
    proxies: ProxyFactory,
    timeout: Duration,
}

impl ProxyDelivery {
    pub fn new(proxies: ProxyFactory, timeout: Duration) -> Self {
        Self { proxies, timeout }
    }
}

#[async_trait]
impl EventDelivery for ProxyDelivery {
    async fn deliver(&self, handler: &Handler, event: &Event) -> Result<(), CallError> {
        self.proxies
            .proxy(&handler.location)
            .call_with(
                &handler.method,
                event.args.clone(),
                event.kwargs.clone(),
                Some(self.timeout),
            )
            .await
            .map(|_| ())
    }
}

/// Subscription table plus the publish loop.
pub struct EventsEngine {
    table: RwLock<HashMap<Topic, Vec<Handler>>>,
    delivery: Arc<dyn EventDelivery>,
    protocol: Protocol,
}

impl EventsEngine {
    pub fn new(delivery: Arc<dyn EventDelivery>) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            delivery,
            protocol: Protocol::default(),
        }
    }

    /// Add `handler` to `topic`. Subscribing twice has no further effect.
    pub fn subscribe(&self, topic: Topic, handler: Handler) -> bool {
        let mut table = self.table.write();
        let handlers = table.entry(topic).or_default();
        if handlers.contains(&handler) {
            tracing::debug!("{} already subscribed", handler);
        } else {
            handlers.push(handler);
        }
        true
    }

    /// Remove `handler` from `topic`. Removing an absent handler is fine.
    pub fn unsubscribe(&self, topic: &Topic, handler: &Handler) -> bool {
        let mut table = self.table.write();
        if let Some(handlers) = table.get_mut(topic) {
            handlers.retain(|h| h != handler);
            if handlers.is_empty() {
                table.remove(topic);
            }
        }
        true
    }

    /// Deliver to every handler of `topic`, in order.
    ///
    /// Handlers that fail are removed once all deliveries have been tried.
    pub async fn publish(&self, topic: &Topic, args: Vec<Value>, kwargs: Kwargs) -> bool {
        let handlers = self.handlers(topic);
        if handlers.is_empty() {
            return true;
        }

        let event = self.protocol.event(&topic.publisher, args, kwargs);
        let mut failed = Vec::new();
        for handler in handlers {
            if let Err(e) = self.delivery.deliver(&handler, &event).await {
                tracing::warn!("Dropping {} from {}: {}", handler, topic, e);
                failed.push(handler);
            }
        }

        if !failed.is_empty() {
            let mut table = self.table.write();
            if let Some(handlers) = table.get_mut(topic) {
                handlers.retain(|h| !failed.contains(h));
                if handlers.is_empty() {
                    table.remove(topic);
                }
            }
        }

        true
    }

    pub fn handlers(&self, topic: &Topic) -> Vec<Handler> {
        self.table.read().get(topic).cloned().unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.table.read().keys().cloned().collect()
    }

    /// Forget every topic published by `publisher`.
    pub fn clear_publisher(&self, publisher: &Location) {
        self.table.write().retain(|topic, _| &topic.publisher != publisher);
    }

    /// Forget every subscription whose handler lives at `location`.
    pub fn drop_handler_location(&self, location: &Location) {
        self.table.write().retain(|_, handlers| {
            handlers.retain(|h| &h.location != location);
            !handlers.is_empty()
        });
    }

    pub fn clear(&self) {
        self.table.write().clear();
    }
}

/// A local closure called with an event's arguments.
pub type Callback = Arc<dyn Fn(Vec<Value>, Kwargs) + Send + Sync>;

/// Hosted object that turns incoming event deliveries into closure calls.
///
/// Registered at a proxy's self location; each method name maps to one closure.
#[derive(Default)]
pub struct Callbacks {
    handlers: RwLock<HashMap<String, Callback>>,
}

impl Callbacks {
    pub fn insert(&self, method: &str, callback: Callback) {
        self.handlers.write().insert(method.to_string(), callback);
    }

    pub fn remove(&self, method: &str) -> bool {
        self.handlers.write().remove(method).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[async_trait]
impl RemoteObject for Callbacks {
    async fn invoke(&self, _ctx: &ObjectContext, call: Call) -> Result<Value, InvokeError> {
        let callback = self
            .handlers
            .read()
            .get(&call.method)
            .cloned()
            .ok_or_else(|| InvokeError::MethodNotFound(call.method.clone()))?;
        callback(call.args, call.kwargs);
        Ok(Value::Null)
    }

    fn methods(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}
