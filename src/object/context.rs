//! What a hosted object sees of the broker around it.

use std::sync::Arc;

use super::{ConfigStore, MethodError};
use crate::events::{EventsEngine, Topic};
use crate::protocol::{Kwargs, Protocol};
use crate::proxy::{Proxy, ProxyFactory};
use crate::transport::Transport;
use crate::{Location, Value};

/// Passed to every method and lifecycle hook. Cheap to clone.
#[derive(Clone)]
pub struct ObjectContext {
    location: Location,
    config: Arc<ConfigStore>,
    events: Option<Arc<EventsEngine>>,
    proxies: Option<ProxyFactory>,
    publisher: Option<Arc<dyn Transport>>,
}

impl ObjectContext {
    pub fn new(
        location: Location,
        config: Arc<ConfigStore>,
        events: Arc<EventsEngine>,
        proxies: ProxyFactory,
    ) -> Self {
        Self {
            location,
            config,
            events: Some(events),
            proxies: Some(proxies),
            publisher: None,
        }
    }

    /// A context outside any broker, with no options. Events go nowhere.
    pub fn detached(location: Location) -> Self {
        Self {
            location,
            config: Arc::new(ConfigStore::default()),
            events: None,
            proxies: None,
            publisher: None,
        }
    }

    pub fn with_config(mut self, config: Arc<ConfigStore>) -> Self {
        self.config = config;
        self
    }

    /// Also mirror published events to transport-level subscribers.
    pub fn with_publisher(mut self, transport: Arc<dyn Transport>) -> Self {
        self.publisher = Some(transport);
        self
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn events(&self) -> Option<&Arc<EventsEngine>> {
        self.events.as_ref()
    }

    /// A proxy for another object, reached through the broker's transports.
    pub fn proxy(&self, location: &Location) -> Result<Proxy, MethodError> {
        self.proxies
            .as_ref()
            .map(|proxies| proxies.proxy(location))
            .ok_or_else(|| MethodError::new("BrokerError", "object is not attached to a broker"))
    }

    /// Publish `event` from this object to its subscribers.
    pub async fn publish(&self, event: &str, args: Vec<Value>, kwargs: Kwargs) -> bool {
        let topic = Topic::new(self.location.clone(), event);

        if let Some(transport) = &self.publisher {
            let record = Protocol::default().event(&self.location, args.clone(), kwargs.clone());
            if let Err(e) = transport.publish(&topic.to_string(), &record).await {
                tracing::debug!("Transport publish of {} failed: {}", topic, e);
            }
        }

        match &self.events {
            Some(engine) => engine.publish(&topic, args, kwargs).await,
            None => true,
        }
    }
}
