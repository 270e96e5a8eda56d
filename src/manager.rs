//! Manager: one per process, owns everything the broker needs.
//!
//! The manager builds the transport registry, resource registry, events
//! engine and server for its bus, and hosts itself at `/Manager/manager` so
//! other processes can ask what lives here. Objects are added from class
//! descriptors, started, stopped and removed through it.
//!
//! # Example
//!
//! ```ignore
//! use skywire::{BrokerConfig, Manager};
//!
//! #[tokio::main]
//! async fn main() -> skywire::Result<()> {
//!     let manager = Manager::start(BrokerConfig::default()).await?;
//!     let dome = manager.add_class(&dome_class(), Some("dome"), Default::default(), true).await?;
//!     dome.call("open", vec![]).await?;
//!     manager.run_until_signal().await;
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::classloader::{ClassDescriptor, ClassLoader, PluginPath};
use crate::config::BrokerConfig;
use crate::error::{LocationError, ManagerError, RegistryError};
use crate::events::{Callbacks, EventsEngine, ProxyDelivery};
use crate::location::Name;
use crate::object::{ConfigStore, Hosted, MethodError, MethodTable, ObjectContext};
use crate::protocol::Kwargs;
use crate::proxy::{Proxy, ProxyFactory, ProxyMethod};
use crate::registry::{ResourceEntry, ResourceRegistry};
use crate::server::Server;
use crate::transport::{TransportKey, TransportRegistry};
use crate::{Location, Value};

pub const MANAGER_CLASS: &str = "Manager";
pub const MANAGER_NAME: &str = "manager";

pub struct Manager {
    config: BrokerConfig,
    location: Location,
    transports: Arc<TransportRegistry>,
    proxies: ProxyFactory,
    resources: Arc<ResourceRegistry>,
    events: Arc<EventsEngine>,
    loader: ClassLoader,
    server: Arc<Server>,
    /// Started objects and their main loops.
    running: Mutex<HashMap<Location, Option<JoinHandle<()>>>>,
    lifecycle: tokio::sync::Mutex<()>,
    callbacks: DashMap<Location, Arc<Callbacks>>,
    shutting_down: AtomicBool,
    done: watch::Sender<bool>,
}

impl Manager {
    /// Build the broker for `config`, bind its bus and start serving.
    pub async fn start(config: BrokerConfig) -> Result<Arc<Manager>, ManagerError> {
        let location = Location::new(&config.host, config.port, MANAGER_CLASS, MANAGER_NAME)?;

        let transports = Arc::new(TransportRegistry::new(
            config.transport,
            config.serializer,
            config.link.clone(),
        ));
        let proxies = ProxyFactory::new(transports.clone(), &config.host, config.port)
            .with_timeout(config.request_timeout());
        let delivery = ProxyDelivery::new(proxies.clone(), config.event_timeout());
        let events = Arc::new(EventsEngine::new(Arc::new(delivery)));
        let resources = Arc::new(ResourceRegistry::new());

        let key = TransportKey::new(&config.host, config.port, config.transport, config.serializer);
        let server = Arc::new(Server::new(
            transports.get(&key),
            resources.clone(),
            events.clone(),
            config.max_workers,
        ));
        server.start().await?;

        let (done, _) = watch::channel(false);
        let manager = Arc::new(Manager {
            config,
            location,
            transports,
            proxies,
            resources,
            events,
            loader: ClassLoader::new(),
            server,
            running: Mutex::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            callbacks: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            done,
        });

        let this = Hosted::new(
            ManagerObject {
                manager: Arc::downgrade(&manager),
            },
            ManagerObject::table(),
        );
        let ctx = manager.context(&manager.location, Arc::new(ConfigStore::default()));
        manager
            .resources
            .add(ResourceEntry::new(manager.location.clone(), Arc::new(this), ctx))?;

        tracing::info!("Manager up on {}", manager.bus());
        Ok(manager)
    }

    pub fn bus(&self) -> String {
        self.config.bus()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Where the manager itself is hosted.
    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn resources(&self) -> &Arc<ResourceRegistry> {
        &self.resources
    }

    pub fn events(&self) -> &Arc<EventsEngine> {
        &self.events
    }

    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.transports
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn class_loader(&self) -> &ClassLoader {
        &self.loader
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn ensure_up(&self) -> Result<(), ManagerError> {
        if self.is_shut_down() {
            return Err(ManagerError::ShutDown);
        }
        Ok(())
    }

    fn context(&self, location: &Location, config: Arc<ConfigStore>) -> ObjectContext {
        ObjectContext::new(location.clone(), config, self.events.clone(), self.proxies.clone())
            .with_publisher(self.server.transport().clone())
    }

    /// A full location as given, or a `/Class/name` path on this bus.
    fn locate(&self, raw: &str) -> Result<Location, ManagerError> {
        match Location::parse(raw) {
            Ok(location) => Ok(location),
            Err(LocationError::InvalidHost { .. }) if raw.starts_with('/') => {
                Ok(Location::resolve(raw, &self.bus())?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn is_local(&self, location: &Location) -> bool {
        location.host() == self.config.host && location.port() == self.config.port
    }

    fn entry(&self, location: &Location) -> Result<ResourceEntry, ManagerError> {
        self.resources
            .get(location)
            .ok_or_else(|| ManagerError::ObjectNotFound(location.to_string()))
    }

    /// Construct an object of `class`, register it and optionally start it.
    ///
    /// Without a name a unique one is generated. `config` is applied over the
    /// class's option defaults; unknown keys and mistyped values are refused.
    /// If starting fails the object is removed again.
    pub async fn add_class(
        &self,
        class: &ClassDescriptor,
        name: Option<&str>,
        config: BTreeMap<String, Value>,
        start: bool,
    ) -> Result<Proxy, ManagerError> {
        self.ensure_up()?;

        if let Some(name) = name {
            if name.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(ManagerError::InvalidName {
                    name: name.to_string(),
                    reason: "names must not start with a digit".to_string(),
                });
            }
        }
        let location = Location::create(&self.bus(), class.name(), name).map_err(|e| {
            ManagerError::InvalidName {
                name: name.unwrap_or_default().to_string(),
                reason: e.to_string(),
            }
        })?;
        if self.resources.contains(&location) {
            return Err(RegistryError::AlreadyRegistered(location.to_string()).into());
        }

        let store = Arc::new(ConfigStore::new(class.options().clone()));
        store.update(config)?;

        let ctx = self.context(&location, store);
        let object = class.construct(&ctx).map_err(|e| ManagerError::Object {
            location: location.to_string(),
            reason: e.to_string(),
        })?;

        let entry = ResourceEntry::new(location.clone(), object, ctx)
            .with_interfaces(class.interfaces().to_vec());
        self.resources.add(entry)?;
        tracing::info!("Added {}", location);

        if start {
            if let Err(e) = self.start_object(&location).await {
                if let Err(remove) = self.resources.remove(&location) {
                    tracing::warn!("Cannot drop {} after failed start: {}", location, remove);
                }
                return Err(e);
            }
        }

        Ok(self.proxies.proxy(&location))
    }

    /// Add an object described by a location, loading its class by name.
    ///
    /// Query options of the location become its configuration.
    pub async fn add_location(
        &self,
        location: &str,
        paths: &[PluginPath],
        start: bool,
    ) -> Result<Proxy, ManagerError> {
        let location = self.locate(location)?;
        let name = match location.name() {
            Name::Named(name) => name.as_str(),
            Name::Index(index) => {
                return Err(ManagerError::InvalidName {
                    name: index.to_string(),
                    reason: "names must not start with a digit".to_string(),
                })
            }
        };

        let class = self.loader.load(location.class(), paths)?;
        let config = location
            .config()
            .iter()
            .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
            .collect();

        self.add_class(&class, Some(name), config, start).await
    }

    /// A proxy for an existing object, here or on another bus.
    ///
    /// Remote objects are checked with the owning manager first.
    pub async fn get_proxy(&self, location: &str) -> Result<Proxy, ManagerError> {
        let location = self.locate(location)?;

        if self.is_local(&location) {
            let entry = self.entry(&location)?;
            return Ok(self.proxies.proxy(&entry.location));
        }

        let remote = Location::new(location.host(), location.port(), MANAGER_CLASS, MANAGER_NAME)?;
        let found = self
            .proxies
            .proxy(&remote)
            .call("has_resource", vec![Value::from(location.path())])
            .await?;
        if found.as_bool() != Some(true) {
            return Err(ManagerError::ObjectNotFound(location.to_string()));
        }
        Ok(self.proxies.proxy(&location.without_config()))
    }

    /// Proxy for the `index`-th local object of `class` (or implementing it).
    pub async fn get_proxy_by_class(&self, class: &str, index: usize) -> Result<Proxy, ManagerError> {
        let location = Location::indexed(&self.config.host, self.config.port, class, index)?;
        self.get_proxy(&location.to_string()).await
    }

    /// Run the object's start hook, then its main loop if it has one.
    pub async fn start_object(&self, location: &Location) -> Result<(), ManagerError> {
        let _lifecycle = self.lifecycle.lock().await;
        let entry = self.entry(location)?;
        if self.running.lock().contains_key(&entry.location) {
            return Ok(());
        }

        entry
            .object
            .start(&entry.context)
            .await
            .map_err(|e| ManagerError::Object {
                location: entry.location.to_string(),
                reason: e.to_string(),
            })?;

        let main = entry.object.has_main().then(|| {
            let object = entry.object.clone();
            let ctx = entry.context.clone();
            tokio::spawn(async move {
                if let Err(e) = object.main(&ctx).await {
                    tracing::error!("Main loop of {} failed: {}", ctx.location(), e);
                }
            })
        });
        self.running.lock().insert(entry.location.clone(), main);

        tracing::debug!("Started {}", entry.location);
        Ok(())
    }

    /// Abort the object's main loop and run its stop hook.
    pub async fn stop_object(&self, location: &Location) -> Result<(), ManagerError> {
        let _lifecycle = self.lifecycle.lock().await;
        let entry = self.entry(location)?;
        self.stop_entry(&entry).await
    }

    async fn stop_entry(&self, entry: &ResourceEntry) -> Result<(), ManagerError> {
        let Some(main) = self.running.lock().remove(&entry.location) else {
            return Ok(());
        };
        if let Some(main) = main {
            main.abort();
        }

        entry
            .object
            .stop(&entry.context)
            .await
            .map_err(|e| ManagerError::Object {
                location: entry.location.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!("Stopped {}", entry.location);
        Ok(())
    }

    /// Stop the object, unregister it and forget its subscriptions.
    pub async fn remove(&self, location: &Location) -> Result<(), ManagerError> {
        let _lifecycle = self.lifecycle.lock().await;
        let entry = self.entry(location)?;
        if let Err(e) = self.stop_entry(&entry).await {
            tracing::warn!("Removing {} anyway: {}", entry.location, e);
        }

        self.resources.remove(&entry.location)?;
        self.events.clear_publisher(&entry.location);
        self.events.drop_handler_location(&entry.location);
        tracing::info!("Removed {}", entry.location);
        Ok(())
    }

    /// Call `callback` whenever the event named by `event` is published.
    ///
    /// The callback is hosted here under the proxy's self location.
    pub async fn subscribe_callback<F>(&self, event: &ProxyMethod, callback: F) -> Result<bool, ManagerError>
    where
        F: Fn(Vec<Value>, Kwargs) + Send + Sync + 'static,
    {
        self.ensure_up()?;
        let handler = event.proxy().self_location().clone();

        let callbacks = match self.callbacks.get(&handler) {
            Some(existing) => existing.clone(),
            None => {
                let callbacks = Arc::new(Callbacks::default());
                let ctx = self.context(&handler, Arc::new(ConfigStore::default()));
                self.resources
                    .add(ResourceEntry::new(handler.clone(), callbacks.clone(), ctx))?;
                self.callbacks.insert(handler.clone(), callbacks.clone());
                callbacks
            }
        };
        callbacks.insert(event.name(), Arc::new(callback));

        Ok(event.subscribe_location(&handler, event.name()).await?)
    }

    pub async fn unsubscribe_callback(&self, event: &ProxyMethod) -> Result<bool, ManagerError> {
        let handler = event.proxy().self_location().clone();
        let done = event.unsubscribe_location(&handler, event.name()).await?;

        let emptied = match self.callbacks.get(&handler) {
            Some(callbacks) => {
                callbacks.remove(event.name());
                callbacks.is_empty()
            }
            None => false,
        };
        if emptied {
            self.callbacks.remove(&handler);
            if let Err(e) = self.resources.remove(&handler) {
                tracing::warn!("Cannot drop callback handler {}: {}", handler, e);
            }
        }
        Ok(done)
    }

    /// Stop every object (newest first), the server and all transports.
    ///
    /// Safe to call concurrently; later callers wait for the first to finish.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            self.wait().await;
            return;
        }
        tracing::info!("Shutting down {}", self.bus());

        {
            let _lifecycle = self.lifecycle.lock().await;
            for entry in self.resources.entries().into_iter().rev() {
                if let Err(e) = self.stop_entry(&entry).await {
                    tracing::warn!("Error stopping {}: {}", entry.location, e);
                }
            }
        }

        self.server.stop().await;
        self.events.clear();
        self.resources.clear();
        self.callbacks.clear();
        self.transports.close_all().await;

        self.done.send_replace(true);
        tracing::info!("Manager on {} is down", self.bus());
    }

    /// Resolve once shutdown has completed.
    pub async fn wait(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Serve until Ctrl-C or a remote shutdown, then shut down.
    pub async fn run_until_signal(&self) {
        self.run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Interrupted"),
                Err(e) => tracing::error!("Cannot listen for Ctrl-C: {}", e),
            }
        })
        .await;
    }

    /// Serve until `interrupt` resolves or a remote shutdown, then shut down.
    pub async fn run_until<F>(&self, interrupt: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = interrupt => self.shutdown().await,
            _ = self.wait() => {}
        }
    }
}

/// Remote face of the manager.
struct ManagerObject {
    manager: Weak<Manager>,
}

impl ManagerObject {
    fn table() -> MethodTable<ManagerObject> {
        MethodTable::new()
            .method("get_resources", |this: Arc<ManagerObject>, (): (), _ctx| async move {
                this.get_resources()
            })
            .method(
                "get_resources_by_class",
                |this: Arc<ManagerObject>, (class,): (String,), _ctx| async move {
                    this.get_resources_by_class(&class)
                },
            )
            .method("has_resource", |this: Arc<ManagerObject>, (path,): (String,), _ctx| async move {
                this.has_resource(&path)
            })
            .method("shutdown", |this: Arc<ManagerObject>, (): (), _ctx| async move {
                this.shutdown()
            })
    }

    fn manager(&self) -> Result<Arc<Manager>, MethodError> {
        self.manager
            .upgrade()
            .ok_or_else(|| MethodError::new("ManagerError", "manager is shut down"))
    }

    fn get_resources(&self) -> Result<Vec<String>, MethodError> {
        Ok(self
            .manager()?
            .resources
            .locations()
            .iter()
            .map(ToString::to_string)
            .collect())
    }

    fn get_resources_by_class(&self, class: &str) -> Result<Vec<String>, MethodError> {
        Ok(self
            .manager()?
            .resources
            .get_by_class(class)
            .into_iter()
            .map(|e| e.location.to_string())
            .collect())
    }

    fn has_resource(&self, path: &str) -> Result<bool, MethodError> {
        let manager = self.manager()?;
        Ok(manager
            .locate(path)
            .map(|location| manager.resources.contains(&location))
            .unwrap_or(false))
    }

    /// Runs in the background so the reply goes out before the server stops.
    fn shutdown(&self) -> Result<bool, MethodError> {
        let manager = self.manager()?;
        tokio::spawn(async move { manager.shutdown().await });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Call, InvokeError, RemoteObject};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn manager() -> Arc<Manager> {
        Manager::start(BrokerConfig::default().port(free_port()))
            .await
            .unwrap()
    }

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    struct Lamp(Arc<Counters>);

    #[async_trait]
    impl RemoteObject for Lamp {
        async fn invoke(&self, _ctx: &ObjectContext, call: Call) -> Result<Value, InvokeError> {
            match call.method.as_str() {
                "on" => Ok(Value::Bool(true)),
                other => Err(InvokeError::MethodNotFound(other.to_string())),
            }
        }

        async fn start(&self, ctx: &ObjectContext) -> Result<(), MethodError> {
            if ctx.config().get_as::<bool>("broken")? {
                return Err(MethodError::new("IOError", "bulb missing"));
            }
            self.0.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self, _ctx: &ObjectContext) -> Result<(), MethodError> {
            self.0.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn lamp_class(counters: Arc<Counters>) -> ClassDescriptor {
        ClassDescriptor::new("Lamp", move |_ctx| Ok(Lamp(counters.clone()))).option("broken", false)
    }

    #[tokio::test]
    async fn test_add_call_and_lifecycle() {
        let manager = manager().await;
        let lamp = Arc::new(Counters::default());

        let proxy = manager
            .add_class(&lamp_class(lamp.clone()), Some("desk"), BTreeMap::new(), true)
            .await
            .unwrap();
        assert_eq!(proxy.call("on", vec![]).await.unwrap(), Value::Bool(true));
        assert_eq!(lamp.starts.load(Ordering::SeqCst), 1);

        manager.start_object(proxy.location()).await.unwrap();
        assert_eq!(lamp.starts.load(Ordering::SeqCst), 1);

        manager.remove(proxy.location()).await.unwrap();
        assert_eq!(lamp.stops.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.get_proxy("/Lamp/desk").await,
            Err(ManagerError::ObjectNotFound(_))
        ));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_class_validation() {
        let manager = manager().await;
        let class = lamp_class(Arc::new(Counters::default()));

        assert!(matches!(
            manager.add_class(&class, Some("1lamp"), BTreeMap::new(), false).await,
            Err(ManagerError::InvalidName { .. })
        ));

        manager.add_class(&class, Some("desk"), BTreeMap::new(), false).await.unwrap();
        assert!(matches!(
            manager.add_class(&class, Some("desk"), BTreeMap::new(), false).await,
            Err(ManagerError::Registry(RegistryError::AlreadyRegistered(_)))
        ));

        let unknown = BTreeMap::from([("color".to_string(), Value::from("red"))]);
        assert!(matches!(
            manager.add_class(&class, None, unknown, false).await,
            Err(ManagerError::Config(_))
        ));

        let broken = BTreeMap::from([("broken".to_string(), Value::Bool(true))]);
        assert!(matches!(
            manager.add_class(&class, Some("hall"), broken, true).await,
            Err(ManagerError::Object { .. })
        ));
        assert!(manager.get_proxy("/Lamp/hall").await.is_err());
        manager.add_class(&class, Some("hall"), BTreeMap::new(), true).await.unwrap();

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_proxy_lookup_by_class_and_index() {
        let manager = manager().await;
        let class = lamp_class(Arc::new(Counters::default()));
        manager.add_class(&class, Some("desk"), BTreeMap::new(), false).await.unwrap();
        manager.add_class(&class, Some("hall"), BTreeMap::new(), false).await.unwrap();

        let proxy = manager.get_proxy_by_class("Lamp", 1).await.unwrap();
        assert_eq!(proxy.location().path(), "/Lamp/hall");
        assert!(manager.get_proxy_by_class("Lamp", 2).await.is_err());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_manager_surface() {
        let observatory = manager().await;
        let dome = manager().await;
        dome.add_class(&lamp_class(Arc::new(Counters::default())), Some("desk"), BTreeMap::new(), false)
            .await
            .unwrap();

        let remote_manager = format!("{}/Manager/manager", dome.bus());
        let remote = observatory.get_proxy(&remote_manager).await.unwrap();
        let found: Vec<String> = remote
            .invoke_as("get_resources_by_class", vec![Value::from("Lamp")])
            .await
            .unwrap();
        assert_eq!(found, vec![format!("{}/Lamp/desk", dome.bus())]);

        let lamp = observatory
            .get_proxy(&format!("{}/Lamp/desk", dome.bus()))
            .await
            .unwrap();
        assert_eq!(lamp.call("on", vec![]).await.unwrap(), Value::Bool(true));
        assert!(matches!(
            observatory.get_proxy(&format!("{}/Lamp/attic", dome.bus())).await,
            Err(ManagerError::ObjectNotFound(_))
        ));

        assert_eq!(remote.call("shutdown", vec![]).await.unwrap(), Value::Bool(true));
        tokio::time::timeout(std::time::Duration::from_secs(10), dome.wait())
            .await
            .unwrap();
        assert!(dome.is_shut_down());

        observatory.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_shutdown() {
        let manager = manager().await;
        let lamp = Arc::new(Counters::default());
        manager
            .add_class(&lamp_class(lamp.clone()), Some("desk"), BTreeMap::new(), true)
            .await
            .unwrap();

        tokio::join!(manager.shutdown(), manager.shutdown(), manager.shutdown());
        assert_eq!(lamp.stops.load(Ordering::SeqCst), 1);
        assert!(manager.resources().is_empty());
        assert!(matches!(
            manager.add_class(&lamp_class(lamp), None, BTreeMap::new(), false).await,
            Err(ManagerError::ShutDown)
        ));

        manager.shutdown().await;
    }
}
