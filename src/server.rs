//! Server dispatch loop.
//!
//! The server owns the bound transport of its bus. It pulls requests off the
//! transport, runs each one as a task bounded by a worker semaphore and
//! sends exactly one response back. A request never takes the loop down: bad
//! locations and unknown resources or methods answer 404, failures and
//! panics answer 500.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{ServerError, TransportError};
use crate::events::{EventsEngine, Handler, Topic};
use crate::object::{Call, InvokeError, MethodError};
use crate::protocol::{Event, Failure, Kwargs, Protocol, Request, Response};
use crate::proxy::reserved;
use crate::registry::{ResourceEntry, ResourceRegistry};
use crate::transport::Transport;
use crate::{Location, Value};

/// Pause before receiving again after the backend went away.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(250);

/// How long `stop` waits for in-flight calls before aborting them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Started,
    Running,
    Stopping,
    Stopped,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Created => "created",
            ServerState::Started => "started",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
        }
    }
}

pub struct Server {
    transport: Arc<dyn Transport>,
    resources: Arc<ResourceRegistry>,
    events: Arc<EventsEngine>,
    protocol: Protocol,
    /// `None` means unbounded.
    workers: Option<Arc<Semaphore>>,
    state: Mutex<ServerState>,
    shutdown: watch::Sender<bool>,
    serve_task: Mutex<Option<JoinHandle<()>>>,
    stop_lock: tokio::sync::Mutex<()>,
}

impl Server {
    /// `max_workers` bounds concurrent calls; 0 means unbounded.
    pub fn new(
        transport: Arc<dyn Transport>,
        resources: Arc<ResourceRegistry>,
        events: Arc<EventsEngine>,
        max_workers: usize,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            transport,
            resources,
            events,
            protocol: Protocol::default(),
            workers: (max_workers > 0).then(|| Arc::new(Semaphore::new(max_workers))),
            state: Mutex::new(ServerState::Created),
            shutdown,
            serve_task: Mutex::new(None),
            stop_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running && !self.transport.is_closed()
    }

    /// Bind the transport and start serving.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        {
            let mut state = self.state.lock();
            if *state != ServerState::Created {
                return Err(ServerError::InvalidState(state.as_str()));
            }
            *state = ServerState::Started;
        }

        if let Err(e) = self.transport.bind().await {
            *self.state.lock() = ServerState::Stopped;
            return Err(e.into());
        }

        let server = self.clone();
        *self.serve_task.lock() = Some(tokio::spawn(server.serve()));
        *self.state.lock() = ServerState::Running;

        tracing::info!("Serving {}", self.transport.key());
        Ok(())
    }

    async fn serve(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut calls = JoinSet::new();

        loop {
            while calls.try_join_next().is_some() {}

            let received = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                received = self.transport.recv_request() => received,
            };

            let request = match received {
                Ok(Some(request)) => request,
                Ok(None) => {
                    tracing::debug!("Transport {} closed, serve loop ending", self.transport.key());
                    break;
                }
                Err(TransportError::Closed) => break,
                Err(e) if e.is_retryable() || e.is_dead() => {
                    tracing::warn!("Receive failed on {}: {}, retrying", self.transport.key(), e);
                    tokio::select! {
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => continue,
                    }
                }
                Err(e) => {
                    tracing::error!("Dropping undecodable request: {}", e);
                    continue;
                }
            };

            let permit = match &self.workers {
                Some(workers) => match workers.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                None => None,
            };

            let server = self.clone();
            calls.spawn(async move {
                let _permit = permit;
                server.handle(request).await;
            });
        }

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while calls.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Aborting {} calls still running at shutdown", calls.len());
            calls.abort_all();
        }
    }

    async fn handle(&self, request: Request) {
        let response = self.dispatch(&request).await;
        match self.transport.send_response(&request, &response).await {
            Ok(()) => {}
            Err(TransportError::Codec(e)) => {
                tracing::warn!("Result of {}.{} not serializable: {}", request.location, request.method, e);
                let failure = Failure::new("SerializationError", e.to_string());
                let fallback = self.protocol.error(&request, &failure);
                if let Err(e) = self.transport.send_response(&request, &fallback).await {
                    tracing::error!("Cannot answer request {}: {}", request.id, e);
                }
            }
            Err(e) => tracing::warn!("Cannot answer request {}: {}", request.id, e),
        }
    }

    /// Turn one request into its response.
    pub async fn dispatch(&self, request: &Request) -> Response {
        let location = match Location::parse(&request.location) {
            Ok(location) => location,
            Err(e) => return self.protocol.not_found(request, e.to_string()),
        };

        let Some(entry) = self.resources.get(&location) else {
            return self
                .protocol
                .not_found(request, format!("resource {location} not found"));
        };

        let call = Call::from(request.clone());
        let method = call.method.clone();
        let outcome = if reserved::is_reserved(&method) {
            self.reserved(&entry, call).await.map_err(InvokeError::from)
        } else {
            AssertUnwindSafe(entry.object.invoke(&entry.context, call))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(InvokeError::Failed(panic_failure(panic))))
        };

        match outcome {
            Ok(value) => self.protocol.ok(request, value),
            Err(InvokeError::MethodNotFound(_)) => self
                .protocol
                .not_found(request, format!("method {}.{} not found", entry.class, method)),
            Err(InvokeError::Failed(failure)) => {
                tracing::debug!("{}.{} failed: {}", entry.location, method, failure);
                self.protocol.error(request, &failure)
            }
        }
    }

    /// Methods every object answers.
    async fn reserved(&self, entry: &ResourceEntry, call: Call) -> Result<Value, MethodError> {
        let config = entry.context.config();
        match call.method.as_str() {
            reserved::GET_ITEM => Ok(config.get(&arg::<String>(&call, 0)?)?),
            reserved::SET_ITEM => {
                config.set(&arg::<String>(&call, 0)?, arg::<Value>(&call, 1)?)?;
                Ok(Value::Null)
            }
            reserved::UPDATE => {
                config.update(arg(&call, 0)?)?;
                Ok(Value::Null)
            }
            reserved::KEYS => Ok(Value::List(
                config.keys().into_iter().map(Value::Str).collect(),
            )),
            reserved::PING => Ok(Value::Bool(true)),
            reserved::SUBSCRIBE | reserved::UNSUBSCRIBE => {
                let topic = Topic::new(entry.location.clone(), arg::<String>(&call, 0)?);
                let subscriber = Location::parse(&arg::<String>(&call, 1)?)?;
                let handler = Handler::new(subscriber, arg::<String>(&call, 2)?);
                let done = if call.method == reserved::SUBSCRIBE {
                    tracing::debug!("{} subscribed to {}", handler, topic);
                    self.events.subscribe(topic, handler)
                } else {
                    self.events.unsubscribe(&topic, &handler)
                };
                Ok(Value::Bool(done))
            }
            other => Err(MethodError::new("NameError", format!("unknown reserved method {other}"))),
        }
    }

    /// Send `args` as an event on `topic` through the transport.
    pub async fn publish(&self, topic: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<usize, TransportError> {
        let event = self.protocol.event(topic, args, kwargs);
        self.publish_event(topic, &event).await
    }

    pub async fn publish_event(&self, topic: &str, event: &Event) -> Result<usize, TransportError> {
        self.transport.publish(topic, event).await
    }

    /// Stop serving, let in-flight calls finish and close the transport.
    ///
    /// Idempotent; concurrent callers all return once the server is stopped.
    pub async fn stop(&self) {
        let _guard = self.stop_lock.lock().await;

        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            if previous != ServerState::Stopped {
                *state = ServerState::Stopping;
            }
            previous
        };
        if previous == ServerState::Stopped {
            return;
        }

        self.shutdown.send_replace(true);
        let task = self.serve_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Serve loop of {} failed: {}", self.transport.key(), e);
            }
        }

        if !self.transport.is_closed() {
            self.transport.close().await;
        }
        *self.state.lock() = ServerState::Stopped;
        tracing::info!("Stopped serving {}", self.transport.key());
    }
}

fn arg<T: DeserializeOwned>(call: &Call, index: usize) -> Result<T, MethodError> {
    let value = call.args.get(index).cloned().ok_or_else(|| {
        MethodError::new(
            "TypeError",
            format!("{} takes at least {} arguments", call.method, index + 1),
        )
    })?;
    value
        .deserialize_into()
        .map_err(|e| MethodError::new("TypeError", format!("argument {} of {}: {}", index + 1, call.method, e)))
}

fn panic_failure(panic: Box<dyn Any + Send>) -> Failure {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "method panicked".to_string()
    };
    Failure::new("Panic", message).with_trace(Backtrace::force_capture().to_string())
}
