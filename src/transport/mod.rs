//! Transport module - how requests, responses and events move between processes.
//!
//! Two interchangeable implementations of [`Transport`]:
//! - [`QueueTransport`] - named lists on an embedded queue host, so several
//!   servers can share one request list
//! - [`SocketTransport`] - direct push/pull over persistent TCP links
//!
//! Both speak the frame format from [`crate::protocol`] over TCP and are
//! addressed by `host:port`. [`TransportRegistry`] makes sure a process opens
//! at most one transport per endpoint.

mod link;
mod listener;
mod queue;
mod registry;
mod socket;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use queue::QueueTransport;
pub use registry::TransportRegistry;
pub use socket::SocketTransport;

use crate::codec::Serializer;
use crate::error::TransportError;
use crate::protocol::{Event, Request, Response, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::writer::WriterConfig;
use crate::Location;

/// Default dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an unclaimed response stays on the queue host.
pub const DEFAULT_RESPONSE_TTL: Duration = Duration::from_secs(60);

/// Which implementation backs a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Socket,
    Queue,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Socket => "socket",
            TransportKind::Queue => "queue",
        })
    }
}

/// Identity of a transport: one per endpoint, kind and serializer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportKey {
    pub host: String,
    pub port: u16,
    pub kind: TransportKind,
    pub serializer: Serializer,
}

impl TransportKey {
    pub fn new(host: impl Into<String>, port: u16, kind: TransportKind, serializer: Serializer) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
            serializer,
        }
    }

    /// Key for the bus `location` lives on.
    pub fn for_location(location: &Location, kind: TransportKind, serializer: Serializer) -> Self {
        Self::new(location.host(), location.port(), kind, serializer)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}#{}", self.kind, self.host, self.port, self.serializer)
    }
}

/// Tunables shared by every TCP link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Largest accepted frame payload, in bytes.
    pub max_payload_size: u32,
    pub writer: WriterConfig,
    pub connect_timeout_ms: u64,
    /// Queue transport only.
    pub response_ttl_ms: u64,
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_ttl(&self) -> Duration {
        Duration::from_millis(self.response_ttl_ms)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            writer: WriterConfig::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            response_ttl_ms: DEFAULT_RESPONSE_TTL.as_millis() as u64,
        }
    }
}

/// Moves protocol records between a client and the server owning a bus.
///
/// The server side calls [`bind`](Transport::bind) and then loops on
/// [`recv_request`](Transport::recv_request); the client side calls
/// [`connect`](Transport::connect). One transport may play both roles.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn key(&self) -> &TransportKey;

    /// Accept requests on this endpoint.
    async fn bind(&self) -> Result<(), TransportError>;

    /// Open the client side. Cheap if already connected.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the transport. Pending `recv_request` calls return `Ok(None)`.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Whether the endpoint answers.
    async fn ping(&self) -> bool;

    async fn send_request(&self, request: &Request) -> Result<(), TransportError>;

    /// Next request for this endpoint; `Ok(None)` once the transport is closed.
    async fn recv_request(&self) -> Result<Option<Request>, TransportError>;

    async fn send_response(&self, request: &Request, response: &Response) -> Result<(), TransportError>;

    /// The response to `request`; `Ok(None)` when `timeout` elapses first.
    async fn recv_response(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Option<Response>, TransportError>;

    /// Forget a sent request whose response will not be awaited.
    fn discard(&self, _request: &Request) {}

    /// Deliver `event` to every subscriber of `topic`. Returns how many were reached.
    async fn publish(&self, topic: &str, event: &Event) -> Result<usize, TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Event>, TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}
