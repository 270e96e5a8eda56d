//! Push/pull transport over persistent TCP links.
//!
//! The bound side accepts connections and queues incoming requests together
//! with the connection and correlation id they arrived on, so the response
//! goes back the same way. The connecting side keeps one link per endpoint
//! and matches responses to requests through oneshot channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex};

use super::link::{Link, LinkSlot, Pending, TopicFrame};
use super::listener::{FrameHandler, Listener, Peer, Subscribers};
use super::{LinkConfig, Transport, TransportKey};
use crate::codec::{MsgPackCodec, Serializer};
use crate::error::TransportError;
use crate::protocol::{kind, Event, Frame, Request, Response};

/// Where to send the response for a received request.
struct Route {
    peer: Peer,
    correlation: u32,
}

/// State shared with the accept loop.
struct Inbound {
    serializer: Serializer,
    tx: mpsc::UnboundedSender<Request>,
    rx: Mutex<mpsc::UnboundedReceiver<Request>>,
    routes: DashMap<String, Route>,
    subscribers: Subscribers,
}

impl Inbound {
    fn new(serializer: Serializer) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            serializer,
            tx,
            rx: Mutex::new(rx),
            routes: DashMap::new(),
            subscribers: Subscribers::default(),
        }
    }

    fn accept_request(&self, peer: &Peer, frame: &Frame) -> Result<(), TransportError> {
        let request: Request = self.serializer.loads(frame.payload())?;
        tracing::debug!("Request {} for {} from {}", request.id, request.location, peer.addr());

        self.routes.insert(
            request.id.clone(),
            Route {
                peer: peer.clone(),
                correlation: frame.correlation_id(),
            },
        );
        self.tx
            .send(request)
            .map_err(|_| TransportError::Closed)
    }
}

impl FrameHandler for Inbound {
    fn on_frame(this: &Arc<Self>, peer: &Peer, frame: Frame) {
        match frame.kind() {
            kind::REQUEST => {
                if let Err(e) = this.accept_request(peer, &frame) {
                    tracing::warn!("Rejecting request from {}: {}", peer.addr(), e);
                    let peer = peer.clone();
                    tokio::spawn(async move { peer.answer(&frame, Err(e)).await });
                }
            }
            kind::PING => {
                let peer = peer.clone();
                tokio::spawn(async move { peer.answer(&frame, Ok(Vec::new())).await });
            }
            other => {
                let this = this.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    let result = match this.subscribers.handle(&peer, &frame).await {
                        Some(result) => result,
                        None => Err(TransportError::Protocol(format!(
                            "unsupported frame kind {other}"
                        ))),
                    };
                    peer.answer(&frame, result).await;
                });
            }
        }
    }

    fn on_disconnect(this: &Arc<Self>, peer: &Peer) {
        this.subscribers.drop_peer(peer);
        this.routes.retain(|_, route| route.peer.id() != peer.id());
    }
}

/// Direct TCP transport. See the module docs.
pub struct SocketTransport {
    key: TransportKey,
    config: LinkConfig,
    inbound: Arc<Inbound>,
    listener: Mutex<Option<Listener>>,
    link: LinkSlot,
    waiting: DashMap<String, (Arc<Link>, Pending)>,
    closed: watch::Sender<bool>,
}

impl SocketTransport {
    pub fn new(key: TransportKey, config: LinkConfig) -> Self {
        let link = LinkSlot::new(key.addr(), config.clone(), key.serializer);
        Self {
            inbound: Arc::new(Inbound::new(key.serializer)),
            key,
            config,
            listener: Mutex::new(None),
            link,
            waiting: DashMap::new(),
            closed: watch::channel(false).0,
        }
    }

    fn control_timeout(&self) -> Option<Duration> {
        Some(self.config.connect_timeout())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Queue a request without waiting.
    ///
    /// Returns `Ok(false)` when the link's write buffer is full. The link must
    /// already be established with [`connect`](Transport::connect).
    pub fn try_send_request(&self, request: &Request) -> Result<bool, TransportError> {
        self.ensure_open()?;
        let link = self
            .link
            .current()
            .ok_or_else(|| TransportError::Disconnected(self.key.addr()))?;
        let payload = Bytes::from(self.key.serializer.dumps(request)?);

        match link.try_submit(kind::REQUEST, payload)? {
            Some(pending) => {
                self.waiting.insert(request.id.clone(), (link, pending));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Next queued request, if one is ready.
    pub fn try_recv_request(&self) -> Option<Request> {
        let mut rx = self.inbound.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Address the listener is bound to.
    pub async fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.lock().await.as_ref().map(Listener::local_addr)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn key(&self) -> &TransportKey {
        &self.key
    }

    async fn bind(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut listener = self.listener.lock().await;
        if listener.is_none() {
            *listener = Some(Listener::bind(&self.key.addr(), &self.config, self.inbound.clone()).await?);
        }
        Ok(())
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.link.get().await.map(|_| ())
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Some(listener) = self.listener.lock().await.take() {
            listener.shutdown().await;
        }
        self.link.close().await;
        self.waiting.clear();
        self.inbound.routes.clear();
        self.inbound.subscribers.clear();
        tracing::debug!("Closed socket transport {}", self.key);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn ping(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.link.get().await {
            Ok(link) => link
                .call(kind::PING, Bytes::new(), self.control_timeout())
                .await
                .is_ok(),
            Err(_) => false,
        }
    }

    async fn send_request(&self, request: &Request) -> Result<(), TransportError> {
        self.ensure_open()?;
        let payload = Bytes::from(self.key.serializer.dumps(request)?);
        let link = self.link.get().await?;
        let pending = link.submit(kind::REQUEST, payload).await?;
        self.waiting.insert(request.id.clone(), (link, pending));
        Ok(())
    }

    async fn recv_request(&self) -> Result<Option<Request>, TransportError> {
        if self.listener.lock().await.is_none() {
            return Err(if self.is_closed() {
                TransportError::Closed
            } else {
                TransportError::NotBound
            });
        }

        let mut closed = self.closed.subscribe();
        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Ok(None),
            request = async { self.inbound.rx.lock().await.recv().await } => Ok(request),
        }
    }

    async fn send_response(&self, request: &Request, response: &Response) -> Result<(), TransportError> {
        let payload = Bytes::from(self.key.serializer.dumps(response)?);
        let (_, route) = self
            .inbound
            .routes
            .remove(&request.id)
            .ok_or_else(|| TransportError::NoRoute(request.id.clone()))?;

        match route.peer.reply(kind::RESPONSE, route.correlation, payload).await {
            Err(e @ TransportError::Codec(_)) => {
                // Keep the route so an error response can still go out.
                self.inbound.routes.insert(request.id.clone(), route);
                Err(e)
            }
            sent => sent,
        }
    }

    async fn recv_response(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Option<Response>, TransportError> {
        let (_, (link, pending)) = self
            .waiting
            .remove(&request.id)
            .ok_or_else(|| TransportError::NoRoute(request.id.clone()))?;

        match link.wait(pending, timeout).await? {
            None => Ok(None),
            Some(frame) if frame.is_error() => Err(TransportError::Protocol(frame.error_text())),
            Some(frame) => Ok(Some(self.key.serializer.loads(frame.payload())?)),
        }
    }

    fn discard(&self, request: &Request) {
        self.waiting.remove(&request.id);
    }

    async fn publish(&self, topic: &str, event: &Event) -> Result<usize, TransportError> {
        self.ensure_open()?;
        let body = self.key.serializer.dumps(event)?;

        if self.listener.lock().await.is_some() {
            return self.inbound.subscribers.fan_out(topic, body).await;
        }

        let link = self.link.get().await?;
        let reply = link
            .call(kind::PUBLISH, TopicFrame::encode(topic, body)?, self.control_timeout())
            .await?;
        let count: u64 = MsgPackCodec::decode(reply.payload())?;
        Ok(count as usize)
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Event>, TransportError> {
        self.ensure_open()?;
        let link = self.link.get().await?;
        let rx = self.link.topics().add(topic);
        if let Err(e) = link
            .call(kind::SUBSCRIBE, TopicFrame::encode(topic, Vec::new())?, self.control_timeout())
            .await
        {
            self.link.topics().remove(topic);
            return Err(e);
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.link.topics().remove(topic);
        if let Some(link) = self.link.current() {
            link.call(kind::UNSUBSCRIBE, TopicFrame::encode(topic, Vec::new())?, self.control_timeout())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::error::CodecError;
    use crate::protocol::{Kwargs, Protocol};
    use crate::transport::TransportKind;
    use crate::{Location, Value};

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn transport(port: u16) -> SocketTransport {
        let key = TransportKey::new("127.0.0.1", port, TransportKind::Socket, Serializer::MsgPack);
        SocketTransport::new(key, LinkConfig::default())
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let port = free_port();
        let server = transport(port);
        server.bind().await.unwrap();

        let client = transport(port);
        client.connect().await.unwrap();

        let protocol = Protocol::default();
        let request = protocol.request(
            format!("127.0.0.1:{port}/Calc/calc"),
            "add",
            vec![Value::Int(2), Value::Int(3)],
            Kwargs::new(),
        );
        client.send_request(&request).await.unwrap();

        let received = server.recv_request().await.unwrap().unwrap();
        assert_eq!(received, request);
        server
            .send_response(&received, &protocol.ok(&received, Value::Int(5)))
            .await
            .unwrap();

        let response = client
            .recv_response(&request, Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.id, request.id);
        assert_eq!(response.result, Some(Value::Int(5)));
    }

    #[tokio::test]
    async fn test_dropped_call_leaves_nothing_waiting() {
        let port = free_port();
        let server = transport(port);
        server.bind().await.unwrap();
        let caller = Arc::new(transport(port));
        let location = Location::parse(&format!("127.0.0.1:{port}/Calc/calc")).unwrap();
        let client = Client::new(caller.clone(), location);

        let call = client.request("add", vec![], Kwargs::new(), Some(Duration::from_secs(30)));
        assert!(tokio::time::timeout(Duration::from_millis(100), call).await.is_err());

        assert!(server.recv_request().await.unwrap().is_some());
        assert!(caller.waiting.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_response_keeps_route_for_fallback() {
        let port = free_port();
        let key = TransportKey::new("127.0.0.1", port, TransportKind::Socket, Serializer::MsgPack);
        let config = LinkConfig {
            max_payload_size: 512,
            ..LinkConfig::default()
        };
        let server = SocketTransport::new(key.clone(), config.clone());
        server.bind().await.unwrap();
        let client = SocketTransport::new(key, config);

        let request = Protocol::default().request(format!("127.0.0.1:{port}/Calc/calc"), "big", vec![], Kwargs::new());
        client.send_request(&request).await.unwrap();
        let received = server.recv_request().await.unwrap().unwrap();

        let protocol = Protocol::default();
        let huge = protocol.ok(&received, Value::Str("x".repeat(4096)));
        assert!(matches!(
            server.send_response(&received, &huge).await,
            Err(TransportError::Codec(CodecError::TooLarge { .. }))
        ));

        server
            .send_response(&received, &protocol.ok(&received, Value::Int(1)))
            .await
            .unwrap();
        let response = client
            .recv_response(&request, Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.result, Some(Value::Int(1)));
    }

    #[tokio::test]
    async fn test_oversized_request_is_refused_locally() {
        let port = free_port();
        let key = TransportKey::new("127.0.0.1", port, TransportKind::Socket, Serializer::MsgPack);
        let config = LinkConfig {
            max_payload_size: 512,
            ..LinkConfig::default()
        };
        let server = SocketTransport::new(key.clone(), config.clone());
        server.bind().await.unwrap();
        let client = SocketTransport::new(key, config);

        let big = Protocol::default().request(
            format!("127.0.0.1:{port}/Calc/calc"),
            "big",
            vec![Value::Str("x".repeat(4096))],
            Kwargs::new(),
        );
        assert!(matches!(
            client.send_request(&big).await,
            Err(TransportError::Codec(CodecError::TooLarge { .. }))
        ));

        // The link survives for the next request.
        let small = Protocol::default().request(format!("127.0.0.1:{port}/Calc/calc"), "add", vec![], Kwargs::new());
        client.send_request(&small).await.unwrap();
        assert_eq!(server.recv_request().await.unwrap().unwrap().id, small.id);
    }

    #[tokio::test]
    async fn test_recv_response_times_out() {
        let port = free_port();
        let server = transport(port);
        server.bind().await.unwrap();
        let client = transport(port);

        let request = Protocol::default().request("h:1/A/a", "m", vec![], Kwargs::new());
        client.send_request(&request).await.unwrap();

        let response = client
            .recv_response(&request, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_dial_refused_is_dead() {
        let client = transport(free_port());
        let err = client.connect().await.unwrap_err();
        assert!(err.is_dead(), "{err}");
        assert!(!client.ping().await);
    }

    #[tokio::test]
    async fn test_try_variants_never_block() {
        let port = free_port();
        let server = transport(port);
        server.bind().await.unwrap();
        assert!(server.try_recv_request().is_none());

        let client = transport(port);
        let request = Protocol::default().request("h:1/A/a", "m", vec![], Kwargs::new());
        assert!(client.try_send_request(&request).is_err());

        client.connect().await.unwrap();
        assert!(client.try_send_request(&request).unwrap());
    }

    #[tokio::test]
    async fn test_recv_request_returns_none_after_close() {
        let port = free_port();
        let server = Arc::new(transport(port));
        server.bind().await.unwrap();

        let waiter = {
            let server = server.clone();
            tokio::spawn(async move { server.recv_request().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close().await;

        assert!(waiter.await.unwrap().unwrap().is_none());
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let port = free_port();
        let server = transport(port);
        server.bind().await.unwrap();

        let subscriber = transport(port);
        let mut events = subscriber.subscribe("Telescope/slewComplete").await.unwrap();

        let event = Protocol::default().event("h:1/Telescope/0", vec![Value::Bool(true)], Kwargs::new());
        assert_eq!(server.publish("Telescope/slewComplete", &event).await.unwrap(), 1);
        assert_eq!(server.publish("Telescope/other", &event).await.unwrap(), 0);

        let received = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, event);

        subscriber.unsubscribe("Telescope/slewComplete").await.unwrap();
        assert_eq!(server.publish("Telescope/slewComplete", &event).await.unwrap(), 0);
    }
}
