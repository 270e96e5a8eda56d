//! Queue-backed transport.
//!
//! Requests are pushed onto one well-known list and popped by whichever
//! server gets there first, so several servers on one host share the load.
//! Each response goes to a list named after its request id.
//!
//! [`bind`](Transport::bind) starts an embedded queue host on the endpoint,
//! or joins the one already listening there.

mod command;
mod host;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};

use self::command::{millis, KeyCommand, PopCommand, Popped, PushCommand};
use self::host::RunningHost;
use super::link::{LinkSlot, TopicFrame};
use super::{LinkConfig, Transport, TransportKey};
use crate::codec::MsgPackCodec;
use crate::error::TransportError;
use crate::protocol::{kind, Event, Request, Response};

/// List every request is pushed to.
pub const REQUESTS_KEY: &str = "skywire:requests";

/// List the response to request `id` is pushed to.
pub fn response_key(id: &str) -> String {
    format!("skywire:response:{id}")
}

/// Transport over an embedded queue host. See the module docs.
pub struct QueueTransport {
    key: TransportKey,
    config: LinkConfig,
    host: Mutex<Option<RunningHost>>,
    bound: watch::Sender<bool>,
    link: LinkSlot,
    closed: watch::Sender<bool>,
}

impl QueueTransport {
    pub fn new(key: TransportKey, config: LinkConfig) -> Self {
        let link = LinkSlot::new(key.addr(), config.clone(), key.serializer);
        Self {
            key,
            config,
            host: Mutex::new(None),
            bound: watch::channel(false).0,
            link,
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

    async fn command<C: serde::Serialize>(
        &self,
        op: u16,
        command: &C,
        timeout: Option<Duration>,
    ) -> Result<Bytes, TransportError> {
        self.ensure_open()?;
        let payload = Bytes::from(MsgPackCodec::encode(command)?);
        let link = self.link.get().await?;
        Ok(link.call(op, payload, timeout).await?.payload)
    }

    async fn push(&self, key: &str, body: Vec<u8>, ttl: Option<Duration>) -> Result<(), TransportError> {
        let command = PushCommand {
            key: key.to_string(),
            body,
            ttl_ms: ttl.map(millis),
        };
        self.command(kind::PUSH, &command, self.control_timeout())
            .await
            .map(|_| ())
    }

    /// Blocking pop. The host enforces `timeout`.
    async fn pop(&self, key: &str, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, TransportError> {
        let command = PopCommand {
            key: key.to_string(),
            timeout_ms: timeout.map(millis),
        };
        let reply = self.command(kind::POP, &command, None).await?;
        let popped: Popped = MsgPackCodec::decode(&reply)?;
        Ok(popped.body)
    }

    async fn delete(&self, key: &str) -> Result<(), TransportError> {
        let command = KeyCommand {
            key: key.to_string(),
        };
        self.command(kind::DELETE, &command, self.control_timeout())
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Transport for QueueTransport {
    fn key(&self) -> &TransportKey {
        &self.key
    }

    async fn bind(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        {
            let mut host = self.host.lock().await;
            if host.is_none() && !*self.bound.borrow() {
                match RunningHost::start(&self.key.addr(), &self.config).await {
                    Ok(running) => *host = Some(running),
                    Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::AddrInUse => {
                        tracing::info!("Joining queue host already on {}", self.key.addr());
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.link.get().await?;
        self.bound.send_replace(true);
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
        self.link.close().await;
        if let Some(host) = self.host.lock().await.take() {
            host.shutdown().await;
        }
        tracing::debug!("Closed queue transport {}", self.key);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn ping(&self) -> bool {
        self.command(kind::PING, &(), self.control_timeout())
            .await
            .is_ok()
    }

    async fn send_request(&self, request: &Request) -> Result<(), TransportError> {
        let body = self.key.serializer.dumps(request)?;
        self.push(REQUESTS_KEY, body, None).await
    }

    async fn recv_request(&self) -> Result<Option<Request>, TransportError> {
        if !*self.bound.borrow() {
            return Err(if self.is_closed() {
                TransportError::Closed
            } else {
                TransportError::NotBound
            });
        }

        let mut closed = self.closed.subscribe();
        loop {
            let popped = tokio::select! {
                _ = closed.wait_for(|closed| *closed) => return Ok(None),
                popped = self.pop(REQUESTS_KEY, None) => popped,
            };

            match popped {
                Ok(Some(body)) => match self.key.serializer.loads(&body) {
                    Ok(request) => return Ok(Some(request)),
                    Err(e) => tracing::warn!("Dropping undecodable request: {}", e),
                },
                Ok(None) => return Err(TransportError::Disconnected(self.key.addr())),
                Err(_) if self.is_closed() => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_response(&self, request: &Request, response: &Response) -> Result<(), TransportError> {
        let body = self.key.serializer.dumps(response)?;
        self.push(&response_key(&request.id), body, Some(self.config.response_ttl()))
            .await
    }

    async fn recv_response(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Option<Response>, TransportError> {
        let key = response_key(&request.id);
        match self.pop(&key, timeout).await? {
            Some(body) => Ok(Some(self.key.serializer.loads(&body)?)),
            None => {
                if let Err(e) = self.delete(&key).await {
                    tracing::debug!("Could not delete {}: {}", key, e);
                }
                Ok(None)
            }
        }
    }

    async fn publish(&self, topic: &str, event: &Event) -> Result<usize, TransportError> {
        let body = self.key.serializer.dumps(event)?;
        let reply = self
            .command(
                kind::PUBLISH,
                &TopicFrame {
                    topic: topic.to_string(),
                    body,
                },
                self.control_timeout(),
            )
            .await?;
        let count: u64 = MsgPackCodec::decode(&reply)?;
        Ok(count as usize)
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Event>, TransportError> {
        self.ensure_open()?;
        let rx = self.link.topics().add(topic);
        let subscribed = TopicFrame {
            topic: topic.to_string(),
            body: Vec::new(),
        };
        if let Err(e) = self
            .command(kind::SUBSCRIBE, &subscribed, self.control_timeout())
            .await
        {
            self.link.topics().remove(topic);
            return Err(e);
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.link.topics().remove(topic);
        if self.link.current().is_some() {
            let unsubscribed = TopicFrame {
                topic: topic.to_string(),
                body: Vec::new(),
            };
            self.command(kind::UNSUBSCRIBE, &unsubscribed, self.control_timeout())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Serializer;
    use crate::protocol::{Kwargs, Protocol};
    use crate::transport::TransportKind;
    use crate::Value;
    use std::sync::Arc;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn transport(port: u16) -> QueueTransport {
        let key = TransportKey::new("127.0.0.1", port, TransportKind::Queue, Serializer::MsgPack);
        QueueTransport::new(key, LinkConfig::default())
    }

    fn request(port: u16, method: &str) -> Request {
        Protocol::default().request(
            format!("127.0.0.1:{port}/Calc/calc"),
            method,
            vec![Value::Int(2), Value::Int(3)],
            Kwargs::new(),
        )
    }

    #[test]
    fn test_well_known_keys() {
        assert_eq!(REQUESTS_KEY, "skywire:requests");
        assert_eq!(response_key("abc"), "skywire:response:abc");
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let port = free_port();
        let server = transport(port);
        server.bind().await.unwrap();
        let client = transport(port);

        let req = request(port, "add");
        client.send_request(&req).await.unwrap();

        let received = server.recv_request().await.unwrap().unwrap();
        assert_eq!(received, req);
        let protocol = Protocol::default();
        server
            .send_response(&received, &protocol.ok(&received, Value::Int(5)))
            .await
            .unwrap();

        let response = client
            .recv_response(&req, Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.result, Some(Value::Int(5)));
    }

    #[tokio::test]
    async fn test_requests_are_fifo() {
        let port = free_port();
        let server = transport(port);
        server.bind().await.unwrap();

        let first = request(port, "first");
        let second = request(port, "second");
        server.send_request(&first).await.unwrap();
        server.send_request(&second).await.unwrap();

        assert_eq!(server.recv_request().await.unwrap().unwrap().method, "first");
        assert_eq!(server.recv_request().await.unwrap().unwrap().method, "second");
    }

    #[tokio::test]
    async fn test_recv_response_times_out() {
        let port = free_port();
        let server = transport(port);
        server.bind().await.unwrap();

        let req = request(port, "add");
        let response = server
            .recv_response(&req, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_second_server_joins_existing_host() {
        let port = free_port();
        let first = transport(port);
        first.bind().await.unwrap();
        let second = transport(port);
        second.bind().await.unwrap();

        second.send_request(&request(port, "add")).await.unwrap();
        assert!(first.recv_request().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unbound_recv_request_fails() {
        let client = transport(free_port());
        assert!(matches!(
            client.recv_request().await,
            Err(TransportError::NotBound)
        ));
    }

    #[tokio::test]
    async fn test_close_releases_pending_recv() {
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
    }

    #[tokio::test]
    async fn test_host_side_publish() {
        let port = free_port();
        let server = transport(port);
        server.bind().await.unwrap();

        let subscriber = transport(port);
        let mut events = subscriber.subscribe("Dome/opened").await.unwrap();

        let event = Protocol::default().event("h:1/Dome/0", vec![], Kwargs::new());
        assert_eq!(server.publish("Dome/opened", &event).await.unwrap(), 1);

        let received = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, event.id);
    }
}
