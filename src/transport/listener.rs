//! Server side of framed TCP links.
//!
//! [`Listener`] accepts connections and runs one read loop and one writer
//! task per connection. Frames are handed to a [`FrameHandler`] together with
//! the [`Peer`] they came from, so replies can be routed back.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use super::link::TopicFrame;
use super::LinkConfig;
use crate::codec::MsgPackCodec;
use crate::error::TransportError;
use crate::protocol::{flags, kind, Frame, FrameBuffer};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// A connected client, as seen by the accepting side.
#[derive(Clone)]
pub(crate) struct Peer {
    id: u64,
    addr: SocketAddr,
    writer: WriterHandle,
    max_payload: u32,
}

impl Peer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.writer.send(frame).await
    }

    pub async fn reply(&self, kind: u16, correlation: u32, payload: Bytes) -> Result<(), TransportError> {
        let frame = OutboundFrame::bounded(kind, flags::IS_REPLY, correlation, payload, self.max_payload)?;
        self.send(frame).await
    }

    pub async fn reply_error(&self, kind: u16, correlation: u32, message: &str) -> Result<(), TransportError> {
        let payload = Bytes::copy_from_slice(message.as_bytes());
        self.send(OutboundFrame::new(kind, flags::ERROR_REPLY, correlation, payload))
            .await
    }

    /// Reply with `result`, or with its error text.
    pub async fn answer(&self, frame: &Frame, result: Result<Vec<u8>, TransportError>) {
        let sent = match result {
            Ok(payload) => {
                self.reply(frame.kind(), frame.correlation_id(), Bytes::from(payload))
                    .await
            }
            Err(e) => {
                self.reply_error(frame.kind(), frame.correlation_id(), &e.to_string())
                    .await
            }
        };
        if let Err(e) = sent {
            tracing::debug!("Reply to {} failed: {}", self.addr, e);
        }
    }
}

/// Receives frames from all connections of a [`Listener`].
pub(crate) trait FrameHandler: Send + Sync + 'static {
    fn on_frame(this: &Arc<Self>, peer: &Peer, frame: Frame);

    fn on_disconnect(_this: &Arc<Self>, _peer: &Peer) {}
}

/// Accept loop plus its connections.
pub(crate) struct Listener {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Listener {
    pub async fn bind<H: FrameHandler>(
        addr: &str,
        config: &LinkConfig,
        handler: Arc<H>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let config = config.clone();
        let task = tokio::spawn(accept_loop(listener, config, handler, shutdown_rx));

        tracing::debug!("Listening on {}", local_addr);

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drop every connection, and wait for the loops to exit.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            tracing::error!("Accept loop on {} panicked: {}", self.local_addr, e);
        }
    }
}

async fn accept_loop<H: FrameHandler>(
    listener: TcpListener,
    config: LinkConfig,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) {
    let next_peer = AtomicU64::new(1);
    let mut connections = JoinSet::new();
    let connection_shutdown = shutdown.clone();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                let id = next_peer.fetch_add(1, Ordering::Relaxed);
                connections.spawn(serve_connection(
                    stream,
                    addr,
                    id,
                    config.clone(),
                    handler.clone(),
                    connection_shutdown.clone(),
                ));
            }
            Err(e) => tracing::warn!("Accept failed: {}", e),
        }
    }

    while connections.join_next().await.is_some() {}
}

async fn serve_connection<H: FrameHandler>(
    stream: TcpStream,
    addr: SocketAddr,
    id: u64,
    config: LinkConfig,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, write_half) = stream.into_split();
    let (writer, _writer_task) = spawn_writer_task(write_half, &config.writer);
    let peer = Peer {
        id,
        addr,
        writer,
        max_payload: config.max_payload_size,
    };

    let mut frame_buffer = FrameBuffer::with_max_payload(config.max_payload_size);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let read = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Read from {} failed: {}", addr, e);
                break;
            }
        };

        match frame_buffer.push(&buf[..n]) {
            Ok(frames) => {
                for frame in frames {
                    H::on_frame(&handler, &peer, frame);
                }
            }
            Err(e) => {
                tracing::warn!("Dropping connection from {}: {}", addr, e);
                break;
            }
        }
    }

    H::on_disconnect(&handler, &peer);
}

/// Topic subscriptions held by the accepting side.
#[derive(Default)]
pub(crate) struct Subscribers {
    peers: DashMap<String, Vec<Peer>>,
}

impl Subscribers {
    pub fn add(&self, topic: &str, peer: &Peer) {
        let mut peers = self.peers.entry(topic.to_string()).or_default();
        if !peers.iter().any(|p| p.id == peer.id) {
            peers.push(peer.clone());
        }
    }

    pub fn remove(&self, topic: &str, peer: &Peer) {
        if let Some(mut peers) = self.peers.get_mut(topic) {
            peers.retain(|p| p.id != peer.id);
        }
        self.peers.remove_if(topic, |_, peers| peers.is_empty());
    }

    pub fn drop_peer(&self, peer: &Peer) {
        self.peers.retain(|_, peers| {
            peers.retain(|p| p.id != peer.id);
            !peers.is_empty()
        });
    }

    pub fn clear(&self) {
        self.peers.clear();
    }

    /// Send `body` to every subscriber of `topic`. Returns the number reached.
    pub async fn fan_out(&self, topic: &str, body: Vec<u8>) -> Result<usize, TransportError> {
        let peers = match self.peers.get(topic) {
            Some(peers) => peers.clone(),
            None => return Ok(0),
        };

        let payload = TopicFrame::encode(topic, body)?;
        let mut reached = 0;
        for peer in &peers {
            let frame = OutboundFrame::bounded(kind::EVENT, 0, 0, payload.clone(), peer.max_payload)?;
            match peer.send(frame).await {
                Ok(()) => reached += 1,
                Err(e) => {
                    tracing::debug!("Event to {} failed: {}", peer.addr(), e);
                    self.remove(topic, peer);
                }
            }
        }
        Ok(reached)
    }

    /// Execute a pub/sub frame. `None` if the frame is not one.
    pub async fn handle(&self, peer: &Peer, frame: &Frame) -> Option<Result<Vec<u8>, TransportError>> {
        let op = frame.kind();
        if !matches!(op, kind::SUBSCRIBE | kind::UNSUBSCRIBE | kind::PUBLISH) {
            return None;
        }

        let request: TopicFrame = match MsgPackCodec::decode(frame.payload()) {
            Ok(request) => request,
            Err(e) => return Some(Err(e.into())),
        };

        let result = match op {
            kind::SUBSCRIBE => {
                self.add(&request.topic, peer);
                Ok(Vec::new())
            }
            kind::UNSUBSCRIBE => {
                self.remove(&request.topic, peer);
                Ok(Vec::new())
            }
            _ => match self.fan_out(&request.topic, request.body).await {
                Ok(count) => MsgPackCodec::encode(&(count as u64)).map_err(Into::into),
                Err(e) => Err(e),
            },
        };
        Some(result)
    }
}
