//! Client side of a framed TCP link.
//!
//! A [`Link`] owns one connection: a writer task for outbound frames and a
//! read loop that hands reply frames to whoever is waiting on their
//! correlation id. Unsolicited frames (published events) go to a
//! [`TopicRouter`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::LinkConfig;
use crate::codec::{MsgPackCodec, Serializable, Serializer};
use crate::error::TransportError;
use crate::protocol::{kind, Event, Frame, FrameBuffer};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Payload of SUBSCRIBE, UNSUBSCRIBE, PUBLISH and EVENT frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TopicFrame {
    pub topic: String,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl TopicFrame {
    pub fn encode(topic: &str, body: Vec<u8>) -> Result<Bytes, TransportError> {
        let frame = TopicFrame {
            topic: topic.to_string(),
            body,
        };
        Ok(Bytes::from(MsgPackCodec::encode(&frame)?))
    }
}

type PendingMap = Arc<DashMap<u32, oneshot::Sender<Frame>>>;

/// A request frame in flight. Dropping it gives up on the reply.
pub(crate) struct Pending {
    correlation: u32,
    rx: oneshot::Receiver<Frame>,
    waiters: PendingMap,
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.waiters.remove(&self.correlation);
    }
}

/// One client connection.
pub(crate) struct Link {
    addr: String,
    writer: WriterHandle,
    max_payload: u32,
    pending: PendingMap,
    next_id: AtomicU32,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Link {
    /// Dial `addr`. Unsolicited frames are forwarded to `unsolicited`.
    pub async fn connect(
        addr: &str,
        config: &LinkConfig,
        unsolicited: mpsc::UnboundedSender<Frame>,
    ) -> Result<Self, TransportError> {
        let stream = match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::from_dial(addr, e)),
            Err(_) => return Err(TransportError::Timeout),
        };
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (writer, _writer_task) = spawn_writer_task(write_half, &config.writer);

        let pending: PendingMap = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            let addr = addr.to_string();
            let max_payload = config.max_payload_size;
            tokio::spawn(async move {
                if let Err(e) = read_loop(read_half, max_payload, &pending, unsolicited).await {
                    tracing::debug!("Link to {} failed: {}", addr, e);
                }
                closed.store(true, Ordering::Release);
                pending.clear();
            })
        };

        tracing::debug!("Connected to {}", addr);

        Ok(Self {
            addr: addr.to_string(),
            writer,
            max_payload: config.max_payload_size,
            pending,
            next_id: AtomicU32::new(1),
            closed,
            reader,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.writer.is_closed()
    }

    fn disconnected(&self) -> TransportError {
        TransportError::Disconnected(self.addr.clone())
    }

    fn next_correlation(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a frame that expects a reply.
    pub async fn submit(&self, kind: u16, payload: Bytes) -> Result<Pending, TransportError> {
        if self.is_closed() {
            return Err(self.disconnected());
        }

        let correlation = self.next_correlation();
        let frame = OutboundFrame::bounded(kind, 0, correlation, payload, self.max_payload)?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation, tx);

        if let Err(e) = self.writer.send(frame).await {
            self.pending.remove(&correlation);
            return Err(match e {
                TransportError::Closed => self.disconnected(),
                other => other,
            });
        }

        Ok(Pending {
            correlation,
            rx,
            waiters: self.pending.clone(),
        })
    }

    /// Like [`submit`](Self::submit) but never waits; `Ok(None)` when the
    /// write buffer is full.
    pub fn try_submit(&self, kind: u16, payload: Bytes) -> Result<Option<Pending>, TransportError> {
        if self.is_closed() {
            return Err(self.disconnected());
        }

        let correlation = self.next_correlation();
        let frame = OutboundFrame::bounded(kind, 0, correlation, payload, self.max_payload)?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation, tx);

        match self.writer.try_send(frame) {
            Ok(true) => Ok(Some(Pending {
                correlation,
                rx,
                waiters: self.pending.clone(),
            })),
            Ok(false) => {
                self.pending.remove(&correlation);
                Ok(None)
            }
            Err(_) => {
                self.pending.remove(&correlation);
                Err(self.disconnected())
            }
        }
    }

    /// Wait for the reply to `pending`. `Ok(None)` on timeout.
    pub async fn wait(
        &self,
        pending: Pending,
        timeout: Option<Duration>,
    ) -> Result<Option<Frame>, TransportError> {
        let mut pending = pending;
        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut pending.rx).await {
                Ok(received) => received,
                Err(_) => return Ok(None),
            },
            None => (&mut pending.rx).await,
        };
        received.map(Some).map_err(|_| self.disconnected())
    }

    /// Send a frame and wait for its reply. Error replies become `Protocol` errors.
    pub async fn call(
        &self,
        kind: u16,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Frame, TransportError> {
        let pending = self.submit(kind, payload).await?;
        match self.wait(pending, timeout).await? {
            Some(frame) if frame.is_error() => Err(TransportError::Protocol(frame.error_text())),
            Some(frame) => Ok(frame),
            None => Err(TransportError::Timeout),
        }
    }

    /// Drop the connection. Pending waiters see `Disconnected`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader.abort();
        self.pending.clear();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    max_payload: u32,
    pending: &PendingMap,
    unsolicited: mpsc::UnboundedSender<Frame>,
) -> Result<(), TransportError> {
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        for frame in frame_buffer.push(&buf[..n])? {
            if frame.is_reply() {
                match pending.remove(&frame.correlation_id()) {
                    Some((_, tx)) => {
                        let _ = tx.send(frame);
                    }
                    None => tracing::debug!("Dropping late reply {}", frame.correlation_id()),
                }
            } else {
                let _ = unsolicited.send(frame);
            }
        }
    }
}

/// Routes published events to local subscription channels.
#[derive(Default)]
pub(crate) struct TopicRouter {
    routes: DashMap<String, Vec<mpsc::Sender<Event>>>,
}

/// Buffered events per local subscription.
const SUBSCRIPTION_BUFFER: usize = 256;

impl TopicRouter {
    pub fn add(&self, topic: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.routes.entry(topic.to_string()).or_default().push(tx);
        rx
    }

    pub fn remove(&self, topic: &str) {
        self.routes.remove(topic);
    }

    pub fn topics(&self) -> Vec<String> {
        self.routes.iter().map(|e| e.key().clone()).collect()
    }

    fn route(&self, serializer: Serializer, frame: &Frame) {
        let delivery: TopicFrame = match MsgPackCodec::decode(frame.payload()) {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::warn!("Malformed event frame: {}", e);
                return;
            }
        };

        let Some(event) = Serializable::<Event>::load(serializer, &delivery.body) else {
            return;
        };

        if let Some(mut senders) = self.routes.get_mut(&delivery.topic) {
            senders.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Subscriber to '{}' is lagging, event dropped", delivery.topic);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    /// Consume unsolicited frames until the link goes away.
    pub fn spawn(
        self: &Arc<Self>,
        serializer: Serializer,
        mut frames: mpsc::UnboundedReceiver<Frame>,
    ) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                match frame.kind() {
                    kind::EVENT => router.route(serializer, &frame),
                    other => tracing::debug!("Ignoring unsolicited frame kind {}", other),
                }
            }
        })
    }
}

/// Lazily dialed, self-healing link.
pub(crate) struct LinkSlot {
    addr: String,
    config: LinkConfig,
    serializer: Serializer,
    topics: Arc<TopicRouter>,
    slot: tokio::sync::Mutex<Option<Arc<Link>>>,
}

impl LinkSlot {
    pub fn new(addr: String, config: LinkConfig, serializer: Serializer) -> Self {
        Self {
            addr,
            config,
            serializer,
            topics: Arc::new(TopicRouter::default()),
            slot: tokio::sync::Mutex::new(None),
        }
    }

    pub fn topics(&self) -> &TopicRouter {
        &self.topics
    }

    /// Current link, dialing (again) if there is none or it died.
    pub async fn get(&self) -> Result<Arc<Link>, TransportError> {
        let mut slot = self.slot.lock().await;
        if let Some(link) = slot.as_ref() {
            if !link.is_closed() {
                return Ok(link.clone());
            }
            tracing::debug!("Link to {} lost, redialing", self.addr);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link::connect(&self.addr, &self.config, tx).await?);
        self.topics.spawn(self.serializer, rx);

        for topic in self.topics.topics() {
            let payload = TopicFrame::encode(&topic, Vec::new())?;
            if let Err(e) = link
                .call(kind::SUBSCRIBE, payload, Some(self.config.connect_timeout()))
                .await
            {
                tracing::warn!("Failed to restore subscription to '{}': {}", topic, e);
            }
        }

        *slot = Some(link.clone());
        Ok(link)
    }

    /// The established link, if any, without waiting.
    pub fn current(&self) -> Option<Arc<Link>> {
        let slot = self.slot.try_lock().ok()?;
        slot.as_ref().filter(|link| !link.is_closed()).cloned()
    }

    pub async fn close(&self) {
        if let Some(link) = self.slot.lock().await.take() {
            link.close();
        }
    }
}
