//! Embedded queue host.
//!
//! Keeps named FIFO lists in memory and serves PUSH, POP and DELETE frames,
//! plus topic pub/sub for events. A blocking POP waits until an entry
//! arrives, the timeout elapses, the popping connection goes away, or the
//! host shuts down. Waiters are served in arrival order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use super::command::{KeyCommand, PopCommand, Popped, PushCommand};
use crate::codec::MsgPackCodec;
use crate::error::TransportError;
use crate::protocol::{kind, Frame};
use crate::transport::listener::{FrameHandler, Listener, Peer, Subscribers};
use crate::transport::LinkConfig;

struct Entry {
    body: Vec<u8>,
    expires: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct QueueList {
    entries: Mutex<VecDeque<Entry>>,
    ready: Notify,
    waiters: AtomicUsize,
}

impl QueueList {
    fn push(&self, entry: Entry) {
        self.entries.lock().push_back(entry);
        self.ready.notify_one();
    }

    fn push_front(&self, body: Vec<u8>) {
        self.entries.lock().push_front(Entry { body, expires: None });
        self.ready.notify_one();
    }

    fn take(&self) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        while let Some(entry) = entries.pop_front() {
            if !entry.is_expired(now) {
                return Some(entry.body);
            }
        }
        None
    }

    fn sweep(&self) {
        let now = Instant::now();
        self.entries.lock().retain(|entry| !entry.is_expired(now));
    }

    fn is_idle(&self) -> bool {
        self.waiters.load(Ordering::Acquire) == 0 && self.entries.lock().is_empty()
    }
}

/// Counts a blocked POP against its list while alive.
struct Waiting(Arc<QueueList>);

impl Drop for Waiting {
    fn drop(&mut self) {
        self.0.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

/// List storage plus pub/sub. Shared by every connection.
pub(crate) struct QueueHost {
    lists: DashMap<String, Arc<QueueList>>,
    subscribers: Subscribers,
    departed: DashMap<u64, watch::Sender<bool>>,
    shutdown: watch::Sender<bool>,
}

impl Default for QueueHost {
    fn default() -> Self {
        Self {
            lists: DashMap::new(),
            subscribers: Subscribers::default(),
            departed: DashMap::new(),
            shutdown: watch::channel(false).0,
        }
    }
}

impl QueueHost {
    fn push(self: &Arc<Self>, command: PushCommand) {
        let expires = command.ttl_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        self.lists
            .entry(command.key.clone())
            .or_default()
            .push(Entry {
                body: command.body,
                expires,
            });

        if let Some(at) = expires {
            let host = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(at).await;
                host.expire(&command.key);
            });
        }
    }

    fn expire(&self, key: &str) {
        if let Some(list) = self.lists.get(key) {
            list.sweep();
        }
        self.drop_if_idle(key);
    }

    fn drop_if_idle(&self, key: &str) {
        self.lists.remove_if(key, |_, list| list.is_idle());
    }

    fn delete(&self, key: &str) {
        if let Some(list) = self.lists.get(key) {
            list.entries.lock().clear();
        }
        self.drop_if_idle(key);
    }

    fn wait_on(&self, key: &str) -> Waiting {
        let list = self.lists.entry(key.to_string()).or_default();
        list.waiters.fetch_add(1, Ordering::AcqRel);
        Waiting(list.clone())
    }

    fn departure(&self, peer: &Peer) -> watch::Receiver<bool> {
        self.departed
            .entry(peer.id())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    async fn pop(&self, peer: &Peer, command: &PopCommand) -> Option<Vec<u8>> {
        let deadline = command.timeout().map(|timeout| Instant::now() + timeout);
        let mut shutdown = self.shutdown.subscribe();
        let mut departed = self.departure(peer);

        let popped = {
            let waiting = self.wait_on(&command.key);
            let list = &waiting.0;
            loop {
                let notified = list.ready.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(body) = list.take() {
                    break Some(body);
                }

                let expired = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    _ = notified => {}
                    _ = expired => break None,
                    _ = shutdown.wait_for(|stop| *stop) => break None,
                    _ = departed.wait_for(|gone| *gone) => break None,
                }
            }
        };

        self.drop_if_idle(&command.key);
        popped
    }

    fn requeue(&self, key: &str, body: Vec<u8>) {
        self.lists.entry(key.to_string()).or_default().push_front(body);
    }

    async fn serve(self: &Arc<Self>, peer: &Peer, frame: Frame) {
        let result = match frame.kind() {
            kind::PING => Ok(Vec::new()),
            kind::PUSH => match MsgPackCodec::decode::<PushCommand>(frame.payload()) {
                Ok(command) => {
                    self.push(command);
                    Ok(Vec::new())
                }
                Err(e) => Err(e.into()),
            },
            kind::DELETE => match MsgPackCodec::decode::<KeyCommand>(frame.payload()) {
                Ok(command) => {
                    self.delete(&command.key);
                    Ok(Vec::new())
                }
                Err(e) => Err(e.into()),
            },
            kind::POP => {
                let command: PopCommand = match MsgPackCodec::decode(frame.payload()) {
                    Ok(command) => command,
                    Err(e) => return peer.answer(&frame, Err(e.into())).await,
                };
                let body = self.pop(peer, &command).await;
                let reply = MsgPackCodec::encode(&Popped { body: body.clone() });
                match (reply, body) {
                    (Ok(payload), Some(body)) => {
                        let sent = peer
                            .reply(kind::POP, frame.correlation_id(), payload.into())
                            .await;
                        if sent.is_err() {
                            tracing::debug!("Popper {} went away, requeueing", peer.addr());
                            self.requeue(&command.key, body);
                        }
                        return;
                    }
                    (reply, _) => reply.map_err(Into::into),
                }
            }
            other => match self.subscribers.handle(peer, &frame).await {
                Some(result) => result,
                None => Err(TransportError::Protocol(format!(
                    "unsupported frame kind {other}"
                ))),
            },
        };
        peer.answer(&frame, result).await;
    }

    fn stop(&self) {
        self.shutdown.send_replace(true);
        self.subscribers.clear();
    }
}

impl FrameHandler for QueueHost {
    fn on_frame(this: &Arc<Self>, peer: &Peer, frame: Frame) {
        let host = this.clone();
        let peer = peer.clone();
        tokio::spawn(async move { host.serve(&peer, frame).await });
    }

    fn on_disconnect(this: &Arc<Self>, peer: &Peer) {
        this.subscribers.drop_peer(peer);
        if let Some((_, departed)) = this.departed.remove(&peer.id()) {
            departed.send_replace(true);
        }
    }
}

/// A queue host accepting connections.
pub(crate) struct RunningHost {
    host: Arc<QueueHost>,
    listener: Listener,
}

impl RunningHost {
    pub async fn start(addr: &str, config: &LinkConfig) -> Result<Self, TransportError> {
        let host = Arc::new(QueueHost::default());
        let listener = Listener::bind(addr, config, host.clone()).await?;
        tracing::info!("Queue host listening on {}", listener.local_addr());
        Ok(Self { host, listener })
    }

    pub async fn shutdown(self) {
        self.host.stop();
        self.listener.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_skips_expired_entries() {
        let list = QueueList::default();
        let past = Instant::now() - Duration::from_millis(1);
        list.push(Entry {
            body: b"stale".to_vec(),
            expires: Some(past),
        });
        list.push(Entry {
            body: b"fresh".to_vec(),
            expires: None,
        });

        assert_eq!(list.take().as_deref(), Some(&b"fresh"[..]));
        assert_eq!(list.take(), None);
    }

    #[test]
    fn test_requeue_goes_to_front() {
        let host = QueueHost::default();
        host.lists.entry("k".into()).or_default().push(Entry {
            body: b"second".to_vec(),
            expires: None,
        });
        host.requeue("k", b"first".to_vec());

        let list = host.lists.get("k").unwrap().clone();
        assert_eq!(list.take().as_deref(), Some(&b"first"[..]));
        assert_eq!(list.take().as_deref(), Some(&b"second"[..]));
    }

    #[test]
    fn test_delete_drops_idle_list() {
        let host = QueueHost::default();
        host.lists.entry("k".into()).or_default().push(Entry {
            body: b"x".to_vec(),
            expires: None,
        });

        host.delete("k");
        assert!(host.lists.get("k").is_none());
    }

    #[test]
    fn test_waited_on_list_survives_delete() {
        let host = QueueHost::default();
        let waiting = host.wait_on("k");

        host.delete("k");
        assert!(host.lists.get("k").is_some());

        drop(waiting);
        host.delete("k");
        assert!(host.lists.get("k").is_none());
    }
}
