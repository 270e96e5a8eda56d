//! Process-wide cache of open transports.

use std::sync::Arc;

use dashmap::DashMap;

use super::{LinkConfig, QueueTransport, SocketTransport, Transport, TransportKey, TransportKind};
use crate::codec::Serializer;
use crate::Location;

/// Hands out one shared transport per [`TransportKey`].
///
/// Created by the manager and passed to whoever needs to reach another bus.
pub struct TransportRegistry {
    kind: TransportKind,
    serializer: Serializer,
    config: LinkConfig,
    transports: DashMap<TransportKey, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new(kind: TransportKind, serializer: Serializer, config: LinkConfig) -> Self {
        Self {
            kind,
            serializer,
            config,
            transports: DashMap::new(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// The transport for `key`, created on first use.
    ///
    /// A cached transport that was closed is replaced.
    pub fn get(&self, key: &TransportKey) -> Arc<dyn Transport> {
        let mut entry = self
            .transports
            .entry(key.clone())
            .or_insert_with(|| self.open(key));
        if entry.is_closed() {
            *entry = self.open(key);
        }
        entry.clone()
    }

    /// The transport to the bus `location` lives on, with the default kind
    /// and serializer.
    pub fn for_location(&self, location: &Location) -> Arc<dyn Transport> {
        self.get(&TransportKey::for_location(location, self.kind, self.serializer))
    }

    fn open(&self, key: &TransportKey) -> Arc<dyn Transport> {
        tracing::debug!("Opening transport {}", key);
        match key.kind {
            TransportKind::Socket => Arc::new(SocketTransport::new(key.clone(), self.config.clone())),
            TransportKind::Queue => Arc::new(QueueTransport::new(key.clone(), self.config.clone())),
        }
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    /// Close and forget every transport.
    pub async fn close_all(&self) {
        let keys: Vec<TransportKey> = self.transports.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, transport)) = self.transports.remove(&key) {
                transport.close().await;
            }
        }
    }
}
