//! Payloads of queue host frames. Always MsgPack, whatever the message serializer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Append `body` to list `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PushCommand {
    pub key: String,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    /// Entry expires unclaimed after this long.
    pub ttl_ms: Option<u64>,
}

/// Take the oldest entry of list `key`, waiting up to `timeout_ms` (forever if absent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PopCommand {
    pub key: String,
    pub timeout_ms: Option<u64>,
}

impl PopCommand {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Reply to a [`PopCommand`]; `None` when nothing arrived in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Popped {
    #[serde(with = "serde_bytes")]
    pub body: Option<Vec<u8>>,
}

/// Drop list `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct KeyCommand {
    pub key: String,
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
