//! Dedicated writer task for socket links.
//!
//! Every connection owns one writer task that receives frames via an mpsc
//! channel and writes them in batches, so request handlers never contend on
//! the socket.
//!
//! # Architecture
//!
//! ```text
//! Call 1 ─┐
//! Call 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► TcpStream
//! Call N ─┘
//! ```

use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backpressure::{BackpressureController, BackpressureGuard};
use crate::error::{CodecError, TransportError};
use crate::protocol::{Header, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header (11 bytes).
    pub header: [u8; HEADER_SIZE],
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Build a frame; the header's payload length is taken from `payload`.
    #[inline]
    pub fn new(kind: u16, flags: u8, correlation_id: u32, payload: Bytes) -> Self {
        let header = Header::new(kind, flags, correlation_id, payload.len() as u32);
        Self {
            header: header.encode(),
            payload,
        }
    }

    /// Build a frame, refusing payloads above `max_payload`.
    ///
    /// The receiving frame buffer drops the whole connection on an oversized
    /// frame, so the check happens before anything is queued.
    pub fn bounded(
        kind: u16,
        flags: u8,
        correlation_id: u32,
        payload: Bytes,
        max_payload: u32,
    ) -> Result<Self, TransportError> {
        if payload.len() > max_payload as usize {
            return Err(CodecError::TooLarge {
                size: payload.len(),
                max: max_payload,
            }
            .into());
        }
        Ok(Self::new(kind, flags, correlation_id, payload))
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear, in milliseconds.
    pub backpressure_timeout_ms: u64,
}

impl WriterConfig {
    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Handle for sending frames to the writer task. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    backpressure: BackpressureController,
}

impl WriterHandle {
    /// Send a frame, waiting while backpressure is active.
    pub async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.backpressure.reserve().await?;
        let mut guard = BackpressureGuard::new(self.backpressure.clone());

        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)?;

        guard.disarm();
        Ok(())
    }

    /// Send a frame without waiting.
    ///
    /// Returns `Ok(false)` when the buffer is full.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<bool, TransportError> {
        if self.backpressure.try_reserve().is_err() {
            return Ok(false);
        }
        let mut guard = BackpressureGuard::new(self.backpressure.clone());

        match self.tx.try_send(frame) {
            Ok(()) => {
                guard.disarm();
                Ok(true)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    /// Whether the writer task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly once every handle is dropped, or with an error when
/// the underlying write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: &WriterConfig,
) -> (WriterHandle, JoinHandle<Result<(), TransportError>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let backpressure =
        BackpressureController::with_timeout(config.max_pending_frames, config.backpressure_timeout());

    let handle = WriterHandle {
        tx,
        backpressure: backpressure.clone(),
    };
    let task = tokio::spawn(writer_loop(rx, writer, backpressure));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    backpressure: BackpressureController,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        backpressure.release_many(batch_size);
        result?;
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let parts: [&[u8]; 2] = [&frame.header[..], &frame.payload[..]];
        for part in parts {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{kind, FrameBuffer};
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn frame(correlation: u32, payload: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(kind::REQUEST, 0, correlation, Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn test_writer_delivers_frames_in_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, &WriterConfig::default());

        for i in 0..10u32 {
            handle.send(frame(i, b"abcd")).await.unwrap();
        }

        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 1024];
        while frames.len() < 10 {
            let n = server.read(&mut buf).await.unwrap();
            frames.extend(buffer.push(&buf[..n]).unwrap());
        }

        let ids: Vec<u32> = frames.iter().map(|f| f.correlation_id()).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_try_send_reports_full_buffer() {
        // nobody reads the other end, so the tiny duplex fills up
        let (client, _server) = duplex(16);
        let config = WriterConfig {
            max_pending_frames: 2,
            channel_capacity: 2,
            backpressure_timeout_ms: 10,
        };
        let (handle, _task) = spawn_writer_task(client, &config);

        let mut accepted = 0;
        for i in 0..16 {
            if handle.try_send(frame(i, b"0123456789abcdef")).unwrap() {
                accepted += 1;
            }
        }
        assert!(accepted < 16);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, &WriterConfig::default());

        drop(handle);

        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let batch = vec![frame(42, b"hello")];

        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 5);
        assert_eq!(slices[1].len(), 5);

        let slices = build_remaining_slices(&batch, HEADER_SIZE + 2);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 3);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|i| frame(i, b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), 5 * (HEADER_SIZE + 3));
    }
}
