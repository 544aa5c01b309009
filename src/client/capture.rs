//! Microphone capture behind the [`CaptureDevice`] seam.
//!
//! A device delivers raw audio into a [`CaptureSink`]; the unit drains the
//! sink on every flush. Releasing closes the sink under the same lock the
//! device writes through, so nothing lands in the buffer after release.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

use crate::protocol::Frame;
use crate::{Error, Result};

/// Upper bound on audio held between two flushes.
pub const MAX_CHUNK_BYTES: usize = 15 * 1024 * 1024;

/// Audio captured since the previous flush. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub bytes: Vec<u8>,
}

impl AudioChunk {
    #[must_use]
    pub fn into_frame(self) -> Frame {
        Frame::audio_append(general_purpose::STANDARD.encode(&self.bytes))
    }
}

#[derive(Default)]
struct Buffer {
    open: bool,
    bytes: Vec<u8>,
}

/// Where a device writes captured audio.
#[derive(Clone, Default)]
pub struct CaptureSink {
    buffer: Arc<Mutex<Buffer>>,
}

impl CaptureSink {
    fn open() -> Self {
        let sink = Self::default();
        sink.buffer.lock().open = true;
        sink
    }

    /// Append captured bytes. Returns `false` once the capture was released;
    /// the device should stop producing.
    pub fn push(&self, bytes: &[u8]) -> bool {
        let mut buffer = self.buffer.lock();
        if !buffer.open {
            return false;
        }
        let room = MAX_CHUNK_BYTES.saturating_sub(buffer.bytes.len());
        if bytes.len() > room {
            tracing::warn!(dropped = bytes.len() - room, "Capture buffer full, dropping audio");
        }
        let take = bytes.len().min(room);
        buffer.bytes.extend_from_slice(&bytes[..take]);
        true
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.buffer.lock().open
    }

    fn take(&self) -> Option<AudioChunk> {
        let mut buffer = self.buffer.lock();
        if buffer.bytes.is_empty() {
            return None;
        }
        Some(AudioChunk { bytes: std::mem::take(&mut buffer.bytes) })
    }

    fn close(&self) {
        let mut buffer = self.buffer.lock();
        buffer.open = false;
        buffer.bytes.clear();
    }
}

/// A running capture holding the device.
pub trait CaptureStream: Send {
    /// Stop producing and give the device back. Called exactly once.
    fn release(&mut self);
}

/// Source of microphone audio.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Acquire the device and start writing into `sink`.
    ///
    /// # Errors
    /// `PermissionDenied` if access is refused, `Device` if the device is
    /// missing or already held.
    async fn open(&self, sink: CaptureSink) -> Result<Box<dyn CaptureStream>>;
}

struct Active {
    sink: CaptureSink,
    stream: Box<dyn CaptureStream>,
}

/// Scoped owner of one capture at a time. Dropping the unit releases the device.
pub struct AudioCaptureUnit {
    device: Arc<dyn CaptureDevice>,
    active: Option<Active>,
}

impl AudioCaptureUnit {
    #[must_use]
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self { device, active: None }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Acquire the device. A no-op while already capturing.
    ///
    /// # Errors
    /// Propagates the device's `PermissionDenied` or `Device` error.
    pub async fn start(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }
        let sink = CaptureSink::open();
        let stream = self.device.open(sink.clone()).await?;
        tracing::info!("Audio capture started");
        self.active = Some(Active { sink, stream });
        Ok(())
    }

    /// Release the device and discard unflushed audio. Safe to call any
    /// number of times.
    pub fn stop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.sink.close();
            active.stream.release();
            tracing::info!("Audio capture stopped");
        }
    }

    /// Drain everything captured since the last flush.
    pub fn flush(&mut self) -> Option<AudioChunk> {
        self.active.as_ref().and_then(|active| active.sink.take())
    }
}

impl Drop for AudioCaptureUnit {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reads raw PCM16 from a file at real-time pace, standing in for a microphone.
pub struct PcmFileDevice {
    path: PathBuf,
    chunk_bytes: usize,
    chunk_interval: Duration,
    held: Arc<AtomicBool>,
}

impl PcmFileDevice {
    /// 24 kHz mono PCM16 in 100 ms reads.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_pacing(path, 4800, Duration::from_millis(100))
    }

    #[must_use]
    pub fn with_pacing(path: impl Into<PathBuf>, chunk_bytes: usize, chunk_interval: Duration) -> Self {
        Self {
            path: path.into(),
            chunk_bytes: chunk_bytes.max(1),
            chunk_interval,
            held: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl CaptureDevice for PcmFileDevice {
    async fn open(&self, sink: CaptureSink) -> Result<Box<dyn CaptureStream>> {
        if self.held.swap(true, Ordering::SeqCst) {
            return Err(Error::Device("capture device is already in use".to_string()));
        }
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) => {
                self.held.store(false, Ordering::SeqCst);
                return Err(match e.kind() {
                    std::io::ErrorKind::PermissionDenied => Error::PermissionDenied,
                    _ => Error::Device(format!("{}: {e}", self.path.display())),
                });
            }
        };

        let chunk_bytes = self.chunk_bytes;
        let mut ticker = tokio::time::interval(self.chunk_interval);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; chunk_bytes];
            loop {
                ticker.tick().await;
                match file.read(&mut buf).await {
                    Ok(0) => {
                        tracing::debug!("Capture input exhausted");
                        break;
                    }
                    Ok(n) => {
                        if !sink.push(&buf[..n]) {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Capture read failed");
                        break;
                    }
                }
            }
        });

        Ok(Box::new(TaskStream { task, held: Arc::clone(&self.held) }))
    }
}

struct TaskStream {
    task: JoinHandle<()>,
    held: Arc<AtomicBool>,
}

impl CaptureStream for TaskStream {
    fn release(&mut self) {
        self.task.abort();
        self.held.store(false, Ordering::SeqCst);
    }
}
