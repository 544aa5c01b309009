use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{Error, Result};

/// Where decoded assistant audio goes.
#[async_trait]
pub trait AudioOutput: Send {
    /// Play one decoded PCM16 buffer. Calls arrive in delta order.
    ///
    /// # Errors
    /// Implementations report device failures; the unit logs them.
    async fn play(&mut self, pcm: Vec<u8>) -> Result<()>;
}

/// Decodes audio deltas and plays them in arrival order on its own task,
/// so enqueueing never waits on the output.
///
/// Each buffer is tagged with the epoch it was queued in; `clear` moves to a
/// new epoch and the player skips anything older.
pub struct AudioPlaybackUnit {
    queue: mpsc::UnboundedSender<(u64, Vec<u8>)>,
    epoch: Arc<AtomicU64>,
    player: JoinHandle<()>,
}

impl AudioPlaybackUnit {
    /// Spawn the player task. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(mut output: Box<dyn AudioOutput>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<(u64, Vec<u8>)>();
        let epoch = Arc::new(AtomicU64::new(0));
        let current = Arc::clone(&epoch);
        let player = tokio::spawn(async move {
            while let Some((queued_in, pcm)) = rx.recv().await {
                if queued_in != current.load(Ordering::Acquire) {
                    continue;
                }
                let len = pcm.len();
                if let Err(e) = output.play(pcm).await {
                    tracing::warn!(error = %e, len, "Audio output failed");
                }
            }
        });
        Self { queue, epoch, player }
    }

    /// Drop everything queued but not yet handed to the output.
    pub fn clear(&self) {
        let previous = self.epoch.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(epoch = previous + 1, "Playback queue cleared");
    }

    /// Decode one base64 delta and queue it.
    ///
    /// # Errors
    /// `PlaybackDecode` if the payload is not valid base64. Nothing is queued
    /// and the caller's session is unaffected.
    #[allow(clippy::result_large_err)]
    pub fn enqueue(&self, payload: &str) -> Result<()> {
        let pcm = general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| Error::PlaybackDecode(e.to_string()))?;
        if pcm.is_empty() {
            return Ok(());
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        self.queue.send((epoch, pcm)).map_err(|_| Error::PlaybackDecode("playback has stopped".to_string()))
    }
}

impl Drop for AudioPlaybackUnit {
    fn drop(&mut self) {
        self.player.abort();
    }
}

/// Writes raw PCM16 to any async writer (a file, stdout, a pipe to a player).
pub struct PcmWriterOutput<W> {
    writer: W,
}

impl<W> PcmWriterOutput<W> {
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> AudioOutput for PcmWriterOutput<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn play(&mut self, pcm: Vec<u8>) -> Result<()> {
        self.writer.write_all(&pcm).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Discards audio; used when no output is configured.
pub struct NullOutput;

#[async_trait]
impl AudioOutput for NullOutput {
    async fn play(&mut self, _pcm: Vec<u8>) -> Result<()> {
        Ok(())
    }
}
