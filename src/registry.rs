//! Per-target stream registry and write serialization
//!
//! The registry owns one optional random-access stream per target file. Each
//! slot sits behind its own async mutex, which doubles as the per-target
//! write lock: a write holds the lock for the whole seek + write + flush
//! sequence, so concurrent install tasks never interleave writes to one
//! file. The index guarantees non-overlapping target regions per part, but
//! serializing keeps each write-and-flush pair atomic.

use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::privilege;

/// Random-access byte store backing one target file
///
/// `tokio::fs::File` is the production implementation; in-memory cursors
/// qualify too, which keeps tests off the filesystem.
pub trait TargetStream: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin> TargetStream for T {}

type Slot = Mutex<Option<Box<dyn TargetStream>>>;

/// Owns the open target streams, one slot per target file
pub struct TargetRegistry {
    slots: Vec<Slot>,
}

impl TargetRegistry {
    /// Create a registry with `target_count` empty slots
    pub fn new(target_count: usize) -> Self {
        Self {
            slots: (0..target_count).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Number of target slots
    pub fn target_count(&self) -> usize {
        self.slots.len()
    }

    fn checked_slot(&self, target_index: usize) -> Result<&Slot> {
        self.slots.get(target_index).ok_or_else(|| {
            Error::invalid_argument(format!(
                "target index {target_index} out of range ({} targets)",
                self.slots.len()
            ))
        })
    }

    /// Attach an already-open stream for a target
    ///
    /// The stream type guarantees the readable + seekable requirement; any
    /// previously attached stream for the target is dropped.
    pub async fn attach_for_read(
        &self,
        target_index: usize,
        stream: Box<dyn TargetStream>,
    ) -> Result<()> {
        *self.checked_slot(target_index)?.lock().await = Some(stream);
        Ok(())
    }

    /// Open (creating if absent) a target file for read/write and attach it
    ///
    /// The parent directory is created as needed. When the on-disk length
    /// differs from `expected_size` the file is extended or truncated to it;
    /// with `use_fast_extend` the OS fast-extend path is attempted after
    /// growing, skipping eager zero-fill. Fast-extend failure is logged and
    /// the slow path stands.
    pub async fn attach_for_write_from_file(
        &self,
        target_index: usize,
        path: &Path,
        expected_size: u64,
        use_fast_extend: bool,
    ) -> Result<()> {
        let slot = self.checked_slot(target_index)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let current_len = file.metadata()?.len();
        if current_len != expected_size {
            debug!(
                "resizing {:?} from {} to {} bytes",
                path, current_len, expected_size
            );
            file.set_len(expected_size)?;
            if use_fast_extend && expected_size > current_len {
                if let Err(e) = privilege::fast_extend(&file, expected_size) {
                    warn!("fast extend failed for {:?}, falling back to zero-fill: {}", path, e);
                }
            }
        }

        *slot.lock().await = Some(Box::new(tokio::fs::File::from_std(file)));
        Ok(())
    }

    /// Drop every attached stream
    pub async fn detach_all(&self) {
        for slot in &self.slots {
            *slot.lock().await = None;
        }
    }

    /// Whether a stream is attached for the target
    pub async fn is_attached(&self, target_index: usize) -> bool {
        match self.slots.get(target_index) {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }

    /// Write `data` at `offset` in the target, serialized per target
    ///
    /// A no-op when no stream is attached. The slot lock is held across
    /// seek, write and flush.
    pub async fn write_to_target(&self, target_index: usize, offset: u64, data: &[u8]) -> Result<()> {
        let mut slot = self.checked_slot(target_index)?.lock().await;
        let Some(stream) = slot.as_mut() else {
            return Ok(());
        };

        stream.seek(SeekFrom::Start(offset)).await?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Slot access for the verifier, which holds the lock while it reads
    pub(crate) fn slot(&self, target_index: usize) -> &Slot {
        &self.slots[target_index]
    }
}
