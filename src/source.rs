//! Forward-only source byte streams
//!
//! Part reconstruction pulls its input through [`SourceStream`]: a cursor
//! over a source patch that only moves forward. HTTP installs get one from
//! the multipart range reader; local installs wrap a pre-opened stream in
//! [`LocalSource`].

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// A forward-reading cursor over source patch bytes
#[async_trait]
pub trait SourceStream: Send {
    /// Source offset of the next byte a read will return
    fn position(&self) -> u64;

    /// Exclusive upper bound on source offsets readable from this stream
    fn available_to(&self) -> u64;

    /// Read exactly `buf.len()` bytes, advancing the cursor
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Discard bytes until the cursor reaches `offset`
    ///
    /// Seeking backwards is not possible on a forward stream and fails with
    /// [`Error::InvalidArgument`].
    async fn skip_to(&mut self, offset: u64) -> Result<()>;
}

/// Read and discard exactly `remaining` bytes
pub(crate) async fn discard_exact<R>(reader: &mut R, mut remaining: u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut scratch = [0u8; 8192];
    while remaining > 0 {
        let take = remaining.min(scratch.len() as u64) as usize;
        reader.read_exact(&mut scratch[..take]).await?;
        remaining -= take as u64;
    }
    Ok(())
}

/// [`SourceStream`] over a pre-opened local byte stream
///
/// The stream is assumed to start at source offset zero and span the whole
/// source patch, so the entire resource is available to read.
pub struct LocalSource {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    position: u64,
    end: u64,
}

impl LocalSource {
    /// Wrap a local stream covering source offsets `0..end`
    pub fn new(inner: Box<dyn AsyncRead + Send + Unpin>, end: u64) -> Self {
        Self {
            inner,
            position: 0,
            end,
        }
    }
}

#[async_trait]
impl SourceStream for LocalSource {
    fn position(&self) -> u64 {
        self.position
    }

    fn available_to(&self) -> u64 {
        self.end
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u64;
        if self.position + len > self.end {
            return Err(Error::invalid_argument(format!(
                "read of {len} bytes at {} overruns source end {}",
                self.position, self.end
            )));
        }
        self.inner.read_exact(buf).await?;
        self.position += len;
        Ok(())
    }

    async fn skip_to(&mut self, offset: u64) -> Result<()> {
        if offset < self.position {
            return Err(Error::invalid_argument(format!(
                "cannot seek backwards from {} to {offset} in a source stream",
                self.position
            )));
        }
        discard_exact(&mut self.inner, offset - self.position).await?;
        self.position = offset;
        Ok(())
    }
}
