//! Install tasks
//!
//! One task repairs one slice of the missing parts served by a single
//! source patch. [`HttpInstallTask`] plans coalesced byte ranges, issues
//! ranged GETs and consumes the multipart body; [`StreamInstallTask`] reads
//! the same parts from a pre-opened local stream. Both reconstruct each part
//! into a pooled buffer and hand it to the registry, which serializes the
//! write per target file.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::buffer_pool::BufferPool;
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::index::PatchIndex;
use crate::multipart::MultipartRangeReader;
use crate::range::{MAX_RANGES_PER_REQUEST, SourceRange, coalesce_ranges, range_header_value};
use crate::registry::TargetRegistry;
use crate::source::{LocalSource, SourceStream};

/// Maximum attempts before an HTTP task reports exhausted retries
pub const MAX_ATTEMPTS: u32 = 8;

/// Base delay of the exponential backoff between failed attempts
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);

/// User agent sent with every ranged request
pub const PATCHER_USER_AGENT: &str = concat!("patch-installer/", env!("CARGO_PKG_VERSION"));

/// Header carrying the optional install session identifier
pub const PATCH_SESSION_HEADER: &str = "X-Patch-Unique-Id";

/// Delay before the attempt following `failed_count` consecutive failures
///
/// The first two attempts retry immediately; after that the delay doubles
/// from the base up to a `base * 32` cap.
fn backoff_delay(base: Duration, failed_count: u32) -> Option<Duration> {
    if failed_count < 2 {
        return None;
    }
    Some(base * (1u32 << (failed_count - 2).min(5)))
}

fn sort_by_source_offset(index: &dyn PatchIndex, pairs: &mut [(usize, usize)]) {
    pairs.sort_by_key(|&(target, part)| index.target(target).part(part).source_offset());
}

fn total_target_size(index: &dyn PatchIndex, pairs: &[(usize, usize)]) -> u64 {
    pairs
        .iter()
        .map(|&(target, part)| index.target(target).part(part).target_size() as u64)
        .sum()
}

/// A queued unit of install work
pub(crate) enum InstallTask {
    Http(HttpInstallTask),
    Stream(StreamInstallTask),
}

impl InstallTask {
    pub(crate) fn source_index(&self) -> usize {
        match self {
            Self::Http(task) => task.source_index,
            Self::Stream(task) => task.source_index,
        }
    }

    pub(crate) fn progress_max(&self) -> u64 {
        match self {
            Self::Http(task) => task.progress_max,
            Self::Stream(task) => task.progress_max,
        }
    }

    pub(crate) fn progress_handle(&self) -> Arc<AtomicU64> {
        match self {
            Self::Http(task) => Arc::clone(&task.progress_value),
            Self::Stream(task) => Arc::clone(&task.progress_value),
        }
    }

    pub(crate) async fn repair(self, cancel: CancellationToken) -> Result<()> {
        match self {
            Self::Http(task) => task.repair(cancel).await,
            Self::Stream(task) => task.repair(cancel).await,
        }
    }
}

/// Repairs parts of one source patch over ranged HTTP requests
pub(crate) struct HttpInstallTask {
    source_index: usize,
    url: String,
    session_id: Option<String>,
    client: reqwest::Client,
    index: Arc<dyn PatchIndex>,
    registry: Arc<TargetRegistry>,
    pool: BufferPool,
    backoff_base: Duration,
    /// Pending `(target, part)` pairs, ascending by source offset
    pending: VecDeque<(usize, usize)>,
    completed: Vec<(usize, usize)>,
    /// Response kept open across attempts until its parts are consumed
    current: Option<MultipartRangeReader>,
    progress_value: Arc<AtomicU64>,
    progress_max: u64,
}

impl HttpInstallTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        source_index: usize,
        url: String,
        session_id: Option<String>,
        client: reqwest::Client,
        index: Arc<dyn PatchIndex>,
        registry: Arc<TargetRegistry>,
        pool: BufferPool,
        backoff_base: Duration,
        mut pairs: Vec<(usize, usize)>,
    ) -> Self {
        sort_by_source_offset(index.as_ref(), &mut pairs);
        let progress_max = total_target_size(index.as_ref(), &pairs);

        Self {
            source_index,
            url,
            session_id,
            client,
            index,
            registry,
            pool,
            backoff_base,
            pending: pairs.into(),
            completed: Vec::new(),
            current: None,
            progress_value: Arc::new(AtomicU64::new(0)),
            progress_max,
        }
    }

    /// Repair every pending part, retrying transient failures with backoff
    pub(crate) async fn repair(mut self, cancel: CancellationToken) -> Result<()> {
        let mut failed_count = 0u32;
        let mut last_error: Option<Error> = None;

        while !self.pending.is_empty() {
            cancel.check()?;

            if failed_count >= MAX_ATTEMPTS {
                warn!(
                    "source {} still has {} pending part(s) after {} attempts",
                    self.source_index,
                    self.pending.len(),
                    MAX_ATTEMPTS
                );
                return Err(Error::exhausted_retries(MAX_ATTEMPTS, last_error));
            }

            if let Some(delay) = backoff_delay(self.backoff_base, failed_count) {
                debug!(
                    "backing off {:?} before retrying source {}",
                    delay, self.source_index
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }

            match self.attempt(&cancel, &mut failed_count).await {
                Ok(()) => {}
                Err(error) if error.is_transient() => {
                    warn!(
                        "install attempt for source {} failed: {error}",
                        self.source_index
                    );
                    // The open response is unusable after a failure; the
                    // next attempt plans fresh ranges from what remains
                    self.current = None;
                    failed_count += 1;
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        debug!(
            "source {} repaired {} part(s)",
            self.source_index,
            self.completed.len()
        );
        Ok(())
    }

    /// One attempt: advance to the next body section and reconstruct every
    /// pending part it covers
    async fn attempt(
        &mut self,
        cancel: &CancellationToken,
        failed_count: &mut u32,
    ) -> Result<()> {
        self.next_stream(cancel).await?;

        loop {
            let Some(&(target_index, part_index)) = self.pending.front() else {
                break;
            };
            cancel.check()?;

            let part = self.index.target(target_index).part(part_index);
            let Some(reader) = self.current.as_mut() else {
                break;
            };
            if part.source_offset() >= reader.available_to() {
                break;
            }

            let mut buffer = self.pool.take(part.target_size());
            reader.skip_to(part.source_offset()).await?;
            part.reconstruct(reader, &mut buffer).await?;
            self.registry
                .write_to_target(target_index, part.target_offset(), &buffer)
                .await?;

            *failed_count = 0;
            self.progress_value
                .fetch_add(part.target_size() as u64, Ordering::Relaxed);
            if let Some(pair) = self.pending.pop_front() {
                self.completed.push(pair);
            }
        }

        Ok(())
    }

    /// Position the reader on the next body section
    ///
    /// Continues an open multipart response when one is available; otherwise
    /// plans ranges for the remaining pending parts and issues a fresh GET.
    async fn next_stream(&mut self, cancel: &CancellationToken) -> Result<()> {
        if let Some(reader) = self.current.as_mut() {
            if reader.next_part().await?.is_some() {
                return Ok(());
            }
            // Response exhausted
            self.current = None;
        }

        cancel.check()?;

        let ranges = self.pending_ranges();
        if ranges.is_empty() {
            return Err(Error::invalid_argument(
                "pending parts map to no fetchable source range",
            ));
        }

        debug!(
            "requesting {} range(s) for source {} from {}",
            ranges.len(),
            self.source_index,
            self.url
        );

        let mut request = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, range_header_value(&ranges))
            .header(reqwest::header::USER_AGENT, PATCHER_USER_AGENT)
            .header(reqwest::header::CONNECTION, "Keep-Alive");
        if let Some(session_id) = &self.session_id {
            request = request.header(PATCH_SESSION_HEADER, session_id);
        }

        let response = request.send().await?.error_for_status()?;
        let mut reader = MultipartRangeReader::from_response(response, &ranges)?;
        if reader.next_part().await?.is_none() {
            return Err(Error::UnexpectedEndOfStream);
        }
        self.current = Some(reader);
        Ok(())
    }

    /// Coalesced source ranges covering the remaining pending parts
    ///
    /// Clamped to [`MAX_RANGES_PER_REQUEST`]; parts dropped from the tail
    /// are re-requested by a later attempt.
    fn pending_ranges(&self) -> Vec<SourceRange> {
        let source_end = self.index.source_end(self.source_index);

        let mut ranges = Vec::with_capacity(self.pending.len());
        for &(target_index, part_index) in &self.pending {
            let part = self.index.target(target_index).part(part_index);
            let start = part.source_offset();
            let end = part.max_source_end().min(source_end);
            if start < end {
                ranges.push(SourceRange::new(start, end));
            }
        }

        let mut ranges = coalesce_ranges(ranges);
        if ranges.len() > MAX_RANGES_PER_REQUEST {
            debug!(
                "clamping {} coalesced ranges to {}",
                ranges.len(),
                MAX_RANGES_PER_REQUEST
            );
            ranges.truncate(MAX_RANGES_PER_REQUEST);
        }
        ranges
    }
}

/// Repairs parts of one source patch from a pre-opened local stream
///
/// Pending parts are sorted by source offset at construction, so a single
/// forward pass over the stream reaches every part.
pub(crate) struct StreamInstallTask {
    source_index: usize,
    index: Arc<dyn PatchIndex>,
    registry: Arc<TargetRegistry>,
    pool: BufferPool,
    pending: VecDeque<(usize, usize)>,
    source: LocalSource,
    progress_value: Arc<AtomicU64>,
    progress_max: u64,
}

impl StreamInstallTask {
    pub(crate) fn new(
        source_index: usize,
        source: LocalSource,
        index: Arc<dyn PatchIndex>,
        registry: Arc<TargetRegistry>,
        pool: BufferPool,
        mut pairs: Vec<(usize, usize)>,
    ) -> Self {
        sort_by_source_offset(index.as_ref(), &mut pairs);
        let progress_max = total_target_size(index.as_ref(), &pairs);

        Self {
            source_index,
            index,
            registry,
            pool,
            pending: pairs.into(),
            source,
            progress_value: Arc::new(AtomicU64::new(0)),
            progress_max,
        }
    }

    pub(crate) async fn repair(mut self, cancel: CancellationToken) -> Result<()> {
        while let Some(&(target_index, part_index)) = self.pending.front() {
            cancel.check()?;

            let part = self.index.target(target_index).part(part_index);
            let mut buffer = self.pool.take(part.target_size());
            self.source.skip_to(part.source_offset()).await?;
            part.reconstruct(&mut self.source, &mut buffer).await?;
            self.registry
                .write_to_target(target_index, part.target_offset(), &buffer)
                .await?;

            self.progress_value
                .fetch_add(part.target_size() as u64, Ordering::Relaxed);
            self.pending.pop_front();
        }

        debug!("source {} stream repair complete", self.source_index);
        Ok(())
    }
}
