//! Installer facade
//!
//! Owns the target registry, the missing-parts ledger and the install queue,
//! and drives the two phases of a repair cycle: concurrent verification of
//! the on-disk tree against the index, then parallel installation of
//! whatever verification found missing. A final pass rewrites the parts
//! whose data comes from the index alone.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncSeekExt};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::buffer_pool::BufferPool;
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::events::InstallerEvents;
use crate::index::{PatchIndex, VerifyOutcome};
use crate::ledger::MissingLedger;
use crate::privilege;
use crate::registry::TargetRegistry;
use crate::source::LocalSource;
use crate::task::{HttpInstallTask, InstallTask, StreamInstallTask};

/// Default number of concurrent per-target verification tasks
pub const DEFAULT_VERIFY_CONCURRENCY: usize = 8;

/// Default number of chunks a source patch's missing parts are split into
pub const DEFAULT_INSTALL_SPLIT: usize = 8;

/// Default interval between progress events
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Where an install task reads its source bytes from
pub enum InstallSource {
    /// Ranged GETs against a remote source patch
    Http {
        /// URL of the source patch resource
        url: String,
        /// Optional session identifier forwarded as a request header
        session_id: Option<String>,
    },
    /// A pre-opened local stream covering the whole source patch
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

/// Verifies and repairs an installed content tree against a patch index
///
/// The installer owns its target streams and queued tasks; the index is
/// borrowed (shared) for the installer's lifetime. Dropping the installer
/// drops every attached stream and queued task.
pub struct Installer {
    index: Arc<dyn PatchIndex>,
    registry: Arc<TargetRegistry>,
    ledger: Arc<Mutex<MissingLedger>>,
    events: Arc<InstallerEvents>,
    pool: BufferPool,
    client: reqwest::Client,
    queue: Vec<InstallTask>,
    backoff_base: Duration,
    progress_interval: Duration,
}

impl Installer {
    /// Create an installer for `index` with the given event callbacks
    pub fn new(index: Arc<dyn PatchIndex>, events: InstallerEvents) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        let registry = Arc::new(TargetRegistry::new(index.target_count()));
        let ledger = Arc::new(Mutex::new(MissingLedger::new(index.as_ref())));

        Ok(Self {
            index,
            registry,
            ledger,
            events: Arc::new(events),
            pool: BufferPool::new(),
            client,
            queue: Vec::new(),
            backoff_base: crate::task::DEFAULT_BACKOFF_BASE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        })
    }

    /// Replace the HTTP client used by install tasks
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Set the interval between progress events
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Set the base delay of the install retry backoff
    ///
    /// The delay before attempt `n + 1` is `base << min(5, n - 2)` once two
    /// attempts have failed.
    pub fn with_retry_backoff(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// The index this installer repairs against
    pub fn index(&self) -> &Arc<dyn PatchIndex> {
        &self.index
    }

    /// Missing part indices recorded for one target
    pub fn missing_parts(&self, target_index: usize) -> Vec<usize> {
        self.ledger.lock().missing_parts(target_index).iter().copied().collect()
    }

    /// Missing `(target, part)` pairs served by one source patch
    pub fn source_parts(&self, source_index: usize) -> Vec<(usize, usize)> {
        self.ledger.lock().source_parts(source_index).iter().copied().collect()
    }

    /// Targets whose on-disk length disagreed with the index
    pub fn size_mismatches(&self) -> Vec<usize> {
        self.ledger.lock().size_mismatches().iter().copied().collect()
    }

    /// Whether verification left anything to repair
    pub fn has_missing_data(&self) -> bool {
        !self.ledger.lock().is_empty()
    }

    /// Whether a stream is attached for the target
    pub async fn is_attached(&self, target_index: usize) -> bool {
        self.registry.is_attached(target_index).await
    }

    /// Attach an already-open stream for one target
    pub async fn attach_for_read(
        &self,
        target_index: usize,
        stream: Box<dyn crate::registry::TargetStream>,
    ) -> Result<()> {
        self.registry.attach_for_read(target_index, stream).await
    }

    /// Open one target file read/write under `path` and attach it
    ///
    /// The file is created and sized to the index's expected length as
    /// needed; see [`Installer::attach_missing_for_write`] for the bulk
    /// variant.
    pub async fn attach_for_write_from_file(
        &self,
        target_index: usize,
        path: &Path,
        use_fast_extend: bool,
    ) -> Result<()> {
        if target_index >= self.index.target_count() {
            return Err(Error::invalid_argument(format!(
                "target index {target_index} out of range ({} targets)",
                self.index.target_count()
            )));
        }
        let expected_size = self.index.target(target_index).file_size();
        self.registry
            .attach_for_write_from_file(target_index, path, expected_size, use_fast_extend)
            .await
    }

    /// Attach every existing target under `root` read-only
    ///
    /// Starts a fresh repair cycle: previously attached streams are dropped,
    /// the ledger is reset, and targets missing from disk are recorded whole.
    pub async fn attach_all_for_read(&self, root: &Path) -> Result<()> {
        self.registry.detach_all().await;
        self.ledger.lock().reset();

        for target_index in 0..self.index.target_count() {
            let path = root.join(self.index.target(target_index).relative_path());
            match tokio::fs::File::open(&path).await {
                Ok(file) => {
                    self.registry
                        .attach_for_read(target_index, Box::new(file))
                        .await?;
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    debug!("target {:?} absent, marking whole file missing", path);
                    self.ledger
                        .lock()
                        .mark_file_missing(self.index.as_ref(), target_index);
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Open for writing every target that needs repair
    ///
    /// Drops read attachments, attempts the fast-extend privilege once, then
    /// opens (creating and sizing as needed) each target with missing parts
    /// or a size mismatch.
    pub async fn attach_missing_for_write(&self, root: &Path) -> Result<()> {
        self.registry.detach_all().await;
        let use_fast_extend = privilege::acquire_fast_extend();

        let targets: Vec<usize> = {
            let ledger = self.ledger.lock();
            (0..self.index.target_count())
                .filter(|&t| ledger.has_missing(t) || ledger.size_mismatches().contains(&t))
                .collect()
        };

        for target_index in targets {
            let target = self.index.target(target_index);
            let path = root.join(target.relative_path());
            self.registry
                .attach_for_write_from_file(target_index, &path, target.file_size(), use_fast_extend)
                .await?;
        }
        Ok(())
    }

    /// Verify every attached target against the index
    ///
    /// Runs up to `concurrency` per-target verification tasks in parallel
    /// (see [`DEFAULT_VERIFY_CONCURRENCY`]). Parts that fail verification
    /// land in the ledger and are reported through the corruption callback;
    /// an unverifiable part aborts with [`Error::InvariantViolated`].
    pub async fn verify_files(&self, concurrency: usize, cancel: &CancellationToken) -> Result<()> {
        cancel.check()?;
        let concurrency = concurrency.max(1);
        let local = cancel.child();

        let mut participating = Vec::new();
        let mut total_bytes = 0u64;
        for target_index in 0..self.index.target_count() {
            if self.registry.is_attached(target_index).await {
                let target = self.index.target(target_index);
                total_bytes += (0..target.part_count())
                    .map(|part_index| target.part(part_index).target_size() as u64)
                    .sum::<u64>();
                participating.push(target_index);
            }
        }

        let progress = Arc::new(AtomicU64::new(0));
        let mut current_target = 0usize;

        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        let mut remaining = participating.into_iter();
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.progress_interval,
            self.progress_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut first_error: Option<Error> = None;

        loop {
            if first_error.is_none() && !local.is_cancelled() {
                while join_set.len() < concurrency {
                    let Some(target_index) = remaining.next() else {
                        break;
                    };
                    current_target = target_index;
                    join_set.spawn(verify_target(
                        Arc::clone(&self.index),
                        Arc::clone(&self.registry),
                        Arc::clone(&self.ledger),
                        Arc::clone(&self.events),
                        target_index,
                        Arc::clone(&progress),
                        local.clone(),
                    ));
                }
            }
            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    self.events.emit_verify_progress(
                        current_target,
                        progress.load(Ordering::Relaxed),
                        total_bytes,
                    );
                }
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok(Ok(()))) => {}
                        Some(Ok(Err(error))) => {
                            if first_error.is_none() {
                                first_error = Some(error);
                            }
                            local.cancel();
                        }
                        Some(Err(join_error)) => {
                            if first_error.is_none() {
                                first_error = Some(Error::TaskPanicked(join_error.to_string()));
                            }
                            local.cancel();
                        }
                        None => {}
                    }
                }
                () = cancel.cancelled(), if first_error.is_none() => {
                    first_error = Some(Error::Cancelled);
                    local.cancel();
                }
            }
        }

        if first_error.is_none() && cancel.is_cancelled() {
            first_error = Some(Error::Cancelled);
        }
        match first_error {
            Some(error) => Err(error),
            None => {
                self.events.emit_verify_progress(
                    current_target,
                    progress.load(Ordering::Relaxed),
                    total_bytes,
                );
                Ok(())
            }
        }
    }

    /// Rewrite every missing part whose data comes from the index alone
    pub async fn repair_non_patch_data(&self, cancel: &CancellationToken) -> Result<()> {
        cancel.check()?;
        let missing: Vec<(usize, usize)> = {
            let ledger = self.ledger.lock();
            (0..self.index.target_count())
                .flat_map(|target_index| {
                    ledger
                        .missing_parts(target_index)
                        .iter()
                        .map(move |&part_index| (target_index, part_index))
                })
                .collect()
        };

        for (target_index, part_index) in missing {
            let part = self.index.target(target_index).part(part_index);
            if part.is_from_source() {
                continue;
            }
            cancel.check()?;

            let mut buffer = self.pool.take(part.target_size());
            part.reconstruct_without_source(&mut buffer)?;
            self.registry
                .write_to_target(target_index, part.target_offset(), &buffer)
                .await?;
            self.ledger
                .lock()
                .remove_part(self.index.as_ref(), target_index, part_index);
        }
        Ok(())
    }

    /// Queue one install task over explicit `(target, part)` pairs
    pub fn queue_install(
        &mut self,
        source_index: usize,
        source: InstallSource,
        pairs: Vec<(usize, usize)>,
    ) -> Result<()> {
        if source_index >= self.index.source_count() {
            return Err(Error::invalid_argument(format!(
                "source index {source_index} out of range ({} sources)",
                self.index.source_count()
            )));
        }

        let task = match source {
            InstallSource::Http { url, session_id } => InstallTask::Http(HttpInstallTask::new(
                source_index,
                url,
                session_id,
                self.client.clone(),
                Arc::clone(&self.index),
                Arc::clone(&self.registry),
                self.pool.clone(),
                self.backoff_base,
                pairs,
            )),
            InstallSource::Stream(stream) => InstallTask::Stream(StreamInstallTask::new(
                source_index,
                LocalSource::new(stream, self.index.source_end(source_index)),
                Arc::clone(&self.index),
                Arc::clone(&self.registry),
                self.pool.clone(),
                pairs,
            )),
        };
        self.queue.push(task);
        Ok(())
    }

    /// Queue the ledger's missing parts for one source patch, split across
    /// `split_by` HTTP tasks
    ///
    /// The parts are divided into `split_by` chunks of roughly equal size
    /// (see [`DEFAULT_INSTALL_SPLIT`]); empty chunks are skipped.
    pub fn queue_install_split(
        &mut self,
        source_index: usize,
        url: &str,
        session_id: Option<&str>,
        split_by: usize,
    ) -> Result<()> {
        if source_index >= self.index.source_count() {
            return Err(Error::invalid_argument(format!(
                "source index {source_index} out of range ({} sources)",
                self.index.source_count()
            )));
        }

        let pairs: Vec<(usize, usize)> = self
            .ledger
            .lock()
            .source_parts(source_index)
            .iter()
            .copied()
            .collect();
        if pairs.is_empty() {
            return Ok(());
        }

        let chunk_size = pairs.len().div_ceil(split_by.max(1));
        for chunk in pairs.chunks(chunk_size) {
            self.queue_install(
                source_index,
                InstallSource::Http {
                    url: url.to_string(),
                    session_id: session_id.map(str::to_string),
                },
                chunk.to_vec(),
            )?;
        }
        Ok(())
    }

    /// Number of queued install tasks
    pub fn queued_task_count(&self) -> usize {
        self.queue.len()
    }

    /// Run every queued install task with bounded concurrency
    ///
    /// With an empty queue this only runs the non-patch reconstructor.
    /// Progress is aggregated across tasks and reported on the progress
    /// interval; the first faulted task cancels its siblings and its error
    /// propagates after the remaining workers have been awaited.
    pub async fn install(&mut self, concurrency: usize, cancel: &CancellationToken) -> Result<()> {
        cancel.check()?;
        let tasks = std::mem::take(&mut self.queue);
        if tasks.is_empty() {
            return self.repair_non_patch_data(cancel).await;
        }

        let concurrency = concurrency.max(1);
        let progress_max: u64 = tasks.iter().map(InstallTask::progress_max).sum();
        let counters: Vec<Arc<AtomicU64>> = tasks.iter().map(InstallTask::progress_handle).collect();

        let local = cancel.child();
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        let mut remaining = tasks.into_iter();
        let mut current_source = 0usize;
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.progress_interval,
            self.progress_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut first_error: Option<Error> = None;

        loop {
            if first_error.is_none() && !local.is_cancelled() {
                while join_set.len() < concurrency {
                    let Some(task) = remaining.next() else {
                        break;
                    };
                    current_source = task.source_index();
                    join_set.spawn(task.repair(local.clone()));
                }
            }
            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    let done: u64 = counters.iter().map(|counter| counter.load(Ordering::Relaxed)).sum();
                    self.events.emit_install_progress(current_source, done, progress_max);
                }
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok(Ok(()))) => {}
                        Some(Ok(Err(error))) => {
                            if first_error.is_none() {
                                warn!("install task faulted, cancelling siblings: {error}");
                                first_error = Some(error);
                            }
                            local.cancel();
                        }
                        Some(Err(join_error)) => {
                            if first_error.is_none() {
                                first_error = Some(Error::TaskPanicked(join_error.to_string()));
                            }
                            local.cancel();
                        }
                        None => {}
                    }
                }
                () = cancel.cancelled(), if first_error.is_none() => {
                    first_error = Some(Error::Cancelled);
                    local.cancel();
                }
            }
        }

        // Everything spawned has been awaited; errors past the first were
        // suppressed above
        local.cancel();

        if first_error.is_none() && cancel.is_cancelled() {
            first_error = Some(Error::Cancelled);
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        let done: u64 = counters.iter().map(|counter| counter.load(Ordering::Relaxed)).sum();
        self.events.emit_install_progress(current_source, done, progress_max);

        self.repair_non_patch_data(cancel).await
    }

    /// Write the two version sidecar files under `root`
    pub async fn write_version_files(&self, root: &Path) -> Result<()> {
        let version = self.index.version_name();
        for name in [
            self.index.version_file_name(),
            self.index.version_backup_file_name(),
        ] {
            let path = root.join(name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            debug!("writing version file {:?}", path);
            tokio::fs::write(&path, version).await?;
        }
        Ok(())
    }
}

/// Verify one target's parts against its attached stream
async fn verify_target(
    index: Arc<dyn PatchIndex>,
    registry: Arc<TargetRegistry>,
    ledger: Arc<Mutex<MissingLedger>>,
    events: Arc<InstallerEvents>,
    target_index: usize,
    progress: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Result<()> {
    let target = index.target(target_index);
    let mut slot = registry.slot(target_index).lock().await;
    let Some(stream) = slot.as_mut() else {
        return Ok(());
    };

    let on_disk_len = stream.seek(SeekFrom::End(0)).await?;
    if on_disk_len != target.file_size() {
        warn!(
            "target {} is {} bytes on disk, index expects {}",
            target.relative_path(),
            on_disk_len,
            target.file_size()
        );
        ledger.lock().record_size_mismatch(target_index);
    }
    stream.seek(SeekFrom::Start(0)).await?;

    for part_index in 0..target.part_count() {
        cancel.check()?;

        let part = target.part(part_index);
        let outcome = part.verify(stream.as_mut()).await?;
        match outcome {
            VerifyOutcome::Pass => {}
            VerifyOutcome::Unverifiable => {
                return Err(Error::InvariantViolated {
                    target: target_index,
                    part: part_index,
                });
            }
            VerifyOutcome::NotEnoughData | VerifyOutcome::BadData => {
                warn!(
                    "part {} of target {} failed verification: {:?}",
                    part_index,
                    target.relative_path(),
                    outcome
                );
                ledger
                    .lock()
                    .mark_part_missing(index.as_ref(), target_index, part_index);
                events.emit_corruption(target_index, part_index, outcome);
            }
        }
        progress.fetch_add(part.target_size() as u64, Ordering::Relaxed);
    }
    Ok(())
}
