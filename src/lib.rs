//! Indexed binary patch installer core
//!
//! This crate repairs (or constructs from nothing) a tree of target files so
//! it matches a precomputed patch index. Whole-patch downloads are off the
//! table for multi-gigabyte content trees, so the installer works
//! differentially:
//!
//! - Concurrent chunked verification of the existing files, producing a
//!   precise ledger of missing `(target, part)` pairs
//! - Coalesced HTTP range requests against remote source patches, consumed
//!   as forward-only `multipart/byteranges` streams (local source streams
//!   work too)
//! - Parallel install tasks with bounded concurrency, aggregated progress,
//!   cooperative cancellation and capped exponential retry
//! - In-place writes serialized per target file, with best-effort
//!   fast preallocation where the OS supports it
//!
//! The patch index itself is consumed through the read-only [`PatchIndex`]
//! family of traits; building indices is out of scope.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use patch_installer::{CancellationToken, Installer, InstallerEvents, PatchIndex};
//!
//! # async fn example(index: Arc<dyn PatchIndex>) -> Result<(), Box<dyn std::error::Error>> {
//! let root = std::path::Path::new("/games/example");
//! let events = InstallerEvents::new()
//!     .on_verify_progress(|_, done, total| println!("verified {done}/{total} bytes"));
//! let mut installer = Installer::new(index, events)?;
//! let cancel = CancellationToken::new();
//!
//! installer.attach_all_for_read(root).await?;
//! installer.verify_files(8, &cancel).await?;
//!
//! if installer.has_missing_data() {
//!     installer.attach_missing_for_write(root).await?;
//!     for source_index in 0..installer.index().source_count() {
//!         installer.queue_install_split(
//!             source_index,
//!             "http://cdn.example.com/patches/base",
//!             None,
//!             8,
//!         )?;
//!     }
//!     installer.install(4, &cancel).await?;
//! }
//!
//! installer.write_version_files(root).await?;
//! # Ok(())
//! # }
//! ```
//!
//! A partially failed install is safe to re-drive: completed parts stay
//! written, and the next verify + install cycle requests only what is still
//! missing.

#![warn(missing_docs)]

mod buffer_pool;
mod cancel;
mod error;
mod events;
mod index;
mod installer;
mod ledger;
mod multipart;
mod privilege;
mod range;
mod registry;
mod source;
mod task;

pub use buffer_pool::{BufferPool, PooledBuf};
pub use cancel::CancellationToken;
pub use error::{Error, Result};
pub use events::InstallerEvents;
pub use index::{PatchIndex, PatchPart, PatchTarget, VerifyOutcome};
pub use installer::{
    DEFAULT_INSTALL_SPLIT, DEFAULT_PROGRESS_INTERVAL, DEFAULT_VERIFY_CONCURRENCY, InstallSource,
    Installer,
};
pub use multipart::MultipartRangeReader;
pub use range::{COALESCE_GAP, MAX_RANGES_PER_REQUEST, SourceRange, coalesce_ranges, range_header_value};
pub use registry::TargetStream;
pub use source::{LocalSource, SourceStream};
pub use task::{DEFAULT_BACKOFF_BASE, MAX_ATTEMPTS, PATCHER_USER_AGENT, PATCH_SESSION_HEADER};
