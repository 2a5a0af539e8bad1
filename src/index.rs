//! Read-only interface to a precomputed patch index
//!
//! The installer never parses an index file itself. Whatever produces the
//! index (an on-disk format, a generated fixture) exposes it through these
//! traits: a flat list of target files, each split into contiguous parts,
//! plus the source patches that part reconstruction reads from. Verification
//! and reconstruction details stay opaque behind the per-part operations.

use async_trait::async_trait;

use crate::error::Result;
use crate::registry::TargetStream;
use crate::source::SourceStream;

/// Outcome of verifying one part against its target file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// On-disk bytes match the index
    Pass,
    /// The target is too short to contain this part
    NotEnoughData,
    /// The bytes are present but do not match
    BadData,
    /// The index does not carry enough metadata to verify the part
    ///
    /// A well-formed index can always verify every part; observing this
    /// outcome aborts verification with
    /// [`Error::InvariantViolated`](crate::Error::InvariantViolated).
    Unverifiable,
}

/// One contiguous byte region of a target file
#[async_trait]
pub trait PatchPart: Send + Sync {
    /// Index of the target file this part belongs to
    fn target_index(&self) -> usize;

    /// Index of this part within its target
    fn part_index(&self) -> usize;

    /// Byte offset of this part in the target file
    fn target_offset(&self) -> u64;

    /// Size of this part in the target file
    fn target_size(&self) -> usize;

    /// Whether reconstruction reads bytes from a source patch
    fn is_from_source(&self) -> bool;

    /// Index of the source patch reconstruction reads from
    ///
    /// Meaningful only when [`is_from_source`](Self::is_from_source) is true.
    fn source_index(&self) -> usize;

    /// Byte offset into the source patch where this part's data begins
    fn source_offset(&self) -> u64;

    /// Exclusive upper bound on source offsets this part may read
    fn max_source_end(&self) -> u64;

    /// Check the part's bytes in the target stream
    async fn verify(&self, target: &mut dyn TargetStream) -> Result<VerifyOutcome>;

    /// Rebuild the part from source bytes
    ///
    /// Reads exactly the bytes it needs from `source` at its current
    /// position and fills all of `out` (`target_size` bytes).
    async fn reconstruct(&self, source: &mut dyn SourceStream, out: &mut [u8]) -> Result<()>;

    /// Rebuild the part from index-embedded data alone
    ///
    /// Only valid when [`is_from_source`](Self::is_from_source) is false.
    fn reconstruct_without_source(&self, out: &mut [u8]) -> Result<()>;
}

/// One target file described by the index
pub trait PatchTarget: Send + Sync {
    /// Path of the file relative to the install root
    fn relative_path(&self) -> &str;

    /// Final size of the file in bytes
    fn file_size(&self) -> u64;

    /// Number of parts the file is divided into
    fn part_count(&self) -> usize;

    /// Accessor for one part
    fn part(&self, part_index: usize) -> &dyn PatchPart;
}

/// A complete patch index
pub trait PatchIndex: Send + Sync {
    /// Number of target files
    fn target_count(&self) -> usize;

    /// Accessor for one target
    fn target(&self, target_index: usize) -> &dyn PatchTarget;

    /// Number of source patches
    fn source_count(&self) -> usize;

    /// Exclusive upper bound on byte offsets in a source patch
    fn source_end(&self, source_index: usize) -> u64;

    /// Human-readable name of the version this index installs
    fn version_name(&self) -> &str;

    /// File name of the primary version sidecar
    fn version_file_name(&self) -> &str;

    /// File name of the backup version sidecar
    fn version_backup_file_name(&self) -> &str;
}
