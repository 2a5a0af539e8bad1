//! Shared fixtures for installer integration tests
//!
//! Provides a digest-verified in-memory patch index plus a wiremock
//! responder that answers ranged GETs with `multipart/byteranges` bodies
//! sliced from a backing source buffer.

#![allow(dead_code)]

use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use wiremock::{Request, Respond, ResponseTemplate};

use patch_installer::{
    PatchIndex, PatchPart, PatchTarget, Result, SourceStream, TargetStream, VerifyOutcome,
};

/// Deterministic filler bytes for fixture content
pub fn pattern_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

enum PartKind {
    Source {
        source_index: usize,
        source_offset: u64,
        max_source_end: u64,
    },
    Literal(Vec<u8>),
    Unverifiable,
}

pub struct TestPart {
    target_index: usize,
    part_index: usize,
    target_offset: u64,
    target_size: usize,
    digest: [u8; 32],
    kind: PartKind,
}

#[async_trait]
impl PatchPart for TestPart {
    fn target_index(&self) -> usize {
        self.target_index
    }

    fn part_index(&self) -> usize {
        self.part_index
    }

    fn target_offset(&self) -> u64 {
        self.target_offset
    }

    fn target_size(&self) -> usize {
        self.target_size
    }

    fn is_from_source(&self) -> bool {
        matches!(self.kind, PartKind::Source { .. })
    }

    fn source_index(&self) -> usize {
        match self.kind {
            PartKind::Source { source_index, .. } => source_index,
            _ => 0,
        }
    }

    fn source_offset(&self) -> u64 {
        match self.kind {
            PartKind::Source { source_offset, .. } => source_offset,
            _ => 0,
        }
    }

    fn max_source_end(&self) -> u64 {
        match self.kind {
            PartKind::Source { max_source_end, .. } => max_source_end,
            _ => 0,
        }
    }

    async fn verify(&self, target: &mut dyn TargetStream) -> Result<VerifyOutcome> {
        if matches!(self.kind, PartKind::Unverifiable) {
            return Ok(VerifyOutcome::Unverifiable);
        }

        let len = target.seek(SeekFrom::End(0)).await?;
        if len < self.target_offset + self.target_size as u64 {
            return Ok(VerifyOutcome::NotEnoughData);
        }

        target.seek(SeekFrom::Start(self.target_offset)).await?;
        let mut contents = vec![0u8; self.target_size];
        target.read_exact(&mut contents).await?;

        if Sha256::digest(&contents)[..] == self.digest {
            Ok(VerifyOutcome::Pass)
        } else {
            Ok(VerifyOutcome::BadData)
        }
    }

    async fn reconstruct(&self, source: &mut dyn SourceStream, out: &mut [u8]) -> Result<()> {
        // Copy part: the source bytes are the target bytes
        source.read_exact(out).await
    }

    fn reconstruct_without_source(&self, out: &mut [u8]) -> Result<()> {
        match &self.kind {
            PartKind::Literal(data) => {
                out.copy_from_slice(data);
                Ok(())
            }
            _ => panic!("reconstruct_without_source on a source-backed part"),
        }
    }
}

pub struct TestTarget {
    path: String,
    size: u64,
    parts: Vec<TestPart>,
}

impl PatchTarget for TestTarget {
    fn relative_path(&self) -> &str {
        &self.path
    }

    fn file_size(&self) -> u64 {
        self.size
    }

    fn part_count(&self) -> usize {
        self.parts.len()
    }

    fn part(&self, part_index: usize) -> &dyn PatchPart {
        &self.parts[part_index]
    }
}

pub struct TestIndex {
    targets: Vec<TestTarget>,
    source_ends: Vec<u64>,
    version: String,
}

impl PatchIndex for TestIndex {
    fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn target(&self, target_index: usize) -> &dyn PatchTarget {
        &self.targets[target_index]
    }

    fn source_count(&self) -> usize {
        self.source_ends.len()
    }

    fn source_end(&self, source_index: usize) -> u64 {
        self.source_ends[source_index]
    }

    fn version_name(&self) -> &str {
        &self.version
    }

    fn version_file_name(&self) -> &str {
        "installed.version"
    }

    fn version_backup_file_name(&self) -> &str {
        "installed.version.bak"
    }
}

pub struct TestIndexBuilder {
    targets: Vec<TestTarget>,
    source_ends: Vec<u64>,
    version: String,
}

impl TestIndexBuilder {
    pub fn new(version: &str) -> Self {
        Self {
            targets: Vec::new(),
            source_ends: Vec::new(),
            version: version.to_string(),
        }
    }

    /// Declare a source patch spanning `0..end`
    pub fn source(mut self, end: u64) -> Self {
        self.source_ends.push(end);
        self
    }

    /// Start a new target file; subsequent parts attach to it
    pub fn target(mut self, path: &str, size: u64) -> Self {
        self.targets.push(TestTarget {
            path: path.to_string(),
            size,
            parts: Vec::new(),
        });
        self
    }

    fn push_part(&mut self, target_offset: u64, size: usize, digest: [u8; 32], kind: PartKind) {
        let target_index = self.targets.len() - 1;
        let target = self.targets.last_mut().expect("target() must come first");
        target.parts.push(TestPart {
            target_index,
            part_index: target.parts.len(),
            target_offset,
            target_size: size,
            digest,
            kind,
        });
    }

    /// Part reconstructed from `data` stored at `source_offset` in a source patch
    pub fn source_part(
        mut self,
        target_offset: u64,
        data: &[u8],
        source_index: usize,
        source_offset: u64,
    ) -> Self {
        self.push_part(
            target_offset,
            data.len(),
            Sha256::digest(data).into(),
            PartKind::Source {
                source_index,
                source_offset,
                max_source_end: source_offset + data.len() as u64,
            },
        );
        self
    }

    /// Part whose bytes come from the index itself
    pub fn literal_part(mut self, target_offset: u64, data: &[u8]) -> Self {
        self.push_part(
            target_offset,
            data.len(),
            Sha256::digest(data).into(),
            PartKind::Literal(data.to_vec()),
        );
        self
    }

    /// Part the index cannot verify (malformed-index fixture)
    pub fn unverifiable_part(mut self, target_offset: u64, size: usize) -> Self {
        self.push_part(target_offset, size, [0; 32], PartKind::Unverifiable);
        self
    }

    pub fn build(self) -> Arc<TestIndex> {
        Arc::new(TestIndex {
            targets: self.targets,
            source_ends: self.source_ends,
            version: self.version,
        })
    }
}

/// Boundary used by [`RangeResponder`] bodies
pub const TEST_BOUNDARY: &str = "PATCHBOUND";

/// Wiremock responder that serves `multipart/byteranges` slices of a source
pub struct RangeResponder {
    source: Vec<u8>,
}

impl RangeResponder {
    pub fn new(source: Vec<u8>) -> Self {
        Self { source }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let header = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let spec = header.strip_prefix("bytes=").unwrap_or_default();

        let mut body = Vec::new();
        for range in spec.split(',') {
            let (start, end) = range.trim().split_once('-').expect("inclusive range spec");
            let start: usize = start.parse().expect("range start");
            let end: usize = end.parse().expect("range end");

            body.extend_from_slice(
                format!(
                    "--{TEST_BOUNDARY}\r\nContent-Type: application/octet-stream\r\n\
                     Content-Range: bytes {start}-{end}/{}\r\n\r\n",
                    self.source.len()
                )
                .as_bytes(),
            );
            body.extend_from_slice(&self.source[start..=end]);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{TEST_BOUNDARY}--\r\n").as_bytes());

        ResponseTemplate::new(206)
            .insert_header(
                "Content-Type",
                format!("multipart/byteranges; boundary={TEST_BOUNDARY}").as_str(),
            )
            .set_body_bytes(body)
    }
}
