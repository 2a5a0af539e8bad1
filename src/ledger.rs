//! Missing-parts ledger
//!
//! Three indexed sets track what verification found wanting: missing part
//! indices per target file, `(target, part)` pairs per source patch, and
//! targets whose on-disk length disagrees with the index.
//!
//! Coherence invariant: a pair `(t, p)` is in the per-source set for `s`
//! exactly when `p` is missing in target `t`, the part reads from a source
//! patch, and that patch is `s`.

use std::collections::BTreeSet;

use crate::index::PatchIndex;

/// Sorted sets of missing parts, indexed three ways
pub struct MissingLedger {
    per_target: Vec<BTreeSet<usize>>,
    per_source: Vec<BTreeSet<(usize, usize)>>,
    size_mismatch: BTreeSet<usize>,
}

impl MissingLedger {
    /// Create an empty ledger shaped for `index`
    pub fn new(index: &dyn PatchIndex) -> Self {
        Self {
            per_target: vec![BTreeSet::new(); index.target_count()],
            per_source: vec![BTreeSet::new(); index.source_count()],
            size_mismatch: BTreeSet::new(),
        }
    }

    /// Forget everything, keeping the shape
    pub fn reset(&mut self) {
        for set in &mut self.per_target {
            set.clear();
        }
        for set in &mut self.per_source {
            set.clear();
        }
        self.size_mismatch.clear();
    }

    /// Record a single part as missing
    pub fn mark_part_missing(&mut self, index: &dyn PatchIndex, target_index: usize, part_index: usize) {
        self.per_target[target_index].insert(part_index);

        let part = index.target(target_index).part(part_index);
        if part.is_from_source() {
            self.per_source[part.source_index()].insert((target_index, part_index));
        }
    }

    /// Record every part of a target as missing
    pub fn mark_file_missing(&mut self, index: &dyn PatchIndex, target_index: usize) {
        for part_index in 0..index.target(target_index).part_count() {
            self.mark_part_missing(index, target_index, part_index);
        }
    }

    /// Record a target whose on-disk length differs from the index
    pub fn record_size_mismatch(&mut self, target_index: usize) {
        self.size_mismatch.insert(target_index);
    }

    /// Remove a repaired part from both indexings
    pub fn remove_part(&mut self, index: &dyn PatchIndex, target_index: usize, part_index: usize) {
        self.per_target[target_index].remove(&part_index);

        let part = index.target(target_index).part(part_index);
        if part.is_from_source() {
            self.per_source[part.source_index()].remove(&(target_index, part_index));
        }
    }

    /// Missing part indices for one target
    pub fn missing_parts(&self, target_index: usize) -> &BTreeSet<usize> {
        &self.per_target[target_index]
    }

    /// Missing `(target, part)` pairs served by one source patch
    pub fn source_parts(&self, source_index: usize) -> &BTreeSet<(usize, usize)> {
        &self.per_source[source_index]
    }

    /// Targets with a recorded size mismatch
    pub fn size_mismatches(&self) -> &BTreeSet<usize> {
        &self.size_mismatch
    }

    /// Whether the target has any missing part
    pub fn has_missing(&self, target_index: usize) -> bool {
        !self.per_target[target_index].is_empty()
    }

    /// Whether nothing at all is recorded
    pub fn is_empty(&self) -> bool {
        self.size_mismatch.is_empty() && self.per_target.iter().all(BTreeSet::is_empty)
    }
}
