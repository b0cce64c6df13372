//! Positional change detection between two document snapshots.
//!
//! The detector compares blocks index by index. It never tries to detect
//! moves: a reorder shows up as a run of updates, and a shrink shows up as
//! tail deletes. That keeps the output cheap to compute and trivially
//! replayable with [`Document::apply`].

use crate::document::{Block, BlockOperation, Document};

/// Outcome of comparing a shadow against a fresh snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// Block operations to send in order.
    Operations(Vec<BlockOperation>),
    /// Content changed in a way the positional diff cannot express; send the whole document.
    Replace,
    /// Nothing to send.
    Unchanged,
}

/// Ordered block operations turning `previous` into `current`.
///
/// A missing `previous` is treated as an empty block sequence. Tail deletes
/// are emitted highest index first so that sequential application never
/// skips an element.
pub fn detect_changes(previous: Option<&Document>, current: &Document) -> Vec<BlockOperation> {
    let old: &[Block] = previous.map(|d| d.blocks.as_slice()).unwrap_or(&[]);
    let new = current.blocks.as_slice();

    let mut ops = Vec::new();

    for (index, block) in new.iter().enumerate() {
        match old.get(index) {
            Some(existing) if existing == block => {}
            Some(_) => ops.push(BlockOperation::Update {
                index,
                block: block.clone(),
            }),
            None => ops.push(BlockOperation::Insert {
                index,
                block: block.clone(),
            }),
        }
    }

    for index in (new.len()..old.len()).rev() {
        ops.push(BlockOperation::Delete { index });
    }

    ops
}

/// Compare snapshots and choose between operations, a full replace, or nothing.
pub fn diff(previous: Option<&Document>, current: &Document) -> Diff {
    let ops = detect_changes(previous, current);
    if !ops.is_empty() {
        return Diff::Operations(ops);
    }

    // Blocks are equal here; only the version can still differ.
    match previous {
        Some(prev) if !prev.same_content(current) => Diff::Replace,
        _ => Diff::Unchanged,
    }
}
