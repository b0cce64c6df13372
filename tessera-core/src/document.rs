//! Block document model shared by every client and the relay.
//!
//! A [`Document`] is an ordered sequence of opaque [`Block`]s. Edits travel as
//! index-addressed [`BlockOperation`]s that are applied with a permissive
//! bounds policy: inserts past the end append, updates and deletes past the
//! end are silent no-ops. The same policy runs on the relay and on every
//! client shadow so both sides converge on the same sequence.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Editor data-format version stamped on freshly created documents.
pub const DEFAULT_EDITOR_VERSION: &str = "2.28.2";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One typed unit of content. The core never looks inside `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Block {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// A snapshot of the whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub version: String,
}

impl Document {
    /// Empty document stamped with the current time.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            time: now_millis(),
            blocks: Vec::new(),
            version: version.into(),
        }
    }

    pub fn with_blocks(blocks: Vec<Block>) -> Self {
        Self {
            time: now_millis(),
            blocks,
            version: DEFAULT_EDITOR_VERSION.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Content equality: blocks and version. `time` is a save stamp and is ignored.
    pub fn same_content(&self, other: &Document) -> bool {
        self.version == other.version && self.blocks == other.blocks
    }

    /// Apply one operation in place. Returns `true` if the block sequence changed.
    pub fn apply(&mut self, op: &BlockOperation) -> bool {
        apply_operation(&mut self.blocks, op)
    }

    /// Apply operations in emission order.
    pub fn apply_all<'a>(&mut self, ops: impl IntoIterator<Item = &'a BlockOperation>) {
        for op in ops {
            self.apply(op);
        }
    }

    /// Refresh the `time` stamp.
    pub fn touch(&mut self) {
        self.time = now_millis();
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new(DEFAULT_EDITOR_VERSION)
    }
}

/// An index-addressed edit of the block sequence.
///
/// Serialized with an `action` tag:
/// `{"action":"insert","index":3,"block":{...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum BlockOperation {
    Insert { index: usize, block: Block },
    Update { index: usize, block: Block },
    Delete { index: usize },
}

impl BlockOperation {
    pub fn index(&self) -> usize {
        match self {
            Self::Insert { index, .. } | Self::Update { index, .. } | Self::Delete { index } => {
                *index
            }
        }
    }

    pub fn block(&self) -> Option<&Block> {
        match self {
            Self::Insert { block, .. } | Self::Update { block, .. } => Some(block),
            Self::Delete { .. } => None,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Apply `op` to `blocks` using the permissive bounds policy.
pub fn apply_operation(blocks: &mut Vec<Block>, op: &BlockOperation) -> bool {
    match op {
        BlockOperation::Insert { index, block } => {
            let at = (*index).min(blocks.len());
            blocks.insert(at, block.clone());
            true
        }
        BlockOperation::Update { index, block } => match blocks.get_mut(*index) {
            Some(slot) => {
                *slot = block.clone();
                true
            }
            None => {
                log::debug!("update at {index} ignored: only {} blocks", blocks.len());
                false
            }
        },
        BlockOperation::Delete { index } => {
            if *index < blocks.len() {
                blocks.remove(*index);
                true
            } else {
                log::debug!("delete at {index} ignored: only {} blocks", blocks.len());
                false
            }
        }
    }
}
