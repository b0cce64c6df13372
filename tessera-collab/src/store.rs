//! Authoritative in-memory document.

use tessera_core::{BlockOperation, Document};

/// One authoritative [`Document`], mutated only through block operations
/// or whole replacement. Every mutation refreshes `time`.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    document: Document,
}

impl DocumentStore {
    /// Empty document tagged with `editor_version`.
    pub fn new(editor_version: &str) -> Self {
        Self {
            document: Document::new(editor_version),
        }
    }

    pub fn from_document(document: Document) -> Self {
        Self { document }
    }

    pub fn get(&self) -> &Document {
        &self.document
    }

    /// Apply `op` with the permissive bounds policy.
    ///
    /// Returns whether the blocks changed. The time stamp is refreshed either way,
    /// since the operation was accepted.
    pub fn apply_operation(&mut self, op: &BlockOperation) -> bool {
        let changed = self.document.apply(op);
        self.document.touch();
        changed
    }

    /// Replace the whole document, stamping it with the current time.
    pub fn replace(&mut self, mut document: Document) {
        document.touch();
        self.document = document;
    }

    pub fn block_count(&self) -> usize {
        self.document.len()
    }
}
