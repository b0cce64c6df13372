//! Mapping between logical cursor positions and surface coordinates.
//!
//! A logical position is `(block index, text offset)`. It survives layout
//! changes and is what travels over the wire. The surface itself is reached
//! only through [`SurfaceGeometry`] (measurement) and [`DocumentTree`]
//! (selection ancestry), so everything here runs without a renderer.

use serde::{Deserialize, Serialize};

use crate::document::BlockOperation;

/// Offset applied to the block box when a block has no editable text.
pub const FALLBACK_INSET: f32 = 10.0;
/// Tallest caret drawn, regardless of the content box height.
pub const MAX_CARET_HEIGHT: f32 = 24.0;
/// Caret height used when only the block box is known.
pub const DEFAULT_CARET_HEIGHT: f32 = 20.0;

/// Logical cursor position inside the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub block_index: usize,
    pub offset: usize,
}

impl CursorPosition {
    pub fn new(block_index: usize, offset: usize) -> Self {
        Self { block_index, offset }
    }
}

/// Axis-aligned rectangle in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }
}

/// Where to draw a caret, relative to the surface origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenPoint {
    pub x: f32,
    pub y: f32,
    pub height: f32,
}

/// Measurement access to a rendered editing surface.
pub trait SurfaceGeometry {
    /// Bounding box of the surface container.
    fn origin(&self) -> Rect;

    /// Bounding box of the block, `None` if the index is not rendered.
    fn block_rect(&self, block_index: usize) -> Option<Rect>;

    /// Editable content region of the block, `None` for non-text blocks.
    fn content_rect(&self, block_index: usize) -> Option<Rect>;

    /// Length of the text content of the block's editable region.
    fn text_len(&self, block_index: usize) -> usize;

    /// Box of a collapsed range at `offset` inside the block's first text node.
    fn caret_rect(&self, block_index: usize, offset: usize) -> Option<Rect>;
}

/// Resolve a logical position to surface coordinates.
///
/// Returns `None` when the block does not exist, which callers treat as
/// "hide this cursor".
pub fn to_screen_coordinates<G: SurfaceGeometry + ?Sized>(
    position: CursorPosition,
    geometry: &G,
) -> Option<ScreenPoint> {
    let block = geometry.block_rect(position.block_index)?;
    let origin = geometry.origin();

    let Some(content) = geometry.content_rect(position.block_index) else {
        return Some(ScreenPoint {
            x: block.x - origin.x + FALLBACK_INSET,
            y: block.y - origin.y + FALLBACK_INSET,
            height: DEFAULT_CARET_HEIGHT,
        });
    };

    let mut left = content.x;
    let text_len = geometry.text_len(position.block_index);
    if position.offset > 0 && text_len > 0 {
        let offset = position.offset.min(text_len);
        if let Some(caret) = geometry.caret_rect(position.block_index, offset) {
            // Text measurement can report garbage for leading/empty nodes.
            left = caret.x.max(block.x);
        }
    }

    Some(ScreenPoint {
        x: left - origin.x,
        y: content.y - origin.y,
        height: content.height.min(MAX_CARET_HEIGHT),
    })
}

/// Ancestry access to the surface's node tree.
pub trait DocumentTree {
    type Node: Clone;

    fn parent(&self, node: &Self::Node) -> Option<Self::Node>;

    fn is_text(&self, node: &Self::Node) -> bool;

    /// Index of `node` in the block list if it is a block element.
    fn block_index(&self, node: &Self::Node) -> Option<usize>;
}

/// A collapsed selection: the anchor node and the offset within it.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection<N> {
    pub anchor: N,
    pub offset: usize,
}

/// Derive a logical position from the current selection.
///
/// Returns `None` when the anchor is not inside any block; no cursor update
/// should be broadcast in that case.
pub fn from_selection<T: DocumentTree + ?Sized>(
    selection: &Selection<T::Node>,
    tree: &T,
) -> Option<CursorPosition> {
    let anchor_is_text = tree.is_text(&selection.anchor);
    let mut node = if anchor_is_text {
        tree.parent(&selection.anchor)
    } else {
        Some(selection.anchor.clone())
    };

    while let Some(current) = node {
        if let Some(block_index) = tree.block_index(&current) {
            let offset = if anchor_is_text { selection.offset } else { 0 };
            return Some(CursorPosition { block_index, offset });
        }
        node = tree.parent(&current);
    }

    None
}

/// Shift a saved caret so it stays on the same block after `op` was applied.
///
/// `block_count` is the number of blocks after the operation. Returns `None`
/// when the document is now empty.
pub fn adjust_for_operation(
    position: CursorPosition,
    op: &BlockOperation,
    block_count: usize,
) -> Option<CursorPosition> {
    if block_count == 0 {
        return None;
    }

    let mut index = position.block_index;
    match op {
        BlockOperation::Insert { index: at, .. } if *at <= index => index += 1,
        BlockOperation::Delete { index: at } if *at < index => index -= 1,
        _ => {}
    }

    Some(CursorPosition {
        block_index: index.min(block_count - 1),
        offset: position.offset,
    })
}
