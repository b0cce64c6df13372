//! # tessera-core: Shared model and pure algorithms for Tessera
//!
//! Everything in this crate runs without a network or a rendering surface.
//!
//! ## Modules
//!
//! - [`document`]: Block, Document and BlockOperation with the shared apply policy
//! - [`diff`]: Positional change detection between two snapshots
//! - [`position`]: Logical cursor position ⇄ surface coordinates
//! - [`identity`]: Client ids, display names and palette colors
//! - [`schedule`]: Cancellable delayed tasks and debouncing

pub mod diff;
pub mod document;
pub mod identity;
pub mod position;
pub mod schedule;

pub use diff::{detect_changes, diff, Diff};
pub use document::{apply_operation, now_millis, Block, BlockOperation, Document, DEFAULT_EDITOR_VERSION};
pub use identity::{ClientId, ClientIdentity, ClientInfo};
pub use position::{
    adjust_for_operation, from_selection, to_screen_coordinates, CursorPosition, DocumentTree, Rect,
    ScreenPoint, Selection, SurfaceGeometry,
};
pub use schedule::{schedule, Debouncer, TaskHandle};
