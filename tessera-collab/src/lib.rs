//! # tessera-collab: Real-time collaboration layer for Tessera
//!
//! Relays block operations and cursor positions between clients over
//! WebSocket, with one authoritative in-memory document per name.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   /document/<name>   ┌──────────────┐
//! │ SyncClient  │ ◄──────────────────► │ RelayServer  │
//! │ (per user)  │      JSON frames     │  (central)   │
//! └──────┬──────┘                      └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌─────────────┐                      ┌──────────────┐
//! │ shadow Doc  │                      │DocumentStore │
//! │ + surface   │                      │(authority)   │
//! └─────────────┘                      └──────┬───────┘
//!                                             │
//!                                     ┌───────┴───────┐
//!                                     │BroadcastGroup │
//!                                     │  (fan-out)    │
//!                                     └───────────────┘
//! ```
//!
//! Cursor positions travel on `/cursors/<name>` and never touch the document.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages and channel routing
//! - [`store`]: Authoritative document with the shared apply policy
//! - [`broadcast`]: Room fan-out with origin tagging
//! - [`presence`]: Server and client cursor tables
//! - [`cursor`]: Debounced outbound cursor updates
//! - [`sync`]: Client submission/application state machine
//! - [`server`]: WebSocket relay server
//! - [`client`]: WebSocket client connections

pub mod broadcast;
pub mod client;
pub mod cursor;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod store;
pub mod sync;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Frame};
pub use client::{
    ConnectionEvent, ConnectionState, CursorConnection, CursorEvent, DocumentConnection, DocumentEvent,
};
pub use cursor::{CursorBroadcaster, CursorConfig, CursorTransport};
pub use presence::{PresenceChange, PresenceRegistry, RemoteCursorView, RemotePresence};
pub use protocol::{Channel, CursorMessage, CursorUpdate, DocumentMessage, ProtocolError, TransportError};
pub use server::{DocumentStatus, RelayServer, ServerConfig, ServerError, ServerStats};
pub use store::DocumentStore;
pub use sync::{
    DocumentTransport, EditorSurface, PhaseCell, SurfaceError, SyncClient, SyncConfig, SyncHandle, SyncMachine,
    SyncPhase,
};
