//! JSON wire protocol for the document and cursor channels.
//!
//! Every frame is one JSON object in a WebSocket text message:
//! ```text
//! document channel                          cursor channel
//! ─────────────────                         ──────────────
//! {"type":"get_document"}                   {"type":"cursor","clientId":…,
//! {"type":"document_data","data":…}           "position":{"blockIndex":…,"offset":…},
//! {"type":"document_change","data":…,         "clientInfo":{"name":…,"color":…}}
//!   "clientId":…}                           {"type":"cursor","clientId":…,
//! {"type":"block_change","change":…,          "action":"remove"}
//!   "timestamp":…,"clientId":…}
//! ```

use serde::{Deserialize, Serialize};
use tessera_core::{now_millis, BlockOperation, ClientId, ClientInfo, CursorPosition, Document};

/// Path prefix of the document channel.
pub const DOCUMENT_PATH: &str = "/document";
/// Path prefix of the cursor channel.
pub const CURSOR_PATH: &str = "/cursors";

/// Wire protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
}

/// Why an outbound frame was not handed to the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
    #[error("Outgoing queue full")]
    QueueFull,
}

/// Messages on the document channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentMessage {
    /// Ask for the current authoritative document.
    GetDocument,

    /// Reply to `get_document`, sent to the requester only.
    DocumentData { data: Document },

    /// Whole-document replace.
    DocumentChange {
        data: Document,
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientId>,
    },

    /// One block operation.
    BlockChange {
        change: BlockOperation,
        #[serde(default)]
        timestamp: u64,
        #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientId>,
    },
}

impl DocumentMessage {
    pub fn document_data(data: Document) -> Self {
        Self::DocumentData { data }
    }

    pub fn document_change(data: Document, client_id: Option<ClientId>) -> Self {
        Self::DocumentChange { data, client_id }
    }

    /// Block change stamped with the current time.
    pub fn block_change(change: BlockOperation, client_id: Option<ClientId>) -> Self {
        Self::BlockChange {
            change,
            timestamp: now_millis(),
            client_id,
        }
    }

    /// Originating client, for messages that carry one.
    pub fn client_id(&self) -> Option<&ClientId> {
        match self {
            Self::DocumentChange { client_id, .. } | Self::BlockChange { client_id, .. } => {
                client_id.as_ref()
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetDocument => "get_document",
            Self::DocumentData { .. } => "document_data",
            Self::DocumentChange { .. } => "document_change",
            Self::BlockChange { .. } => "block_change",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum CursorTag {
    #[serde(rename = "cursor")]
    Cursor,
}

/// Explicit actions carried by a cursor frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorAction {
    Remove,
}

/// A frame on the cursor channel.
///
/// Either a position update (`position` and `clientInfo` present) or a
/// removal (`action: "remove"`). [`decode`](Self::decode) rejects frames
/// that are neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMessage {
    #[serde(rename = "type")]
    tag: CursorTag,
    pub client_id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<CursorAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
}

/// Interpreted content of a [`CursorMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum CursorUpdate {
    Moved {
        position: CursorPosition,
        client_info: ClientInfo,
    },
    Removed,
}

impl CursorMessage {
    pub fn position(client_id: ClientId, position: CursorPosition, client_info: ClientInfo) -> Self {
        Self {
            tag: CursorTag::Cursor,
            client_id,
            action: None,
            position: Some(position),
            client_info: Some(client_info),
        }
    }

    pub fn remove(client_id: ClientId) -> Self {
        Self {
            tag: CursorTag::Cursor,
            client_id,
            action: Some(CursorAction::Remove),
            position: None,
            client_info: None,
        }
    }

    pub fn is_remove(&self) -> bool {
        self.action == Some(CursorAction::Remove)
    }

    pub fn update(&self) -> Result<CursorUpdate, ProtocolError> {
        if self.is_remove() {
            return Ok(CursorUpdate::Removed);
        }
        let position = self.position.ok_or(ProtocolError::MissingField("position"))?;
        let client_info = self
            .client_info
            .clone()
            .ok_or(ProtocolError::MissingField("clientInfo"))?;
        Ok(CursorUpdate::Moved {
            position,
            client_info,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self = serde_json::from_str(text)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        msg.update()?;
        Ok(msg)
    }
}

/// Which channel a WebSocket upgrade path addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Document(String),
    Cursor(String),
}

impl Channel {
    /// Parse `/document[/<name>]` or `/cursors[/<name>]`.
    ///
    /// A missing or empty name selects `default_document`. Nested paths are rejected.
    pub fn from_path(path: &str, default_document: &str) -> Option<Self> {
        let path = path.trim_end_matches('/');
        let (prefix, make): (&str, fn(String) -> Channel) = if path.starts_with(DOCUMENT_PATH) {
            (DOCUMENT_PATH, Channel::Document)
        } else if path.starts_with(CURSOR_PATH) {
            (CURSOR_PATH, Channel::Cursor)
        } else {
            return None;
        };

        let rest = &path[prefix.len()..];
        let name = match rest.strip_prefix('/') {
            None if rest.is_empty() => default_document,
            None => return None,
            Some(name) if name.contains('/') => return None,
            Some(name) => name,
        };
        Some(make(name.to_string()))
    }

    pub fn document_name(&self) -> &str {
        match self {
            Self::Document(name) | Self::Cursor(name) => name,
        }
    }

    pub fn path(&self) -> String {
        match self {
            Self::Document(name) => format!("{DOCUMENT_PATH}/{name}"),
            Self::Cursor(name) => format!("{CURSOR_PATH}/{name}"),
        }
    }
}
