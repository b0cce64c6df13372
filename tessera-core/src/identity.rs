//! Client identity shared by the document and cursor channels.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Longest display name accepted, in characters.
pub const MAX_NAME_CHARS: usize = 20;
/// Name used when the user leaves it blank.
pub const ANONYMOUS_NAME: &str = "Anonymous User";

/// Cursor swatches handed out to new clients.
pub const PALETTE: [&str; 10] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEEAD", "#D4A5A5", "#FF8A80", "#82B1FF",
    "#B39DDB", "#A5D6A7",
];

/// Opaque, stable client identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Palette swatch derived from the id, stable across sessions.
    pub fn palette_color(&self) -> &'static str {
        // FNV-1a; std's hasher is randomly seeded per process.
        let hash = self
            .0
            .bytes()
            .fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3));
        PALETTE[(hash % PALETTE.len() as u64) as usize]
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Display data attached to cursor messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub color: String,
}

impl ClientInfo {
    pub fn new(name: &str, color: impl Into<String>) -> Self {
        Self {
            name: sanitize_name(name),
            color: color.into(),
        }
    }
}

/// Trim, cap at [`MAX_NAME_CHARS`], and substitute [`ANONYMOUS_NAME`] for blanks.
pub fn sanitize_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return ANONYMOUS_NAME.to_string();
    }
    trimmed.chars().take(MAX_NAME_CHARS).collect::<String>().trim_end().to_string()
}

/// Who this client is on both channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: ClientId,
    pub info: ClientInfo,
}

impl ClientIdentity {
    pub fn new(client_id: ClientId, info: ClientInfo) -> Self {
        Self { client_id, info }
    }

    /// Random id with the id's palette color.
    pub fn generate(name: &str) -> Self {
        let client_id = ClientId::generate();
        let color = client_id.palette_color();
        Self {
            info: ClientInfo::new(name, color),
            client_id,
        }
    }

    pub fn rename(&mut self, name: &str) {
        self.info.name = sanitize_name(name);
    }
}
