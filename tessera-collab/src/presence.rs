//! Cursor presence tables.
//!
//! ## Architecture
//!
//! ```text
//! CursorBroadcaster ──► {type:"cursor",…} ──► RelayServer
//!                                                │  PresenceRegistry (who is where,
//!                                                │  which connection owns them)
//!                                                ▼
//!                                         other connections
//!                                                │
//!                                                ▼
//!                                  RemotePresence::handle_message()
//!                                                │
//!                                                ▼
//!                         screen_positions() via to_screen_coordinates
//! ```

use std::collections::HashMap;
use std::time::Duration;
use tessera_core::{to_screen_coordinates, ClientId, ClientInfo, CursorPosition, ScreenPoint, SurfaceGeometry};
use tokio::time::Instant;

use crate::broadcast::ConnectionId;
use crate::protocol::{CursorMessage, CursorUpdate};

// ───────────────────────────────────────────────────────────────────
// Server side
// ───────────────────────────────────────────────────────────────────

/// Server-side presence of one client.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub client_id: ClientId,
    pub connection: ConnectionId,
    pub position: CursorPosition,
    pub client_info: ClientInfo,
    pub last_seen: Instant,
}

/// Presence of every client in one cursor room, keyed by client id.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: HashMap<ClientId, PresenceEntry>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a client's entry. Returns `true` if the client was new.
    pub fn upsert(
        &mut self,
        client_id: ClientId,
        connection: ConnectionId,
        position: CursorPosition,
        client_info: ClientInfo,
    ) -> bool {
        let entry = PresenceEntry {
            client_id: client_id.clone(),
            connection,
            position,
            client_info,
            last_seen: Instant::now(),
        };
        self.entries.insert(client_id, entry).is_none()
    }

    pub fn remove(&mut self, client_id: &ClientId) -> Option<PresenceEntry> {
        self.entries.remove(client_id)
    }

    /// Drop every entry owned by `connection`, returning their ids.
    pub fn remove_connection(&mut self, connection: ConnectionId) -> Vec<ClientId> {
        let owned: Vec<ClientId> = self
            .entries
            .values()
            .filter(|e| e.connection == connection)
            .map(|e| e.client_id.clone())
            .collect();
        for id in &owned {
            self.entries.remove(id);
        }
        owned
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&PresenceEntry> {
        self.entries.get(client_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Client side
// ───────────────────────────────────────────────────────────────────

/// A peer's cursor as tracked by a client.
#[derive(Debug, Clone)]
pub struct RemotePresenceEntry {
    pub client_id: ClientId,
    pub position: CursorPosition,
    pub client_info: ClientInfo,
    pub last_seen: Instant,
}

/// What a cursor message did to the table.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    /// Own echo, or a removal of an unknown client.
    Ignored,
    Joined(ClientId),
    Moved(ClientId),
    /// Position update whose display name differs from the last one seen.
    Renamed { client_id: ClientId, name: String },
    Left(ClientId),
}

/// A peer cursor ready for drawing. `point` is `None` when its block is gone.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursorView {
    pub client_id: ClientId,
    pub client_info: ClientInfo,
    pub point: Option<ScreenPoint>,
}

impl RemoteCursorView {
    pub fn is_hidden(&self) -> bool {
        self.point.is_none()
    }
}

/// Remote cursors seen by one client.
#[derive(Debug)]
pub struct RemotePresence {
    local_id: ClientId,
    peers: HashMap<ClientId, RemotePresenceEntry>,
}

impl RemotePresence {
    pub fn new(local_id: ClientId) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
        }
    }

    /// Fold one cursor frame into the table.
    pub fn handle_message(&mut self, msg: &CursorMessage) -> PresenceChange {
        if msg.client_id == self.local_id {
            return PresenceChange::Ignored;
        }

        let update = match msg.update() {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Dropping cursor frame from {}: {e}", msg.client_id);
                return PresenceChange::Ignored;
            }
        };

        match update {
            CursorUpdate::Removed => match self.peers.remove(&msg.client_id) {
                Some(_) => PresenceChange::Left(msg.client_id.clone()),
                None => PresenceChange::Ignored,
            },
            CursorUpdate::Moved {
                position,
                client_info,
            } => {
                let now = Instant::now();
                match self.peers.get_mut(&msg.client_id) {
                    Some(peer) => {
                        let renamed = peer.client_info.name != client_info.name;
                        peer.position = position;
                        peer.client_info = client_info;
                        peer.last_seen = now;
                        if renamed {
                            PresenceChange::Renamed {
                                client_id: msg.client_id.clone(),
                                name: peer.client_info.name.clone(),
                            }
                        } else {
                            PresenceChange::Moved(msg.client_id.clone())
                        }
                    }
                    None => {
                        self.peers.insert(
                            msg.client_id.clone(),
                            RemotePresenceEntry {
                                client_id: msg.client_id.clone(),
                                position,
                                client_info,
                                last_seen: now,
                            },
                        );
                        PresenceChange::Joined(msg.client_id.clone())
                    }
                }
            }
        }
    }

    /// Map every peer through the surface geometry, ordered by client id.
    pub fn screen_positions<G: SurfaceGeometry + ?Sized>(&self, geometry: &G) -> Vec<RemoteCursorView> {
        let mut views: Vec<RemoteCursorView> = self
            .peers
            .values()
            .map(|peer| RemoteCursorView {
                client_id: peer.client_id.clone(),
                client_info: peer.client_info.clone(),
                point: to_screen_coordinates(peer.position, geometry),
            })
            .collect();
        views.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        views
    }

    /// Drop peers not heard from within `timeout`. Returns the dropped ids.
    pub fn prune_idle(&mut self, timeout: Duration) -> Vec<ClientId> {
        let now = Instant::now();
        let stale: Vec<ClientId> = self
            .peers
            .values()
            .filter(|p| now.duration_since(p.last_seen) > timeout)
            .map(|p| p.client_id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    /// Forget everyone, e.g. after the cursor channel reconnects.
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn peer(&self, client_id: &ClientId) -> Option<&RemotePresenceEntry> {
        self.peers.get(client_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_id(&self) -> &ClientId {
        &self.local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Rect;
    use uuid::Uuid;

    fn moved(id: &str, block: usize, name: &str) -> CursorMessage {
        CursorMessage::position(
            ClientId::new(id),
            CursorPosition::new(block, 0),
            ClientInfo::new(name, "#FF6B6B"),
        )
    }

    #[test]
    fn test_registry_upsert_and_remove() {
        let mut registry = PresenceRegistry::new();
        let conn = Uuid::new_v4();
        let id = ClientId::new("a");

        assert!(registry.upsert(id.clone(), conn, CursorPosition::new(0, 1), ClientInfo::new("A", "#fff")));
        assert!(!registry.upsert(id.clone(), conn, CursorPosition::new(2, 0), ClientInfo::new("A", "#fff")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id).unwrap().position, CursorPosition::new(2, 0));

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_remove_connection_only_owned() {
        let mut registry = PresenceRegistry::new();
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        let info = ClientInfo::new("x", "#fff");
        registry.upsert(ClientId::new("a1"), conn_a, CursorPosition::new(0, 0), info.clone());
        registry.upsert(ClientId::new("a2"), conn_a, CursorPosition::new(0, 0), info.clone());
        registry.upsert(ClientId::new("b"), conn_b, CursorPosition::new(0, 0), info);

        let mut removed = registry.remove_connection(conn_a);
        removed.sort();
        assert_eq!(removed, vec![ClientId::new("a1"), ClientId::new("a2")]);
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_connection(conn_a).is_empty());
    }

    #[test]
    fn test_remote_presence_lifecycle() {
        let mut presence = RemotePresence::new(ClientId::new("me"));

        assert_eq!(presence.handle_message(&moved("p", 1, "Pat")), PresenceChange::Joined(ClientId::new("p")));
        assert_eq!(presence.handle_message(&moved("p", 2, "Pat")), PresenceChange::Moved(ClientId::new("p")));
        assert_eq!(
            presence.handle_message(&moved("p", 2, "Patricia")),
            PresenceChange::Renamed {
                client_id: ClientId::new("p"),
                name: "Patricia".into()
            }
        );
        assert_eq!(presence.peer(&ClientId::new("p")).unwrap().position.block_index, 2);

        let remove = CursorMessage::remove(ClientId::new("p"));
        assert_eq!(presence.handle_message(&remove), PresenceChange::Left(ClientId::new("p")));
        assert_eq!(presence.handle_message(&remove), PresenceChange::Ignored);
        assert_eq!(presence.peer_count(), 0);
    }

    #[test]
    fn test_remote_presence_ignores_self() {
        let mut presence = RemotePresence::new(ClientId::new("me"));
        assert_eq!(presence.handle_message(&moved("me", 0, "Me")), PresenceChange::Ignored);
        assert_eq!(presence.peer_count(), 0);
    }

    struct TwoBlocks;

    impl SurfaceGeometry for TwoBlocks {
        fn origin(&self) -> Rect {
            Rect::new(0.0, 0.0, 800.0, 600.0)
        }
        fn block_rect(&self, i: usize) -> Option<Rect> {
            (i < 2).then(|| Rect::new(0.0, i as f32 * 40.0, 800.0, 40.0))
        }
        fn content_rect(&self, i: usize) -> Option<Rect> {
            self.block_rect(i)
        }
        fn text_len(&self, _: usize) -> usize {
            0
        }
        fn caret_rect(&self, _: usize, _: usize) -> Option<Rect> {
            None
        }
    }

    #[test]
    fn test_screen_positions_hide_missing_blocks() {
        let mut presence = RemotePresence::new(ClientId::new("me"));
        presence.handle_message(&moved("a", 1, "A"));
        presence.handle_message(&moved("b", 5, "B"));

        let views = presence.screen_positions(&TwoBlocks);
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].client_id, ClientId::new("a"));
        assert_eq!(views[0].point.unwrap().y, 40.0);
        assert!(views[1].is_hidden());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_idle() {
        let mut presence = RemotePresence::new(ClientId::new("me"));
        presence.handle_message(&moved("old", 0, "Old"));
        tokio::time::advance(Duration::from_secs(20)).await;
        presence.handle_message(&moved("new", 0, "New"));
        tokio::time::advance(Duration::from_secs(15)).await;

        let pruned = presence.prune_idle(Duration::from_secs(30));
        assert_eq!(pruned, vec![ClientId::new("old")]);
        assert!(presence.peer(&ClientId::new("new")).is_some());
    }
}
