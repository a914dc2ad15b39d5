//! Rooms — shared whiteboard state and fan-out.
//!
//! DESIGN
//! ======
//! A `Room` is the unit of collaboration: live connections, the object
//! map, and per-user colors behind one `RwLock`. Mutations hold the
//! write lock for the minimum span and hand back the peer snapshot for
//! their fan-out; delivery itself runs lock-free through each peer's
//! bounded channel. The `RoomRegistry` owns every room and is the only
//! place rooms are created or deleted.
//!
//! ORDERING
//! ========
//! `join` registers the connection and snapshots the object map in one
//! critical section, and every object mutation captures its peer
//! snapshot in the same critical section that commits the change. An
//! edit committed before a join is in the joiner's sync and its fan-out
//! cannot see the joiner; an edit committed after lands in the joiner's
//! channel. A joiner therefore never misses an edit and never sees one
//! twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Utf8Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::color::ColorGenerator;
use crate::config::GlobalConfig;

/// Rooms idle and empty for longer than this are swept.
const ROOM_IDLE_TTL: Duration = Duration::from_secs(3600);
/// Rooms older than this are swept regardless of activity.
const ROOM_MAX_AGE: Duration = Duration::from_secs(24 * 3600);
/// Outbound frame queue per connection. A slow client loses frames
/// rather than stalling the room.
pub const CLIENT_CHANNEL_CAPACITY: usize = 256;

/// Sender half of a connection's outbound frame queue. The receiving
/// task owns the socket, so all writes to one socket are serialized.
pub type ClientSender = mpsc::Sender<Utf8Bytes>;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room is full")]
    RoomFull,
    #[error("server at maximum room capacity")]
    ServerAtCapacity,
    #[error("room code missing")]
    MissingRoomCode,
}

/// A single shape on the whiteboard. `data` is the validated, sanitized
/// attribute bag; its schema is fixed by `kind` at creation time.
#[derive(Debug, Clone, Serialize)]
pub struct DrawingObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Map<String, Value>,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "zIndex")]
    pub z_index: i64,
}

/// What a joiner needs before its first live frame: the room-local color
/// and the object snapshot taken inside the join critical section.
#[derive(Debug)]
pub struct JoinSnapshot {
    pub color: String,
    pub objects: Vec<DrawingObject>,
}

struct RoomInner {
    connections: HashMap<String, ClientSender>,
    objects: HashMap<String, DrawingObject>,
    user_colors: HashMap<String, String>,
    colors: ColorGenerator,
    last_active: Instant,
}

impl RoomInner {
    /// Defensive copy of the connection set, taken while the caller
    /// holds the room lock.
    fn connection_snapshot(&self) -> Vec<(String, ClientSender)> {
        self.connections
            .iter()
            .map(|(user_id, sender)| (user_id.clone(), sender.clone()))
            .collect()
    }
}

/// One collaborative whiteboard room.
pub struct Room {
    created_at: Instant,
    inner: RwLock<RoomInner>,
}

impl Room {
    #[must_use]
    pub fn new() -> Self {
        Self::new_at(Instant::now())
    }

    fn new_at(now: Instant) -> Self {
        Self {
            created_at: now,
            inner: RwLock::new(RoomInner {
                connections: HashMap::new(),
                objects: HashMap::new(),
                user_colors: HashMap::new(),
                colors: ColorGenerator::new(),
                last_active: now,
            }),
        }
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    /// Add a user to the room, assigning a color on first join, and
    /// return the object snapshot for the sync frame. A rejoin for the
    /// same user replaces the previous connection and keeps its color.
    ///
    /// # Errors
    ///
    /// Returns `RoomFull` when the room is at capacity and the user is
    /// not already a member.
    pub async fn join(
        &self,
        user_id: &str,
        sender: ClientSender,
        max_room_size: usize,
    ) -> Result<JoinSnapshot, RoomError> {
        self.join_at(user_id, sender, max_room_size, Instant::now()).await
    }

    async fn join_at(
        &self,
        user_id: &str,
        sender: ClientSender,
        max_room_size: usize,
        now: Instant,
    ) -> Result<JoinSnapshot, RoomError> {
        let mut inner = self.inner.write().await;

        // Capacity check and insert share the critical section so the
        // cap is never exceeded under concurrent joins. Rejoins replace
        // the existing entry and do not count against the cap.
        if !inner.connections.contains_key(user_id) && inner.connections.len() >= max_room_size {
            return Err(RoomError::RoomFull);
        }
        inner.connections.insert(user_id.to_string(), sender);

        if !inner.user_colors.contains_key(user_id) {
            let color = inner.colors.next_color();
            inner.user_colors.insert(user_id.to_string(), color);
        }
        inner.last_active = now;

        let color = inner
            .user_colors
            .get(user_id)
            .cloned()
            .unwrap_or_default();
        let objects: Vec<DrawingObject> = inner.objects.values().cloned().collect();

        Ok(JoinSnapshot { color, objects })
    }

    /// Remove a user's connection. Colors persist so a returning user
    /// gets the same one back.
    ///
    /// The caller proves ownership with its own sender: if the stored
    /// entry is a different channel, the user has already been
    /// superseded by a reconnect and the entry is left alone, so a
    /// stale task tearing down late cannot evict its successor.
    pub async fn leave(&self, user_id: &str, sender: &ClientSender) {
        let mut inner = self.inner.write().await;
        if inner
            .connections
            .get(user_id)
            .is_some_and(|stored| stored.same_channel(sender))
        {
            inner.connections.remove(user_id);
        }
        inner.last_active = Instant::now();
    }

    /// Drop a connection after a delivery failure. Ownership is checked
    /// the same way as `leave`: only the exact channel that failed is
    /// removed, never a reconnected successor under the same user id.
    pub async fn remove_connection(&self, user_id: &str, sender: &ClientSender) {
        let mut inner = self.inner.write().await;
        if inner
            .connections
            .get(user_id)
            .is_some_and(|stored| stored.same_channel(sender))
        {
            inner.connections.remove(user_id);
            inner.last_active = Instant::now();
            warn!(%user_id, "removed dead connection from room");
        }
    }

    /// Defensive copy of the connection set for lock-free fan-out.
    pub async fn connections(&self) -> Vec<(String, ClientSender)> {
        self.inner.read().await.connection_snapshot()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Room-local color assigned at first join, if any.
    pub async fn user_color(&self, user_id: &str) -> Option<String> {
        self.inner.read().await.user_colors.get(user_id).cloned()
    }

    // =========================================================================
    // OBJECTS
    // =========================================================================

    /// Insert an object and return the peer snapshot for its fan-out.
    ///
    /// The snapshot is taken in the same critical section that commits
    /// the insert: a user joining after this point finds the object in
    /// its sync and is absent from the returned peers, so it can never
    /// receive the object twice.
    #[must_use = "fan the mutation out to the returned peers"]
    pub async fn add_object(&self, object: DrawingObject) -> Vec<(String, ClientSender)> {
        let mut inner = self.inner.write().await;
        inner.objects.insert(object.id.clone(), object);
        inner.last_active = Instant::now();
        inner.connection_snapshot()
    }

    /// Replace an object's data wholesale. Unknown ids are a no-op;
    /// returns whether the object existed, plus the peer snapshot taken
    /// with the mutation.
    pub async fn update_object(
        &self,
        id: &str,
        data: Map<String, Value>,
    ) -> (bool, Vec<(String, ClientSender)>) {
        let mut inner = self.inner.write().await;
        inner.last_active = Instant::now();
        let existed = match inner.objects.get_mut(id) {
            Some(object) => {
                object.data = data;
                true
            }
            None => false,
        };
        (existed, inner.connection_snapshot())
    }

    /// Remove an object. Deleting a missing id is permitted. Returns the
    /// peer snapshot taken with the mutation.
    #[must_use = "fan the mutation out to the returned peers"]
    pub async fn delete_object(&self, id: &str) -> Vec<(String, ClientSender)> {
        let mut inner = self.inner.write().await;
        inner.objects.remove(id);
        inner.last_active = Instant::now();
        inner.connection_snapshot()
    }

    /// Cloned snapshot of one object.
    pub async fn get_object(&self, id: &str) -> Option<DrawingObject> {
        self.inner.read().await.objects.get(id).cloned()
    }

    pub async fn object_count(&self) -> usize {
        self.inner.read().await.objects.len()
    }

    // =========================================================================
    // FAN-OUT
    // =========================================================================

    /// Fan a serialized frame out to a previously captured connection
    /// snapshot, skipping `exclude`. Delivery is best-effort: a full
    /// queue drops the frame for that peer, a closed queue evicts the
    /// failed connection from the room.
    ///
    /// Mutation handlers pass the snapshot their mutation returned so
    /// the peer set is exactly the membership at commit time.
    pub async fn deliver(
        &self,
        peers: Vec<(String, ClientSender)>,
        payload: &Utf8Bytes,
        exclude: Option<&str>,
    ) {
        let mut failed = Vec::new();
        for (user_id, sender) in peers {
            if exclude == Some(user_id.as_str()) {
                continue;
            }
            match sender.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(%user_id, "client queue full; dropping frame");
                }
                Err(TrySendError::Closed(_)) => failed.push((user_id, sender)),
            }
        }

        for (user_id, sender) in failed {
            self.remove_connection(&user_id, &sender).await;
        }
    }

    /// Send a serialized frame to the current connection set except
    /// `exclude`. For traffic with no state mutation to anchor to
    /// (cursors); object mutations use `deliver` with the snapshot
    /// their mutation returned.
    pub async fn broadcast(&self, payload: &Utf8Bytes, exclude: Option<&str>) {
        let peers = self.connections().await;
        self.deliver(peers, payload, exclude).await;
    }

    // =========================================================================
    // EXPIRY
    // =========================================================================

    fn is_expired_at(&self, now: Instant, inner: &RoomInner) -> bool {
        let empty = inner.connections.is_empty();
        let idle = now.saturating_duration_since(inner.last_active) > ROOM_IDLE_TTL;
        let aged = now.saturating_duration_since(self.created_at) > ROOM_MAX_AGE;
        (idle && empty) || aged
    }
}

impl Default for Room {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Owner of every room, keyed by room code.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { rooms: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Join an existing room or create it first, atomically under the
    /// registry lock so the global room cap holds under concurrent
    /// creates.
    ///
    /// # Errors
    ///
    /// `ServerAtCapacity` when a create would exceed the room cap,
    /// `RoomFull` when the target room is at its connection cap.
    pub async fn get_or_join(
        &self,
        code: &str,
        user_id: &str,
        sender: ClientSender,
        config: &GlobalConfig,
    ) -> Result<(Arc<Room>, JoinSnapshot), RoomError> {
        if code.is_empty() {
            return Err(RoomError::MissingRoomCode);
        }

        let mut rooms = self.rooms.write().await;

        let room = match rooms.get(code) {
            Some(room) => room.clone(),
            None => {
                if rooms.len() >= config.max_rooms {
                    return Err(RoomError::ServerAtCapacity);
                }
                let room = Arc::new(Room::new());
                rooms.insert(code.to_string(), room.clone());
                info!(%code, total = rooms.len(), "room created");
                room
            }
        };

        let snapshot = room.join(user_id, sender, config.max_room_size).await?;
        Ok((room, snapshot))
    }

    /// Read-only lookup.
    pub async fn get(&self, code: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(code).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Remove expired rooms. Each room's state is sampled briefly under
    /// its read lock while the registry lock is held. Returns how many
    /// rooms were removed.
    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now()).await
    }

    async fn cleanup_at(&self, now: Instant) -> usize {
        let mut rooms = self.rooms.write().await;

        let mut expired = Vec::new();
        for (code, room) in rooms.iter() {
            let inner = room.inner.read().await;
            if room.is_expired_at(now, &inner) {
                expired.push(code.clone());
            }
        }

        for code in &expired {
            rooms.remove(code);
            info!(%code, "room removed");
        }
        expired.len()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
