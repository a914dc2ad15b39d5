//! Wire protocol — JSON text frames exchanged with whiteboard clients.
//!
//! DESIGN
//! ======
//! Inbound frames are routed on their `type` field. Frames with a fixed
//! shape deserialize into the typed payloads below; cursor frames stay an
//! untyped map because the server relays them verbatim (plus stamped
//! fields). Outbound frames are built here so every handler emits the
//! same shapes.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::services::room::DrawingObject;

// =============================================================================
// INBOUND PAYLOADS
// =============================================================================

/// First frame on every connection: `{"type":"authenticate","token":...}`.
/// `token` is absent for first-time clients.
#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// `object` payload of an `objectAdded` frame.
#[derive(Debug, Deserialize)]
pub struct ObjectAddedPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Map<String, Value>,
    #[serde(rename = "zIndex")]
    pub z_index: i64,
}

/// `object` payload of an `objectUpdated` frame. The object's type is
/// never taken from the client here; it comes from the stored object.
#[derive(Debug, Deserialize)]
pub struct ObjectUpdatedPayload {
    pub id: String,
    pub data: Map<String, Value>,
}

// =============================================================================
// OUTBOUND FRAMES
// =============================================================================

/// Handshake reply carrying the (possibly fresh) identity.
pub fn authenticated_frame(user_id: &str, token: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&json!({
        "type": "authenticated",
        "userId": user_id,
        "token": token,
    }))
}

/// One-shot room snapshot delivered on join, before any live broadcast.
pub fn sync_frame(objects: &[DrawingObject]) -> Result<String, serde_json::Error> {
    serde_json::to_string(&json!({
        "type": "sync",
        "objects": objects,
    }))
}

/// Join confirmation with the room-local color.
pub fn room_joined_frame(color: &str, room: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&json!({
        "type": "room_joined",
        "color": color,
        "room": room,
    }))
}

/// Reply to `getUserId`.
pub fn user_id_frame(user_id: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&json!({
        "type": "userId",
        "userId": user_id,
    }))
}

// =============================================================================
// TESTS
// =============================================================================
