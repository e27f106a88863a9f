mod hub;
mod lifecycle;
mod protocol;
mod record;
mod registry;
mod validate;
mod ws;

use axum::{routing::get, Router};

use crate::AppState;

pub use hub::{ConnectionId, Hub};
pub use lifecycle::{Connection, ConnectionState, Presence};
pub use protocol::{ClientEvent, JoinPayload, SendMessagePayload, ServerEvent};
pub use record::{Avatar, Coordinates, Snapshot, UserId, UserRecord};
pub use registry::{Admission, Registry, RegistryView};
pub use validate::{
    AVATAR_MAX_BYTES, AVATAR_TYPES, MESSAGE_MAX_CHARS, USERNAME_LEN, username_taken,
    validate_avatar, validate_coordinates, validate_message_body, validate_username,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::presence_ws))
}
