use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("username must be 3-20 characters of letters, digits or underscore")]
    InvalidUsername,

    #[error("username {0} is already taken")]
    UsernameTaken(String),

    #[error("avatar {0}")]
    InvalidAvatar(&'static str),

    #[error("coordinates must be [longitude, latitude] as two finite numbers")]
    InvalidCoordinates,

    #[error("message must be 1-500 characters")]
    InvalidMessage,

    #[error("this connection has already joined")]
    AlreadyBound,

    #[error("join before sending messages")]
    NotBound,

    #[error("malformed event: {0}")]
    BadRequest(String),
}

impl Rejection {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::InvalidUsername => "username_invalid",
            Self::UsernameTaken(_) => "username_taken",
            Self::InvalidAvatar(_) => "avatar_invalid",
            Self::InvalidCoordinates => "coordinates_invalid",
            Self::InvalidMessage => "message_invalid",
            Self::AlreadyBound => "already_joined",
            Self::NotBound => "not_joined",
            Self::BadRequest(_) => "bad_request",
        }
    }
}
