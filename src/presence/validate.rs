use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::error::Rejection;

use super::record::{Avatar, Coordinates, UserRecord};

pub const USERNAME_LEN: std::ops::RangeInclusive<usize> = 3..=20;
pub const AVATAR_MAX_BYTES: usize = 1024 * 1024;
pub const AVATAR_TYPES: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];
pub const MESSAGE_MAX_CHARS: usize = 500;

pub fn validate_username(username: &str) -> Result<(), Rejection> {
    let shaped = USERNAME_LEN.contains(&username.chars().count())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');

    if shaped { Ok(()) } else { Err(Rejection::InvalidUsername) }
}

/// Case-insensitive match against every current record.
pub fn username_taken<'a>(
    username: &str,
    records: impl IntoIterator<Item = &'a UserRecord>,
) -> bool {
    records
        .into_iter()
        .any(|record| record.username.eq_ignore_ascii_case(username))
}

pub fn validate_avatar(file: &serde_json::Value) -> Result<Avatar, Rejection> {
    let (Some(content_type), Some(data)) = (
        file.get("type").and_then(serde_json::Value::as_str),
        file.get("data").and_then(serde_json::Value::as_str),
    ) else {
        return Err(Rejection::InvalidAvatar("must be an object with string type and data"));
    };

    if !AVATAR_TYPES.contains(&content_type) {
        return Err(Rejection::InvalidAvatar("must be a png, jpeg, gif or webp image"));
    }

    // refuse to decode anything that cannot fit
    let too_big = Rejection::InvalidAvatar("must be at most 1 MiB");
    if data.len() > AVATAR_MAX_BYTES.div_ceil(3) * 4 {
        return Err(too_big);
    }

    let bytes = BASE64
        .decode(data.as_bytes())
        .map_err(|_| Rejection::InvalidAvatar("data is not valid base64"))?;
    if bytes.len() > AVATAR_MAX_BYTES {
        return Err(too_big);
    }

    Ok(Avatar {
        content_type: content_type.to_owned(),
        bytes: bytes.into(),
    })
}

pub fn validate_coordinates(value: &serde_json::Value) -> Result<Coordinates, Rejection> {
    let Some([longitude, latitude]) = value.as_array().map(Vec::as_slice) else {
        return Err(Rejection::InvalidCoordinates);
    };

    match (longitude.as_f64(), latitude.as_f64()) {
        (Some(longitude), Some(latitude)) if longitude.is_finite() && latitude.is_finite() => {
            Ok(Coordinates { longitude, latitude })
        }
        _ => Err(Rejection::InvalidCoordinates),
    }
}

pub fn validate_message_body(body: &str) -> Result<(), Rejection> {
    if body.is_empty() || body.chars().count() > MESSAGE_MAX_CHARS {
        return Err(Rejection::InvalidMessage);
    }
    Ok(())
}
