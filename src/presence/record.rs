use std::sync::Arc;

use axum::body::Bytes;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{ser::SerializeStruct, Serialize, Serializer};
use time::OffsetDateTime;
use uuid::Uuid;

pub type UserId = Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct Avatar {
    pub content_type: String,
    pub bytes: Bytes,
}

/// `[longitude, latitude]`, both finite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub longitude: f64,
    pub latitude: f64,
}

impl Serialize for Coordinates {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.longitude, self.latitude].serialize(serializer)
    }
}

/// One online identity. Never mutated once it is in the registry.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: UserId,
    pub username: String,
    pub avatar: Avatar,
    pub coordinates: Coordinates,
    pub joined_at: OffsetDateTime,
}

#[derive(Serialize)]
struct AvatarJson<'a> {
    #[serde(rename = "type")]
    content_type: &'a str,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Properties<'a> {
    user_id: &'a UserId,
    username: &'a str,
    avatar: AvatarJson<'a>,
    #[serde(with = "time::serde::rfc3339")]
    joined_at: OffsetDateTime,
}

#[derive(Serialize)]
struct Point<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    coordinates: &'a Coordinates,
}

#[derive(Serialize)]
struct Feature<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    properties: Properties<'a>,
    geometry: Point<'a>,
}

// A record goes over the wire as a GeoJSON Feature.
impl Serialize for UserRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Feature {
            kind: "Feature",
            properties: Properties {
                user_id: &self.user_id,
                username: &self.username,
                avatar: AvatarJson {
                    content_type: &self.avatar.content_type,
                    data: BASE64.encode(&self.avatar.bytes),
                },
                joined_at: self.joined_at,
            },
            geometry: Point {
                kind: "Point",
                coordinates: &self.coordinates,
            },
        }
        .serialize(serializer)
    }
}

/// Point-in-time copy of the registry, most recent join first.
#[derive(Debug, Clone)]
pub struct Snapshot {
    users: Arc<[Arc<UserRecord>]>,
}

impl Snapshot {
    pub(crate) fn new(users: Vec<Arc<UserRecord>>) -> Self {
        Self { users: users.into() }
    }

    pub fn users(&self) -> &[Arc<UserRecord>] {
        &self.users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn usernames(&self) -> Vec<&str> {
        self.users.iter().map(|user| user.username.as_str()).collect()
    }
}

struct Features<'a>(&'a [Arc<UserRecord>]);

impl Serialize for Features<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(Arc::as_ref))
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut collection = serializer.serialize_struct("FeatureCollection", 2)?;
        collection.serialize_field("type", "FeatureCollection")?;
        collection.serialize_field("features", &Features(&self.users))?;
        collection.end()
    }
}
