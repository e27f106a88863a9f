use axum::extract::ws::Message;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Rejection;

use super::record::{Snapshot, UserId, UserRecord};

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Fields stay loose so a bad shape is reported by the matching validator,
/// in admission order, instead of as `bad_request`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(default)]
    pub username: serde_json::Value,
    /// `{"type": <mime>, "data": <base64>}`
    #[serde(default)]
    pub avatar_file: serde_json::Value,
    #[serde(default)]
    pub coordinates: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub recipient_id: String,
    pub body: String,
}

#[derive(Debug)]
pub enum ClientEvent {
    Join(JoinPayload),
    SendMessage(SendMessagePayload),
    Init,
    Exit,
}

impl ClientEvent {
    pub fn parse(frame: &str) -> Result<Self, Rejection> {
        let RawFrame { event, data } = serde_json::from_str(frame).map_err(bad_request)?;

        match event.as_str() {
            "join" => Ok(Self::Join(payload(data)?)),
            "send_message" => Ok(Self::SendMessage(payload(data)?)),
            "init" => Ok(Self::Init),
            "exit" => Ok(Self::Exit),
            other => Err(Rejection::BadRequest(format!("unknown event {other}"))),
        }
    }
}

fn payload<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, Rejection> {
    serde_json::from_value(data).map_err(bad_request)
}

fn bad_request(err: serde_json::Error) -> Rejection {
    Rejection::BadRequest(err.to_string())
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent<'a> {
    Admitted(&'a UserRecord),
    UpdateUsers(&'a Snapshot),
    Init(&'a Snapshot),
    #[serde(rename_all = "camelCase")]
    ReceiveMessage { sender_id: UserId, body: &'a str },
}

#[derive(Serialize)]
struct RejectionFrame<'a> {
    event: &'static str,
    data: RejectionData<'a>,
}

#[derive(Serialize)]
struct RejectionData<'a> {
    message: &'a str,
}

impl ServerEvent<'_> {
    pub fn to_message(&self) -> Option<Message> {
        encode(self)
    }
}

pub fn rejection_message(rejection: &Rejection) -> Option<Message> {
    encode(&RejectionFrame {
        event: rejection.event_name(),
        data: RejectionData {
            message: &rejection.to_string(),
        },
    })
}

fn encode<T: Serialize>(event: &T) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode outbound event");
            None
        }
    }
}
