use std::{num::NonZeroUsize, ops::ControlFlow, sync::Arc};

use axum::extract::ws::Message;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Rejection;

use super::hub::{ConnectionId, Hub};
use super::protocol::{self, ClientEvent, JoinPayload, SendMessagePayload, ServerEvent};
use super::record::{Snapshot, UserId, UserRecord};
use super::registry::Registry;
use super::validate;

/// Close code sent to users pushed out by the capacity limit (policy violation).
const CLOSE_EVICTED: u16 = 1008;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unbound,
    Bound(UserId),
    Closed,
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self.state {
            ConnectionState::Bound(user_id) => Some(user_id),
            _ => None,
        }
    }
}

struct Shared {
    registry: Registry,
    hub: Hub,
    // held only while queueing a snapshot round
    fanout: Mutex<()>,
}

#[derive(Clone)]
pub struct Presence(Arc<Shared>);

impl Default for Presence {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Presence {
    pub fn new(max_online_users: Option<NonZeroUsize>) -> Self {
        Self(Arc::new(Shared {
            registry: Registry::new(max_online_users),
            hub: Hub::default(),
            fanout: Mutex::new(()),
        }))
    }

    pub fn registry(&self) -> &Registry {
        &self.0.registry
    }

    pub fn hub(&self) -> &Hub {
        &self.0.hub
    }

    pub fn online_users(&self) -> usize {
        self.0.registry.len()
    }

    pub fn connect(&self) -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (id, rx) = self.0.hub.register();
        (
            Connection {
                id,
                state: ConnectionState::Unbound,
            },
            rx,
        )
    }

    pub fn handle_frame(&self, conn: &mut Connection, frame: &str) -> ControlFlow<()> {
        match ClientEvent::parse(frame) {
            Ok(event) => self.handle(conn, event),
            Err(rejection) => {
                self.reject(conn, &rejection);
                ControlFlow::Continue(())
            }
        }
    }

    pub fn handle(&self, conn: &mut Connection, event: ClientEvent) -> ControlFlow<()> {
        if conn.state == ConnectionState::Closed {
            return ControlFlow::Break(());
        }

        let result = match event {
            ClientEvent::Join(payload) => self.join(conn, payload).map(drop),
            ClientEvent::SendMessage(payload) => self.send_message(conn, payload).map(drop),
            ClientEvent::Init => {
                self.init(conn);
                Ok(())
            }
            ClientEvent::Exit => {
                tracing::info!(conn = conn.id, "client exit");
                self.disconnect(conn);
                return ControlFlow::Break(());
            }
        };

        if let Err(rejection) = result {
            self.reject(conn, &rejection);
        }
        ControlFlow::Continue(())
    }

    /// `Unbound -> Bound`. Checks run in a fixed order and nothing is stored
    /// until all of them pass; uniqueness is checked again under the registry
    /// lock at insert time.
    pub fn join(&self, conn: &mut Connection, payload: JoinPayload) -> Result<Arc<UserRecord>, Rejection> {
        match conn.state {
            ConnectionState::Unbound => {}
            ConnectionState::Bound(_) => return Err(Rejection::AlreadyBound),
            ConnectionState::Closed => return Err(Rejection::NotBound),
        }

        let JoinPayload {
            username,
            avatar_file,
            coordinates,
        } = payload;

        let username = username
            .as_str()
            .map(str::to_owned)
            .ok_or(Rejection::InvalidUsername)?;
        validate::validate_username(&username)?;
        if self.0.registry.is_username_taken(&username) {
            return Err(Rejection::UsernameTaken(username));
        }
        let avatar = validate::validate_avatar(&avatar_file)?;
        let coordinates = validate::validate_coordinates(&coordinates)?;

        let record = UserRecord {
            user_id: Uuid::now_v7(),
            username: username.clone(),
            avatar,
            coordinates,
            joined_at: OffsetDateTime::now_utc(),
        };

        let Some(admission) = self
            .0
            .registry
            .try_insert(record, |view| !validate::username_taken(&username, view.records()))
        else {
            tracing::debug!(conn = conn.id, username = %username, "lost username race");
            return Err(Rejection::UsernameTaken(username));
        };

        let user = admission.record;
        self.0.hub.bind(conn.id, user.user_id);
        conn.state = ConnectionState::Bound(user.user_id);

        tracing::info!(
            conn = conn.id,
            user_id = %user.user_id,
            username = %user.username,
            online = self.0.registry.len(),
            "user joined"
        );

        self.send(conn.id, &ServerEvent::Admitted(&user));

        for gone in &admission.evicted {
            tracing::info!(user_id = %gone.user_id, username = %gone.username, "user evicted, server full");
            self.0.hub.close_user(&gone.user_id, CLOSE_EVICTED, "server is full");
        }

        self.broadcast_users();
        Ok(user)
    }

    /// Best-effort private delivery. Returns whether a recipient was found;
    /// a missing recipient is not an error.
    pub fn send_message(&self, conn: &Connection, payload: SendMessagePayload) -> Result<bool, Rejection> {
        let ConnectionState::Bound(sender_id) = conn.state else {
            return Err(Rejection::NotBound);
        };
        // evicted, waiting for its close
        if !self.0.registry.contains(&sender_id) {
            return Err(Rejection::NotBound);
        }
        validate::validate_message_body(&payload.body)?;

        let target = Uuid::parse_str(&payload.recipient_id)
            .ok()
            .filter(|recipient| self.0.registry.contains(recipient))
            .and_then(|recipient| self.0.hub.route(&recipient));

        let Some(target) = target else {
            tracing::debug!(
                conn = conn.id,
                recipient = %payload.recipient_id,
                "recipient offline, message dropped"
            );
            return Ok(false);
        };

        Ok(self.send(
            target,
            &ServerEvent::ReceiveMessage {
                sender_id,
                body: &payload.body,
            },
        ))
    }

    pub fn init(&self, conn: &Connection) {
        let _round = self.0.fanout.lock();
        let snapshot = self.0.registry.snapshot();
        self.send(conn.id, &ServerEvent::Init(&snapshot));
    }

    /// `* -> Closed`. Safe to call more than once; only a removal that actually
    /// deleted a record triggers a broadcast.
    pub fn disconnect(&self, conn: &mut Connection) -> bool {
        let previous = std::mem::replace(&mut conn.state, ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return false;
        }

        self.0.hub.unregister(conn.id);

        let ConnectionState::Bound(user_id) = previous else {
            tracing::debug!(conn = conn.id, "unbound connection closed");
            return false;
        };
        let Some(user) = self.0.registry.remove(&user_id) else {
            return false;
        };

        tracing::info!(
            conn = conn.id,
            user_id = %user.user_id,
            username = %user.username,
            online = self.0.registry.len(),
            "user left"
        );
        self.broadcast_users();
        true
    }

    pub fn broadcast_users(&self) -> Snapshot {
        let _round = self.0.fanout.lock();
        let snapshot = self.0.registry.snapshot();

        if let Some(msg) = ServerEvent::UpdateUsers(&snapshot).to_message() {
            let reached = self.0.hub.broadcast(&msg);
            tracing::debug!(users = snapshot.len(), connections = reached, "broadcast update_users");
        }
        snapshot
    }

    fn send(&self, id: ConnectionId, event: &ServerEvent<'_>) -> bool {
        event
            .to_message()
            .is_some_and(|msg| self.0.hub.send_to(id, msg))
    }

    fn reject(&self, conn: &Connection, rejection: &Rejection) {
        tracing::debug!(conn = conn.id, reason = rejection.event_name(), "rejected: {rejection}");
        if let Some(msg) = protocol::rejection_message(rejection) {
            self.0.hub.send_to(conn.id, msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde_json::{json, Value};

    use super::*;

    fn join_frame(username: &str, coordinates: Value) -> String {
        json!({
            "event": "join",
            "data": {
                "username": username,
                "avatarFile": { "type": "image/png", "data": BASE64.encode(b"\x89PNG") },
                "coordinates": coordinates,
            }
        })
        .to_string()
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Text(text) = msg {
                events.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        events
    }

    fn names(event: &Value) -> Vec<&str> {
        event["data"]["features"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["properties"]["username"].as_str().unwrap())
            .collect()
    }

    fn joined(presence: &Presence, username: &str) -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (mut conn, mut rx) = presence.connect();
        let flow = presence.handle_frame(&mut conn, &join_frame(username, json!([1.0, 2.0])));
        assert_eq!(flow, ControlFlow::Continue(()));
        assert!(conn.user_id().is_some(), "{username} was not admitted");
        events(&mut rx);
        (conn, rx)
    }

    #[test]
    fn join_admits_then_broadcasts() {
        let presence = Presence::default();
        let (mut watcher, mut watcher_rx) = presence.connect();
        let (mut conn, mut rx) = presence.connect();

        presence.handle_frame(&mut conn, &join_frame("bob", json!([69.2, 41.3])));

        let own = events(&mut rx);
        assert_eq!(own.len(), 2);
        assert_eq!(own[0]["event"], "admitted");
        assert_eq!(own[0]["data"]["properties"]["username"], "bob");
        assert_eq!(own[0]["data"]["geometry"]["coordinates"], json!([69.2, 41.3]));
        assert_eq!(own[1]["event"], "update_users");
        assert_eq!(names(&own[1]), ["bob"]);

        // unbound connections still get the broadcast
        let seen = events(&mut watcher_rx);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], own[1]);
        assert!(matches!(conn.state(), ConnectionState::Bound(_)));
        assert!(presence.disconnect(&mut conn));
        assert!(!presence.disconnect(&mut watcher));
    }

    #[test]
    fn invalid_username_is_rejected_without_side_effects() {
        let presence = Presence::default();
        let (_bob, mut bob_rx) = joined(&presence, "bob");
        let (mut conn, mut rx) = presence.connect();

        presence.handle_frame(&mut conn, &join_frame("ab", json!([1.0, 2.0])));

        let own = events(&mut rx);
        assert_eq!(own.len(), 1);
        assert_eq!(own[0]["event"], "username_invalid");
        assert!(events(&mut bob_rx).is_empty());
        assert_eq!(presence.online_users(), 1);
        assert_eq!(conn.state(), ConnectionState::Unbound);
    }

    #[test]
    fn oversized_avatar_is_rejected() {
        let presence = Presence::default();
        let (mut conn, mut rx) = presence.connect();
        let frame = json!({
            "event": "join",
            "data": {
                "username": "bob",
                "avatarFile": { "type": "image/png", "data": BASE64.encode(vec![0u8; 2 * 1024 * 1024]) },
                "coordinates": [1.0, 2.0],
            }
        });

        presence.handle_frame(&mut conn, &frame.to_string());

        let own = events(&mut rx);
        assert_eq!(own.len(), 1);
        assert_eq!(own[0]["event"], "avatar_invalid");
        assert!(presence.registry().is_empty());
    }

    #[test]
    fn username_checked_before_avatar_and_coordinates() {
        let presence = Presence::default();
        let (_alice, _alice_rx) = joined(&presence, "Alice");
        let (mut conn, mut rx) = presence.connect();

        presence.handle_frame(&mut conn, &join_frame("ALICE", json!("nowhere")));
        assert_eq!(events(&mut rx)[0]["event"], "username_taken");

        presence.handle_frame(&mut conn, &join_frame("carol", json!([1.0])));
        assert_eq!(events(&mut rx)[0]["event"], "coordinates_invalid");

        // retry with fixed input
        presence.handle_frame(&mut conn, &join_frame("carol", json!([1.0, 2.0])));
        assert_eq!(events(&mut rx)[0]["event"], "admitted");
    }

    #[test]
    fn second_join_on_bound_connection_is_refused() {
        let presence = Presence::default();
        let (mut conn, mut rx) = joined(&presence, "bob");

        presence.handle_frame(&mut conn, &join_frame("robert", json!([1.0, 2.0])));

        let own = events(&mut rx);
        assert_eq!(own.len(), 1);
        assert_eq!(own[0]["event"], "already_joined");
        assert_eq!(presence.registry().snapshot().usernames(), ["bob"]);
    }

    #[test]
    fn racing_joins_admit_one() {
        let presence = Presence::default();
        let names = ["Alice", "alice", "ALICE", "aLICE", "AlIcE", "aliCE"];

        let results: Vec<Vec<Value>> = std::thread::scope(|scope| {
            let handles: Vec<_> = names
                .iter()
                .map(|name| {
                    let presence = presence.clone();
                    scope.spawn(move || {
                        let (mut conn, mut rx) = presence.connect();
                        presence.handle_frame(&mut conn, &join_frame(name, json!([0.0, 0.0])));
                        events(&mut rx)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let outcomes: Vec<_> = results
            .iter()
            .filter_map(|events| {
                events
                    .iter()
                    .map(|e| e["event"].as_str().unwrap())
                    .find(|e| *e == "admitted" || *e == "username_taken")
            })
            .collect();

        assert_eq!(outcomes.len(), names.len());
        assert_eq!(outcomes.iter().filter(|e| **e == "admitted").count(), 1);
        assert_eq!(presence.online_users(), 1);
    }

    #[test]
    fn private_message_reaches_only_recipient() {
        let presence = Presence::default();
        let (alice, mut alice_rx) = joined(&presence, "alice");
        let (bob, mut bob_rx) = joined(&presence, "bob");
        let (_carol, mut carol_rx) = joined(&presence, "carol");
        events(&mut alice_rx);
        events(&mut bob_rx);

        let sent = presence.send_message(
            &alice,
            SendMessagePayload {
                recipient_id: bob.user_id().unwrap().to_string(),
                body: "hi bob".to_owned(),
            },
        );
        assert_eq!(sent, Ok(true));

        let got = events(&mut bob_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["event"], "receive_message");
        assert_eq!(got[0]["data"]["senderId"], alice.user_id().unwrap().to_string());
        assert_eq!(got[0]["data"]["body"], "hi bob");
        assert!(events(&mut alice_rx).is_empty());
        assert!(events(&mut carol_rx).is_empty());
    }

    #[test]
    fn message_to_departed_user_is_dropped() {
        let presence = Presence::default();
        let (alice, mut alice_rx) = joined(&presence, "alice");
        let (mut bob, _bob_rx) = joined(&presence, "bob");
        let bob_id = bob.user_id().unwrap();
        presence.disconnect(&mut bob);
        events(&mut alice_rx);

        for recipient_id in [bob_id.to_string(), Uuid::now_v7().to_string(), "not-a-uuid".to_owned()] {
            let sent = presence.send_message(
                &alice,
                SendMessagePayload {
                    recipient_id,
                    body: "anyone?".to_owned(),
                },
            );
            assert_eq!(sent, Ok(false));
        }
        assert!(events(&mut alice_rx).is_empty());
    }

    #[test]
    fn message_rules() {
        let presence = Presence::default();
        let (mut unbound, mut unbound_rx) = presence.connect();
        let (mut alice, mut alice_rx) = joined(&presence, "alice");
        let alice_id = alice.user_id().unwrap().to_string();

        let frame = |body: &str| {
            json!({"event": "send_message", "data": {"recipientId": alice_id, "body": body}}).to_string()
        };

        presence.handle_frame(&mut unbound, &frame("hello"));
        let got = events(&mut unbound_rx);
        assert_eq!(got.last().unwrap()["event"], "not_joined");

        presence.handle_frame(&mut alice, &frame(""));
        presence.handle_frame(&mut alice, &frame(&"x".repeat(501)));
        let got = events(&mut alice_rx);
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|e| e["event"] == "message_invalid"));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let presence = Presence::default();
        let (_watcher, mut watcher_rx) = joined(&presence, "watcher");
        let (mut bob, _bob_rx) = joined(&presence, "bob");
        events(&mut watcher_rx);

        assert!(presence.disconnect(&mut bob));
        assert_eq!(events(&mut watcher_rx).len(), 1);

        assert!(!presence.disconnect(&mut bob));
        assert!(events(&mut watcher_rx).is_empty());

        let (mut never_joined, _rx) = presence.connect();
        assert!(!presence.disconnect(&mut never_joined));
        assert!(events(&mut watcher_rx).is_empty());
        assert_eq!(presence.online_users(), 1);
    }

    #[test]
    fn exit_closes_and_ignores_later_events() {
        let presence = Presence::default();
        let (_watcher, mut watcher_rx) = joined(&presence, "watcher");
        let (mut bob, _bob_rx) = joined(&presence, "bob");
        events(&mut watcher_rx);

        assert_eq!(presence.handle_frame(&mut bob, r#"{"event":"exit"}"#), ControlFlow::Break(()));
        assert_eq!(bob.state(), ConnectionState::Closed);
        assert_eq!(names(&events(&mut watcher_rx)[0]), ["watcher"]);

        assert_eq!(
            presence.handle_frame(&mut bob, &join_frame("bobby", json!([1.0, 2.0]))),
            ControlFlow::Break(())
        );
        assert_eq!(presence.online_users(), 1);
    }

    #[test]
    fn init_answers_only_the_requester() {
        let presence = Presence::default();
        let (_bob, mut bob_rx) = joined(&presence, "bob");
        let (mut viewer, mut viewer_rx) = presence.connect();

        presence.handle_frame(&mut viewer, r#"{"event":"init"}"#);

        let got = events(&mut viewer_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["event"], "init");
        assert_eq!(names(&got[0]), ["bob"]);
        assert!(events(&mut bob_rx).is_empty());
    }

    #[test]
    fn bad_frames_get_bad_request() {
        let presence = Presence::default();
        let (mut conn, mut rx) = presence.connect();

        assert_eq!(presence.handle_frame(&mut conn, "{"), ControlFlow::Continue(()));
        assert_eq!(events(&mut rx)[0]["event"], "bad_request");
    }

    #[test]
    fn bob_carol_dave() {
        let presence = Presence::default();
        let mut conns = Vec::new();

        for (i, name) in ["bob", "carol", "dave"].into_iter().enumerate() {
            let (mut conn, rx) = presence.connect();
            presence.handle_frame(&mut conn, &join_frame(name, json!([i as f64, -(i as f64)])));
            conns.push((conn, rx));

            for (_, rx) in conns.iter_mut() {
                let updates: Vec<_> = events(rx)
                    .into_iter()
                    .filter(|e| e["event"] == "update_users")
                    .collect();
                assert_eq!(updates.len(), 1, "after {name}");
                let expected: Vec<_> = ["bob", "carol", "dave"][..=i].iter().rev().copied().collect();
                assert_eq!(names(&updates[0]), expected);
            }
        }

        let (mut dave, _) = conns.pop().unwrap();
        presence.disconnect(&mut dave);

        for (_, rx) in conns.iter_mut() {
            let got = events(rx);
            assert_eq!(got.len(), 1);
            assert_eq!(names(&got[0]), ["carol", "bob"]);
        }
    }

    #[test]
    fn capacity_closes_evicted_connection() {
        let presence = Presence::new(NonZeroUsize::new(1));
        let (_bob, mut bob_rx) = joined(&presence, "bob");
        let (_carol, mut carol_rx) = joined(&presence, "carol");

        let mut closed = false;
        while let Ok(msg) = bob_rx.try_recv() {
            closed |= matches!(msg, Message::Close(Some(ref frame)) if frame.code == CLOSE_EVICTED);
        }
        assert!(closed);
        assert_eq!(presence.registry().snapshot().usernames(), ["carol"]);
        assert!(events(&mut carol_rx).is_empty());
    }

    fn join_data(data: Value) -> String {
        json!({"event": "join", "data": data}).to_string()
    }

    #[test]
    fn loose_join_fields_follow_check_order() {
        let presence = Presence::default();
        let (mut conn, mut rx) = presence.connect();
        let png = json!({ "type": "image/png", "data": BASE64.encode(b"png") });

        let cases = [
            (json!({ "username": "ab", "coordinates": [1.0, 2.0] }), "username_invalid"),
            (json!({ "username": 42, "avatarFile": png, "coordinates": [1.0, 2.0] }), "username_invalid"),
            (json!({ "avatarFile": png, "coordinates": [1.0, 2.0] }), "username_invalid"),
            (json!({ "username": "bob", "coordinates": [1.0, 2.0] }), "avatar_invalid"),
            (json!({ "username": "bob", "avatarFile": null, "coordinates": [1.0, 2.0] }), "avatar_invalid"),
            (
                json!({ "username": "bob", "avatarFile": { "type": "image/png" }, "coordinates": [1.0, 2.0] }),
                "avatar_invalid",
            ),
            (json!({ "username": "bob", "avatarFile": png }), "coordinates_invalid"),
        ];

        for (data, expected) in cases {
            presence.handle_frame(&mut conn, &join_data(data.clone()));
            let got = events(&mut rx);
            assert_eq!(got.len(), 1, "{data}");
            assert_eq!(got[0]["event"], expected, "{data}");
        }
        assert_eq!(conn.state(), ConnectionState::Unbound);
        assert!(presence.registry().is_empty());
    }

    #[test]
    fn evicted_connection_cannot_send() {
        let presence = Presence::new(NonZeroUsize::new(1));
        let (bob, mut bob_rx) = joined(&presence, "bob");
        let (carol, mut carol_rx) = joined(&presence, "carol");
        events(&mut bob_rx);
        assert!(matches!(bob.state(), ConnectionState::Bound(_)));

        let sent = presence.send_message(
            &bob,
            SendMessagePayload {
                recipient_id: carol.user_id().unwrap().to_string(),
                body: "still here?".to_owned(),
            },
        );
        assert_eq!(sent, Err(Rejection::NotBound));
        assert!(events(&mut carol_rx).is_empty());
    }
}
