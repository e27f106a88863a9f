use std::sync::{
    atomic::{AtomicU64, Ordering},
    OnceLock,
};

use axum::extract::ws::{CloseFrame, Message};
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::record::UserId;

pub type ConnectionId = u64;

struct Slot {
    tx: mpsc::UnboundedSender<Message>,
    // set once, on admission
    user_id: OnceLock<UserId>,
}

#[derive(Default)]
pub struct Hub {
    slots: DashMap<ConnectionId, Slot>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.slots.insert(
            id,
            Slot {
                tx,
                user_id: OnceLock::new(),
            },
        );

        tracing::debug!(conn = id, connections = self.slots.len(), "connection registered");
        (id, rx)
    }

    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.slots.remove(&id).is_some();
        if removed {
            tracing::debug!(conn = id, connections = self.slots.len(), "connection unregistered");
        }
        removed
    }

    /// Returns false if the connection is gone or was already bound.
    pub fn bind(&self, id: ConnectionId, user_id: UserId) -> bool {
        self.slots
            .get(&id)
            .is_some_and(|slot| slot.user_id.set(user_id).is_ok())
    }

    pub fn send_to(&self, id: ConnectionId, msg: Message) -> bool {
        self.slots
            .get(&id)
            .is_some_and(|slot| slot.tx.send(msg).is_ok())
    }

    pub fn broadcast(&self, msg: &Message) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.tx.send(msg.clone()).is_ok())
            .count()
    }

    /// The connection bound to `user_id`, lowest id first if there is more than one.
    pub fn route(&self, user_id: &UserId) -> Option<ConnectionId> {
        self.slots
            .iter()
            .filter(|slot| slot.user_id.get() == Some(user_id))
            .map(|slot| *slot.key())
            .min()
    }

    pub fn close_user(&self, user_id: &UserId, code: u16, reason: &str) {
        for slot in self.slots.iter() {
            if slot.user_id.get() == Some(user_id) {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                let _ = slot.tx.send(Message::Close(Some(frame)));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
