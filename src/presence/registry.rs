use std::{cmp::Reverse, collections::HashMap, num::NonZeroUsize, sync::Arc};

use parking_lot::RwLock;

use super::record::{Snapshot, UserId, UserRecord};
use super::validate;

struct Entry {
    /// Insertion order, breaks `joined_at` ties.
    seq: u64,
    record: Arc<UserRecord>,
}

impl Entry {
    fn age_key(&self) -> (time::OffsetDateTime, u64) {
        (self.record.joined_at, self.seq)
    }
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, Entry>,
    next_seq: u64,
}

pub struct RegistryView<'a> {
    users: &'a HashMap<UserId, Entry>,
}

impl<'a> RegistryView<'a> {
    pub fn records(&self) -> impl Iterator<Item = &'a UserRecord> + use<'a> {
        self.users.values().map(|entry| entry.record.as_ref())
    }
}

#[derive(Debug)]
pub struct Admission {
    pub record: Arc<UserRecord>,
    /// Oldest records pushed out by the capacity limit, if one is set.
    pub evicted: Vec<Arc<UserRecord>>,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
    capacity: Option<NonZeroUsize>,
}

impl Registry {
    pub fn new(capacity: Option<NonZeroUsize>) -> Self {
        Self {
            inner: RwLock::default(),
            capacity,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner.users.values().collect();
        entries.sort_unstable_by_key(|entry| Reverse(entry.age_key()));

        Snapshot::new(entries.into_iter().map(|entry| entry.record.clone()).collect())
    }

    pub fn len(&self) -> usize {
        self.inner.read().users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().users.is_empty()
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.inner.read().users.contains_key(user_id)
    }

    pub fn is_username_taken(&self, username: &str) -> bool {
        let inner = self.inner.read();
        validate::username_taken(username, RegistryView { users: &inner.users }.records())
    }

    /// Runs `predicate` and inserts `record` under a single write lock, so the
    /// registry cannot change between the check and the insert. Returns `None`
    /// and leaves the registry untouched when the predicate fails or the id is
    /// already present.
    pub fn try_insert<P>(&self, record: UserRecord, predicate: P) -> Option<Admission>
    where
        P: FnOnce(&RegistryView<'_>) -> bool,
    {
        let mut inner = self.inner.write();

        if inner.users.contains_key(&record.user_id)
            || !predicate(&RegistryView { users: &inner.users })
        {
            return None;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let record = Arc::new(record);
        inner.users.insert(
            record.user_id,
            Entry {
                seq,
                record: record.clone(),
            },
        );

        let mut evicted = Vec::new();
        if let Some(capacity) = self.capacity {
            while inner.users.len() > capacity.get() {
                let Some(oldest) = inner
                    .users
                    .iter()
                    .filter(|(id, _)| **id != record.user_id)
                    .min_by_key(|(_, entry)| entry.age_key())
                    .map(|(id, _)| *id)
                else {
                    break;
                };
                evicted.extend(inner.users.remove(&oldest).map(|entry| entry.record));
            }
        }

        Some(Admission { record, evicted })
    }

    /// Absent ids are not an error: leaving twice or before joining is a no-op.
    pub fn remove(&self, user_id: &UserId) -> Option<Arc<UserRecord>> {
        self.inner
            .write()
            .users
            .remove(user_id)
            .map(|entry| entry.record)
    }
}
