//! Per-batch record cache.

use std::collections::{HashMap, HashSet};

use crate::remote::RemoteEntity;
use crate::store::{LocalRecord, RecordKey};

/// Read-your-writes cache scoped to a single reconciliation batch.
///
/// Holds every record the batch has seen so far, plus a known-absent set so
/// a prewarmed miss never turns into another store query. Owned by exactly
/// one `Reconciler` and dropped with it; it is never shared across batches.
#[derive(Debug, Default)]
pub(crate) struct PersistCache {
    records: HashMap<RecordKey, LocalRecord>,
    absent: HashSet<RecordKey>,
}

impl PersistCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, key: &RecordKey) -> Option<&LocalRecord> {
        self.records.get(key)
    }

    /// Cache a record. Clears any stale known-absent marker for the key.
    pub(crate) fn insert(&mut self, record: LocalRecord) {
        let key = record.key();
        self.absent.remove(&key);
        self.records.insert(key, record);
    }

    pub(crate) fn mark_absent(&mut self, key: RecordKey) {
        self.absent.insert(key);
    }

    pub(crate) fn is_known_absent(&self, key: &RecordKey) -> bool {
        self.absent.contains(key)
    }

    /// Every key a batch of entities can touch, including nested entities,
    /// for one batched prewarm query.
    pub(crate) fn batch_keys(entities: &[RemoteEntity]) -> HashSet<RecordKey> {
        let mut keys = HashSet::new();
        for entity in entities {
            entity.collect_keys(&mut keys);
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteStatus, RemoteUser};
    use crate::store::{Payload, RecordKind, UserPayload};
    use chrono::Utc;

    fn user_record(id: &str) -> LocalRecord {
        let ts = Utc::now();
        LocalRecord {
            domain: "d".to_string(),
            remote_id: id.to_string(),
            payload: Payload::User(UserPayload {
                username: format!("user_{id}"),
                display_name: String::new(),
                avatar_url: None,
                followers_count: 0,
                following_count: 0,
                statuses_count: 0,
            }),
            author_id: None,
            repost_of_id: None,
            quote_of_id: None,
            subject_id: None,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn test_insert_clears_absent_marker() {
        let mut cache = PersistCache::new();
        let key = RecordKey::new(RecordKind::User, "7");

        cache.mark_absent(key.clone());
        assert!(cache.is_known_absent(&key));

        cache.insert(user_record("7"));
        assert!(!cache.is_known_absent(&key));
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn test_batch_keys_covers_nested_entities() {
        let status = RemoteStatus {
            id: "100".to_string(),
            text: String::new(),
            created_at: Utc::now(),
            reply_count: 0,
            repost_count: 0,
            favorite_count: 0,
            media: Vec::new(),
            author: Some(Box::new(RemoteUser {
                id: "7".to_string(),
                username: "u".to_string(),
                display_name: String::new(),
                avatar_url: None,
                followers_count: 0,
                following_count: 0,
                statuses_count: 0,
            })),
            repost_of: None,
            quote_of: None,
            poll_options: Vec::new(),
        };

        let keys = PersistCache::batch_keys(&[RemoteEntity::Status(status)]);
        assert!(keys.contains(&RecordKey::new(RecordKind::Status, "100")));
        assert!(keys.contains(&RecordKey::new(RecordKind::User, "7")));
        assert_eq!(keys.len(), 2);
    }
}
