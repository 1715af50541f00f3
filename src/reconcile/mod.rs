//! Create-or-merge reconciliation of remote entities into local records.
//!
//! A [`Reconciler`] is a per-batch parameter object: it carries the domain,
//! the network timestamp, and the batch-scoped caches through every step so
//! none of that state lives in globals. Writes are staged rather than
//! committed; the caller flushes them through [`Store::apply_records`] in a
//! single transaction once the whole batch has reconciled.

mod cache;

pub mod boundary;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::remote::{
    RemoteEntity, RemoteList, RemoteNotification, RemotePollOption, RemoteStatus, RemoteUser,
};
use crate::store::{
    ListPayload, LocalRecord, NotificationPayload, Payload, PollOptionPayload, RecordKey,
    StatusPayload, Store, StoreError, UserPayload,
};

use cache::PersistCache;

/// Distinct nested records written while reconciling one top-level entity.
/// Repeat references to the same record within a batch are not recounted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NestedCounts {
    pub users: u64,
    pub statuses: u64,
    pub poll_options: u64,
}

impl NestedCounts {
    pub fn total(&self) -> u64 {
        self.users + self.statuses + self.poll_options
    }
}

/// How one upsert left the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpsertOutcome {
    Created,
    Merged,
    /// Already written by this batch, or the store copy is newer.
    Unchanged,
}

impl UpsertOutcome {
    fn wrote(self) -> bool {
        self != Self::Unchanged
    }
}

/// Outcome of reconciling one top-level entity.
#[derive(Debug, Clone)]
pub struct PersistResult {
    /// The record as it stands after the merge (or as created).
    pub record: LocalRecord,
    /// Whether this batch first created the record.
    pub is_new_insertion: bool,
    /// Nested entities resolved along the way.
    pub nested: NestedCounts,
}

/// One reconciliation batch against one domain.
///
/// Not `Clone` and not shared: a batch is created, fed entities, drained
/// with [`take_staged`](Self::take_staged), and dropped. The network
/// timestamp is sampled by the caller when the response arrives, never taken
/// from entity-embedded timestamps.
pub struct Reconciler {
    store: Arc<dyn Store>,
    domain: String,
    network_ts: DateTime<Utc>,
    cache: PersistCache,
    staged: Vec<LocalRecord>,
    store_lookups: u64,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, domain: impl Into<String>, network_ts: DateTime<Utc>) -> Self {
        Self {
            store,
            domain: domain.into(),
            network_ts,
            cache: PersistCache::new(),
            staged: Vec::new(),
            store_lookups: 0,
        }
    }

    /// Pre-load every record the batch can touch with one store query.
    ///
    /// Keys that come back empty are marked known-absent so later misses
    /// stay in memory instead of hitting the store per entity.
    pub async fn prewarm(&mut self, entities: &[RemoteEntity]) -> Result<(), StoreError> {
        let keys = PersistCache::batch_keys(entities);
        if keys.is_empty() {
            return Ok(());
        }

        self.store_lookups += 1;
        let records = self.store.get_records(&self.domain, &keys).await?;
        let found: HashSet<RecordKey> = records.iter().map(LocalRecord::key).collect();

        debug!(
            domain = %self.domain,
            keys = keys.len(),
            found = found.len(),
            "Prewarmed reconcile cache"
        );

        for record in records {
            self.cache.insert(record);
        }
        for key in keys {
            if !found.contains(&key) {
                self.cache.mark_absent(key);
            }
        }

        Ok(())
    }

    /// Reconcile one entity and everything nested inside it, depth-first.
    ///
    /// Returns `Ok(None)` for a malformed entity (empty remote id); the rest
    /// of the batch continues. Store failures abort the batch.
    pub async fn reconcile(
        &mut self,
        entity: &RemoteEntity,
    ) -> Result<Option<PersistResult>, StoreError> {
        let mut nested = NestedCounts::default();

        let outcome = match entity {
            RemoteEntity::Status(status) => self.reconcile_status(status, &mut nested).await?,
            RemoteEntity::User(user) => self.reconcile_user(user).await?,
            RemoteEntity::Notification(notification) => {
                self.reconcile_notification(notification, &mut nested).await?
            }
            RemoteEntity::List(list) => self.reconcile_list(list, &mut nested).await?,
            RemoteEntity::PollOption(option) => self.reconcile_poll_option(option, None).await?,
        };

        Ok(outcome.map(|(record, outcome)| PersistResult {
            record,
            is_new_insertion: outcome == UpsertOutcome::Created,
            nested,
        }))
    }

    /// Hand the staged writes to the caller, nested-before-parent order.
    /// The reconciler performs no commit of its own.
    pub fn take_staged(&mut self) -> Vec<LocalRecord> {
        std::mem::take(&mut self.staged)
    }

    /// Number of store queries issued so far, including the prewarm.
    pub fn store_lookups(&self) -> u64 {
        self.store_lookups
    }

    fn reconcile_status<'a>(
        &'a mut self,
        status: &'a RemoteStatus,
        nested: &'a mut NestedCounts,
    ) -> BoxFuture<'a, Result<Option<(LocalRecord, UpsertOutcome)>, StoreError>> {
        Box::pin(async move {
            if status.id.is_empty() {
                warn!(domain = %self.domain, "Skipping status with empty id");
                return Ok(None);
            }

            let mut author_id = None;
            if let Some(author) = &status.author {
                if let Some((record, outcome)) = self.reconcile_user(author).await? {
                    if outcome.wrote() {
                        nested.users += 1;
                    }
                    author_id = Some(record.remote_id);
                }
            }

            let mut repost_of_id = None;
            if let Some(repost) = &status.repost_of {
                if let Some((record, outcome)) = self.reconcile_status(repost, nested).await? {
                    if outcome.wrote() {
                        nested.statuses += 1;
                    }
                    repost_of_id = Some(record.remote_id);
                }
            }

            let mut quote_of_id = None;
            if let Some(quote) = &status.quote_of {
                if let Some((record, outcome)) = self.reconcile_status(quote, nested).await? {
                    if outcome.wrote() {
                        nested.statuses += 1;
                    }
                    quote_of_id = Some(record.remote_id);
                }
            }

            let mut poll_option_ids = Vec::with_capacity(status.poll_options.len());
            for option in &status.poll_options {
                if let Some((record, outcome)) = self
                    .reconcile_poll_option(option, Some(status.id.as_str()))
                    .await?
                {
                    if outcome.wrote() {
                        nested.poll_options += 1;
                    }
                    poll_option_ids.push(record.remote_id);
                }
            }

            let payload = Payload::Status(StatusPayload {
                text: status.text.clone(),
                created_at: status.created_at,
                reply_count: status.reply_count,
                repost_count: status.repost_count,
                favorite_count: status.favorite_count,
                media: status.media.clone(),
                poll_option_ids,
            });

            self.upsert(&status.id, payload, author_id, repost_of_id, quote_of_id, None)
                .await
                .map(Some)
        })
    }

    async fn reconcile_user(
        &mut self,
        user: &RemoteUser,
    ) -> Result<Option<(LocalRecord, UpsertOutcome)>, StoreError> {
        if user.id.is_empty() {
            warn!(domain = %self.domain, "Skipping user with empty id");
            return Ok(None);
        }

        let payload = Payload::User(UserPayload {
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            avatar_url: user.avatar_url.clone(),
            followers_count: user.followers_count,
            following_count: user.following_count,
            statuses_count: user.statuses_count,
        });

        self.upsert(&user.id, payload, None, None, None, None)
            .await
            .map(Some)
    }

    async fn reconcile_notification(
        &mut self,
        notification: &RemoteNotification,
        nested: &mut NestedCounts,
    ) -> Result<Option<(LocalRecord, UpsertOutcome)>, StoreError> {
        if notification.id.is_empty() {
            warn!(domain = %self.domain, "Skipping notification with empty id");
            return Ok(None);
        }

        let mut account_id = None;
        if let Some(account) = &notification.account {
            if let Some((record, outcome)) = self.reconcile_user(account).await? {
                if outcome.wrote() {
                    nested.users += 1;
                }
                account_id = Some(record.remote_id);
            }
        }

        let mut subject_id = None;
        if let Some(status) = &notification.status {
            if let Some((record, outcome)) = self.reconcile_status(status, nested).await? {
                if outcome.wrote() {
                    nested.statuses += 1;
                }
                subject_id = Some(record.remote_id);
            }
        }

        let payload = Payload::Notification(NotificationPayload {
            kind: notification.kind,
            created_at: notification.created_at,
        });

        self.upsert(&notification.id, payload, account_id, None, None, subject_id)
            .await
            .map(Some)
    }

    async fn reconcile_list(
        &mut self,
        list: &RemoteList,
        nested: &mut NestedCounts,
    ) -> Result<Option<(LocalRecord, UpsertOutcome)>, StoreError> {
        if list.id.is_empty() {
            warn!(domain = %self.domain, "Skipping list with empty id");
            return Ok(None);
        }

        let mut owner_id = None;
        if let Some(owner) = &list.owner {
            if let Some((record, outcome)) = self.reconcile_user(owner).await? {
                if outcome.wrote() {
                    nested.users += 1;
                }
                owner_id = Some(record.remote_id);
            }
        }

        let payload = Payload::List(ListPayload {
            title: list.title.clone(),
            description: list.description.clone(),
            member_count: list.member_count,
        });

        self.upsert(&list.id, payload, owner_id, None, None, None)
            .await
            .map(Some)
    }

    async fn reconcile_poll_option(
        &mut self,
        option: &RemotePollOption,
        status_id: Option<&str>,
    ) -> Result<Option<(LocalRecord, UpsertOutcome)>, StoreError> {
        if option.id.is_empty() {
            warn!(domain = %self.domain, "Skipping poll option with empty id");
            return Ok(None);
        }

        let payload = Payload::PollOption(PollOptionPayload {
            title: option.title.clone(),
            votes_count: option.votes_count,
            position: option.position,
        });

        self.upsert(
            &option.id,
            payload,
            None,
            None,
            None,
            status_id.map(str::to_string),
        )
        .await
        .map(Some)
    }

    /// Create or merge one record through the batch cache.
    ///
    /// A record already carrying this batch's timestamp (a repeated nested
    /// entity) is returned as-is without staging a second write; an existing
    /// record with a newer timestamp wins over us outright.
    async fn upsert(
        &mut self,
        remote_id: &str,
        payload: Payload,
        author_id: Option<String>,
        repost_of_id: Option<String>,
        quote_of_id: Option<String>,
        subject_id: Option<String>,
    ) -> Result<(LocalRecord, UpsertOutcome), StoreError> {
        let key = RecordKey::new(payload.kind(), remote_id);

        let existing = if let Some(record) = self.cache.get(&key) {
            Some(record.clone())
        } else if self.cache.is_known_absent(&key) {
            None
        } else {
            // Cold miss (entity outside the prewarmed set). One query, then
            // the answer stays in the cache either way.
            self.store_lookups += 1;
            let fetched = self.store.get_record(&self.domain, &key).await?;
            match &fetched {
                Some(record) => self.cache.insert(record.clone()),
                None => self.cache.mark_absent(key.clone()),
            }
            fetched
        };

        let (record, outcome) = match existing {
            Some(existing) => {
                if self.network_ts <= existing.updated_at {
                    return Ok((existing, UpsertOutcome::Unchanged));
                }
                let merged = LocalRecord {
                    domain: existing.domain,
                    remote_id: existing.remote_id,
                    payload,
                    // An absent nested entity never clears a known relation.
                    author_id: author_id.or(existing.author_id),
                    repost_of_id: repost_of_id.or(existing.repost_of_id),
                    quote_of_id: quote_of_id.or(existing.quote_of_id),
                    subject_id: subject_id.or(existing.subject_id),
                    created_at: existing.created_at,
                    updated_at: self.network_ts,
                };
                (merged, UpsertOutcome::Merged)
            }
            None => {
                let record = LocalRecord {
                    domain: self.domain.clone(),
                    remote_id: remote_id.to_string(),
                    payload,
                    author_id,
                    repost_of_id,
                    quote_of_id,
                    subject_id,
                    created_at: self.network_ts,
                    updated_at: self.network_ts,
                };
                (record, UpsertOutcome::Created)
            }
        };

        self.staged.push(record.clone());
        self.cache.insert(record.clone());
        Ok((record, outcome))
    }
}
