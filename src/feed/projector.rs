//! Ordered record projection.
//!
//! A projector owns a caller-mutated ordered list of remote ids and keeps a
//! `watch` channel filled with the matching local records, in list order.
//! Recomputes are debounced with a trailing window so a burst of store
//! changes (one reconcile batch touches many records) produces a single
//! republish, and the output is always a complete snapshot, never a torn
//! intermediate.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::feed::pagination::FeedSink;
use crate::store::{LocalRecord, RecordKind, Store, StoreError};

/// Which records an id list projects to.
#[derive(Debug, Clone)]
pub struct ProjectionFilter {
    pub domain: String,
    pub kind: RecordKind,
    /// Restrict to records authored by this user, if set.
    pub author_id: Option<String>,
}

#[derive(Default)]
struct OrderedIds {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl OrderedIds {
    /// Ids from `incoming` not already present, in their given order.
    fn take_new(&mut self, incoming: Vec<String>) -> Vec<String> {
        let mut fresh = Vec::with_capacity(incoming.len());
        for id in incoming {
            if self.seen.insert(id.clone()) {
                fresh.push(id);
            }
        }
        fresh
    }
}

struct ProjectorShared {
    store: Arc<dyn Store>,
    filter: ProjectionFilter,
    list: Mutex<OrderedIds>,
    dirty: Notify,
    output_tx: watch::Sender<Vec<LocalRecord>>,
    cancel: CancellationToken,
}

impl ProjectorShared {
    fn snapshot_order(&self) -> Vec<String> {
        match self.list.lock() {
            Ok(list) => list.order.clone(),
            Err(_) => {
                warn!("Projection list lock poisoned");
                Vec::new()
            }
        }
    }

    async fn recompute(&self) -> Result<(), StoreError> {
        let order = self.snapshot_order();
        let records = self
            .store
            .records_by_ids(&self.filter.domain, self.filter.kind, &order)
            .await?;

        let index: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut resolved: Vec<(usize, LocalRecord)> = records
            .into_iter()
            .filter(|record| match &self.filter.author_id {
                Some(author) => record.author_id.as_deref() == Some(author.as_str()),
                None => true,
            })
            .filter_map(|record| {
                // Unresolved ids stay silently absent until reconciled.
                index.get(record.remote_id.as_str()).map(|i| (*i, record))
            })
            .collect();
        resolved.sort_by_key(|(i, _)| *i);

        let output: Vec<LocalRecord> = resolved.into_iter().map(|(_, record)| record).collect();
        debug!(
            domain = %self.filter.domain,
            ids = order.len(),
            resolved = output.len(),
            "Republishing projection"
        );
        self.output_tx.send_replace(output);
        Ok(())
    }
}

/// Handle to a projection worker. Cheap to clone; all clones drive the same
/// list and output channel.
#[derive(Clone)]
pub struct RecordProjector {
    shared: Arc<ProjectorShared>,
}

impl RecordProjector {
    /// Spawn the projection worker. It wakes on list mutations and on store
    /// change broadcasts, so a record that reconciles after its id entered
    /// the list shows up without any caller action.
    pub fn spawn(store: Arc<dyn Store>, filter: ProjectionFilter, config: &SyncConfig) -> Self {
        let changes = store.subscribe_changes();
        let (output_tx, _) = watch::channel(Vec::new());
        let shared = Arc::new(ProjectorShared {
            store,
            filter,
            list: Mutex::new(OrderedIds::default()),
            dirty: Notify::new(),
            output_tx,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_worker(
            shared.clone(),
            changes,
            config.debounce_window,
        ));

        Self { shared }
    }

    /// Add ids at the front of the list ("new items arrived"). Ids already
    /// present keep their current position.
    pub fn prepend(&self, ids: Vec<String>) {
        if let Ok(mut list) = self.shared.list.lock() {
            let fresh = list.take_new(ids);
            if fresh.is_empty() {
                return;
            }
            list.order.splice(0..0, fresh);
        }
        self.shared.dirty.notify_one();
    }

    /// Add ids at the back of the list ("load more"). Duplicates are
    /// dropped.
    pub fn append(&self, ids: Vec<String>) {
        if let Ok(mut list) = self.shared.list.lock() {
            let fresh = list.take_new(ids);
            if fresh.is_empty() {
                return;
            }
            list.order.extend(fresh);
        }
        self.shared.dirty.notify_one();
    }

    /// Empty the list. The empty projection publishes after the debounce.
    pub fn clear(&self) {
        if let Ok(mut list) = self.shared.list.lock() {
            list.order.clear();
            list.seen.clear();
        }
        self.shared.dirty.notify_one();
    }

    /// Recompute and publish immediately, skipping the debounce. Lets tests
    /// and one-shot callers observe a settled projection deterministically.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.shared.recompute().await
    }

    /// Watch channel carrying the current ordered projection.
    pub fn subscribe(&self) -> watch::Receiver<Vec<LocalRecord>> {
        self.shared.output_tx.subscribe()
    }

    /// Stop the worker. The last published output stays readable.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }
}

impl FeedSink for RecordProjector {
    fn append(&self, ids: Vec<String>) {
        RecordProjector::append(self, ids);
    }

    fn clear(&self) {
        RecordProjector::clear(self);
    }
}

async fn run_worker(
    shared: Arc<ProjectorShared>,
    mut changes: broadcast::Receiver<()>,
    debounce: Duration,
) {
    loop {
        // Wait for the first event of a burst. A lagged broadcast receiver
        // just means "something changed", which is all we need.
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = shared.dirty.notified() => {}
            _ = changes.recv() => {}
        }

        // Trailing debounce: every further event restarts the window.
        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => return,
                _ = tokio::time::sleep(debounce) => break,
                _ = shared.dirty.notified() => {}
                _ = changes.recv() => {}
            }
        }

        if let Err(error) = shared.recompute().await {
            warn!(%error, "Projection recompute failed");
        }
    }
}
