//! Timeline feed source.
//!
//! Glues a network-client collaborator to the reconcile engine: one
//! [`load_page`](crate::feed::FeedSource::load_page) call fetches a page of
//! statuses, folds them into the store, records timeline memberships, and
//! runs gap detection against the membership snapshot taken before the
//! batch landed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::feed::error::FetchError;
use crate::feed::pagination::{FeedSource, LoadedPage, PageToken};
use crate::reconcile::{boundary, Reconciler};
use crate::remote::{RemoteEntity, RemoteStatus};
use crate::store::{Store, TimelineKind};

/// One page of a remote timeline, in server order (newest first).
#[derive(Debug, Clone)]
pub struct RemotePage {
    pub statuses: Vec<RemoteStatus>,
    /// Cursor for the page below this one; `None` when exhausted.
    pub next_max_id: Option<String>,
}

/// Network-client collaborator that fetches raw timeline pages.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, max_id: Option<&str>, limit: u32) -> Result<RemotePage, FetchError>;
}

/// A home or mentions timeline for one account on one domain.
pub struct TimelineSource {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn PageFetcher>,
    domain: String,
    account_id: String,
    timeline: TimelineKind,
}

impl TimelineSource {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn PageFetcher>,
        domain: impl Into<String>,
        account_id: impl Into<String>,
        timeline: TimelineKind,
    ) -> Self {
        Self {
            store,
            fetcher,
            domain: domain.into(),
            account_id: account_id.into(),
            timeline,
        }
    }
}

#[async_trait]
impl FeedSource for TimelineSource {
    async fn load_page(
        &self,
        token: Option<&PageToken>,
        page_size: u32,
    ) -> Result<LoadedPage, FetchError> {
        let anchor = token.map(|t| t.0.as_str());
        let page = self.fetcher.fetch(anchor, page_size).await?;
        // Merge-guard clock: when the response arrived, not what the
        // entities claim about themselves.
        let network_ts = Utc::now();

        // Snapshot memberships before this batch adds its own.
        let preexisting = self
            .store
            .membership_ids(&self.domain, &self.account_id, self.timeline)
            .await?;

        let entities: Vec<RemoteEntity> = page
            .statuses
            .into_iter()
            .map(RemoteEntity::Status)
            .collect();

        let mut batch = Reconciler::new(self.store.clone(), self.domain.clone(), network_ts);
        batch.prewarm(&entities).await?;

        let mut ids = Vec::with_capacity(entities.len());
        let mut inserted = 0u64;
        let mut merged = 0u64;
        let mut nested = 0u64;
        for entity in &entities {
            if let Some(result) = batch.reconcile(entity).await? {
                if result.is_new_insertion {
                    inserted += 1;
                } else {
                    merged += 1;
                }
                nested += result.nested.total();
                ids.push(result.record.remote_id);
            }
        }

        let staged = batch.take_staged();
        debug!(
            domain = %self.domain,
            timeline = self.timeline.as_str(),
            inserted,
            merged,
            nested,
            staged = staged.len(),
            lookups = batch.store_lookups(),
            "Reconciled timeline page"
        );
        self.store.apply_records(&staged).await?;

        self.store
            .ensure_memberships(&self.domain, &self.account_id, self.timeline, &ids)
            .await?;

        let decision = boundary::detect(anchor, &preexisting, &ids);
        boundary::apply(
            self.store.as_ref(),
            &self.domain,
            &self.account_id,
            self.timeline,
            &decision,
        )
        .await?;

        Ok(LoadedPage {
            ids,
            next_token: page.next_max_id.map(PageToken),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::feed::pagination::{FeedController, FeedState};
    use crate::feed::projector::{ProjectionFilter, RecordProjector};
    use crate::remote::tests::status;
    use crate::store::{RecordKey, RecordKind, SqliteStore};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedFetcher {
        pages: Mutex<VecDeque<RemotePage>>,
        seen_max_ids: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedFetcher {
        fn new(pages: Vec<RemotePage>) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(pages.into()),
                seen_max_ids: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(&self, max_id: Option<&str>, _limit: u32) -> Result<RemotePage, FetchError> {
            self.seen_max_ids
                .lock()
                .unwrap()
                .push(max_id.map(str::to_string));
            Ok(self.pages.lock().unwrap().pop_front().unwrap_or(RemotePage {
                statuses: Vec::new(),
                next_max_id: None,
            }))
        }
    }

    fn page(ids: &[&str], next_max_id: Option<&str>) -> RemotePage {
        RemotePage {
            statuses: ids.iter().map(|id| status(id, "7")).collect(),
            next_max_id: next_max_id.map(str::to_string),
        }
    }

    fn source(store: Arc<SqliteStore>, fetcher: Arc<ScriptedFetcher>) -> TimelineSource {
        TimelineSource::new(store, fetcher, "d", "me", TimelineKind::Home)
    }

    #[tokio::test]
    async fn test_first_page_persists_and_marks_boundary() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let fetcher = ScriptedFetcher::new(vec![page(&["3", "2", "1"], Some("1"))]);
        let source = source(store.clone(), fetcher);

        let loaded = source.load_page(None, 20).await.unwrap();
        assert_eq!(loaded.ids, vec!["3", "2", "1"]);
        assert_eq!(loaded.next_token, Some(PageToken("1".to_string())));

        // Statuses and their shared author landed in the store.
        let record = store
            .get_record("d", &RecordKey::new(RecordKind::Status, "2"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.author_id.as_deref(), Some("7"));
        assert!(store
            .get_record("d", &RecordKey::new(RecordKind::User, "7"))
            .await
            .unwrap()
            .is_some());

        // Nothing below the oldest fetched status is known yet.
        assert_eq!(
            store.has_more("d", "me", TimelineKind::Home, "1").await.unwrap(),
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_anchor_page_clears_its_marker() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let fetcher = ScriptedFetcher::new(vec![
            page(&["9", "8"], Some("8")),
            page(&["7", "6"], Some("6")),
        ]);
        let source = source(store.clone(), fetcher.clone());

        let first = source.load_page(None, 20).await.unwrap();
        assert_eq!(
            store.has_more("d", "me", TimelineKind::Home, "8").await.unwrap(),
            Some(true)
        );

        let second = source
            .load_page(first.next_token.as_ref(), 20)
            .await
            .unwrap();
        assert_eq!(second.ids, vec!["7", "6"]);

        // The anchor's gap marker moved down to the new oldest status.
        assert_eq!(
            store.has_more("d", "me", TimelineKind::Home, "8").await.unwrap(),
            Some(false)
        );
        assert_eq!(
            store.has_more("d", "me", TimelineKind::Home, "6").await.unwrap(),
            Some(true)
        );

        let seen = fetcher.seen_max_ids.lock().unwrap().clone();
        assert_eq!(seen, vec![None, Some("8".to_string())]);
    }

    #[tokio::test]
    async fn test_overlapping_reload_closes_the_gap() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let fetcher = ScriptedFetcher::new(vec![
            page(&["3", "2", "1"], Some("1")),
            page(&["5", "4", "3"], Some("3")),
        ]);
        let source = source(store.clone(), fetcher);

        source.load_page(None, 20).await.unwrap();
        // A later reload whose page reaches back into known statuses.
        source.load_page(None, 20).await.unwrap();

        assert_eq!(
            store.has_more("d", "me", TimelineKind::Home, "3").await.unwrap(),
            Some(false)
        );
        // The original boundary marker below "1" is untouched.
        assert_eq!(
            store.has_more("d", "me", TimelineKind::Home, "1").await.unwrap(),
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_malformed_status_skipped_from_page() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut bad = status("", "7");
        bad.text = "no id".to_string();
        let fetcher = ScriptedFetcher::new(vec![RemotePage {
            statuses: vec![status("2", "7"), bad, status("1", "7")],
            next_max_id: None,
        }]);
        let source = source(store.clone(), fetcher);

        let loaded = source.load_page(None, 20).await.unwrap();
        assert_eq!(loaded.ids, vec!["2", "1"]);

        let members = store
            .membership_ids("d", "me", TimelineKind::Home)
            .await
            .unwrap();
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn test_controller_drives_timeline_into_projection() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let fetcher = ScriptedFetcher::new(vec![
            page(&["3", "2"], Some("2")),
            page(&["1"], None),
        ]);
        let source = Arc::new(source(store.clone(), fetcher));

        let projector = RecordProjector::spawn(
            store.clone(),
            ProjectionFilter {
                domain: "d".to_string(),
                kind: RecordKind::Status,
                author_id: None,
            },
            &SyncConfig::default(),
        );
        let controller = FeedController::new(
            source,
            Arc::new(projector.clone()),
            SyncConfig::default(),
        );
        let mut states = controller.subscribe_state();

        controller.reload();
        states.wait_for(|s| *s == FeedState::Idle).await.unwrap();
        controller.load_more();
        states.wait_for(|s| *s == FeedState::NoMore).await.unwrap();

        projector.flush().await.unwrap();
        let rx = projector.subscribe();
        let out: Vec<String> = rx.borrow().iter().map(|r| r.remote_id.clone()).collect();
        assert_eq!(out, vec!["3", "2", "1"]);

        // The anchor's marker was cleared; the page below it did not
        // overlap anything previously known, so its oldest carries one.
        assert_eq!(
            store.has_more("d", "me", TimelineKind::Home, "2").await.unwrap(),
            Some(false)
        );
        assert_eq!(
            store.has_more("d", "me", TimelineKind::Home, "1").await.unwrap(),
            Some(true)
        );
        controller.shutdown();
        projector.shutdown();
    }
}
