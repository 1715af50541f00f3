//! Timeline gap detection.
//!
//! A `has_more` marker on a membership row means "older statuses exist on
//! the server between this status and the next locally-known one". Markers
//! are set when a fetched page fails to connect to the locally known
//! timeline, and cleared when a later fetch closes the gap.

use std::collections::HashSet;

use tracing::debug;

use crate::store::{Store, StoreError, TimelineKind};

/// Membership flag mutations derived from one fetched page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BoundaryDecision {
    /// Status id whose marker should be cleared (the fetch anchor).
    pub clear_has_more: Option<String>,
    /// Oldest batch status id and the flag value it should carry.
    pub set_has_more: Option<(String, bool)>,
}

/// Derive membership flag mutations from one fetched page.
///
/// `anchor` is the `max_id` the request was made with, if any. `preexisting`
/// is the set of status ids already members of the timeline, snapshotted
/// *before* the batch was reconciled. `batch_newest_first` is the page in
/// fetch order; the last element is the oldest status in the page.
///
/// Fetching below an anchor always clears the anchor's marker: the server
/// told us everything that directly follows it. The oldest status of the
/// page carries a marker exactly when the page failed to overlap anything
/// previously known (other than the anchor itself).
pub fn detect(
    anchor: Option<&str>,
    preexisting: &HashSet<String>,
    batch_newest_first: &[String],
) -> BoundaryDecision {
    let mut decision = BoundaryDecision::default();

    if let Some(anchor) = anchor {
        decision.clear_has_more = Some(anchor.to_string());
    }

    let Some(oldest) = batch_newest_first.last() else {
        return decision;
    };

    let overlap: Vec<&String> = batch_newest_first
        .iter()
        .filter(|id| preexisting.contains(*id))
        .collect();

    let disconnected = match anchor {
        Some(anchor) => {
            overlap.is_empty() || (overlap.len() == 1 && overlap[0].as_str() == anchor)
        }
        None => overlap.is_empty(),
    };

    if anchor != Some(oldest.as_str()) {
        decision.set_has_more = Some((oldest.clone(), disconnected));
    }

    decision
}

/// Apply a decision to the store. Flags referencing statuses with no
/// membership row are dropped by the store itself.
pub async fn apply(
    store: &dyn Store,
    domain: &str,
    account_id: &str,
    timeline: TimelineKind,
    decision: &BoundaryDecision,
) -> Result<(), StoreError> {
    if let Some(anchor) = &decision.clear_has_more {
        store
            .set_has_more(domain, account_id, timeline, anchor, false)
            .await?;
    }
    if let Some((oldest, flag)) = &decision.set_has_more {
        debug!(
            domain,
            timeline = timeline.as_str(),
            status_id = %oldest,
            has_more = flag,
            "Marking timeline boundary"
        );
        store
            .set_has_more(domain, account_id, timeline, oldest, *flag)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn set(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fresh_load_into_empty_timeline() {
        let decision = detect(None, &HashSet::new(), &ids(&["3", "2", "1"]));
        assert_eq!(decision.clear_has_more, None);
        // Nothing below "1" is known locally yet.
        assert_eq!(decision.set_has_more, Some(("1".to_string(), true)));
    }

    #[test]
    fn test_reload_overlapping_known_statuses() {
        let decision = detect(None, &set(&["2", "1"]), &ids(&["4", "3", "2"]));
        assert_eq!(decision.clear_has_more, None);
        // The page reconnects with the known timeline, no gap below it.
        assert_eq!(decision.set_has_more, Some(("2".to_string(), false)));
    }

    #[test]
    fn test_anchor_fetch_that_closes_the_gap() {
        let decision = detect(Some("5"), &set(&["5", "2", "1"]), &ids(&["4", "3", "2"]));
        assert_eq!(decision.clear_has_more, Some("5".to_string()));
        assert_eq!(decision.set_has_more, Some(("2".to_string(), false)));
    }

    #[test]
    fn test_anchor_fetch_that_leaves_a_gap() {
        let decision = detect(Some("9"), &set(&["9", "2", "1"]), &ids(&["8", "7", "6"]));
        assert_eq!(decision.clear_has_more, Some("9".to_string()));
        // Still nothing connecting "6" to "2".
        assert_eq!(decision.set_has_more, Some(("6".to_string(), true)));
    }

    #[test]
    fn test_overlap_of_only_the_anchor_still_counts_as_gap() {
        // Servers that include the anchor in the page must not fool the
        // overlap check into thinking the page reconnected.
        let decision = detect(Some("9"), &set(&["9", "2", "1"]), &ids(&["9", "8", "7"]));
        assert_eq!(decision.clear_has_more, Some("9".to_string()));
        assert_eq!(decision.set_has_more, Some(("7".to_string(), true)));
    }

    #[test]
    fn test_empty_batch_only_clears_the_anchor() {
        let decision = detect(Some("9"), &set(&["9"]), &[]);
        assert_eq!(decision.clear_has_more, Some("9".to_string()));
        assert_eq!(decision.set_has_more, None);
    }

    #[test]
    fn test_empty_batch_without_anchor_is_a_noop() {
        let decision = detect(None, &HashSet::new(), &[]);
        assert_eq!(decision, BoundaryDecision::default());
    }

    #[test]
    fn test_single_item_page_equal_to_anchor_sets_nothing() {
        let decision = detect(Some("9"), &set(&["9"]), &ids(&["9"]));
        assert_eq!(decision.clear_has_more, Some("9".to_string()));
        assert_eq!(decision.set_has_more, None);
    }

    #[tokio::test]
    async fn test_apply_mutates_membership_flags() {
        use crate::store::SqliteStore;

        let store = SqliteStore::open_in_memory().unwrap();
        store
            .ensure_memberships(
                "d",
                "me",
                TimelineKind::Home,
                &ids(&["9", "8", "7", "6"]),
            )
            .await
            .unwrap();
        store
            .set_has_more("d", "me", TimelineKind::Home, "9", true)
            .await
            .unwrap();

        let decision = detect(Some("9"), &set(&["9"]), &ids(&["8", "7", "6"]));
        apply(&store, "d", "me", TimelineKind::Home, &decision)
            .await
            .unwrap();

        assert_eq!(
            store.has_more("d", "me", TimelineKind::Home, "9").await.unwrap(),
            Some(false)
        );
        assert_eq!(
            store.has_more("d", "me", TimelineKind::Home, "6").await.unwrap(),
            Some(true)
        );
    }
}
