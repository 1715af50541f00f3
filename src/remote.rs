//! Typed wire entities handed in by network-client collaborators.
//!
//! The entity kinds form a closed union: adding or removing a kind is a
//! compile-time exhaustiveness error in every reconcile match, not a silent
//! runtime gap.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{RecordKey, RecordKind};

/// Backend platform a batch originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Twitter,
    Mastodon,
}

impl Platform {
    /// The implicit domain for single-tenant backends. Mastodon callers pass
    /// the instance domain instead.
    pub fn implicit_domain(&self) -> Option<&'static str> {
        match self {
            Platform::Twitter => Some("twitter.com"),
            Platform::Mastodon => None,
        }
    }
}

/// Kind of media attached to a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    AnimatedGif,
    Audio,
}

/// A media descriptor carried denormalized inside a status payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMedia {
    pub url: String,
    pub preview_url: Option<String>,
    pub kind: MediaKind,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteUser {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub followers_count: u64,
    pub following_count: u64,
    pub statuses_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePollOption {
    pub id: String,
    pub title: String,
    pub votes_count: u64,
    /// Display position within the poll, zero-based.
    pub position: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub reply_count: u64,
    pub repost_count: u64,
    pub favorite_count: u64,
    #[serde(default)]
    pub media: Vec<RemoteMedia>,
    pub author: Option<Box<RemoteUser>>,
    pub repost_of: Option<Box<RemoteStatus>>,
    pub quote_of: Option<Box<RemoteStatus>>,
    #[serde(default)]
    pub poll_options: Vec<RemotePollOption>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Follow,
    Favorite,
    Repost,
    Mention,
    Poll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteNotification {
    pub id: String,
    pub kind: NotificationKind,
    pub created_at: DateTime<Utc>,
    /// The account that triggered the notification.
    pub account: Option<Box<RemoteUser>>,
    /// The status the notification refers to, if any.
    pub status: Option<Box<RemoteStatus>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteList {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub owner: Option<Box<RemoteUser>>,
    pub member_count: u64,
}

/// Tagged union over every entity kind a backend can hand us.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteEntity {
    Status(RemoteStatus),
    User(RemoteUser),
    Notification(RemoteNotification),
    List(RemoteList),
    PollOption(RemotePollOption),
}

impl RemoteEntity {
    pub fn remote_id(&self) -> &str {
        match self {
            RemoteEntity::Status(s) => &s.id,
            RemoteEntity::User(u) => &u.id,
            RemoteEntity::Notification(n) => &n.id,
            RemoteEntity::List(l) => &l.id,
            RemoteEntity::PollOption(p) => &p.id,
        }
    }

    pub fn record_kind(&self) -> RecordKind {
        match self {
            RemoteEntity::Status(_) => RecordKind::Status,
            RemoteEntity::User(_) => RecordKind::User,
            RemoteEntity::Notification(_) => RecordKind::Notification,
            RemoteEntity::List(_) => RecordKind::List,
            RemoteEntity::PollOption(_) => RecordKind::PollOption,
        }
    }

    /// Collect this entity's key and the keys of every nested entity,
    /// recursively. Drives the single batched prewarm query at the start of
    /// a reconciliation batch.
    pub fn collect_keys(&self, out: &mut HashSet<RecordKey>) {
        match self {
            RemoteEntity::Status(s) => collect_status_keys(s, out),
            RemoteEntity::User(u) => {
                insert_key(out, RecordKind::User, &u.id);
            }
            RemoteEntity::Notification(n) => {
                insert_key(out, RecordKind::Notification, &n.id);
                if let Some(account) = &n.account {
                    insert_key(out, RecordKind::User, &account.id);
                }
                if let Some(status) = &n.status {
                    collect_status_keys(status, out);
                }
            }
            RemoteEntity::List(l) => {
                insert_key(out, RecordKind::List, &l.id);
                if let Some(owner) = &l.owner {
                    insert_key(out, RecordKind::User, &owner.id);
                }
            }
            RemoteEntity::PollOption(p) => {
                insert_key(out, RecordKind::PollOption, &p.id);
            }
        }
    }
}

fn collect_status_keys(status: &RemoteStatus, out: &mut HashSet<RecordKey>) {
    insert_key(out, RecordKind::Status, &status.id);
    if let Some(author) = &status.author {
        insert_key(out, RecordKind::User, &author.id);
    }
    if let Some(repost) = &status.repost_of {
        collect_status_keys(repost, out);
    }
    if let Some(quote) = &status.quote_of {
        collect_status_keys(quote, out);
    }
    for option in &status.poll_options {
        insert_key(out, RecordKind::PollOption, &option.id);
    }
}

fn insert_key(out: &mut HashSet<RecordKey>, kind: RecordKind, id: &str) {
    // Entities with no usable id are skipped during reconcile anyway.
    if !id.is_empty() {
        out.insert(RecordKey::new(kind, id));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn user(id: &str) -> RemoteUser {
        RemoteUser {
            id: id.to_string(),
            username: format!("user_{id}"),
            display_name: format!("User {id}"),
            avatar_url: None,
            followers_count: 0,
            following_count: 0,
            statuses_count: 0,
        }
    }

    pub(crate) fn status(id: &str, author_id: &str) -> RemoteStatus {
        RemoteStatus {
            id: id.to_string(),
            text: format!("status {id}"),
            created_at: Utc::now(),
            reply_count: 0,
            repost_count: 0,
            favorite_count: 0,
            media: Vec::new(),
            author: Some(Box::new(user(author_id))),
            repost_of: None,
            quote_of: None,
            poll_options: Vec::new(),
        }
    }

    #[test]
    fn test_collect_keys_nested_status() {
        let mut s = status("100", "7");
        s.repost_of = Some(Box::new(status("99", "8")));
        let mut keys = HashSet::new();
        RemoteEntity::Status(s).collect_keys(&mut keys);

        assert!(keys.contains(&RecordKey::new(RecordKind::Status, "100")));
        assert!(keys.contains(&RecordKey::new(RecordKind::Status, "99")));
        assert!(keys.contains(&RecordKey::new(RecordKind::User, "7")));
        assert!(keys.contains(&RecordKey::new(RecordKind::User, "8")));
        assert_eq!(keys.len(), 4);
    }

    #[test]
    fn test_collect_keys_skips_empty_ids() {
        let mut s = status("100", "7");
        s.author.as_mut().unwrap().id = String::new();
        let mut keys = HashSet::new();
        RemoteEntity::Status(s).collect_keys(&mut keys);
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_collect_keys_notification() {
        let n = RemoteNotification {
            id: "n1".to_string(),
            kind: NotificationKind::Mention,
            created_at: Utc::now(),
            account: Some(Box::new(user("5"))),
            status: Some(Box::new(status("42", "5"))),
        };
        let mut keys = HashSet::new();
        RemoteEntity::Notification(n).collect_keys(&mut keys);
        // Notification, status, one user (shared by account and author).
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn test_implicit_domain() {
        assert_eq!(Platform::Twitter.implicit_domain(), Some("twitter.com"));
        assert_eq!(Platform::Mastodon.implicit_domain(), None);
    }
}
