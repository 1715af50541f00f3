//! Types for the store module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::{MediaKind, NotificationKind, RemoteMedia};

/// Entity kind of a local record.
///
/// Remote ids are only unique per kind per backend, so the kind is part of
/// the durable natural key alongside `(domain, remote_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    Status = 0,
    User = 1,
    Notification = 2,
    List = 3,
    PollOption = 4,
}

impl RecordKind {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::User => "user",
            Self::Notification => "notification",
            Self::List => "list",
            Self::PollOption => "poll_option",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "status" => Some(Self::Status),
            "user" => Some(Self::User),
            "notification" => Some(Self::Notification),
            "list" => Some(Self::List),
            "poll_option" => Some(Self::PollOption),
            _ => None,
        }
    }
}

/// Which timeline a membership marker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimelineKind {
    Home,
    Mentions,
}

impl TimelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Home => "home",
            Self::Mentions => "mentions",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "home" => Some(Self::Home),
            "mentions" => Some(Self::Mentions),
            _ => None,
        }
    }
}

/// Lookup key for a record within one domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub kind: RecordKind,
    pub remote_id: String,
}

impl RecordKey {
    pub fn new(kind: RecordKind, remote_id: impl Into<String>) -> Self {
        Self {
            kind,
            remote_id: remote_id.into(),
        }
    }
}

/// Denormalized status payload, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub reply_count: u64,
    pub repost_count: u64,
    pub favorite_count: u64,
    #[serde(default)]
    pub media: Vec<RemoteMedia>,
    /// Poll option record ids in display order.
    #[serde(default)]
    pub poll_option_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub followers_count: u64,
    pub following_count: u64,
    pub statuses_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub kind: NotificationKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListPayload {
    pub title: String,
    pub description: Option<String>,
    pub member_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollOptionPayload {
    pub title: String,
    pub votes_count: u64,
    pub position: u32,
}

/// Per-kind denormalized payload of a local record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Status(StatusPayload),
    User(UserPayload),
    Notification(NotificationPayload),
    List(ListPayload),
    PollOption(PollOptionPayload),
}

impl Payload {
    pub fn kind(&self) -> RecordKind {
        match self {
            Payload::Status(_) => RecordKind::Status,
            Payload::User(_) => RecordKind::User,
            Payload::Notification(_) => RecordKind::Notification,
            Payload::List(_) => RecordKind::List,
            Payload::PollOption(_) => RecordKind::PollOption,
        }
    }
}

/// The persisted representation of a remote entity.
///
/// `created_at` is the first-seen timestamp and never changes after insert;
/// `updated_at` is the network timestamp of the last reconciliation that
/// merged into this record. Relation fields hold remote ids of other records
/// in the same domain.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    pub domain: String,
    pub remote_id: String,
    pub payload: Payload,
    /// Status author, notification account, or list owner.
    pub author_id: Option<String>,
    pub repost_of_id: Option<String>,
    pub quote_of_id: Option<String>,
    /// The status a notification or poll option refers to.
    pub subject_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalRecord {
    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.kind(), self.remote_id.clone())
    }
}

/// Summary of the store contents for one domain.
#[derive(Debug, Clone)]
pub struct StoreSummary {
    pub total_records: u64,
    pub statuses: u64,
    pub users: u64,
    pub timeline_entries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_record_kind_round_trip() {
        for kind in [
            RecordKind::Status,
            RecordKind::User,
            RecordKind::Notification,
            RecordKind::List,
            RecordKind::PollOption,
        ] {
            assert_eq!(RecordKind::from_str(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_record_kind_from_invalid() {
        assert_eq!(RecordKind::from_str("invalid"), None);
    }

    #[test]
    fn test_record_kind_size() {
        assert_eq!(size_of::<RecordKind>(), 1);
    }

    #[test]
    fn test_timeline_kind_round_trip() {
        for kind in [TimelineKind::Home, TimelineKind::Mentions] {
            assert_eq!(TimelineKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(TimelineKind::from_str("bogus"), None);
    }

    #[test]
    fn test_payload_kind_matches_variant() {
        let payload = Payload::PollOption(PollOptionPayload {
            title: "yes".to_string(),
            votes_count: 3,
            position: 0,
        });
        assert_eq!(payload.kind(), RecordKind::PollOption);
    }

    #[test]
    fn test_payload_json_round_trip() {
        let payload = Payload::Status(StatusPayload {
            text: "hello".to_string(),
            created_at: Utc::now(),
            reply_count: 1,
            repost_count: 2,
            favorite_count: 3,
            media: vec![RemoteMedia {
                url: "https://example.com/a.png".to_string(),
                preview_url: None,
                kind: MediaKind::Photo,
                width: Some(100),
                height: Some(50),
            }],
            poll_option_ids: vec!["p1".to_string()],
        });
        let json = serde_json::to_string(&payload).unwrap();
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
