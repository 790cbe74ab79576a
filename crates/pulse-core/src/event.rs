//! Normalized events and the raw records adapters produce.
//!
//! An [`Event`] is the common representation of one unit of activity - a
//! commit or a feed entry - after normalization. Events are append-only:
//! once persisted they are never mutated, and resync only adds events whose
//! natural key has not been seen for the owning source.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::normalize::RawTimestamp;
use crate::store::UserRef;

/// Opaque identifier for a persisted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID (used when decoding stored rows).
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The identity used to detect an already-seen event during merge.
///
/// Clone-derived events carry a stable VCS-native identifier. Feed entries
/// have none, so their identity is the `(title, timestamp, author)`
/// composite the original entry was published with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NaturalKey {
    /// VCS-native commit identifier (git/hg hash, bzr revno).
    VcsId(String),
    /// Composite identity for feed entries.
    Composite {
        title: String,
        timestamp: NaiveDateTime,
        author: String,
    },
}

impl NaturalKey {
    /// Renders the key as the stable string stored under the per-source
    /// uniqueness index. Fields are joined with an unit separator so no
    /// printable title or author name can collide across variants.
    #[must_use]
    pub fn storage_key(&self) -> String {
        match self {
            Self::VcsId(id) => format!("vcs\u{1f}{id}"),
            Self::Composite {
                title,
                timestamp,
                author,
            } => format!(
                "feed\u{1f}{title}\u{1f}{}\u{1f}{author}",
                timestamp.format("%Y-%m-%dT%H:%M:%S")
            ),
        }
    }
}

/// Who produced an event: a registered user when the identity service
/// recognizes the author, otherwise the free-text name the backend
/// reported. Exactly one of the two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorIdentity {
    /// Reference to a known registered user.
    Known(UserRef),
    /// Free-text display name.
    Name(String),
}

impl AuthorIdentity {
    /// The name to display for this author.
    #[must_use]
    pub fn display_name(&self) -> &str {
        match self {
            Self::Known(user) => &user.login,
            Self::Name(name) => name,
        }
    }
}

/// Backend-specific extra data attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EventPayload {
    /// Formatted diff text for a VCS commit.
    Diff { text: String },
}

/// One normalized unit of activity attributed to a tracked source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Opaque id.
    pub id: EventId,
    /// Dedup identity, unique per source.
    pub natural_key: NaturalKey,
    /// First line of the commit message, or the feed entry title.
    pub title: String,
    /// Full commit message or feed entry content.
    pub body: String,
    /// UTC, no offset retained.
    pub timestamp: NaiveDateTime,
    /// Bound user reference or free-text author name.
    pub author: AuthorIdentity,
    /// Whether the event came from a feed. Feed events never carry a
    /// payload.
    pub from_feed: bool,
    /// Formatted diff text for VCS commits; absent for feed events.
    pub payload: Option<EventPayload>,
}

/// A commit as extracted from a local working copy, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommit {
    /// VCS-native identifier.
    pub vcs_id: String,
    /// Author as the backend reports it.
    pub author: String,
    /// Full commit message.
    pub message: String,
    /// Commit time as recorded, offset included when the backend provides
    /// one.
    pub timestamp: RawTimestamp,
    /// Raw line-level diff, when extraction produced one.
    pub diff: Option<String>,
}

/// A feed entry as parsed from an RSS/Atom document, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFeedEntry {
    /// Entry title.
    pub title: String,
    /// Entry content/description.
    pub description: String,
    /// Author display name from the entry.
    pub author_name: String,
    /// Publication time as the feed states it.
    pub timestamp: RawTimestamp,
}
