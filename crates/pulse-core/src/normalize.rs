//! Normalization of raw adapter records into [`Event`]s.
//!
//! Timestamps are stored as naive UTC: a time carrying an offset is shifted
//! by that offset and the offset dropped. When a backend reports a time
//! with no offset at all, the clock face is kept unmodified - an exact
//! offset-less timestamp is preferable to losing the event.

use chrono::{DateTime, FixedOffset, NaiveDateTime};

use crate::diff::format_diff;
use crate::event::{AuthorIdentity, Event, EventId, EventPayload, NaturalKey, RawCommit, RawFeedEntry};
use crate::store::IdentityResolver;

/// Timestamp formats accepted for offset-less backend output.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// A timestamp as a backend reported it, before UTC normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTimestamp {
    /// Local time with a known UTC offset.
    WithOffset(DateTime<FixedOffset>),
    /// Local time with no offset available.
    Local(NaiveDateTime),
}

impl RawTimestamp {
    /// Parses a backend timestamp string. Accepts RFC 3339 (git
    /// `iso-strict`, Atom), RFC 2822 (RSS `pubDate`), and a couple of
    /// offset-less fallback shapes.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(Self::WithOffset(dt));
        }
        if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
            return Some(Self::WithOffset(dt));
        }
        // bzr style: "Sat 2010-05-01 10:00:00 +0200"
        if let Ok(dt) = DateTime::parse_from_str(raw, "%a %Y-%m-%d %H:%M:%S %z") {
            return Some(Self::WithOffset(dt));
        }
        for format in NAIVE_FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
                return Some(Self::Local(dt));
            }
        }
        None
    }

    /// Normalizes to naive UTC: `local - utc_offset` when an offset is
    /// known, the unmodified clock face otherwise.
    #[must_use]
    pub fn to_utc(self) -> NaiveDateTime {
        match self {
            Self::WithOffset(dt) => dt.naive_utc(),
            Self::Local(dt) => dt,
        }
    }
}

/// Extracts the title of a commit message: its first line, or the whole
/// message when it has no line break.
#[must_use]
pub fn title_of(message: &str) -> &str {
    message.lines().next().unwrap_or(message)
}

fn bind_author(name: &str, resolver: &dyn IdentityResolver) -> AuthorIdentity {
    match resolver.find_user_by_identity(name) {
        Some(user) => AuthorIdentity::Known(user),
        None => AuthorIdentity::Name(name.to_string()),
    }
}

/// Normalizes a raw VCS commit into an [`Event`].
///
/// The diff, when present, is rendered through the diff formatter and
/// attached as the event payload.
#[must_use]
pub fn normalize_commit(raw: &RawCommit, resolver: &dyn IdentityResolver) -> Event {
    Event {
        id: EventId::new(),
        natural_key: NaturalKey::VcsId(raw.vcs_id.clone()),
        title: title_of(&raw.message).to_string(),
        body: raw.message.clone(),
        timestamp: raw.timestamp.to_utc(),
        author: bind_author(&raw.author, resolver),
        from_feed: false,
        payload: raw.diff.as_deref().map(|diff| EventPayload::Diff {
            text: format_diff(diff),
        }),
    }
}

/// Normalizes a raw feed entry into an [`Event`].
///
/// Feed entries have no stable native id, so the natural key is the
/// `(title, timestamp, author)` composite.
#[must_use]
pub fn normalize_feed_entry(raw: &RawFeedEntry, resolver: &dyn IdentityResolver) -> Event {
    let timestamp = raw.timestamp.to_utc();
    Event {
        id: EventId::new(),
        natural_key: NaturalKey::Composite {
            title: raw.title.clone(),
            timestamp,
            author: raw.author_name.clone(),
        },
        title: raw.title.clone(),
        body: raw.description.clone(),
        timestamp,
        author: bind_author(&raw.author_name, resolver),
        from_feed: true,
        payload: None,
    }
}
