//! Tracked sources and the closed set of supported version control systems.
//!
//! A [`TrackedSource`] is one project's external activity origin: either a
//! repository we clone and inspect locally, or an RSS/Atom feed we poll.
//! The two are mutually exclusive and modeled as a tagged [`SourceOrigin`].

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier for a tracked source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(Uuid);

impl SourceId {
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

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Configuration references a version control system outside the supported
/// set. Not transient: the source is skipped until its configuration is
/// fixed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported version control system: {0}")]
pub struct UnsupportedVcs(pub String);

/// The closed set of version control systems we know how to clone and
/// inspect.
///
/// Subversion is bridged through `git svn`, so extraction for `Svn` runs on
/// a git working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    Git,
    Svn,
    Hg,
    Bzr,
}

impl VcsKind {
    /// Returns the canonical lowercase name, matching the executable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Svn => "svn",
            Self::Hg => "hg",
            Self::Bzr => "bzr",
        }
    }

    /// The verb used in the human-facing clone command for this system.
    #[must_use]
    pub const fn clone_verb(&self) -> &'static str {
        match self {
            Self::Git => "clone",
            Self::Svn => "co",
            Self::Hg => "clone",
            Self::Bzr => "branch",
        }
    }
}

impl fmt::Display for VcsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VcsKind {
    type Err = UnsupportedVcs;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(Self::Git),
            "svn" => Ok(Self::Svn),
            "hg" => Ok(Self::Hg),
            "bzr" => Ok(Self::Bzr),
            other => Err(UnsupportedVcs(other.to_string())),
        }
    }
}

/// Where a source's activity comes from. A source is either clone-based or
/// feed-based, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceOrigin {
    /// A repository reached by cloning with a native VCS tool.
    Cloned {
        /// Address handed to the clone command.
        clone_url: String,
        /// Which tool clones and inspects the repository.
        vcs: VcsKind,
        /// Overrides the rendered clone command for display, when the
        /// default `<vcs> <verb> <url>` form is misleading.
        clone_command_override: Option<String>,
    },
    /// An RSS or Atom feed polled over HTTP.
    Feed {
        /// Feed document URL.
        feed_url: String,
    },
}

impl SourceOrigin {
    /// Returns true for feed-based sources.
    #[must_use]
    pub const fn is_feed(&self) -> bool {
        matches!(self, Self::Feed { .. })
    }
}

/// A project's external activity origin together with its sync state.
///
/// Created by project administration; the synchronization core only ever
/// mutates `most_recent_event_time`, and only as part of a successful sync
/// commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedSource {
    /// Opaque id; events are keyed by it.
    pub id: SourceId,
    /// Human-facing URL, display only.
    pub web_url: String,
    /// The owning project's stable path segment. Determines the local
    /// working-copy directory, so repeated runs target the same clone.
    pub slug: String,
    /// Clone-based or feed-based origin.
    pub origin: SourceOrigin,
    /// UTC high-water mark: the latest event timestamp already
    /// incorporated. `None` until the first successful sync; never
    /// decreases afterwards.
    pub most_recent_event_time: Option<NaiveDateTime>,
}

impl TrackedSource {
    /// Renders the human-facing clone command, or `None` for feed sources.
    ///
    /// Honors the per-source override when one is configured.
    #[must_use]
    pub fn clone_command(&self) -> Option<String> {
        match &self.origin {
            SourceOrigin::Cloned {
                clone_url,
                vcs,
                clone_command_override,
            } => Some(clone_command_override.clone().unwrap_or_else(|| {
                format!("{} {} {}", vcs.as_str(), vcs.clone_verb(), clone_url)
            })),
            SourceOrigin::Feed { .. } => None,
        }
    }
}
