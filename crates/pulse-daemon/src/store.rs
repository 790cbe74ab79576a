//! SQLite-backed source registry and event store.
//!
//! One connection serves both tables. The natural-key uniqueness invariant
//! is enforced by the schema (`UNIQUE(source_id, natural_key)`) and
//! appends use `INSERT OR IGNORE`, so replaying an overlapping fetch
//! window is harmless. The per-run commit - new events plus the advanced
//! high-water mark - happens inside a single transaction.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDateTime;
use pulse_core::{
    AuthorIdentity, Event, EventId, EventPayload, NaturalKey, SourceId, SourceOrigin, StoreError,
    TrackedSource, UserRef, VcsKind,
};
use pulse_core::{EventStore, SourceRegistry, SyncStore};
use rusqlite::{params, Connection, Row};
use tracing::warn;
use uuid::Uuid;

/// Timestamp column format. Naive UTC, second resolution.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Schema for the sources and events tables.
const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sources (
        id TEXT PRIMARY KEY,
        web_url TEXT NOT NULL,
        slug TEXT NOT NULL UNIQUE,
        origin TEXT NOT NULL CHECK (origin IN ('cloned', 'feed')),
        clone_url TEXT,
        vcs TEXT,
        clone_command TEXT,
        feed_url TEXT,
        most_recent_event_time TEXT
    );

    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL REFERENCES sources(id),
        natural_key TEXT NOT NULL,
        title TEXT NOT NULL,
        body TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        author_user_id INTEGER,
        author_user_login TEXT,
        author_name TEXT,
        from_feed INTEGER NOT NULL,
        payload TEXT,
        UNIQUE (source_id, natural_key)
    );

    CREATE INDEX IF NOT EXISTS idx_events_source_time
        ON events(source_id, timestamp DESC);
";

fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_ts(raw: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// SQLite store implementing the registry, event-store and sync-commit
/// contracts.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (and initializes) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error when schema initialization fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Database(format!("connection mutex poisoned: {e}")))
    }

    fn decode_source(row: &Row<'_>) -> Result<TrackedSource, StoreError> {
        let id: String = row.get(0).map_err(db_err)?;
        let web_url: String = row.get(1).map_err(db_err)?;
        let slug: String = row.get(2).map_err(db_err)?;
        let origin: String = row.get(3).map_err(db_err)?;
        let clone_url: Option<String> = row.get(4).map_err(db_err)?;
        let vcs: Option<String> = row.get(5).map_err(db_err)?;
        let clone_command: Option<String> = row.get(6).map_err(db_err)?;
        let feed_url: Option<String> = row.get(7).map_err(db_err)?;
        let mark: Option<String> = row.get(8).map_err(db_err)?;

        let id = Uuid::parse_str(&id)
            .map(SourceId::from_uuid)
            .map_err(|e| StoreError::Corrupt(format!("bad source id {id:?}: {e}")))?;

        let origin = match origin.as_str() {
            "cloned" => {
                let clone_url = clone_url
                    .ok_or_else(|| StoreError::Corrupt("cloned source without clone_url".into()))?;
                let vcs = vcs
                    .ok_or_else(|| StoreError::Corrupt("cloned source without vcs kind".into()))?;
                let vcs = VcsKind::from_str(&vcs)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                SourceOrigin::Cloned {
                    clone_url,
                    vcs,
                    clone_command_override: clone_command,
                }
            },
            "feed" => SourceOrigin::Feed {
                feed_url: feed_url
                    .ok_or_else(|| StoreError::Corrupt("feed source without feed_url".into()))?,
            },
            other => {
                return Err(StoreError::Corrupt(format!("unknown origin {other:?}")));
            },
        };

        Ok(TrackedSource {
            id,
            web_url,
            slug,
            origin,
            most_recent_event_time: mark.as_deref().map(parse_ts).transpose()?,
        })
    }

    fn decode_event(row: &Row<'_>) -> Result<Event, StoreError> {
        let id: String = row.get(0).map_err(db_err)?;
        let natural_key: String = row.get(1).map_err(db_err)?;
        let title: String = row.get(2).map_err(db_err)?;
        let body: String = row.get(3).map_err(db_err)?;
        let timestamp: String = row.get(4).map_err(db_err)?;
        let author_user_id: Option<i64> = row.get(5).map_err(db_err)?;
        let author_user_login: Option<String> = row.get(6).map_err(db_err)?;
        let author_name: Option<String> = row.get(7).map_err(db_err)?;
        let from_feed: bool = row.get(8).map_err(db_err)?;
        let payload: Option<String> = row.get(9).map_err(db_err)?;

        let id = Uuid::parse_str(&id)
            .map(EventId::from_uuid)
            .map_err(|e| StoreError::Corrupt(format!("bad event id {id:?}: {e}")))?;
        let timestamp = parse_ts(&timestamp)?;

        let author = match (author_user_id, author_user_login, author_name) {
            (Some(user_id), Some(login), None) => AuthorIdentity::Known(UserRef {
                id: u64::try_from(user_id)
                    .map_err(|_| StoreError::Corrupt("negative author user id".into()))?,
                login,
            }),
            (None, None, Some(name)) => AuthorIdentity::Name(name),
            _ => {
                return Err(StoreError::Corrupt(
                    "event row must carry exactly one author identity".into(),
                ));
            },
        };

        let natural_key = decode_natural_key(&natural_key)?;
        let payload = payload
            .as_deref()
            .map(|raw| {
                serde_json::from_str::<EventPayload>(raw)
                    .map_err(|e| StoreError::Corrupt(format!("bad payload: {e}")))
            })
            .transpose()?;

        Ok(Event {
            id,
            natural_key,
            title,
            body,
            timestamp,
            author,
            from_feed,
            payload,
        })
    }

    /// Inserts events inside an open transaction, ignoring natural-key
    /// duplicates. Returns how many rows were actually inserted.
    fn insert_events(
        tx: &rusqlite::Transaction<'_>,
        source_id: SourceId,
        events: &[Event],
    ) -> Result<usize, StoreError> {
        let mut inserted = 0;
        for event in events {
            let (author_user_id, author_user_login, author_name) = match &event.author {
                AuthorIdentity::Known(user) => {
                    (Some(i64::try_from(user.id).unwrap_or(i64::MAX)), Some(user.login.clone()), None)
                },
                AuthorIdentity::Name(name) => (None, None, Some(name.clone())),
            };
            let payload = event
                .payload
                .as_ref()
                .map(|p| {
                    serde_json::to_string(p)
                        .map_err(|e| StoreError::Database(format!("payload encode: {e}")))
                })
                .transpose()?;

            let changed = tx
                .execute(
                    "INSERT OR IGNORE INTO events
                     (id, source_id, natural_key, title, body, timestamp,
                      author_user_id, author_user_login, author_name, from_feed, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        event.id.to_string(),
                        source_id.to_string(),
                        event.natural_key.storage_key(),
                        event.title,
                        event.body,
                        format_ts(event.timestamp),
                        author_user_id,
                        author_user_login,
                        author_name,
                        event.from_feed,
                        payload,
                    ],
                )
                .map_err(db_err)?;
            inserted += changed;
        }
        Ok(inserted)
    }
}

/// Reconstructs a [`NaturalKey`] from its storage form.
fn decode_natural_key(raw: &str) -> Result<NaturalKey, StoreError> {
    let parts: Vec<&str> = raw.split('\u{1f}').collect();
    match parts.as_slice() {
        ["vcs", id] => Ok(NaturalKey::VcsId((*id).to_string())),
        ["feed", title, timestamp, author] => Ok(NaturalKey::Composite {
            title: (*title).to_string(),
            timestamp: parse_ts(timestamp)?,
            author: (*author).to_string(),
        }),
        _ => Err(StoreError::Corrupt(format!("bad natural key {raw:?}"))),
    }
}

const SOURCE_COLUMNS: &str = "id, web_url, slug, origin, clone_url, vcs, clone_command, \
                              feed_url, most_recent_event_time";

const EVENT_COLUMNS: &str = "id, natural_key, title, body, timestamp, author_user_id, \
                             author_user_login, author_name, from_feed, payload";

impl SourceRegistry for SqliteStore {
    fn list_due_sources(&self) -> Result<Vec<TrackedSource>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY slug"))
            .map_err(db_err)?;

        let mut sources = Vec::new();
        let mut rows = stmt.query([]).map_err(db_err)?;
        while let Some(row) = rows.next().map_err(db_err)? {
            match Self::decode_source(row) {
                Ok(source) => sources.push(source),
                // One misconfigured row must not block the whole batch;
                // it is reported and the source skipped until fixed.
                Err(e) => warn!(error = %e, "skipping undecodable source row"),
            }
        }
        Ok(sources)
    }

    fn get_source(&self, id: SourceId) -> Result<Option<TrackedSource>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?1"))
            .map_err(db_err)?;
        let mut rows = stmt.query(params![id.to_string()]).map_err(db_err)?;
        match rows.next().map_err(db_err)? {
            Some(row) => Ok(Some(Self::decode_source(row)?)),
            None => Ok(None),
        }
    }

    fn register_source(&self, source: &TrackedSource) -> Result<(), StoreError> {
        let (origin, clone_url, vcs, clone_command, feed_url) = match &source.origin {
            SourceOrigin::Cloned {
                clone_url,
                vcs,
                clone_command_override,
            } => (
                "cloned",
                Some(clone_url.clone()),
                Some(vcs.as_str().to_string()),
                clone_command_override.clone(),
                None,
            ),
            SourceOrigin::Feed { feed_url } => {
                ("feed", None, None, None, Some(feed_url.clone()))
            },
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO sources
             (id, web_url, slug, origin, clone_url, vcs, clone_command, feed_url,
              most_recent_event_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                source.id.to_string(),
                source.web_url,
                source.slug,
                origin,
                clone_url,
                vcs,
                clone_command,
                feed_url,
                source.most_recent_event_time.map(format_ts),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn update_high_water_mark(
        &self,
        id: SourceId,
        mark: NaiveDateTime,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE sources SET most_recent_event_time = ?2 WHERE id = ?1",
                params![id.to_string(), format_ts(mark)],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(StoreError::SourceNotFound(id));
        }
        Ok(())
    }
}

impl EventStore for SqliteStore {
    fn append_events(&self, source_id: SourceId, events: &[Event]) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let inserted = Self::insert_events(&tx, source_id, events)?;
        tx.commit().map_err(db_err)?;
        Ok(inserted)
    }

    fn natural_keys(&self, source_id: SourceId) -> Result<HashSet<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT natural_key FROM events WHERE source_id = ?1")
            .map_err(db_err)?;
        let keys = stmt
            .query_map(params![source_id.to_string()], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<Result<HashSet<_>, _>>()
            .map_err(db_err)?;
        Ok(keys)
    }

    fn events_for_source(&self, source_id: SourceId) -> Result<Vec<Event>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE source_id = ?1 \
                 ORDER BY timestamp DESC"
            ))
            .map_err(db_err)?;

        let mut events = Vec::new();
        let mut rows = stmt.query(params![source_id.to_string()]).map_err(db_err)?;
        while let Some(row) = rows.next().map_err(db_err)? {
            events.push(Self::decode_event(row)?);
        }
        Ok(events)
    }
}

impl SyncStore for SqliteStore {
    fn commit_sync(
        &self,
        source_id: SourceId,
        events: &[Event],
        mark: Option<NaiveDateTime>,
    ) -> Result<usize, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let inserted = Self::insert_events(&tx, source_id, events)?;

        if let Some(mark) = mark {
            let changed = tx
                .execute(
                    "UPDATE sources SET most_recent_event_time = ?2 WHERE id = ?1",
                    params![source_id.to_string(), format_ts(mark)],
                )
                .map_err(db_err)?;
            if changed == 0 {
                // Roll the whole run back rather than leave events owned
                // by a source the registry does not know.
                drop(tx);
                return Err(StoreError::SourceNotFound(source_id));
            }
        }

        tx.commit().map_err(db_err)?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pulse_core::normalize::RawTimestamp;
    use pulse_core::{normalize_commit, NoIdentityResolver, RawCommit};

    use super::*;

    fn ts(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2010, 5, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn cloned_source(slug: &str) -> TrackedSource {
        TrackedSource {
            id: SourceId::new(),
            web_url: format!("https://example.org/{slug}"),
            slug: slug.to_string(),
            origin: SourceOrigin::Cloned {
                clone_url: format!("https://example.org/{slug}.git"),
                vcs: VcsKind::Git,
                clone_command_override: None,
            },
            most_recent_event_time: None,
        }
    }

    fn commit_event(id: &str, day: u32) -> Event {
        let raw = RawCommit {
            vcs_id: id.to_string(),
            author: "ada".to_string(),
            message: format!("commit {id}"),
            timestamp: RawTimestamp::parse(&format!("2010-05-{day:02}T10:00:00+02:00")).unwrap(),
            diff: Some("--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n".to_string()),
        };
        normalize_commit(&raw, &NoIdentityResolver)
    }

    #[test]
    fn register_and_list_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = cloned_source("proj");
        store.register_source(&source).unwrap();

        let listed = store.list_due_sources().unwrap();
        assert_eq!(listed, vec![source.clone()]);
        assert_eq!(store.get_source(source.id).unwrap(), Some(source));
    }

    #[test]
    fn undecodable_source_rows_are_skipped_not_fatal() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.register_source(&cloned_source("good")).unwrap();

        {
            let conn = store.lock().unwrap();
            conn.execute(
                "INSERT INTO sources (id, web_url, slug, origin, clone_url, vcs)
                 VALUES (?1, 'https://example.org/bad', 'bad', 'cloned',
                         'https://example.org/bad.git', 'cvs')",
                params![Uuid::new_v4().to_string()],
            )
            .unwrap();
        }

        let listed = store.list_due_sources().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].slug, "good");
    }

    #[test]
    fn append_ignores_duplicate_natural_keys() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = cloned_source("proj");
        store.register_source(&source).unwrap();

        let first = vec![commit_event("aaa", 1), commit_event("bbb", 2)];
        assert_eq!(store.append_events(source.id, &first).unwrap(), 2);

        // Overlapping window: one seen commit, one new.
        let second = vec![commit_event("bbb", 2), commit_event("ccc", 3)];
        assert_eq!(store.append_events(source.id, &second).unwrap(), 1);

        let keys = store.natural_keys(source.id).unwrap();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn events_round_trip_and_come_back_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = cloned_source("proj");
        store.register_source(&source).unwrap();

        let events = vec![commit_event("old", 1), commit_event("new", 3)];
        store.append_events(source.id, &events).unwrap();

        let stored = store.events_for_source(source.id).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].natural_key, NaturalKey::VcsId("new".to_string()));
        assert_eq!(stored[1].natural_key, NaturalKey::VcsId("old".to_string()));
        assert_eq!(stored[0].timestamp, ts(3, 8));
        assert!(matches!(
            stored[0].payload,
            Some(EventPayload::Diff { .. })
        ));
        assert_eq!(stored[0].author, AuthorIdentity::Name("ada".to_string()));
    }

    #[test]
    fn commit_sync_writes_events_and_mark_together() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = cloned_source("proj");
        store.register_source(&source).unwrap();

        let events = vec![commit_event("aaa", 1)];
        let inserted = store.commit_sync(source.id, &events, Some(ts(1, 8))).unwrap();
        assert_eq!(inserted, 1);

        let reloaded = store.get_source(source.id).unwrap().unwrap();
        assert_eq!(reloaded.most_recent_event_time, Some(ts(1, 8)));
    }

    #[test]
    fn commit_sync_for_unknown_source_rolls_back_events() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ghost = SourceId::new();

        let events = vec![commit_event("aaa", 1)];
        let err = store.commit_sync(ghost, &events, Some(ts(1, 8))).unwrap_err();
        assert!(matches!(err, StoreError::SourceNotFound(_)));
        assert!(store.natural_keys(ghost).unwrap().is_empty());
    }

    #[test]
    fn update_high_water_mark_requires_known_source() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            store.update_high_water_mark(SourceId::new(), ts(1, 8)),
            Err(StoreError::SourceNotFound(_))
        ));
    }
}
