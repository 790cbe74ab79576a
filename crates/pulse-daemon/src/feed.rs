//! Feed adapter: HTTP fetch and RSS/Atom parsing.
//!
//! Used for sources with no clonable repository - hosted-forge activity
//! feeds and project blogs alike. The feed itself is assumed to be
//! recency-bounded, so no lookback window applies here; natural-key dedup
//! in the orchestrator absorbs re-reads of already-seen entries.

use std::time::Duration;

use async_trait::async_trait;
use pulse_core::normalize::RawTimestamp;
use pulse_core::{RawFeedEntry, SyncConfig};
use thiserror::Error;
use tracing::{debug, warn};

/// User agent sent with feed requests.
const USER_AGENT: &str = concat!("pulse-sync/", env!("CARGO_PKG_VERSION"));

/// Errors raised while fetching or parsing a feed. Recoverable per source,
/// same isolation policy as VCS failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FeedError {
    /// Transport-level failure (DNS, connect, TLS, timeout).
    #[error("feed request failed: {0}")]
    Http(String),

    /// Server answered with a non-success status.
    #[error("feed request to {url} returned status {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Feed document exceeds the configured size bound.
    #[error("feed document exceeds {limit} bytes")]
    TooLarge {
        /// The configured bound.
        limit: u64,
    },

    /// Document is not well-formed RSS or Atom.
    #[error("feed parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for FeedError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value.to_string())
    }
}

/// The adapter seam the orchestrator dispatches feed sources through.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetches and parses the feed at `feed_url`.
    async fn fetch_feed(&self, feed_url: &str) -> Result<Vec<RawFeedEntry>, FeedError>;
}

/// Production feed adapter over HTTP.
pub struct FeedAdapter {
    client: reqwest::Client,
    max_bytes: u64,
}

impl FeedAdapter {
    /// Builds an adapter from the sync configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::Http`] when the HTTP client cannot be
    /// constructed.
    pub fn new(config: &SyncConfig) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(config.feed_timeout())
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            max_bytes: config.max_feed_bytes,
        })
    }
}

#[async_trait]
impl FeedSource for FeedAdapter {
    async fn fetch_feed(&self, feed_url: &str) -> Result<Vec<RawFeedEntry>, FeedError> {
        debug!(url = %feed_url, "fetching feed");

        let response = self.client.get(feed_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status {
                url: feed_url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(FeedError::TooLarge {
                    limit: self.max_bytes,
                });
            }
        }

        let body = response.bytes().await?;
        if body.len() as u64 > self.max_bytes {
            return Err(FeedError::TooLarge {
                limit: self.max_bytes,
            });
        }

        let text = String::from_utf8_lossy(&body);
        parse_feed(&text)
    }
}

/// Which flavor of document the root element announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedFlavor {
    Rss,
    Atom,
}

/// Fields collected for the entry currently being parsed.
#[derive(Debug, Default)]
struct PartialEntry {
    title: Option<String>,
    description: Option<String>,
    author_name: Option<String>,
    timestamp: Option<RawTimestamp>,
}

impl PartialEntry {
    /// Finishes the entry. Entries without a title or a parsable date
    /// cannot be keyed or placed on the timeline and are dropped.
    fn finish(self) -> Option<RawFeedEntry> {
        let title = self.title?;
        let Some(timestamp) = self.timestamp else {
            warn!(title = %title, "skipping feed entry without a parsable date");
            return None;
        };
        Some(RawFeedEntry {
            title,
            description: self.description.unwrap_or_default(),
            author_name: self.author_name.unwrap_or_default(),
            timestamp,
        })
    }
}

/// Stores element text into the slot the surrounding element selected.
fn assign_field(entry: &mut PartialEntry, field: Option<&'static str>, text: String) {
    match field {
        Some("title") => entry.title = Some(text),
        Some("description") => entry.description = Some(text),
        Some("summary") => {
            if entry.description.is_none() {
                entry.description = Some(text);
            }
        },
        Some("author") => entry.author_name = Some(text),
        Some("date") => entry.timestamp = RawTimestamp::parse(&text),
        Some("updated") => {
            if entry.timestamp.is_none() {
                entry.timestamp = RawTimestamp::parse(&text);
            }
        },
        _ => {},
    }
}

/// Parses an RSS 2.0 or Atom 1.0 document into raw entries, in document
/// order. Unknown elements are ignored.
///
/// # Errors
///
/// Returns [`FeedError::Parse`] on malformed XML or a root element that is
/// neither `<rss>` nor `<feed>`.
pub fn parse_feed(xml: &str) -> Result<Vec<RawFeedEntry>, FeedError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut flavor = None;
    let mut entries = Vec::new();
    let mut current: Option<PartialEntry> = None;
    let mut in_author = false;
    let mut field: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                let name = std::str::from_utf8(name.as_ref()).unwrap_or("");

                if flavor.is_none() {
                    flavor = Some(match name {
                        "rss" | "RDF" => FeedFlavor::Rss,
                        "feed" => FeedFlavor::Atom,
                        other => {
                            return Err(FeedError::Parse(format!(
                                "unrecognized feed root element <{other}>"
                            )));
                        },
                    });
                    continue;
                }

                match (flavor, name) {
                    (Some(FeedFlavor::Rss), "item") | (Some(FeedFlavor::Atom), "entry") => {
                        current = Some(PartialEntry::default());
                    },
                    _ if current.is_none() => {},
                    (_, "title") => field = Some("title"),
                    (Some(FeedFlavor::Rss), "description")
                    | (Some(FeedFlavor::Atom), "content") => field = Some("description"),
                    // Atom summary only counts when no content was seen.
                    (Some(FeedFlavor::Atom), "summary") => field = Some("summary"),
                    (Some(FeedFlavor::Rss), "pubDate")
                    | (Some(FeedFlavor::Rss), "date")
                    | (Some(FeedFlavor::Atom), "published") => field = Some("date"),
                    (Some(FeedFlavor::Atom), "updated") => field = Some("updated"),
                    (Some(FeedFlavor::Rss), "creator") | (Some(FeedFlavor::Rss), "author") => {
                        field = Some("author");
                    },
                    (Some(FeedFlavor::Atom), "author") => in_author = true,
                    (Some(FeedFlavor::Atom), "name") if in_author => field = Some("author"),
                    _ => {},
                }
            },
            Ok(Event::Text(e)) => {
                if let Some(entry) = current.as_mut() {
                    let text = e.unescape().unwrap_or_default().to_string();
                    assign_field(entry, field, text);
                }
            },
            Ok(Event::CData(e)) => {
                if let Some(entry) = current.as_mut() {
                    let text = String::from_utf8_lossy(e.as_ref()).to_string();
                    assign_field(entry, field, text);
                }
            },
            Ok(Event::End(e)) => {
                let name = e.local_name();
                let name = std::str::from_utf8(name.as_ref()).unwrap_or("");
                match name {
                    "item" | "entry" => {
                        if let Some(done) = current.take().and_then(PartialEntry::finish) {
                            entries.push(done);
                        }
                    },
                    "author" => in_author = false,
                    _ => {},
                }
                field = None;
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(FeedError::Parse(e.to_string())),
            _ => {},
        }
    }

    if flavor.is_none() {
        return Err(FeedError::Parse("document has no root element".to_string()));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>Project blog</title>
    <item>
      <title>Weekly update</title>
      <description>&lt;p&gt;progress&lt;/p&gt;</description>
      <dc:creator>Grace</dc:creator>
      <pubDate>Sat, 01 May 2010 10:00:00 +0200</pubDate>
    </item>
    <item>
      <title>No date, dropped</title>
      <description>x</description>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Commits</title>
  <updated>2010-05-02T00:00:00Z</updated>
  <entry>
    <title>Fix bug</title>
    <content type="html">longer description</content>
    <author><name>Ada</name></author>
    <published>2010-05-01T10:00:00+02:00</published>
  </entry>
</feed>"#;

    #[test]
    fn parses_rss_items() {
        let entries = parse_feed(RSS).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.title, "Weekly update");
        assert_eq!(entry.description, "<p>progress</p>");
        assert_eq!(entry.author_name, "Grace");
        assert_eq!(
            entry.timestamp.to_utc(),
            NaiveDate::from_ymd_opt(2010, 5, 1)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn parses_atom_entries() {
        let entries = parse_feed(ATOM).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.title, "Fix bug");
        assert_eq!(entry.description, "longer description");
        assert_eq!(entry.author_name, "Ada");
        assert_eq!(
            entry.timestamp.to_utc(),
            NaiveDate::from_ymd_opt(2010, 5, 1)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn feed_channel_title_does_not_leak_into_entries() {
        let entries = parse_feed(RSS).unwrap();
        assert!(entries.iter().all(|e| e.title != "Project blog"));
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        assert!(matches!(
            parse_feed("<rss><channel><item></rss>"),
            Err(FeedError::Parse(_))
        ));
    }

    #[test]
    fn non_feed_document_is_rejected() {
        assert!(matches!(
            parse_feed("<html><body/></html>"),
            Err(FeedError::Parse(_))
        ));
    }
}
