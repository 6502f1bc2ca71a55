//! Fetching and parsing syndication documents.

use std::path::PathBuf;
use std::time::Duration;

use ::time::OffsetDateTime;
use anyhow::{Context, Result};
use async_trait::async_trait;
use feed_rs::model::Entry;
use feed_rs::parser::ParseFeedError;
use http_cache_reqwest::{CACacheManager, Cache, HttpCache, MokaCache, MokaManager};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use thiserror::Error;
use tokio::time;
use tracing::{debug, trace, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REDIRECTS: usize = 5;
const USER_AGENT: &str = concat!("rssagg/", env!("CARGO_PKG_VERSION"));

/// A candidate post extracted from a syndication document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedItem {
    pub title: String,
    pub description: Option<String>,
    pub link: String,
    pub published: Option<OffsetDateTime>,
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("could not fetch `{url}`")]
    Request {
        url: String,
        #[source]
        source: reqwest_middleware::Error,
    },

    #[error("fetching `{url}` timed out after {}s", .timeout.as_secs_f32())]
    Timeout { url: String, timeout: Duration },

    #[error("`{url}` responded with {status}")]
    Status { url: String, status: StatusCode },

    #[error("could not read the response when fetching `{url}`")]
    Body {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("the document at `{url}` is too large ({size} bytes, at most {max} allowed)")]
    TooLarge { url: String, size: u64, max: u64 },

    #[error("could not parse the document at `{url}`")]
    Parse {
        url: String,
        #[source]
        source: ParseFeedError,
    },
}

/// Turns a feed URL into the items it currently lists.
#[async_trait]
pub trait FeedSource: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> Result<Vec<ParsedItem>, FetchError>;
}

pub struct Fetcher {
    http_client: ClientWithMiddleware,
    timeout: Duration,
    max_feed_size: u64,
}

impl Fetcher {
    pub fn new(cache_dir: Option<PathBuf>, timeout: Duration, max_feed_size: u64) -> Result<Self> {
        let builder = ClientBuilder::new(
            reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(timeout)
                .redirect(Policy::limited(MAX_REDIRECTS))
                .user_agent(USER_AGENT)
                .build()
                .context("could not create an HTTP client")?,
        );

        let builder = if let Some(path) = cache_dir {
            debug!("Using a file cache at {}", path.display());
            builder.with(Cache(HttpCache {
                mode: Default::default(),
                manager: CACacheManager { path },
                options: Default::default(),
            }))
        } else {
            debug!("Using an in-memory cache");
            builder.with(Cache(HttpCache {
                mode: Default::default(),
                manager: MokaManager::new(MokaCache::builder().max_capacity(8192).build()),
                options: Default::default(),
            }))
        };

        Ok(Self {
            http_client: builder.build(),
            timeout,
            max_feed_size,
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.into(),
                source,
            })?;

        let status = response.status();

        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.into(),
                status,
            });
        }

        let too_large = |size| FetchError::TooLarge {
            url: url.into(),
            size,
            max: self.max_feed_size,
        };

        if let Some(size) = response.content_length().filter(|&n| n > self.max_feed_size) {
            return Err(too_large(size));
        }

        let body = response.bytes().await.map_err(|source| FetchError::Body {
            url: url.into(),
            source,
        })?;

        if body.len() as u64 > self.max_feed_size {
            return Err(too_large(body.len() as u64));
        }

        Ok(body.to_vec())
    }
}

#[async_trait]
impl FeedSource for Fetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<ParsedItem>, FetchError> {
        let body = time::timeout(self.timeout, self.download(url))
            .await
            .map_err(|_| FetchError::Timeout {
                url: url.into(),
                timeout: self.timeout,
            })??;
        trace!(size = body.len(), "Downloaded the document");

        parse(&body).map_err(|source| FetchError::Parse {
            url: url.into(),
            source,
        })
    }
}

/// Parses an RSS, Atom or JSON Feed document.
///
/// Items are returned in document order. Items without a link are dropped since
/// posts are identified by their URL.
pub fn parse(body: &[u8]) -> Result<Vec<ParsedItem>, ParseFeedError> {
    let feed = feed_rs::parser::parse(body)?;

    Ok(feed
        .entries
        .into_iter()
        .enumerate()
        .filter_map(|(idx, entry)| {
            let id = entry.id.clone();
            let item = convert_entry(entry);

            if item.is_none() {
                warn!(entry_id = %id, "Skipping entry #{}: it has no link", idx + 1);
            }

            item
        })
        .collect())
}

fn convert_entry(entry: Entry) -> Option<ParsedItem> {
    let link = entry
        .links
        .iter()
        .find(|link| link.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .or_else(|| entry.links.first())?
        .href
        .clone();

    let description = entry
        .summary
        .map(|text| text.content)
        .or_else(|| entry.content.and_then(|content| content.body))
        .filter(|description| !description.trim().is_empty());

    let published = entry
        .published
        .or(entry.updated)
        .and_then(|date| date.timestamp_nanos_opt())
        .and_then(|nanos| OffsetDateTime::from_unix_timestamp_nanos(nanos.into()).ok());

    Some(ParsedItem {
        title: entry.title.map(|text| text.content).unwrap_or_default(),
        description,
        link,
        published,
    })
}

#[cfg(test)]
pub mod tests {
    use std::net::SocketAddr;

    use axum::http::header;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    use super::*;

    pub const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example blog</title>
    <link>https://blog.example.com/</link>
    <description>Posts</description>
    <item>
      <title>First post</title>
      <link>https://blog.example.com/first</link>
      <description>The very first one</description>
      <pubDate>Mon, 01 Jan 2024 12:00:00 +0000</pubDate>
    </item>
    <item>
      <title>Undated post</title>
      <link>https://blog.example.com/undated</link>
    </item>
    <item>
      <title>Linkless post</title>
      <description>Nowhere to be found</description>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example atom</title>
  <id>urn:uuid:60a76c80-d399-11d9-b93C-0003939e0af6</id>
  <updated>2024-01-02T10:00:00Z</updated>
  <entry>
    <title>Atom entry</title>
    <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a</id>
    <link rel="edit" href="https://atom.example.com/edit/1"/>
    <link href="https://atom.example.com/posts/1"/>
    <updated>2024-01-02T10:00:00Z</updated>
    <summary>Short</summary>
  </entry>
</feed>"#;

    /// Serves fixtures on an ephemeral local port.
    pub async fn serve_fixtures() -> SocketAddr {
        let router = Router::new()
            .route(
                "/rss",
                get(|| async { ([(header::CONTENT_TYPE, "application/rss+xml")], RSS) }),
            )
            .route(
                "/atom",
                get(|| async { ([(header::CONTENT_TYPE, "application/atom+xml")], ATOM) }),
            )
            .route(
                "/slow",
                get(|| async {
                    time::sleep(Duration::from_secs(5)).await;
                    RSS
                }),
            )
            .route("/garbage", get(|| async { "this is not a feed" }))
            .route("/big", get(|| async { "x".repeat(4096) }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        addr
    }

    fn fetcher(timeout: Duration) -> Fetcher {
        Fetcher::new(None, timeout, 1024).unwrap()
    }

    #[test]
    fn test_parse_rss_normalizes_items() {
        let items = parse(RSS.as_bytes()).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "First post");
        assert_eq!(items[0].link, "https://blog.example.com/first");
        assert_eq!(items[0].description.as_deref(), Some("The very first one"));
        assert_eq!(
            items[0].published.map(|date| date.unix_timestamp()),
            Some(1_704_110_400)
        );

        assert_eq!(items[1].title, "Undated post");
        assert_eq!(items[1].description, None);
        assert_eq!(items[1].published, None);
    }

    #[test]
    fn test_parse_atom_prefers_alternate_link() {
        let items = parse(ATOM.as_bytes()).unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].link, "https://atom.example.com/posts/1");
        assert_eq!(items[0].description.as_deref(), Some("Short"));
        assert!(items[0].published.is_some());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse(b"<html><body>nope</body></html>").is_err());
        assert!(parse(b"").is_err());
    }

    #[tokio::test]
    async fn test_fetch_rss() {
        let addr = serve_fixtures().await;
        let fetcher = Fetcher::new(None, Duration::from_secs(5), 1024 * 1024).unwrap();

        let items = fetcher.fetch(&format!("http://{addr}/rss")).await.unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_missing_document() {
        let addr = serve_fixtures().await;

        let err = fetcher(Duration::from_secs(5))
            .fetch(&format!("http://{addr}/missing"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, FetchError::Status { status, .. } if status == StatusCode::NOT_FOUND),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_fetch_garbage() {
        let addr = serve_fixtures().await;

        let err = fetcher(Duration::from_secs(5))
            .fetch(&format!("http://{addr}/garbage"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Parse { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_fetch_too_large() {
        let addr = serve_fixtures().await;

        let err = fetcher(Duration::from_secs(5))
            .fetch(&format!("http://{addr}/big"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, FetchError::TooLarge { size: 4096, max: 1024, .. }),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        let addr = serve_fixtures().await;

        let err = fetcher(Duration::from_millis(200))
            .fetch(&format!("http://{addr}/slow"))
            .await
            .unwrap_err();
        // the client timeout and the outer timeout race; both mean the origin was too slow
        assert!(
            matches!(err, FetchError::Timeout { .. } | FetchError::Request { .. }),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_fetch_unreachable() {
        let err = fetcher(Duration::from_secs(5))
            .fetch("http://127.0.0.1:1/feed.xml")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request { .. }), "{err:?}");
    }
}
