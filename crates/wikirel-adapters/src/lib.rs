//! Article source contracts + the MediaWiki revision adapter.

pub mod wikitext;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use wikirel_storage::{FetchError, HttpFetcher};

pub use wikitext::normalize_article;

pub const CRATE_NAME: &str = "wikirel-adapters";

pub const DEFAULT_API_URL: &str = "https://en.wikipedia.org/w/api.php";

/// Title and normalized body of one article revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleRevision {
    pub title: String,
    pub content: String,
}

/// Expected outcomes of a lookup. A missing page or revision is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(ArticleRevision),
    NotFound,
}

#[derive(Debug, Error)]
pub enum ArticleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("undecodable response for revision {revision_id}: {source}")]
    Decode {
        revision_id: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ArticleSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Exactly one upstream lookup per call.
    async fn fetch_revision(
        &self,
        page_id: u64,
        revision_id: u64,
    ) -> Result<FetchOutcome, ArticleError>;
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let pointer = path
        .iter()
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect::<String>();
    value.pointer(&pointer)?.as_str()
}

/// Pull `(title, raw wikitext)` for `page_id` out of an `action=query&prop=revisions` response.
///
/// Accepts the legacy `revisions[0]["*"]` slot as well as the `slots.main` shapes.
pub fn extract_revision(response: &JsonValue, page_id: u64) -> Option<(&str, &str)> {
    let page_key = page_id.to_string();
    let page = ["query", "pages", page_key.as_str()];
    let title = json_str(response, &[&page[..], &["title"][..]].concat())?;
    let content = [
        &["revisions", "0", "*"][..],
        &["revisions", "0", "slots", "main", "*"][..],
        &["revisions", "0", "slots", "main", "content"][..],
    ]
    .iter()
    .find_map(|suffix| json_str(response, &[&page[..], *suffix].concat()))?;
    Some((title, content))
}

/// Decode a raw API body into a fetch outcome.
pub fn parse_revision_response(
    body: &[u8],
    page_id: u64,
    revision_id: u64,
) -> Result<FetchOutcome, ArticleError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|source| ArticleError::Decode { revision_id, source })?;
    Ok(match extract_revision(&value, page_id) {
        Some((title, markup)) => FetchOutcome::Found(ArticleRevision {
            title: title.to_string(),
            content: normalize_article(markup),
        }),
        None => FetchOutcome::NotFound,
    })
}

/// Live MediaWiki `api.php` source.
#[derive(Debug, Clone)]
pub struct WikipediaApiSource {
    http: Arc<HttpFetcher>,
    api_url: String,
}

impl WikipediaApiSource {
    pub fn new(http: Arc<HttpFetcher>, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

#[async_trait]
impl ArticleSource for WikipediaApiSource {
    fn source_id(&self) -> &str {
        "wikipedia-api"
    }

    async fn fetch_revision(
        &self,
        page_id: u64,
        revision_id: u64,
    ) -> Result<FetchOutcome, ArticleError> {
        let query = [
            ("action", "query".to_string()),
            ("format", "json".to_string()),
            ("prop", "revisions".to_string()),
            ("revids", revision_id.to_string()),
            ("rvprop", "content".to_string()),
        ];
        let resp = self.http.get(&self.api_url, &query).await?;
        let outcome = parse_revision_response(&resp.body, page_id, revision_id)?;
        if outcome == FetchOutcome::NotFound {
            debug!(page_id, revision_id, "revision absent from response");
        }
        Ok(outcome)
    }
}

/// Replays captured API responses from `{dir}/{revision_id}.json`; a missing file is `NotFound`.
#[derive(Debug, Clone)]
pub struct FixtureArticleSource {
    dir: PathBuf,
}

impl FixtureArticleSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ArticleSource for FixtureArticleSource {
    fn source_id(&self) -> &str {
        "fixtures"
    }

    async fn fetch_revision(
        &self,
        page_id: u64,
        revision_id: u64,
    ) -> Result<FetchOutcome, ArticleError> {
        let path = self.dir.join(format!("{revision_id}.json"));
        match tokio::fs::read(&path).await {
            Ok(body) => parse_revision_response(&body, page_id, revision_id),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FetchOutcome::NotFound),
            Err(source) => Err(ArticleError::Fixture { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wikirel_storage::HttpClientConfig;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_body(page_id: u64, title: &str, markup: &str) -> JsonValue {
        json!({
            "batchcomplete": "",
            "query": {
                "pages": {
                    page_id.to_string(): {
                        "pageid": page_id,
                        "ns": 0,
                        "title": title,
                        "revisions": [
                            { "contentformat": "text/x-wiki", "contentmodel": "wikitext", "*": markup }
                        ]
                    }
                }
            }
        })
    }

    fn source_for(server: &MockServer) -> WikipediaApiSource {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("wikirel-test/0.1".into()),
            max_in_flight: 4,
        })
        .expect("http client");
        WikipediaApiSource::new(Arc::new(http), format!("{}/w/api.php", server.uri()))
    }

    #[test]
    fn extracts_legacy_and_slot_content() {
        let legacy = api_body(42, "Climate Change", "Body");
        assert_eq!(extract_revision(&legacy, 42), Some(("Climate Change", "Body")));

        let slots = json!({"query": {"pages": {"42": {
            "title": "Climate Change",
            "revisions": [{"slots": {"main": {"content": "Slot body"}}}]
        }}}});
        assert_eq!(extract_revision(&slots, 42), Some(("Climate Change", "Slot body")));
    }

    #[test]
    fn wrong_page_id_or_missing_revisions_is_not_found() {
        let body = api_body(42, "Climate Change", "Body");
        assert_eq!(extract_revision(&body, 43), None);

        let no_revisions = json!({"query": {"pages": {"42": {"title": "Climate Change"}}}});
        let bytes = serde_json::to_vec(&no_revisions).unwrap();
        assert_eq!(
            parse_revision_response(&bytes, 42, 7).unwrap(),
            FetchOutcome::NotFound
        );

        let bad_revids = json!({"batchcomplete": "", "query": {"badrevids": {"7": {"revid": 7, "missing": ""}}}});
        let bytes = serde_json::to_vec(&bad_revids).unwrap();
        assert_eq!(
            parse_revision_response(&bytes, 42, 7).unwrap(),
            FetchOutcome::NotFound
        );
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        let err = parse_revision_response(b"<html>", 1, 2).unwrap_err();
        assert!(matches!(err, ArticleError::Decode { revision_id: 2, .. }));
    }

    #[tokio::test]
    async fn live_source_requests_revision_content_and_normalizes_it() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("action", "query"))
            .and(query_param("prop", "revisions"))
            .and(query_param("revids", "900"))
            .and(query_param("rvprop", "content"))
            .respond_with(ResponseTemplate::new(200).set_body_json(api_body(
                42,
                "Climate Change",
                "'''Climate change''' is [[Global warming|warming]].\n== See also ==\n* [[Weather]]",
            )))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = source_for(&server).fetch_revision(42, 900).await.unwrap();
        assert_eq!(
            outcome,
            FetchOutcome::Found(ArticleRevision {
                title: "Climate Change".into(),
                content: "climate change is warming.".into(),
            })
        );
    }

    #[tokio::test]
    async fn http_404_is_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = source_for(&server).fetch_revision(42, 900).await.unwrap_err();
        assert!(matches!(
            err,
            ArticleError::Fetch(FetchError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn fixture_source_replays_files_and_treats_absence_as_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("900.json"),
            serde_json::to_vec(&api_body(42, "Climate Change", "Text")).unwrap(),
        )
        .unwrap();
        let source = FixtureArticleSource::new(dir.path());

        let found = source.fetch_revision(42, 900).await.unwrap();
        assert!(matches!(found, FetchOutcome::Found(ref a) if a.content == "text"));
        assert_eq!(source.fetch_revision(42, 901).await.unwrap(), FetchOutcome::NotFound);
    }
}
