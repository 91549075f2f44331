//! # GameMuse Net
//!
//! The network side of the offline worker: request and response values, the
//! [`Fetcher`] seam the controller talks to, and a `reqwest` implementation.
//!
//! Responses are read to completion before they are returned. A [`Response`]
//! clone shares its [`Bytes`] buffer, which lets the controller hand one copy
//! to the page and another to the cache.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CACHE_CONTROL;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

pub mod pattern;

pub use pattern::UrlPattern;

/// Transport-level failures. A response with a bad status is not one of these.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("cannot reach {url}: {message}")]
    Unreachable { url: String, message: String },

    #[error("malformed URL {0}")]
    InvalidUrl(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("body of {url} is not valid {expected}")]
    Body { url: Url, expected: &'static str },

    #[error(transparent)]
    Client(#[from] reqwest::Error),
}

/// An outgoing request as seen by the worker.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Per-request override of [`HttpConfig::timeout_secs`].
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// POST carrying a JSON document.
    pub fn post_json(url: Url, body: impl Into<Bytes>) -> Self {
        let mut request = Self::new(Method::POST, url);
        request.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        request.body = Some(body.into());
        request
    }

    pub fn parse_get(raw: &str) -> Result<Self, NetError> {
        Url::parse(raw)
            .map(Self::get)
            .map_err(|e| NetError::InvalidUrl(format!("{raw} ({e})")))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }
}

/// A fully read response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header value, keeping earlier values of the same name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// 2xx.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn header_str(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every `Cache-Control` value, comma-joined. Bytes outside visible
    /// ASCII are replaced rather than dropping the value.
    pub fn cache_control(&self) -> Option<String> {
        let joined = self
            .headers
            .get_all(CACHE_CONTROL)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()))
            .collect::<Vec<_>>()
            .join(",");
        (!joined.is_empty()).then_some(joined)
    }

    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|_| NetError::Body {
            url: self.url.clone(),
            expected: "UTF-8",
        })
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|_| NetError::Body {
            url: self.url.clone(),
            expected: "JSON",
        })
    }
}

/// Turns a [`Request`] into a [`Response`].
///
/// `Err` means no response arrived at all (offline, DNS, timeout); a 404 or
/// 500 is still `Ok`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// Settings for [`HttpFetcher`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    /// Applied to requests without their own timeout.
    pub timeout_secs: u64,
    pub max_redirects: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("gamemuse-worker/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
            max_redirects: 10,
        }
    }
}

/// [`Fetcher`] over a shared `reqwest` connection pool.
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig) -> Result<Self, NetError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        info!(
            user_agent = %config.user_agent,
            timeout_secs = config.timeout_secs,
            "HTTP fetcher ready"
        );
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let timeout = request.timeout.unwrap_or(self.timeout);
        debug!(method = %request.method, url = %request.url, ?timeout, "Sending request");

        let mut outgoing = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(timeout);
        if let Some(body) = &request.body {
            outgoing = outgoing.body(body.clone());
        }

        let reply = match outgoing.send().await {
            Ok(reply) => reply,
            Err(e) if e.is_timeout() => return Err(NetError::Timeout(timeout)),
            Err(e) if e.is_connect() => {
                return Err(NetError::Unreachable {
                    url: request.url.to_string(),
                    message: e.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let url = reply.url().clone();
        let status = reply.status();
        let headers = reply.headers().clone();
        let body = reply.bytes().await?;
        trace!(%url, %status, bytes = body.len(), "Response read");

        Ok(Response {
            url,
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(&HttpConfig::default()).unwrap()
    }

    #[test]
    fn test_post_json_sets_content_type() {
        let url = Url::parse("https://sync.example.com/favorites").unwrap();
        let request = Request::post_json(url, r#"{"op":"add"}"#)
            .with_timeout(Duration::from_secs(5));

        assert!(!request.is_get());
        assert_eq!(
            request.headers.get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_get_needs_absolute_url() {
        assert!(Request::parse_get("https://api.rawg.io/api/games").unwrap().is_get());
        assert!(matches!(
            Request::parse_get("/games"),
            Err(NetError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_cache_control_joins_repeated_headers() {
        let url = Url::parse("https://api.rawg.io/api/games").unwrap();
        let response = Response::new(url.clone(), StatusCode::OK)
            .with_header(CACHE_CONTROL, HeaderValue::from_static("private"))
            .with_header(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        assert_eq!(response.cache_control().as_deref(), Some("private,no-store"));
        assert_eq!(Response::new(url, StatusCode::OK).cache_control(), None);
    }

    #[test]
    fn test_cache_control_keeps_values_with_obs_text() {
        let url = Url::parse("https://api.rawg.io/api/games").unwrap();
        let response = Response::new(url, StatusCode::OK).with_header(
            CACHE_CONTROL,
            HeaderValue::from_bytes(b"no-store, x=\"caf\xe9\"").unwrap(),
        );
        let value = response.cache_control().unwrap();
        assert!(value.starts_with("no-store,"));
    }

    #[test]
    fn test_body_decoding_errors_name_the_url() {
        let url = Url::parse("https://api.rawg.io/api/games").unwrap();
        let response = Response::new(url, StatusCode::OK).with_body(&b"\xff\xfe"[..]);
        let err = response.json::<serde_json::Value>().unwrap_err();
        assert!(err.to_string().contains("api.rawg.io"));
        assert!(response.text().is_err());
    }

    #[tokio::test]
    async fn test_fetch_reads_status_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/games"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("cache-control", "max-age=60")
                    .set_body_string(r#"{"count":1,"results":[]}"#),
            )
            .mount(&server)
            .await;

        let request = Request::parse_get(&format!("{}/api/games", server.uri())).unwrap();
        let response = fetcher().fetch(&request).await.unwrap();

        assert!(response.ok());
        assert_eq!(response.header_str("cache-control"), Some("max-age=60"));
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["count"], 1);
    }

    #[tokio::test]
    async fn test_fetch_sends_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({"game_id": 3498})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/sync", server.uri())).unwrap();
        let response = fetcher()
            .fetch(&Request::post_json(url, r#"{"game_id":3498}"#))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_error_status_is_still_a_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let request = Request::parse_get(&format!("{}/missing", server.uri())).unwrap();
        let response = fetcher().fetch(&request).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let request = Request::parse_get(&server.uri())
            .unwrap()
            .with_timeout(Duration::from_millis(100));
        assert!(matches!(
            fetcher().fetch(&request).await,
            Err(NetError::Timeout(_))
        ));
    }
}
