//! Request classification, the cacheability predicate, and freshness checks.

use std::time::Duration;

use gamemuse_net::{Response, UrlPattern};
use http::{Method, StatusCode};
use url::Url;

/// Header carrying the write time (epoch milliseconds) of cached API entries.
pub const CACHE_TIMESTAMP_HEADER: &str = "x-cache-timestamp";

/// Strategy selector for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Remote game catalog API: network-first.
    Catalog,
    /// Everything else: cache-first.
    StaticAsset,
}

/// Classifies requests purely from their URL.
#[derive(Debug, Clone)]
pub struct Classifier {
    catalog: UrlPattern,
}

impl Classifier {
    pub fn new(catalog: UrlPattern) -> Self {
        Self { catalog }
    }

    pub fn classify(&self, url: &Url) -> RequestClass {
        if self.catalog.matches(url) {
            RequestClass::Catalog
        } else {
            RequestClass::StaticAsset
        }
    }
}

/// True iff the request was a GET, the status is exactly 200, and the
/// `Cache-Control` value (if any) carries no `no-store` directive.
pub fn is_cacheable(method: &Method, status: StatusCode, cache_control: Option<&str>) -> bool {
    if *method != Method::GET || status != StatusCode::OK {
        return false;
    }
    match cache_control {
        Some(value) => !has_directive(value, "no-store"),
        None => true,
    }
}

/// [`is_cacheable`] applied to a fetched response.
pub fn response_is_cacheable(method: &Method, response: &Response) -> bool {
    is_cacheable(method, response.status, response.cache_control().as_deref())
}

fn has_directive(cache_control: &str, directive: &str) -> bool {
    cache_control.split(',').any(|part| {
        let name = part.split('=').next().unwrap_or_default().trim();
        name.eq_ignore_ascii_case(directive)
    })
}

/// Write time recorded in a cached response, if present.
pub fn cache_timestamp(response: &Response) -> Option<u64> {
    response
        .header_str(CACHE_TIMESTAMP_HEADER)
        .and_then(|v| v.trim().parse().ok())
}

/// Whether a cached response is still inside `ttl` at `now_ms`.
///
/// Responses without a timestamp are treated as stale.
pub fn is_fresh(response: &Response, ttl: Duration, now_ms: u64) -> bool {
    match cache_timestamp(response) {
        Some(written) => now_ms.saturating_sub(written) <= ttl.as_millis() as u64,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    #[test]
    fn test_cacheability_all_boundary_combinations() {
        let methods = [(Method::GET, true), (Method::POST, false)];
        let statuses = [(StatusCode::OK, true), (StatusCode::NOT_FOUND, false)];
        let controls = [(None, true), (Some("no-store"), false)];

        for (method, method_ok) in &methods {
            for (status, status_ok) in &statuses {
                for (control, control_ok) in &controls {
                    let expected = *method_ok && *status_ok && *control_ok;
                    assert_eq!(
                        is_cacheable(method, *status, *control),
                        expected,
                        "{method} {status} {control:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_other_success_statuses_are_not_cacheable() {
        assert!(!is_cacheable(&Method::GET, StatusCode::NO_CONTENT, None));
        assert!(!is_cacheable(&Method::GET, StatusCode::PARTIAL_CONTENT, None));
    }

    #[test]
    fn test_no_store_among_other_directives() {
        assert!(!is_cacheable(
            &Method::GET,
            StatusCode::OK,
            Some("private, No-Store, max-age=0")
        ));
        assert!(is_cacheable(
            &Method::GET,
            StatusCode::OK,
            Some("public, max-age=3600")
        ));
        assert!(is_cacheable(&Method::GET, StatusCode::OK, Some("no-cache")));
    }

    #[test]
    fn test_no_store_with_non_ascii_directive_is_not_cacheable() {
        let url = Url::parse("https://api.rawg.io/api/games").unwrap();
        let response = Response::new(url, StatusCode::OK).with_header(
            http::header::CACHE_CONTROL,
            HeaderValue::from_bytes(b"no-store, x=\"caf\xe9\"").unwrap(),
        );
        assert!(!response_is_cacheable(&Method::GET, &response));
    }

    #[test]
    fn test_classifier() {
        let classifier = Classifier::new(UrlPattern::contains("api.rawg.io/api"));
        let api = Url::parse("https://api.rawg.io/api/games/5?key=abc").unwrap();
        let shell = Url::parse("http://localhost:3000/index.html").unwrap();
        let image = Url::parse("https://media.rawg.io/media/games/5.jpg").unwrap();

        assert_eq!(classifier.classify(&api), RequestClass::Catalog);
        assert_eq!(classifier.classify(&shell), RequestClass::StaticAsset);
        assert_eq!(classifier.classify(&image), RequestClass::StaticAsset);
    }

    #[test]
    fn test_freshness() {
        let url = Url::parse("https://api.rawg.io/api/games").unwrap();
        let ttl = Duration::from_secs(60);
        let stamped = Response::new(url.clone(), StatusCode::OK).with_header(
            http::HeaderName::from_static(CACHE_TIMESTAMP_HEADER),
            HeaderValue::from_static("1000"),
        );

        assert_eq!(cache_timestamp(&stamped), Some(1000));
        assert!(is_fresh(&stamped, ttl, 1000 + 60_000));
        assert!(!is_fresh(&stamped, ttl, 1000 + 60_001));
        assert!(!is_fresh(&Response::new(url, StatusCode::OK), ttl, 1000));
    }
}
