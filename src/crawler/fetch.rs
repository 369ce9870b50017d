//! Page fetching: URL normalization, bounded retrieval with retry, link
//! extraction, and sitemap parsing.

use futures::StreamExt;
use scraper::{Html, Selector};
use std::time::Duration;
use url::Url;

/// Query parameters that carry session state, stripped during
/// normalization so the same page is not queued once per visitor token.
const SESSION_PARAMS: &[&str] = &[
    "phpsessid",
    "jsessionid",
    "sessionid",
    "session_id",
    "sid",
    "sess",
];

/// Normalize a raw link against an optional base: resolve relative URLs,
/// lowercase the host, strip fragments, default ports and session tokens.
/// Returns `None` for unparsable or non-HTTP links.
pub fn normalize_url(base: Option<&Url>, raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let mut url = match base {
        Some(base) => base.join(raw).ok()?,
        None => Url::parse(raw).ok()?,
    };

    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    url.set_fragment(None);

    if let Some(host) = url.host_str() {
        let lower = host.to_lowercase();
        if lower != host {
            url.set_host(Some(&lower)).ok()?;
        }
    }

    // Strip default ports.
    if matches!(
        (url.scheme(), url.port()),
        ("http", Some(80)) | ("https", Some(443))
    ) {
        url.set_port(None).ok()?;
    }

    // Drop session-token query parameters, keep the rest in order.
    if url.query().is_some() {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| {
                let k = k.to_lowercase();
                !SESSION_PARAMS.contains(&k.as_str()) && !k.starts_with("utm_")
            })
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else {
            let query = kept
                .iter()
                .map(|(k, v)| {
                    if v.is_empty() {
                        k.clone()
                    } else {
                        format!("{}={}", k, v)
                    }
                })
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&query));
        }
    }

    Some(url)
}

/// `scheme://host[:port]` of a URL.
pub fn origin_of(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{}", port));
    }
    origin
}

/// One fetched page.
#[derive(Debug)]
pub struct FetchedPage {
    pub final_url: Url,
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Fetch failure, classified for the retry loop.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transient fetch failure ({status:?}): {message}")]
    Transient { status: Option<u16>, message: String },
    #[error("permanent fetch failure ({status:?}): {message}")]
    Permanent { status: Option<u16>, message: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Transient { status, .. } | FetchError::Permanent { status, .. } => *status,
        }
    }
}

/// Build the crawl HTTP client: bounded redirects, custom user agent.
pub fn build_client(user_agent: &str, timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(user_agent)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(timeout)
        .build()?)
}

/// Fetch one page with bounded body size and retry with exponential
/// backoff + jitter on transient failures (connect errors, 5xx, 408, 429).
/// Non-retryable 4xx fail immediately.
pub async fn fetch_page(
    client: &reqwest::Client,
    url: &Url,
    max_body_bytes: u64,
    max_retries: u32,
) -> Result<FetchedPage, FetchError> {
    let mut last_err: Option<FetchError> = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let base_ms = 500u64 * (1 << (attempt - 1).min(4));
            let jitter = rand::random::<u64>() % (base_ms / 2 + 1);
            tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
        }

        match try_fetch(client, url, max_body_bytes).await {
            Ok(page) => return Ok(page),
            Err(e @ FetchError::Transient { .. }) => {
                last_err = Some(e);
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or(FetchError::Transient {
        status: None,
        message: "fetch failed".into(),
    }))
}

async fn try_fetch(
    client: &reqwest::Client,
    url: &Url,
    max_body_bytes: u64,
) -> Result<FetchedPage, FetchError> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| FetchError::Transient {
            status: None,
            message: e.to_string(),
        })?;

    let status = response.status().as_u16();
    if !response.status().is_success() {
        let retryable = status >= 500 || status == 408 || status == 429;
        let message = format!("HTTP {}", status);
        return Err(if retryable {
            FetchError::Transient {
                status: Some(status),
                message,
            }
        } else {
            FetchError::Permanent {
                status: Some(status),
                message,
            }
        });
    }

    if let Some(len) = response.content_length() {
        if len > max_body_bytes {
            return Err(FetchError::Permanent {
                status: Some(status),
                message: format!("response of {} bytes exceeds limit", len),
            });
        }
    }

    let final_url = response.url().clone();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let mut body: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(piece) = stream.next().await {
        let piece = piece.map_err(|e| FetchError::Transient {
            status: None,
            message: format!("body read failed: {}", e),
        })?;
        if (body.len() + piece.len()) as u64 > max_body_bytes {
            return Err(FetchError::Permanent {
                status: Some(status),
                message: "response exceeds size limit".into(),
            });
        }
        body.extend_from_slice(&piece);
    }

    Ok(FetchedPage {
        final_url,
        status,
        content_type,
        body,
    })
}

/// Extract and normalize all anchor links from an HTML page.
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let doc = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    doc.select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| normalize_url(Some(base), href))
        .collect()
}

/// Parse a sitemap.xml (urlset or sitemapindex) into its `<loc>` URLs.
pub fn parse_sitemap(xml: &[u8]) -> Vec<String> {
    let mut urls = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_loc = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"loc" {
                    in_loc = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_loc => {
                let loc = te.unescape().unwrap_or_default().trim().to_string();
                if !loc.is_empty() {
                    urls.push(loc);
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"loc" {
                    in_loc = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lowercases_host_and_strips_fragment() {
        let url = normalize_url(None, "HTTPS://Example.TEST/Path#section").unwrap();
        assert_eq!(url.as_str(), "https://example.test/Path");
    }

    #[test]
    fn test_normalize_resolves_relative() {
        let base = Url::parse("https://example.test/docs/page.html").unwrap();
        let url = normalize_url(Some(&base), "../other.html").unwrap();
        assert_eq!(url.as_str(), "https://example.test/other.html");
    }

    #[test]
    fn test_normalize_strips_session_tokens() {
        let url = normalize_url(
            None,
            "https://example.test/page?id=3&PHPSESSID=abc&utm_source=mail",
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://example.test/page?id=3");
    }

    #[test]
    fn test_normalize_strips_default_port() {
        let url = normalize_url(None, "https://example.test:443/x").unwrap();
        assert_eq!(url.as_str(), "https://example.test/x");
    }

    #[test]
    fn test_normalize_rejects_non_http() {
        assert!(normalize_url(None, "mailto:x@example.test").is_none());
        assert!(normalize_url(None, "javascript:alert(1)").is_none());
        assert!(normalize_url(None, "").is_none());
    }

    #[test]
    fn test_origin_includes_custom_port() {
        let url = Url::parse("http://example.test:8080/a/b").unwrap();
        assert_eq!(origin_of(&url), "http://example.test:8080");
    }

    #[test]
    fn test_extract_links_normalized() {
        let base = Url::parse("https://example.test/dir/").unwrap();
        let html = r#"<a href="page.html">x</a> <a href="/abs#frag">y</a>
                      <a href="mailto:a@b">z</a>"#;
        let links = extract_links(html, &base);
        let strs: Vec<&str> = links.iter().map(|u| u.as_str()).collect();
        assert_eq!(
            strs,
            vec![
                "https://example.test/dir/page.html",
                "https://example.test/abs"
            ]
        );
    }

    #[test]
    fn test_parse_sitemap_urlset() {
        let xml = br#"<?xml version="1.0"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
              <url><loc>https://example.test/a</loc></url>
              <url><loc>https://example.test/b</loc></url>
            </urlset>"#;
        assert_eq!(
            parse_sitemap(xml),
            vec!["https://example.test/a", "https://example.test/b"]
        );
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_then_succeeds() {
        let server = httpmock::MockServer::start();
        // httpmock serves mocks in order of specificity; emulate recovery
        // by counting hits on a single mock that always fails, then
        // checking the retry count.
        let failing = server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/flaky");
            then.status(503);
        });

        let client = build_client("answer-harness-test", Duration::from_secs(5)).unwrap();
        let url = Url::parse(&server.url("/flaky")).unwrap();
        let err = fetch_page(&client, &url, 1024 * 1024, 2).await.unwrap_err();
        assert!(matches!(err, FetchError::Transient { .. }));
        assert_eq!(failing.hits(), 3, "initial attempt plus two retries");
    }

    #[tokio::test]
    async fn test_fetch_does_not_retry_permanent_404() {
        let server = httpmock::MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/gone");
            then.status(404);
        });

        let client = build_client("answer-harness-test", Duration::from_secs(5)).unwrap();
        let url = Url::parse(&server.url("/gone")).unwrap();
        let err = fetch_page(&client, &url, 1024, 3).await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent { .. }));
        assert_eq!(err.status(), Some(404));
        assert_eq!(mock.hits(), 1);
    }

    #[tokio::test]
    async fn test_fetch_enforces_body_cap() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/big");
            then.status(200).body("x".repeat(2048));
        });

        let client = build_client("answer-harness-test", Duration::from_secs(5)).unwrap();
        let url = Url::parse(&server.url("/big")).unwrap();
        let err = fetch_page(&client, &url, 1024, 0).await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent { .. }));
    }

    #[tokio::test]
    async fn test_fetch_success_returns_body_and_type() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/page");
            then.status(200)
                .header("content-type", "text/html; charset=utf-8")
                .body("<html><body>hi</body></html>");
        });

        let client = build_client("answer-harness-test", Duration::from_secs(5)).unwrap();
        let url = Url::parse(&server.url("/page")).unwrap();
        let page = fetch_page(&client, &url, 1024 * 1024, 0).await.unwrap();
        assert_eq!(page.status, 200);
        assert!(page.content_type.starts_with("text/html"));
        assert!(String::from_utf8_lossy(&page.body).contains("hi"));
    }
}
