use crate::error::TransportError;
use crate::target::TargetUrl;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

/// A fully-read HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// The URL that was asked for
    pub requested_url: TargetUrl,
    /// The URL that answered, after redirects
    pub url: TargetUrl,
    pub status_code: u16,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(url: TargetUrl, status_code: u16, body: impl Into<String>) -> Self {
        Self {
            requested_url: url.clone(),
            url,
            status_code,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_html(&self) -> bool {
        self.content_type()
            .map(|ct| ct.contains("text/html") || ct.contains("application/xhtml"))
            .unwrap_or(false)
    }

    /// Substring check against the body.
    pub fn contains(&self, needle: &str) -> bool {
        self.body.contains(needle)
    }
}

/// The HTTP collaborator used for every fetch.
///
/// Implementations must be safe for many concurrent in-flight requests.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET `url`. With `use_cache` set, a response already fetched in this
    /// session may be returned without touching the network, and
    /// concurrent calls for one URL share a single fetch.
    async fn get(&self, url: &TargetUrl, use_cache: bool) -> Result<HttpResponse, TransportError>;
}

type CacheSlot = Arc<OnceCell<Arc<HttpResponse>>>;

/// reqwest-backed client with an in-memory response cache for the session.
///
/// Only `use_cache` requests read or fill the cache.
pub struct CachedClient {
    client: Client,
    cache: Mutex<HashMap<TargetUrl, CacheSlot>>,
    network_requests: AtomicUsize,
}

impl CachedClient {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(10)
    }

    pub fn with_timeout(timeout_secs: u64) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(concat!("Sitemapper/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs((timeout_secs / 2).max(1)))
            .pool_max_idle_per_host(50)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
            network_requests: AtomicUsize::new(0),
        }
    }

    /// Number of requests that actually went out on the wire.
    pub fn network_requests(&self) -> usize {
        self.network_requests.load(Ordering::Relaxed)
    }

    /// Number of URLs with a cached response.
    pub async fn cached_len(&self) -> usize {
        self.cache
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    async fn fetch(&self, url: &TargetUrl) -> Result<HttpResponse, TransportError> {
        debug!("Fetching {}", url);
        self.network_requests.fetch_add(1, Ordering::Relaxed);

        let response = self.client.get(url.as_url().clone()).send().await?;

        let status_code = response.status().as_u16();
        let final_url = TargetUrl::parse(response.url().as_str()).unwrap_or_else(|_| url.clone());
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response.text().await.map_err(|e| TransportError::Body {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        Ok(HttpResponse {
            requested_url: url.clone(),
            url: final_url,
            status_code,
            headers,
            body,
        })
    }
}

#[async_trait]
impl HttpClient for CachedClient {
    async fn get(&self, url: &TargetUrl, use_cache: bool) -> Result<HttpResponse, TransportError> {
        if !use_cache {
            return self.fetch(url).await;
        }

        let slot = self.cache.lock().await.entry(url.clone()).or_default().clone();
        if let Some(hit) = slot.get() {
            debug!("Cache hit for {}", url);
            return Ok(hit.as_ref().clone());
        }

        // A failed fetch leaves the slot empty so a later call can retry
        let response = slot
            .get_or_try_init(|| async { self.fetch(url).await.map(Arc::new) })
            .await?;
        Ok(response.as_ref().clone())
    }
}

#[async_trait]
impl<T: HttpClient + ?Sized> HttpClient for Arc<T> {
    async fn get(&self, url: &TargetUrl, use_cache: bool) -> Result<HttpResponse, TransportError> {
        (**self).get(url, use_cache).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    #[tokio::test]
    async fn test_cached_get_hits_network_once() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html>hello</html>"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = CachedClient::new().unwrap();
        let url = TargetUrl::parse(&format!("{}/page", mock_server.uri())).unwrap();

        let first = client.get(&url, true).await.unwrap();
        let second = client.get(&url, true).await.unwrap();

        assert_eq!(first.body, second.body);
        assert_eq!(first.status_code, 200);
        assert!(first.is_html());
        assert_eq!(client.network_requests(), 1);
    }

    #[tokio::test]
    async fn test_uncached_get_always_fetches() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(2)
            .mount(&mock_server)
            .await;

        let client = CachedClient::new().unwrap();
        let url = TargetUrl::parse(&format!("{}/page", mock_server.uri())).unwrap();

        client.get(&url, false).await.unwrap();
        client.get(&url, false).await.unwrap();

        assert_eq!(client.network_requests(), 2);
        assert_eq!(client.cached_len().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_cached_gets_share_one_fetch() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("slow page")
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = CachedClient::new().unwrap();
        let url = TargetUrl::parse(&format!("{}/slow", mock_server.uri())).unwrap();

        let (first, second) = tokio::join!(client.get(&url, true), client.get(&url, true));

        assert_eq!(first.unwrap().body, "slow page");
        assert_eq!(second.unwrap().body, "slow page");
        assert_eq!(client.network_requests(), 1);
        assert_eq!(client.cached_len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let client = CachedClient::with_timeout(2).unwrap();
        let url = TargetUrl::parse("http://127.0.0.1:9/").unwrap();

        assert!(client.get(&url, true).await.is_err());
        assert!(client.get(&url, true).await.is_err());
        assert_eq!(client.network_requests(), 2);
        assert_eq!(client.cached_len().await, 0);
    }

    #[tokio::test]
    async fn test_transport_failure_is_an_error() {
        // Nothing listens on port 9 of localhost in the test environment
        let client = CachedClient::with_timeout(2).unwrap();
        let url = TargetUrl::parse("http://127.0.0.1:9/").unwrap();

        let result = client.get(&url, true).await;
        assert!(matches!(result, Err(TransportError::Http(_))));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let url = TargetUrl::parse("http://example.com/").unwrap();
        let response = HttpResponse::new(url, 200, "</urlset>")
            .with_header("Content-Type", "text/xml");

        assert_eq!(response.header("content-type"), Some("text/xml"));
        assert_eq!(response.header("CONTENT-TYPE"), Some("text/xml"));
        assert!(response.contains("</urlset>"));
        assert!(!response.is_html());
    }
}
