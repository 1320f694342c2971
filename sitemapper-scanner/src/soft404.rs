// Soft-404 detection: decides whether a successful-looking response is
// really a "not found" page.

use crate::http::{HttpClient, HttpResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;
use uuid::Uuid;

/// Bodies at least this similar to a known-missing page are treated as 404s.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.90;

#[async_trait]
pub trait Soft404Oracle: Send + Sync {
    async fn is_soft_404(&self, response: &HttpResponse) -> bool;
}

#[async_trait]
impl<T: Soft404Oracle + ?Sized> Soft404Oracle for Arc<T> {
    async fn is_soft_404(&self, response: &HttpResponse) -> bool {
        (**self).is_soft_404(response).await
    }
}

/// Oracle that only trusts the status code.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusOracle;

#[async_trait]
impl Soft404Oracle for StatusOracle {
    async fn is_soft_404(&self, response: &HttpResponse) -> bool {
        response.status_code == 404
    }
}

/// How a server answers for a resource that certainly does not exist.
#[derive(Debug, Clone)]
struct Fingerprint {
    status_code: u16,
    probe_name: String,
    body: String,
}

type FingerprintCell = Arc<OnceCell<Option<Fingerprint>>>;

/// Compares responses against a fingerprint of the server's "not found" page.
///
/// One random, non-existent sibling is requested per directory and file
/// extension. If the server answers it with a real 404 status, any non-404
/// response from that directory is genuine. Otherwise the bodies are
/// compared word by word, with the requested file names masked out since
/// error pages tend to echo them back.
pub struct FingerprintOracle {
    client: Arc<dyn HttpClient>,
    fingerprints: Mutex<HashMap<String, FingerprintCell>>,
    threshold: f64,
}

impl FingerprintOracle {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self {
            client,
            fingerprints: Mutex::new(HashMap::new()),
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    async fn fingerprint_for(&self, response: &HttpResponse) -> Option<Fingerprint> {
        let (directory, extension) = split_path(response.url.path());
        let key = format!("{}|{}|{}", response.url.base(), directory, extension);

        let cell = {
            let mut fingerprints = self.fingerprints.lock().await;
            fingerprints.entry(key).or_default().clone()
        };

        cell.get_or_init(|| async {
            let probe_name = format!("{}{}", Uuid::new_v4().simple(), extension);
            let probe_url = match response.url.resolve(&format!("{}{}", directory, probe_name)) {
                Ok(url) => url,
                Err(e) => {
                    debug!("Cannot build 404 probe for {}: {}", response.url, e);
                    return None;
                }
            };

            match self.client.get(&probe_url, false).await {
                Ok(probe) => {
                    debug!(
                        "404 fingerprint for {}{} is status {}",
                        response.url.base(),
                        directory,
                        probe.status_code
                    );
                    Some(Fingerprint {
                        status_code: probe.status_code,
                        probe_name,
                        body: probe.body,
                    })
                }
                Err(e) => {
                    debug!("404 probe {} failed: {}", probe_url, e);
                    None
                }
            }
        })
        .await
        .clone()
    }
}

#[async_trait]
impl Soft404Oracle for FingerprintOracle {
    async fn is_soft_404(&self, response: &HttpResponse) -> bool {
        if response.status_code == 404 {
            return true;
        }

        let Some(fingerprint) = self.fingerprint_for(response).await else {
            return false;
        };

        if fingerprint.status_code == 404 || fingerprint.status_code != response.status_code {
            return false;
        }

        let requested_name = file_name(response.requested_url.path());
        let ratio = similarity(
            &mask(&response.body, requested_name),
            &mask(&fingerprint.body, &fingerprint.probe_name),
        );
        debug!("{} is {:.2} similar to the 404 fingerprint", response.url, ratio);

        ratio >= self.threshold
    }
}

/// Split a URL path into its directory (with trailing slash) and the
/// extension of its last segment (with leading dot, or empty).
fn split_path(path: &str) -> (&str, &str) {
    let (directory, file) = match path.rfind('/') {
        Some(idx) => path.split_at(idx + 1),
        None => ("/", path),
    };

    let extension = match file.rfind('.') {
        Some(idx) if idx > 0 => &file[idx..],
        _ => "",
    };

    (directory, extension)
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

fn mask(body: &str, name: &str) -> String {
    if name.is_empty() {
        body.to_string()
    } else {
        body.replace(name, "")
    }
}

/// Word-level Dice coefficient between two bodies, in `0.0..=1.0`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let words_a: Vec<&str> = a.split_whitespace().collect();
    let words_b: Vec<&str> = b.split_whitespace().collect();

    if words_a.is_empty() && words_b.is_empty() {
        return 1.0;
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for word in words_a.iter().copied() {
        *counts.entry(word).or_insert(0) += 1;
    }

    let mut common = 0usize;
    for word in words_b.iter().copied() {
        if let Some(count) = counts.get_mut(word)
            && *count > 0
        {
            *count -= 1;
            common += 1;
        }
    }

    (2 * common) as f64 / (words_a.len() + words_b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::CachedClient;
    use crate::target::TargetUrl;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path, path_regex},
    };

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/"), ("/", ""));
        assert_eq!(split_path("/index.php"), ("/", ".php"));
        assert_eq!(split_path("/blog/2024/post.html"), ("/blog/2024/", ".html"));
        assert_eq!(split_path("/api/users"), ("/api/", ""));
        assert_eq!(split_path("/static/.hidden"), ("/static/", ""));
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("a b c", "a b c"), 1.0);
        assert_eq!(similarity("a b c", "x y z"), 0.0);
        let partial = similarity("a b c d", "a b x y");
        assert!((partial - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_status_oracle() {
        let url = TargetUrl::parse("http://example.com/missing").unwrap();
        assert!(StatusOracle.is_soft_404(&HttpResponse::new(url.clone(), 404, "")).await);
        assert!(!StatusOracle.is_soft_404(&HttpResponse::new(url, 200, "")).await);
    }

    #[tokio::test]
    async fn test_real_404_server_never_flags_success() {
        let mock_server = MockServer::start().await;
        // Unmatched paths get wiremock's default 404
        Mock::given(method("GET"))
            .and(path("/about.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("About us"))
            .mount(&mock_server)
            .await;

        let client: Arc<dyn HttpClient> = Arc::new(CachedClient::new().unwrap());
        let oracle = FingerprintOracle::new(client.clone());

        let url = TargetUrl::parse(&format!("{}/about.html", mock_server.uri())).unwrap();
        let response = client.get(&url, true).await.unwrap();

        assert!(!oracle.is_soft_404(&response).await);
    }

    #[tokio::test]
    async fn test_soft_404_page_is_detected() {
        let mock_server = MockServer::start().await;
        let not_found = |name: &str| {
            format!("<html><body><h1>Oops</h1> The page {} could not be found on this server</body></html>", name)
        };

        Mock::given(method("GET"))
            .and(path("/real.html"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><body>Product catalogue with many items</body></html>"),
            )
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/gone.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string(not_found("gone.html")))
            .mount(&mock_server)
            .await;

        // Every other .html file gets the same friendly error page
        Mock::given(method("GET"))
            .and(path_regex(r"^/[0-9a-f]{32}\.html$"))
            .respond_with(ResponseTemplate::new(200).set_body_string(not_found("PROBE")))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client: Arc<dyn HttpClient> = Arc::new(CachedClient::new().unwrap());
        let oracle = FingerprintOracle::new(client.clone());

        let gone = TargetUrl::parse(&format!("{}/gone.html", mock_server.uri())).unwrap();
        let real = TargetUrl::parse(&format!("{}/real.html", mock_server.uri())).unwrap();

        let gone = client.get(&gone, true).await.unwrap();
        let real = client.get(&real, true).await.unwrap();

        assert!(oracle.is_soft_404(&gone).await);
        assert!(!oracle.is_soft_404(&real).await);
    }
}
