// Fetching, gating and parsing of a site's sitemap.xml

use crate::error::{DiscoveryError, Result, or_cancelled};
use crate::http::{HttpClient, HttpResponse};
use crate::soft404::Soft404Oracle;
use crate::target::TargetUrl;
use quick_xml::Reader;
use quick_xml::events::Event;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const SITEMAP_PATH: &str = "sitemap.xml";

/// Any sitemap worth parsing closes a `<urlset>`.
pub const URLSET_CLOSE_TAG: &str = "</urlset>";

/// A URL listed in a sitemap `<loc>`, not yet fetched.
pub type CandidateUrl = TargetUrl;

/// A sitemap that passed the gate. Lives for one discovery call only.
#[derive(Debug, Clone)]
pub struct SitemapDocument {
    response: HttpResponse,
}

impl SitemapDocument {
    pub fn new(response: HttpResponse) -> Self {
        Self { response }
    }

    pub fn url(&self) -> &TargetUrl {
        &self.response.url
    }

    pub fn body(&self) -> &str {
        &self.response.body
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    /// Lazily walk every `<loc>` in the document.
    pub fn urls(&self) -> SitemapUrls<'_> {
        extract_urls(self)
    }
}

/// Fetch `sitemap_path` from the root of `base` and decide whether it is
/// worth parsing.
///
/// Returns `Ok(None)` when the document is missing, is not a urlset, or the
/// oracle calls it a soft 404. Only a transport failure is an error.
pub async fn fetch_sitemap(
    client: &dyn HttpClient,
    oracle: &dyn Soft404Oracle,
    base: &TargetUrl,
    sitemap_path: &str,
    cancel: &CancellationToken,
) -> Result<Option<SitemapDocument>> {
    let sitemap_url = base.base().resolve(sitemap_path)?;
    debug!("Fetching sitemap {}", sitemap_url);

    let response = or_cancelled(cancel, client.get(&sitemap_url, true))
        .await?
        .map_err(|source| DiscoveryError::Fetch {
            url: sitemap_url.to_string(),
            source,
        })?;

    if !response.contains(URLSET_CLOSE_TAG) {
        debug!("{} has no {}, ignoring it", sitemap_url, URLSET_CLOSE_TAG);
        return Ok(None);
    }

    if or_cancelled(cancel, oracle.is_soft_404(&response)).await? {
        debug!("{} looks like a 404 page, ignoring it", sitemap_url);
        return Ok(None);
    }

    debug!("Analyzing sitemap.xml file.");
    Ok(Some(SitemapDocument::new(response)))
}

/// Walk the `<loc>` entries of `doc`.
///
/// Entries without text or with an unusable URL are logged and skipped.
/// A document that is not well-formed XML yields a single
/// `DiscoveryError::Parse` and then ends.
pub fn extract_urls(doc: &SitemapDocument) -> SitemapUrls<'_> {
    let mut reader = Reader::from_str(doc.body());
    reader.config_mut().trim_text(true);

    SitemapUrls {
        reader,
        depth: 0,
        seen_root: false,
        loc_depth: None,
        loc_text: None,
        finished: false,
    }
}

pub struct SitemapUrls<'a> {
    reader: Reader<&'a [u8]>,
    depth: usize,
    seen_root: bool,
    /// Depth at which the currently open `<loc>` holds its content
    loc_depth: Option<usize>,
    loc_text: Option<String>,
    finished: bool,
}

impl SitemapUrls<'_> {
    fn fail(&mut self, reason: String) -> Option<Result<CandidateUrl>> {
        self.finished = true;
        Some(Err(DiscoveryError::Parse(reason)))
    }

    fn open_element(&mut self, is_loc: bool) -> std::result::Result<(), String> {
        if self.depth == 0 {
            if self.seen_root {
                return Err("more than one root element".to_string());
            }
            self.seen_root = true;
        }

        self.depth += 1;
        if is_loc && self.loc_depth.is_none() {
            self.loc_depth = Some(self.depth);
            self.loc_text = None;
        }
        Ok(())
    }

    fn capture_text(&mut self, text: String) -> std::result::Result<(), String> {
        if self.depth == 0 {
            return Err(format!("text outside the root element: '{}'", text));
        }
        if self.loc_depth == Some(self.depth) && self.loc_text.is_none() {
            self.loc_text = Some(text);
        }
        Ok(())
    }

    /// Turn the text of a closed `<loc>` into a candidate, if it is one.
    fn finish_loc(&mut self) -> Option<CandidateUrl> {
        self.loc_depth = None;
        let Some(raw) = self.loc_text.take() else {
            debug!("Sitemap file had an invalid format");
            return None;
        };

        match TargetUrl::parse(&raw) {
            Ok(url) => Some(url),
            Err(e) => {
                debug!("Sitemap file had an invalid URL: \"{}\"", e);
                None
            }
        }
    }
}

impl Iterator for SitemapUrls<'_> {
    type Item = Result<CandidateUrl>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let event = match self.reader.read_event() {
                Ok(event) => event,
                Err(e) => {
                    let position = self.reader.error_position();
                    return self.fail(format!("{} at position {}", e, position));
                }
            };

            match event {
                Event::Start(start) => {
                    let is_loc = start.local_name().as_ref() == b"loc";
                    if let Err(reason) = self.open_element(is_loc) {
                        return self.fail(reason);
                    }
                }
                Event::Empty(empty) => {
                    let is_loc = empty.local_name().as_ref() == b"loc";
                    if let Err(reason) = self.open_element(false) {
                        return self.fail(reason);
                    }
                    self.depth -= 1;
                    if is_loc && self.loc_depth.is_none() {
                        debug!("Sitemap file had an invalid format");
                    }
                }
                Event::End(_) => {
                    if self.depth == 0 {
                        return self.fail("closing tag without an open element".to_string());
                    }
                    let closes_loc = self.loc_depth == Some(self.depth);
                    self.depth -= 1;
                    if closes_loc && let Some(url) = self.finish_loc() {
                        return Some(Ok(url));
                    }
                }
                Event::Text(text) => {
                    let text = match text.unescape() {
                        Ok(text) => text.into_owned(),
                        Err(e) => return self.fail(e.to_string()),
                    };
                    if let Err(reason) = self.capture_text(text) {
                        return self.fail(reason);
                    }
                }
                Event::CData(cdata) => {
                    let text = String::from_utf8_lossy(&cdata).trim().to_string();
                    if let Err(reason) = self.capture_text(text) {
                        return self.fail(reason);
                    }
                }
                Event::Eof => {
                    if self.depth != 0 {
                        return self.fail(format!("{} element(s) left unclosed", self.depth));
                    }
                    if !self.seen_root {
                        return self.fail("document has no root element".to_string());
                    }
                    self.finished = true;
                }
                _ => {}
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::CachedClient;
    use crate::soft404::StatusOracle;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    fn document(body: &str) -> SitemapDocument {
        let url = TargetUrl::parse("http://x/sitemap.xml").unwrap();
        SitemapDocument::new(HttpResponse::new(url, 200, body))
    }

    fn collect(body: &str) -> Result<Vec<String>> {
        document(body)
            .urls()
            .map(|url| url.map(|u| u.to_string()))
            .collect()
    }

    #[test]
    fn test_extracts_every_loc() {
        let urls = collect(
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
                <url><loc>http://x/a</loc><lastmod>2024-01-01</lastmod></url>
                <url><loc> http://x/b?id=1&amp;page=2 </loc></url>
                <url><loc><![CDATA[http://x/c]]></loc></url>
            </urlset>"#,
        )
        .unwrap();

        assert_eq!(urls, vec!["http://x/a", "http://x/b?id=1&page=2", "http://x/c"]);
    }

    #[test]
    fn test_invalid_entry_is_skipped() {
        let urls = collect(
            r#"<?xml version="1.0"?><urlset><url><loc>http://x/a</loc></url><url><loc>not a url</loc></url><url><loc>http://x/b</loc></url></urlset>"#,
        )
        .unwrap();

        assert_eq!(urls, vec!["http://x/a", "http://x/b"]);
    }

    #[test]
    fn test_empty_and_nested_locs_are_skipped() {
        let urls = collect(
            r#"<urlset>
                <url><loc/></url>
                <url><loc></loc></url>
                <url><loc><b>http://x/bold</b></loc></url>
                <url><loc>http://x/ok</loc></url>
            </urlset>"#,
        )
        .unwrap();

        assert_eq!(urls, vec!["http://x/ok"]);
    }

    #[test]
    fn test_namespaced_loc() {
        let urls = collect(
            r#"<sm:urlset xmlns:sm="http://www.sitemaps.org/schemas/sitemap/0.9"><sm:url><sm:loc>http://x/ns</sm:loc></sm:url></sm:urlset>"#,
        )
        .unwrap();

        assert_eq!(urls, vec!["http://x/ns"]);
    }

    #[test]
    fn test_malformed_documents_fail() {
        let cases = [
            "<urlset><url><loc>http://x/a</loc></url>",
            "<urlset><url><loc>http://x/a</url></loc></urlset>",
            "</urlset>",
            "garbage </urlset>",
            "<urlset></urlset><urlset></urlset>",
            "",
            "<urlset><loc>http://x/&bogus;</loc></urlset>",
        ];

        for body in cases {
            let result = collect(body);
            assert!(
                matches!(result, Err(DiscoveryError::Parse(_))),
                "expected parse error for {:?}, got {:?}",
                body,
                result
            );
        }
    }

    #[test]
    fn test_iteration_is_lazy() {
        let doc = document(
            "<urlset><url><loc>http://x/a</loc></url><url><loc>http://x/b</loc></url><broken",
        );
        let mut urls = doc.urls();

        assert_eq!(urls.next().unwrap().unwrap().as_str(), "http://x/a");
        assert_eq!(urls.next().unwrap().unwrap().as_str(), "http://x/b");
        assert!(matches!(urls.next(), Some(Err(DiscoveryError::Parse(_)))));
        assert!(urls.next().is_none());
    }

    #[tokio::test]
    async fn test_fetch_sitemap_gate() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/sitemap.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>not a sitemap</html>"))
            .mount(&mock_server)
            .await;

        let client = CachedClient::new().unwrap();
        let base = TargetUrl::parse(&format!("{}/some/page", mock_server.uri())).unwrap();
        let cancel = CancellationToken::new();

        let result = fetch_sitemap(&client, &StatusOracle, &base, SITEMAP_PATH, &cancel)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_fetch_sitemap_missing_is_not_an_error() {
        let mock_server = MockServer::start().await;

        let client = CachedClient::new().unwrap();
        let base = TargetUrl::parse(&mock_server.uri()).unwrap();
        let cancel = CancellationToken::new();

        let result = fetch_sitemap(&client, &StatusOracle, &base, SITEMAP_PATH, &cancel)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_fetch_sitemap_accepts_urlset() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/sitemap.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<urlset><url><loc>http://x/a</loc></url></urlset>"),
            )
            .mount(&mock_server)
            .await;

        let client = CachedClient::new().unwrap();
        let base = TargetUrl::parse(&mock_server.uri()).unwrap();
        let cancel = CancellationToken::new();

        let doc = fetch_sitemap(&client, &StatusOracle, &base, SITEMAP_PATH, &cancel)
            .await
            .unwrap()
            .expect("sitemap should pass the gate");
        assert!(doc.url().as_str().ends_with("/sitemap.xml"));
        assert_eq!(doc.urls().count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_sitemap_transport_failure() {
        let client = CachedClient::with_timeout(2).unwrap();
        let base = TargetUrl::parse("http://127.0.0.1:9/").unwrap();
        let cancel = CancellationToken::new();

        let result = fetch_sitemap(&client, &StatusOracle, &base, SITEMAP_PATH, &cancel).await;
        assert!(matches!(result, Err(DiscoveryError::Fetch { .. })));
    }

    #[tokio::test]
    async fn test_fetch_sitemap_cancelled() {
        let client = CachedClient::new().unwrap();
        let base = TargetUrl::parse("http://127.0.0.1:9/").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = fetch_sitemap(&client, &StatusOracle, &base, SITEMAP_PATH, &cancel).await;
        assert!(matches!(result, Err(DiscoveryError::Cancelled)));
    }
}
