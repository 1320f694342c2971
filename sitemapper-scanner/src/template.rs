use crate::http::HttpResponse;
use crate::target::TargetUrl;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

/// A discovered request that later stages can test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub method: String,
    pub url: TargetUrl,
    pub params: Vec<(String, String)>,
}

impl RequestDescriptor {
    /// A GET for `url`, with its query string split out into params.
    pub fn get(url: &TargetUrl) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.without_query(),
            params: url.query_pairs(),
        }
    }

    pub fn new(method: &str, url: TargetUrl, params: Vec<(String, String)>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url,
            params,
        }
    }
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)?;
        if !self.params.is_empty() {
            let params: Vec<String> = self
                .params
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            write!(f, " [{}]", params.join("&"))?;
        }
        Ok(())
    }
}

/// Turns a response into the requests it exposes.
pub trait RequestTemplate: Send + Sync {
    fn to_request_descriptors(&self, response: &HttpResponse) -> Vec<RequestDescriptor>;
}

/// Default template: the response URL itself, redirect-style headers, and
/// for HTML pages every form and same-host link.
#[derive(Debug, Clone)]
pub struct HtmlRequestTemplate {
    follow_links: bool,
}

impl HtmlRequestTemplate {
    pub fn new() -> Self {
        Self { follow_links: true }
    }

    pub fn with_follow_links(mut self, follow_links: bool) -> Self {
        self.follow_links = follow_links;
        self
    }

    fn extract_forms(document: &Html, page: &TargetUrl) -> Vec<RequestDescriptor> {
        let form_selector = Selector::parse("form").unwrap();
        let field_selector = Selector::parse("input[name], select[name], textarea[name]").unwrap();

        let mut requests = Vec::new();
        for form in document.select(&form_selector) {
            let action = form.value().attr("action").unwrap_or_default();
            let target = if action.trim().is_empty() {
                page.clone()
            } else {
                match page.resolve(action) {
                    Ok(url) => url,
                    Err(e) => {
                        debug!("Skipping form with unusable action: {}", e);
                        continue;
                    }
                }
            };

            let method = form.value().attr("method").unwrap_or("GET");

            let params = form
                .select(&field_selector)
                .filter_map(|field| {
                    let name = field.value().attr("name")?;
                    let value = field.value().attr("value").unwrap_or_default();
                    Some((name.to_string(), value.to_string()))
                })
                .collect();

            requests.push(RequestDescriptor::new(method, target, params));
        }

        requests
    }

    fn extract_links(document: &Html, page: &TargetUrl) -> Vec<RequestDescriptor> {
        let link_selector = Selector::parse("a[href]").unwrap();

        document
            .select(&link_selector)
            .filter_map(|element| element.value().attr("href"))
            .filter(|href| !href.starts_with('#'))
            .filter_map(|href| page.resolve(href).ok())
            .filter(|url| url.host() == page.host())
            .map(|url| RequestDescriptor::get(&url))
            .collect()
    }
}

impl Default for HtmlRequestTemplate {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTemplate for HtmlRequestTemplate {
    fn to_request_descriptors(&self, response: &HttpResponse) -> Vec<RequestDescriptor> {
        let mut requests = vec![RequestDescriptor::get(&response.url)];

        for header in ["location", "content-location"] {
            if let Some(value) = response.header(header)
                && let Ok(url) = response.url.resolve(value)
            {
                requests.push(RequestDescriptor::get(&url));
            }
        }

        if response.is_html() {
            let document = Html::parse_document(&response.body);
            requests.extend(Self::extract_forms(&document, &response.url));
            if self.follow_links {
                requests.extend(Self::extract_links(&document, &response.url));
            }
        }

        let mut seen = HashSet::with_capacity(requests.len());
        requests.retain(|request| seen.insert(request.clone()));
        requests
    }
}
