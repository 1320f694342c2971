use crate::error::{DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// A validated, absolute http(s) URL.
///
/// Equality and hashing follow the normalized serialization produced by the
/// `url` crate, so `http://EXAMPLE.com:80/a` and `http://example.com/a`
/// compare equal. Fragments never survive construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetUrl(Url);

impl TargetUrl {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DiscoveryError::InvalidUrl("empty URL".to_string()));
        }

        let url = Url::parse(text)
            .map_err(|e| DiscoveryError::InvalidUrl(format!("'{}': {}", text, e)))?;
        Self::from_url(url)
    }

    /// Resolve `reference` against `self`, the way a browser resolves an href.
    pub fn resolve(&self, reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(DiscoveryError::InvalidUrl("empty URL".to_string()));
        }

        let url = self.0.join(reference).map_err(|e| {
            DiscoveryError::InvalidUrl(format!("'{}' against {}: {}", reference, self, e))
        })?;
        Self::from_url(url)
    }

    /// Scheme, host and port only, with a root path.
    pub fn base(&self) -> Self {
        let mut url = self.0.clone();
        url.set_path("/");
        url.set_query(None);
        url.set_fragment(None);
        // Only fails for cannot-be-a-base URLs, which `from_url` rejects.
        let _ = url.set_username("");
        let _ = url.set_password(None);
        Self(url)
    }

    pub fn host(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.0.path()
    }

    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.0
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// The same URL without its query string.
    pub fn without_query(&self) -> Self {
        let mut url = self.0.clone();
        url.set_query(None);
        Self(url)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    fn from_url(mut url: Url) -> Result<Self> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(DiscoveryError::InvalidUrl(format!(
                    "unsupported scheme '{}' in {}",
                    other, url
                )));
            }
        }

        if url.host_str().is_none_or(str::is_empty) {
            return Err(DiscoveryError::InvalidUrl(format!("missing host in {}", url)));
        }

        url.set_fragment(None);
        Ok(Self(url))
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl AsRef<str> for TargetUrl {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<String> for TargetUrl {
    type Error = DiscoveryError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TargetUrl> for String {
    fn from(value: TargetUrl) -> Self {
        value.0.into()
    }
}

impl std::str::FromStr for TargetUrl {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
