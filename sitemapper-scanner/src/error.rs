use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure talking to a remote host. Never fatal for a single candidate,
/// fatal when fetching the sitemap itself.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to read response body from {url}: {reason}")]
    Body { url: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Error while parsing sitemap.xml: {0}")]
    Parse(String),

    #[error("Failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("Discovery cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Run `future` unless `cancel` fires first.
pub(crate) async fn or_cancelled<F: Future>(cancel: &CancellationToken, future: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DiscoveryError::Cancelled),
        output = future => Ok(output),
    }
}
