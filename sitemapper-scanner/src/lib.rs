pub mod error;
pub mod guard;
pub mod harvest;
pub mod http;
pub mod plugin;
pub mod sitemap;
pub mod soft404;
pub mod target;
pub mod template;

pub use error::{DiscoveryError, TransportError};
pub use harvest::{FetchOutcome, Harvester, ProgressCallback, Rejection};
pub use http::{CachedClient, HttpClient, HttpResponse};
pub use plugin::{Discovered, DiscoveryPlugin, SitemapReader, drive_to_exhaustion};
pub use soft404::{FingerprintOracle, Soft404Oracle};
pub use target::TargetUrl;
pub use template::{HtmlRequestTemplate, RequestDescriptor, RequestTemplate};
pub use tokio_util::sync::CancellationToken;
