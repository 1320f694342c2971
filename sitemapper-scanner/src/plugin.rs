use crate::error::Result;
use crate::guard::{GuardState, RunOnceGuard};
use crate::harvest::{DEFAULT_CONCURRENCY, Harvester, ProgressCallback};
use crate::http::HttpClient;
use crate::sitemap::{CandidateUrl, SITEMAP_PATH, fetch_sitemap};
use crate::soft404::{FingerprintOracle, Soft404Oracle};
use crate::template::{HtmlRequestTemplate, RequestDescriptor, RequestTemplate};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What a discovery call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovered {
    Requests(Vec<RequestDescriptor>),
    /// The plugin has nothing left to do and should not be called again
    RunOnce,
}

impl Discovered {
    pub fn is_run_once(&self) -> bool {
        matches!(self, Discovered::RunOnce)
    }

    pub fn into_requests(self) -> Vec<RequestDescriptor> {
        match self {
            Discovered::Requests(requests) => requests,
            Discovered::RunOnce => Vec::new(),
        }
    }
}

/// A user-tunable setting a plugin exposes to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginOption {
    pub name: &'static str,
    pub description: &'static str,
    pub default: String,
}

/// The contract between a discovery plugin and the scheduler that drives it.
///
/// The scheduler keeps calling `discover` until the plugin answers
/// `Discovered::RunOnce`.
#[async_trait]
pub trait DiscoveryPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn options(&self) -> Vec<PluginOption> {
        Vec::new()
    }

    /// Plugins that must run before this one.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    async fn discover(
        &self,
        seed: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Discovered>;
}

/// Finds new requests by reading the site's sitemap.xml and probing every
/// URL it lists. Runs once per instance.
pub struct SitemapReader {
    guard: RunOnceGuard,
    harvester: Harvester,
    sitemap_path: String,
    include_sitemap_requests: bool,
}

impl SitemapReader {
    pub const NAME: &'static str = "sitemap_reader";

    pub const DESCRIPTION: &'static str = "Searches for the sitemap.xml file and parses it.\n\n\
         The sitemap.xml file is used by site administrators to give search \
         engine crawlers more information about the site. Every URL it lists \
         is fetched, and the ones that exist become new requests.";

    /// A reader using the fingerprint 404 oracle and HTML request template
    /// on top of `client`.
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        let oracle = Arc::new(FingerprintOracle::new(client.clone()));
        Self::with_parts(client, oracle, Arc::new(HtmlRequestTemplate::new()))
    }

    pub fn with_parts(
        client: Arc<dyn HttpClient>,
        oracle: Arc<dyn Soft404Oracle>,
        template: Arc<dyn RequestTemplate>,
    ) -> Self {
        Self {
            guard: RunOnceGuard::new(),
            harvester: Harvester::new(client, oracle, template)
                .with_concurrency(DEFAULT_CONCURRENCY),
            sitemap_path: SITEMAP_PATH.to_string(),
            include_sitemap_requests: true,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.harvester = self.harvester.with_concurrency(concurrency);
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.harvester = self.harvester.with_progress_callback(callback);
        self
    }

    pub fn with_sitemap_path(mut self, path: &str) -> Self {
        self.sitemap_path = path.to_string();
        self
    }

    /// Whether the sitemap response itself contributes requests.
    pub fn with_sitemap_requests(mut self, include: bool) -> Self {
        self.include_sitemap_requests = include;
        self
    }

    pub fn has_run(&self) -> bool {
        self.guard.state() == GuardState::Spent
    }

    async fn read_sitemap(
        &self,
        seed: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Vec<RequestDescriptor>> {
        let base = seed.url.base();
        let Some(document) = fetch_sitemap(
            self.harvester.client().as_ref(),
            self.harvester.oracle().as_ref(),
            &base,
            &self.sitemap_path,
            cancel,
        )
        .await?
        else {
            return Ok(Vec::new());
        };

        let mut requests = if self.include_sitemap_requests {
            self.harvester
                .template()
                .to_request_descriptors(document.response())
        } else {
            Vec::new()
        };

        // Parse everything before fetching anything: a broken document
        // must not produce partial results.
        let candidates = document.urls().collect::<Result<Vec<CandidateUrl>>>()?;
        info!("Found {} URL(s) in {}", candidates.len(), document.url());

        let harvested = self.harvester.harvest(&candidates, cancel).await?;

        let mut seen: HashSet<RequestDescriptor> = requests.iter().cloned().collect();
        for request in harvested {
            if seen.insert(request.clone()) {
                requests.push(request);
            }
        }

        Ok(requests)
    }
}

#[async_trait]
impl DiscoveryPlugin for SitemapReader {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        Self::DESCRIPTION
    }

    async fn discover(
        &self,
        seed: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Discovered> {
        if !self.guard.try_enter() {
            debug!("{} already ran", self.name());
            return Ok(Discovered::RunOnce);
        }

        let requests = self.read_sitemap(seed, cancel).await?;
        Ok(Discovered::Requests(requests))
    }
}

/// Call `plugin` until it reports it is done, collecting everything it found.
pub async fn drive_to_exhaustion(
    plugin: &dyn DiscoveryPlugin,
    seed: &RequestDescriptor,
    cancel: &CancellationToken,
) -> Result<Vec<RequestDescriptor>> {
    let mut requests = Vec::new();
    loop {
        match plugin.discover(seed, cancel).await? {
            Discovered::Requests(found) => requests.extend(found),
            Discovered::RunOnce => break,
        }
    }
    Ok(requests)
}
