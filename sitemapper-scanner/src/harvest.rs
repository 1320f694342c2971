use crate::error::{DiscoveryError, Result, or_cancelled};
use crate::http::HttpClient;
use crate::soft404::Soft404Oracle;
use crate::target::TargetUrl;
use crate::template::{RequestDescriptor, RequestTemplate};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on candidates fetched at the same time.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Called with `(index, url)` each time a candidate starts fetching.
pub type ProgressCallback = Arc<dyn Fn(usize, String) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The oracle judged the response to be a (soft) 404
    NotFound,
    /// The request itself failed
    NetworkError,
}

/// What became of a single candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Classified(Vec<RequestDescriptor>),
    Rejected(Rejection),
    /// The candidate was not a usable URL
    Malformed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HarvestStats {
    pub classified: usize,
    pub not_found: usize,
    pub network_errors: usize,
    pub malformed: usize,
}

impl HarvestStats {
    fn record(&mut self, outcome: &FetchOutcome) {
        match outcome {
            FetchOutcome::Classified(_) => self.classified += 1,
            FetchOutcome::Rejected(Rejection::NotFound) => self.not_found += 1,
            FetchOutcome::Rejected(Rejection::NetworkError) => self.network_errors += 1,
            FetchOutcome::Malformed => self.malformed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.classified + self.not_found + self.network_errors + self.malformed
    }
}

/// Fetches candidates, a bounded number at a time, and keeps the ones that
/// turn out to be real.
#[derive(Clone)]
pub struct Harvester {
    client: Arc<dyn HttpClient>,
    oracle: Arc<dyn Soft404Oracle>,
    template: Arc<dyn RequestTemplate>,
    concurrency: usize,
    progress_callback: Option<ProgressCallback>,
}

impl Harvester {
    pub fn new(
        client: Arc<dyn HttpClient>,
        oracle: Arc<dyn Soft404Oracle>,
        template: Arc<dyn RequestTemplate>,
    ) -> Self {
        Self {
            client,
            oracle,
            template,
            concurrency: DEFAULT_CONCURRENCY,
            progress_callback: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn client(&self) -> &Arc<dyn HttpClient> {
        &self.client
    }

    pub fn oracle(&self) -> &Arc<dyn Soft404Oracle> {
        &self.oracle
    }

    pub fn template(&self) -> &Arc<dyn RequestTemplate> {
        &self.template
    }

    /// Fetch one candidate and classify the response.
    ///
    /// Only cancellation is an error; everything else that can go wrong
    /// with a single candidate is folded into the outcome.
    pub async fn fetch_and_classify(
        &self,
        candidate: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let url = match TargetUrl::parse(candidate) {
            Ok(url) => url,
            Err(e) => {
                debug!("Skipping malformed candidate: {}", e);
                return Ok(FetchOutcome::Malformed);
            }
        };

        let response = match or_cancelled(cancel, self.client.get(&url, true)).await? {
            Ok(response) => response,
            Err(e) => {
                debug!("Error while fetching {} in sitemap discovery: \"{}\"", url, e);
                return Ok(FetchOutcome::Rejected(Rejection::NetworkError));
            }
        };

        if or_cancelled(cancel, self.oracle.is_soft_404(&response)).await? {
            debug!("{} is a 404", url);
            return Ok(FetchOutcome::Rejected(Rejection::NotFound));
        }

        Ok(FetchOutcome::Classified(
            self.template.to_request_descriptors(&response),
        ))
    }

    pub async fn harvest<I>(
        &self,
        candidates: I,
        cancel: &CancellationToken,
    ) -> Result<Vec<RequestDescriptor>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let (requests, _) = self.harvest_with_stats(candidates, cancel).await?;
        Ok(requests)
    }

    /// Fetch and classify every candidate, returning the merged requests
    /// once every candidate is done.
    ///
    /// Output order is unspecified. Identical requests are merged. On
    /// cancellation all in-flight fetches are aborted and nothing is
    /// returned.
    pub async fn harvest_with_stats<I>(
        &self,
        candidates: I,
        cancel: &CancellationToken,
    ) -> Result<(Vec<RequestDescriptor>, HarvestStats)>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let candidates: Vec<String> = candidates
            .into_iter()
            .map(|candidate| candidate.as_ref().to_string())
            .collect();
        info!(
            "Harvesting {} candidate(s), at most {} at a time",
            candidates.len(),
            self.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (tx, mut rx) = mpsc::unbounded_channel::<FetchOutcome>();
        let mut fetch_handles = JoinSet::new();

        for (index, candidate) in candidates.into_iter().enumerate() {
            let harvester = self.clone();
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();

            fetch_handles.spawn(async move {
                // The semaphore is never closed
                let Ok(_permit) = semaphore.acquire().await else {
                    return Ok(());
                };

                if let Some(ref callback) = harvester.progress_callback {
                    callback(index, candidate.clone());
                }

                let outcome = harvester.fetch_and_classify(&candidate, &cancel).await?;
                // The receiver outlives every task
                let _ = tx.send(outcome);
                Ok::<(), DiscoveryError>(())
            });
        }
        drop(tx);

        let mut stats = HarvestStats::default();

        // Wait for every candidate to complete
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                joined = fetch_handles.join_next() => Some(joined),
            };

            let Some(joined) = joined else {
                fetch_handles.abort_all();
                return Err(DiscoveryError::Cancelled);
            };

            match joined {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    fetch_handles.abort_all();
                    return Err(e);
                }
                Some(Err(e)) => {
                    // Only this candidate is lost
                    warn!("Harvest task failed: {}", e);
                    stats.record(&FetchOutcome::Malformed);
                }
            }
        }

        let mut seen = HashSet::new();
        let mut requests = Vec::new();
        while let Some(outcome) = rx.recv().await {
            stats.record(&outcome);
            if let FetchOutcome::Classified(found) = outcome {
                for request in found {
                    if seen.insert(request.clone()) {
                        requests.push(request);
                    }
                }
            }
        }

        info!(
            "Harvest complete. {} real, {} not found, {} failed, {} malformed, {} request(s)",
            stats.classified,
            stats.not_found,
            stats.network_errors,
            stats.malformed,
            requests.len()
        );

        Ok((requests, stats))
    }
}
