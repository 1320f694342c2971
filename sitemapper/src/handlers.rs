use anyhow::Context;
use clap::ArgMatches;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use sitemapper_scanner::plugin::DiscoveryPlugin;
use sitemapper_scanner::{
    CachedClient, CancellationToken, DiscoveryError, HttpClient, ProgressCallback,
    RequestDescriptor, SitemapReader, TargetUrl, drive_to_exhaustion,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const BANNER: &str = r#"
     _ _
 ___(_) |_ ___ _ __ ___   __ _ _ __  _ __   ___ _ __
/ __| | __/ _ \ '_ ` _ \ / _` | '_ \| '_ \ / _ \ '__|
\__ \ | ||  __/ | | | | | (_| | |_) | |_) |  __/ |
|___/_|\__\___|_| |_| |_|\__,_| .__/| .__/ \___|_|
                              |_|   |_|
"#;

pub fn print_banner() {
    println!("{}", BANNER.bright_cyan());
    println!("  sitemap driven endpoint discovery v{}\n", env!("CARGO_PKG_VERSION"));
}

// Helper functions for the discover handler

/// Load URLs from either a file or a single URL argument
pub fn load_urls_from_source(
    url: Option<&Url>,
    hosts_file: Option<&PathBuf>,
) -> Result<Vec<String>, String> {
    if let Some(hosts_file_path) = hosts_file {
        load_urls_from_file(hosts_file_path)
    } else if let Some(url) = url {
        Ok(vec![url.as_str().to_string()])
    } else {
        Err("Either --url or --hosts-file must be provided".to_string())
    }
}

/// Load and parse URLs from a file, skipping blank lines and `#` comments
pub fn load_urls_from_file(path: &PathBuf) -> Result<Vec<String>, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read hosts file {}: {}", path.display(), e))?;

    let urls: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_url_line)
        .collect();

    if urls.is_empty() {
        return Err(format!("No valid URLs found in {}", path.display()));
    }

    Ok(urls)
}

/// Parse a single line as a URL, trying to add http:// if needed
pub fn parse_url_line(line: &str) -> Option<String> {
    if let Ok(url) = TargetUrl::parse(line) {
        return Some(url.to_string());
    }

    let with_scheme = format!("http://{}", line);
    if let Ok(url) = TargetUrl::parse(&with_scheme) {
        return Some(url.to_string());
    }

    warn!("Skipping invalid URL '{}'", line);
    None
}

/// Options for configuring a discovery run
pub struct DiscoverOptions {
    pub urls: Vec<String>,
    pub threads: usize,
    pub timeout_secs: u64,
    pub sitemap_path: String,
    pub include_sitemap_request: bool,
    pub show_progress_bars: bool,
}

/// Everything found on one host.
#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub host: String,
    pub requests: Vec<RequestDescriptor>,
    pub error: Option<String>,
}

/// Run sitemap discovery against every host in `options`.
///
/// Each host gets its own plugin instance and HTTP client, so a response
/// cache never outlives its host. A failure on one host is recorded in its
/// report. Cancellation stops the whole run with `DiscoveryError::Cancelled`.
pub async fn execute_discovery(
    options: DiscoverOptions,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<HostReport>> {
    let DiscoverOptions {
        urls,
        threads,
        timeout_secs,
        sitemap_path,
        include_sitemap_request,
        show_progress_bars,
    } = options;

    let progress_bar = if show_progress_bars {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap(),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(Arc::new(pb))
    } else {
        None
    };

    let processed_count = Arc::new(AtomicUsize::new(0));
    let progress_callback: ProgressCallback = match progress_bar.clone() {
        Some(pb) => {
            let count = processed_count.clone();
            Arc::new(move |_worker_id: usize, url: String| {
                let done = count.fetch_add(1, Ordering::Relaxed) + 1;
                pb.set_message(format!("{} URLs probed, now {}", done, url));
            })
        }
        None => Arc::new(|_worker_id: usize, _url: String| {}),
    };

    let mut reports = Vec::with_capacity(urls.len());
    for (idx, url_str) in urls.iter().enumerate() {
        if let Some(ref pb) = progress_bar {
            pb.set_message(format!(
                "Reading sitemap of host {}/{}: {}",
                idx + 1,
                urls.len(),
                url_str
            ));
        }

        let seed = match TargetUrl::parse(url_str) {
            Ok(url) => RequestDescriptor::get(&url),
            Err(e) => {
                reports.push(HostReport {
                    host: url_str.clone(),
                    requests: Vec::new(),
                    error: Some(e.to_string()),
                });
                continue;
            }
        };

        let client: Arc<dyn HttpClient> = Arc::new(
            CachedClient::with_timeout(timeout_secs).context("Failed to build HTTP client")?,
        );
        let reader = SitemapReader::new(client)
            .with_concurrency(threads)
            .with_sitemap_path(&sitemap_path)
            .with_sitemap_requests(include_sitemap_request)
            .with_progress_callback(progress_callback.clone());
        debug!("Running {} against {}", reader.name(), seed.url);

        match drive_to_exhaustion(&reader, &seed, &cancel).await {
            Ok(requests) => reports.push(HostReport {
                host: seed.url.base().to_string(),
                requests,
                error: None,
            }),
            Err(DiscoveryError::Cancelled) => {
                if let Some(ref pb) = progress_bar {
                    pb.abandon_with_message("Discovery cancelled");
                }
                return Err(DiscoveryError::Cancelled.into());
            }
            Err(e) => reports.push(HostReport {
                host: seed.url.base().to_string(),
                requests: Vec::new(),
                error: Some(e.to_string()),
            }),
        }
    }

    if let Some(ref pb) = progress_bar {
        let total = processed_count.load(Ordering::Relaxed);
        pb.finish_with_message(format!("Discovery complete! {} URLs probed", total));
    }

    Ok(reports)
}

/// Generate a human readable report, grouped by host
pub fn generate_discovery_report(reports: &[HostReport]) -> String {
    let total: usize = reports.iter().map(|r| r.requests.len()).sum();

    let mut report = String::new();
    report.push_str("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\n");
    report.push_str("# Summary:\n");
    report.push_str(&format!("  Hosts scanned: {}\n", reports.len()));
    report.push_str(&format!("  Requests discovered: {}\n", total));
    report.push_str("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\n");

    for host_report in reports {
        report.push_str(&format!("## {}\n", host_report.host));

        if let Some(ref error) = host_report.error {
            report.push_str(&format!("  {} {}\n\n", "✗".red(), error.red()));
            continue;
        }

        if host_report.requests.is_empty() {
            report.push_str("  no usable sitemap.xml\n\n");
            continue;
        }

        report.push_str(&format!("  {} requests found\n\n", host_report.requests.len()));

        // Group by method so forms stand out from plain pages
        let mut by_method: BTreeMap<&str, Vec<&RequestDescriptor>> = BTreeMap::new();
        for request in &host_report.requests {
            by_method.entry(request.method.as_str()).or_default().push(request);
        }

        for (method, requests) in by_method {
            let method_str = match method {
                "GET" => method.green().to_string(),
                "POST" => method.yellow().to_string(),
                _ => method.cyan().to_string(),
            };

            for request in requests {
                let mut line = format!("  {} {}", method_str, request.url);
                if !request.params.is_empty() {
                    let names: Vec<&str> = request.params.iter().map(|(n, _)| n.as_str()).collect();
                    line.push_str(&format!(" {}", format!("[{}]", names.join(", ")).bright_black()));
                }
                report.push_str(&line);
                report.push('\n');
            }
        }
        report.push('\n');
    }

    report
}

pub fn generate_json_report(reports: &[HostReport]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(reports)
}

pub async fn handle_discover(sub_matches: &ArgMatches) -> anyhow::Result<()> {
    let url = sub_matches.get_one::<Url>("url");
    let hosts_file = sub_matches.get_one::<PathBuf>("hosts-file");
    let threads = *sub_matches.get_one::<usize>("threads").unwrap_or(&10);
    let timeout_secs = *sub_matches.get_one::<u64>("timeout").unwrap_or(&10);
    let sitemap_path = sub_matches
        .get_one::<String>("sitemap-path")
        .cloned()
        .unwrap_or_else(|| sitemapper_scanner::sitemap::SITEMAP_PATH.to_string());
    let skip_sitemap_request = sub_matches.get_flag("skip-sitemap-request");
    let json = sub_matches
        .get_one::<String>("format")
        .is_some_and(|format| format == "json");

    let urls = load_urls_from_source(url, hosts_file).map_err(anyhow::Error::msg)?;

    if !json {
        println!("\n🗺️  Reading sitemaps of {} host(s)", urls.len());
        println!("Workers: {}", threads);
        println!("Sitemap: {}\n", sitemap_path);
    }

    let options = DiscoverOptions {
        urls,
        threads,
        timeout_secs,
        sitemap_path,
        include_sitemap_request: !skip_sitemap_request,
        show_progress_bars: !json,
    };

    // Ctrl-C aborts everything in flight
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let reports = execute_discovery(options, cancel)
        .await
        .context("Discovery failed")?;

    if json {
        let report = generate_json_report(&reports).context("Failed to render report")?;
        println!("{}", report);
    } else {
        println!("\n✓ Discovery complete!\n");
        print!("{}", generate_discovery_report(&reports));
    }

    Ok(())
}

pub fn handle_plugin_info() {
    println!("{}", SitemapReader::NAME.bold());
    println!();
    println!("{}", SitemapReader::DESCRIPTION);
    println!();
    println!("Options: none");
    println!("Depends on: none");
}
