//! CLI entry point for the predator crawler.

use std::io::{self, IsTerminal, Read};

use anyhow::{Context as _, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use predator::{CrawlError, CrawlStats, CrawlerBuilder, CrawlerConfig};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    let base = match &args.config {
        Some(path) => CrawlerConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CrawlerConfig::default(),
    };
    let config = args.apply(base);

    let crawler = CrawlerBuilder::from_config(config)
        .build()
        .await
        .context("building crawler")?;
    debug!(?args, "CLI arguments parsed");
    if args.memory_cache() {
        debug!("memory cache is discarded on exit");
    }

    let input_text = if !args.urls.is_empty() {
        args.urls.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        info!("No input provided. Pipe URLs via stdin or pass as arguments.");
        info!("Example: echo 'https://example.com/' | predator");
        return Ok(());
    };
    let urls = parse_urls(&input_text);
    if urls.is_empty() {
        info!("No URLs found in input");
        return Ok(());
    }

    let progress = if !args.quiet && io::stderr().is_terminal() {
        let bar = ProgressBar::new(urls.len() as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    } else {
        ProgressBar::hidden()
    };

    let bar = progress.clone();
    crawler.after_response(move |_, response| {
        bar.println(format!(
            "{} {} {} {}",
            response.status(),
            response.from_cache(),
            response.request().url(),
            response.body().len()
        ));
        bar.inc(1);
    });

    for url in &urls {
        if let Err(error) = crawler.get(url).await {
            warn!(url = %url, error = %error, "request failed");
            // Rejected before the pipeline, so not in the stats.
            if matches!(error, CrawlError::InvalidUrl { .. }) {
                progress.inc(1);
            }
        }
    }
    crawler.close().await;
    let stats = crawler.stats();
    progress.inc(unanswered(stats));
    progress.finish_and_clear();

    info!(
        requests = stats.requests(),
        responses = stats.responses(),
        cache_hits = stats.cache_hits(),
        retries = stats.retries(),
        failed = stats.failed(),
        "Crawl complete"
    );
    Ok(())
}

/// Requests that settled without reaching a response handler.
fn unanswered(stats: &CrawlStats) -> u64 {
    u64::try_from(stats.failed() + stats.aborted()).unwrap_or(u64::MAX)
}

/// One URL per non-empty line; `#` starts a comment line.
fn parse_urls(input: &str) -> Vec<String> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
