//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use predator::config::MEMORY_CACHE_LOCATION;
use predator::{CacheConfig, CrawlerConfig, LogConfig};

/// Fetch URLs through the predator crawler.
///
/// Prints one line per response: status, whether it came from the cache, the
/// URL and the body size in bytes.
#[derive(Parser, Debug)]
#[command(name = "predator")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to fetch; read from stdin (one per line) when omitted
    pub urls: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Worker pool size (1-100); requests run one at a time when omitted
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Retries for non-2xx responses (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub retries: Option<u8>,

    /// Proxy URL (http, https or socks5); repeat for a pool
    #[arg(long = "proxy", value_name = "URL")]
    pub proxies: Vec<String>,

    /// Response cache: `memory` or a SQLite database path
    #[arg(long, value_name = "PATH|memory")]
    pub cache: Option<String>,

    /// Store cached responses zlib-compressed
    #[arg(long, requires = "cache")]
    pub compress: bool,

    /// Per-attempt timeout in seconds (1-3600)
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub timeout: Option<u64>,

    /// User-Agent header
    #[arg(long)]
    pub user_agent: Option<String>,

    /// JSON crawler configuration; flags override its values
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Log level implied by `-v`/`-q`.
    #[must_use]
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }

    /// Overlays the flags onto `config`.
    #[must_use]
    pub fn apply(&self, mut config: CrawlerConfig) -> CrawlerConfig {
        if let Some(concurrency) = self.concurrency {
            config.concurrency = Some(usize::from(concurrency));
            config.block_panic = true;
        }
        if let Some(retries) = self.retries {
            config.retry_count = Some(u32::from(retries));
        }
        if !self.proxies.is_empty() {
            config.proxies.clone_from(&self.proxies);
        }
        if let Some(location) = &self.cache {
            config.cache = Some(CacheConfig {
                location: location.clone(),
                compressed: self.compress,
                query_fields: Vec::new(),
                body_fields: Vec::new(),
            });
        }
        if let Some(secs) = self.timeout {
            config.timeout_ms = Some(secs.saturating_mul(1000));
        }
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = Some(user_agent.clone());
        }
        if config.log.is_none() || self.verbose > 0 || self.quiet {
            config.log = Some(LogConfig::console(self.log_level()));
        }
        config
    }

    /// Whether the configured cache lives only in memory.
    #[must_use]
    pub fn memory_cache(&self) -> bool {
        self.cache
            .as_deref()
            .is_some_and(|location| location.eq_ignore_ascii_case(MEMORY_CACHE_LOCATION))
    }
}
