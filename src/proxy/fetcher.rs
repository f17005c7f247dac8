//! Source fetcher for raw share-link lists
//!
//! This module provides functionality for:
//! - Reading share-link lists from URLs, local files or literal text
//! - Retrieving URLs through an ordered chain of network strategies
//!   (system path, two DNS-over-HTTPS resolvers, pinned provider addresses)
//! - Retrying each strategy on timeout before falling through to the next

use crate::error::FetchError;
use crate::proxy::models::CandidateSet;
use rand::seq::SliceRandom;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Default timeout for each fetch attempt in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default attempts per strategy
const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Default pause between timed-out attempts in seconds
const DEFAULT_BACKOFF_SECS: u64 = 2;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Addresses of the raw-content CDN that serves most published lists
const PINNED_ADDRESSES: [Ipv4Addr; 4] = [
    Ipv4Addr::new(185, 199, 108, 133),
    Ipv4Addr::new(185, 199, 109, 133),
    Ipv4Addr::new(185, 199, 110, 133),
    Ipv4Addr::new(185, 199, 111, 133),
];

/// DNS record type A
const DNS_TYPE_A: u16 = 1;

/// Where a share-link list comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Url(Url),
    File(PathBuf),
    Literal(String),
}

impl Origin {
    /// Classify an operator-supplied source string
    ///
    /// `http(s)://` is a URL, an existing path is a file, anything else is
    /// treated as the list itself.
    pub fn detect(input: &str) -> Result<Self, FetchError> {
        let trimmed = input.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let url =
                Url::parse(trimmed).map_err(|_| FetchError::InvalidUrl(trimmed.to_string()))?;
            return Ok(Origin::Url(url));
        }
        if !trimmed.contains('\n') && Path::new(trimmed).is_file() {
            return Ok(Origin::File(PathBuf::from(trimmed)));
        }
        Ok(Origin::Literal(input.to_string()))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Url(url) => write!(f, "{}", url),
            Origin::File(path) => write!(f, "{}", path.display()),
            Origin::Literal(text) => write!(f, "<{} bytes of text>", text.len()),
        }
    }
}

/// DNS-over-HTTPS resolver reachable by IP address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DohResolver {
    pub name: &'static str,
    pub endpoint: &'static str,
}

impl DohResolver {
    pub const CLOUDFLARE: DohResolver = DohResolver {
        name: "cloudflare",
        endpoint: "https://1.1.1.1/dns-query",
    };

    pub const GOOGLE: DohResolver = DohResolver {
        name: "google",
        endpoint: "https://8.8.8.8/resolve",
    };
}

/// One way of reaching a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStrategy {
    /// Default system resolver and routing
    System,
    /// Resolve the host through an alternate resolver, then connect to it
    Resolver(DohResolver),
    /// Connect to one of a fixed set of addresses, keeping the original host name
    Pinned(Vec<IpAddr>),
}

impl FetchStrategy {
    /// Strategies in the order they are tried
    pub fn default_chain() -> Vec<FetchStrategy> {
        vec![
            FetchStrategy::System,
            FetchStrategy::Resolver(DohResolver::CLOUDFLARE),
            FetchStrategy::Resolver(DohResolver::GOOGLE),
            FetchStrategy::Pinned(PINNED_ADDRESSES.iter().copied().map(IpAddr::V4).collect()),
        ]
    }

    pub fn name(&self) -> String {
        match self {
            FetchStrategy::System => "system".to_string(),
            FetchStrategy::Resolver(resolver) => format!("resolver:{}", resolver.name),
            FetchStrategy::Pinned(_) => "pinned".to_string(),
        }
    }
}

impl fmt::Display for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Result of one attempt with one strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Fetched(String),
    /// Retried after a backoff
    TimedOut,
    /// Abandons the strategy
    Failed(String),
}

/// Performs single fetch attempts
pub trait StrategyExecutor: Send + Sync {
    fn execute(
        &self,
        strategy: &FetchStrategy,
        url: &Url,
        timeout: Duration,
    ) -> impl Future<Output = Attempt> + Send;
}

/// Configuration for the source fetcher
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Timeout of each attempt
    pub timeout: Duration,
    /// Attempts per strategy when attempts time out
    pub max_attempts: usize,
    /// Pause after a timed-out attempt
    pub backoff: Duration,
    /// User agent for HTTP requests
    pub user_agent: String,
    /// Strategies tried in order
    pub strategies: Vec<FetchStrategy>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_secs(DEFAULT_BACKOFF_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            strategies: FetchStrategy::default_chain(),
        }
    }
}

impl FetcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<FetchStrategy>) -> Self {
        self.strategies = strategies;
        self
    }
}

/// Fetcher turning an [`Origin`] into a [`CandidateSet`]
pub struct SourceFetcher<E: StrategyExecutor = HttpExecutor> {
    config: FetcherConfig,
    executor: E,
}

impl SourceFetcher<HttpExecutor> {
    /// Create a fetcher with default configuration
    pub fn new() -> Self {
        Self::with_config(FetcherConfig::default())
    }

    /// Create a fetcher with custom configuration
    pub fn with_config(config: FetcherConfig) -> Self {
        let executor = HttpExecutor::new(config.user_agent.clone());
        Self { config, executor }
    }
}

impl Default for SourceFetcher<HttpExecutor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: StrategyExecutor> SourceFetcher<E> {
    pub fn with_executor(config: FetcherConfig, executor: E) -> Self {
        Self { config, executor }
    }

    /// Retrieve and normalize a share-link list
    ///
    /// URL bodies are reversed so the newest appended links come first; files
    /// and literal text keep their order.
    pub async fn fetch(&self, origin: &Origin) -> Result<CandidateSet, FetchError> {
        let candidates = match origin {
            Origin::Url(url) => CandidateSet::from_text_reversed(&self.fetch_url(url).await?),
            Origin::File(path) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| FetchError::Io {
                        path: path.clone(),
                        source,
                    })?;
                CandidateSet::from_lines(text.lines())
            }
            Origin::Literal(text) => CandidateSet::from_lines(text.lines()),
        };
        info!(origin = %origin, candidates = candidates.len(), "source fetched");
        Ok(candidates)
    }

    /// Fetch a URL body, trying each strategy in order
    pub async fn fetch_url(&self, url: &Url) -> Result<String, FetchError> {
        for strategy in &self.config.strategies {
            if let Some(body) = self.run_strategy(strategy, url).await {
                return Ok(body);
            }
        }
        Err(FetchError::AllStrategiesFailed {
            url: url.to_string(),
        })
    }

    async fn run_strategy(&self, strategy: &FetchStrategy, url: &Url) -> Option<String> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.executor.execute(strategy, url, self.config.timeout).await {
                Attempt::Fetched(body) => {
                    debug!(%strategy, attempt, bytes = body.len(), "fetched");
                    return Some(body);
                }
                Attempt::TimedOut => {
                    warn!(%strategy, attempt, "fetch timed out");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.backoff).await;
                    }
                }
                Attempt::Failed(reason) => {
                    warn!(%strategy, attempt, reason = %reason, "fetch strategy failed");
                    return None;
                }
            }
        }
        None
    }
}

/// Network executor built on reqwest
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    user_agent: String,
}

enum StepError {
    Timeout,
    Fatal(String),
}

impl From<reqwest::Error> for StepError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StepError::Timeout
        } else {
            StepError::Fatal(e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

impl DohResponse {
    fn first_ipv4(&self) -> Option<IpAddr> {
        self.answer
            .iter()
            .filter(|a| a.record_type == DNS_TYPE_A)
            .find_map(|a| a.data.parse::<Ipv4Addr>().ok().map(IpAddr::V4))
    }
}

impl HttpExecutor {
    pub fn new(user_agent: String) -> Self {
        Self { user_agent }
    }

    async fn try_execute(
        &self,
        strategy: &FetchStrategy,
        url: &Url,
        timeout: Duration,
    ) -> Result<String, StepError> {
        let host = url
            .host_str()
            .ok_or_else(|| StepError::Fatal("url has no host".to_string()))?;
        let port = url.port_or_known_default().unwrap_or(443);

        let pinned_addr = match strategy {
            FetchStrategy::System => None,
            FetchStrategy::Resolver(resolver) => {
                let ip = match host.parse::<IpAddr>() {
                    Ok(ip) => ip,
                    Err(_) => self.resolve(resolver, host, timeout).await?,
                };
                Some(SocketAddr::new(ip, port))
            }
            FetchStrategy::Pinned(addresses) => {
                let ip = pick_address(addresses)
                    .ok_or_else(|| StepError::Fatal("no pinned addresses".to_string()))?;
                Some(SocketAddr::new(ip, port))
            }
        };

        let mut builder = Client::builder()
            .timeout(timeout)
            .user_agent(&self.user_agent);
        if let Some(addr) = pinned_addr {
            debug!(host, %addr, "connecting to resolved address");
            builder = builder.resolve(host, addr);
        }
        let client = builder.build()?;

        let body = client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }

    async fn resolve(
        &self,
        resolver: &DohResolver,
        host: &str,
        timeout: Duration,
    ) -> Result<IpAddr, StepError> {
        let client = Client::builder().timeout(timeout).build()?;
        let response: DohResponse = client
            .get(resolver.endpoint)
            .query(&[("name", host), ("type", "A")])
            .header(ACCEPT, "application/dns-json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response
            .first_ipv4()
            .ok_or_else(|| StepError::Fatal(format!("{} has no A record for {}", resolver.name, host)))
    }
}

fn pick_address(addresses: &[IpAddr]) -> Option<IpAddr> {
    addresses.choose(&mut rand::thread_rng()).copied()
}

impl StrategyExecutor for HttpExecutor {
    async fn execute(&self, strategy: &FetchStrategy, url: &Url, timeout: Duration) -> Attempt {
        match self.try_execute(strategy, url, timeout).await {
            Ok(body) => Attempt::Fetched(body),
            Err(StepError::Timeout) => Attempt::TimedOut,
            Err(StepError::Fatal(reason)) => Attempt::Failed(reason),
        }
    }
}
