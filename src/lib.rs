//! Proxy Qualifier - share-link acquisition and latency qualification
//!
//! Fetches vmess/vless/shadowsocks/trojan share links from untrusted sources,
//! normalizes them into connection descriptors and measures which endpoints
//! currently work by driving a probe request through an ephemeral local
//! proxy engine for each candidate. Working links are kept in a
//! deduplicated result file across runs.

pub mod error;
pub mod proxy;
pub mod tui;

pub use error::{FetchError, ParseError, ProbeError, StoreError};
pub use proxy::*;

use std::path::PathBuf;
use std::time::Duration;

/// Application result type
pub type Result<T> = anyhow::Result<T>;

/// Worker pool sizes an operator may choose from
pub const WORKER_PRESETS: &[usize] = &[4, 8, 16, 32, 64];

/// Per-probe timeouts (seconds) an operator may choose from
pub const TIMEOUT_PRESETS: &[u64] = &[2, 5, 10, 15];

/// Probe targets an operator may choose from; each answers 200 when reachable
pub const TEST_URL_PRESETS: &[&str] = &[
    "https://www.google.com/",
    "https://cloudflare.com/cdn-cgi/trace",
    "http://httpbin.org/ip",
];

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Result store file path
    pub store_path: PathBuf,
    /// Proxy engine binary, invoked as `<engine> run -config <path>`
    pub engine_binary: PathBuf,
    /// Number of concurrent probes
    pub workers: usize,
    /// Timeout of the single probe request
    pub timeout: Duration,
    /// URL each probe requests through the engine
    pub test_url: String,
    /// How long a freshly spawned engine may take to open its listener
    pub startup_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("working.txt"),
            engine_binary: PathBuf::from("xray"),
            workers: WORKER_PRESETS[1],
            timeout: Duration::from_secs(TIMEOUT_PRESETS[1]),
            test_url: TEST_URL_PRESETS[0].to_string(),
            startup_grace: Duration::from_millis(1500),
        }
    }
}

impl Config {
    /// Engine settings derived from this configuration
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new()
            .with_binary(self.engine_binary.clone())
            .with_startup_grace(self.startup_grace)
    }

    /// Qualifier settings derived from this configuration
    pub fn qualifier_config(&self) -> QualifierConfig {
        QualifierConfig::new()
            .with_workers(self.workers)
            .with_timeout(self.timeout)
            .with_test_url(self.test_url.clone())
    }
}
