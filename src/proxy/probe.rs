//! Single-candidate probe through an ephemeral proxy engine

use crate::error::ProbeError;
use crate::proxy::engine::{EngineConfig, EngineInstance};
use crate::proxy::models::QualificationOutcome;
use crate::proxy::parser::DescriptorParser;
use crate::proxy::port::allocate_port;
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use reqwest::{Client, Proxy as ReqwestProxy, StatusCode};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What a probe requests and how long it may take
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub test_url: String,
    pub timeout: Duration,
}

impl ProbeTarget {
    pub fn new(test_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            test_url: test_url.into(),
            timeout,
        }
    }
}

/// Measures the latency of one raw share link
///
/// Implementations never fail: every problem collapses into an unreachable
/// outcome. The token is only read, never signaled.
pub trait Probe: Send + Sync + 'static {
    fn probe(
        &self,
        uri: &str,
        target: &ProbeTarget,
        cancel: &CancellationToken,
    ) -> impl Future<Output = QualificationOutcome> + Send;
}

/// Probe backed by the external proxy engine
#[derive(Debug, Clone, Default)]
pub struct EngineProbe {
    config: EngineConfig,
}

impl EngineProbe {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Parse, start the engine, measure, and always shut the engine down
    async fn measure(
        &self,
        uri: &str,
        target: &ProbeTarget,
        cancel: &CancellationToken,
    ) -> Result<u64, ProbeError> {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        let descriptor = DescriptorParser::parse(uri)?;
        let port = allocate_port();

        let mut engine = EngineInstance::start(&self.config, &descriptor, port).await?;
        let result = self.request_through(&mut engine, target, cancel).await;
        engine.shutdown(self.config.stop_grace).await;
        result
    }

    async fn request_through(
        &self,
        engine: &mut EngineInstance,
        target: &ProbeTarget,
        cancel: &CancellationToken,
    ) -> Result<u64, ProbeError> {
        engine.wait_ready(self.config.startup_grace).await?;
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }

        let proxy = ReqwestProxy::all(format!("socks5h://127.0.0.1:{}", engine.port()))?;
        let client = Client::builder()
            .proxy(proxy)
            .timeout(target.timeout)
            .build()?;

        let start = Instant::now();
        let response = tokio::time::timeout(
            target.timeout,
            client
                .get(&target.test_url)
                .header(CACHE_CONTROL, "no-cache")
                .header(PRAGMA, "no-cache")
                .send(),
        )
        .await
        .map_err(|_| ProbeError::Timeout(target.timeout))??;

        if response.status() != StatusCode::OK {
            return Err(ProbeError::Status(response.status()));
        }
        Ok(start.elapsed().as_millis() as u64)
    }
}

impl Probe for EngineProbe {
    async fn probe(
        &self,
        uri: &str,
        target: &ProbeTarget,
        cancel: &CancellationToken,
    ) -> QualificationOutcome {
        match self.measure(uri, target, cancel).await {
            Ok(millis) => {
                debug!(uri, millis, "probe succeeded");
                QualificationOutcome::working(uri, millis)
            }
            Err(e) => {
                debug!(uri, error = %e, "probe failed");
                QualificationOutcome::unreachable(uri)
            }
        }
    }
}
