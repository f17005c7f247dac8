//! Proxy module for acquiring and qualifying share links
//!
//! This module provides functionality for:
//! - Fetching share-link lists from URLs, files or literal text
//! - Parsing vmess/vless/shadowsocks/trojan links into descriptors
//! - Driving an ephemeral proxy engine per candidate to measure latency
//! - Qualifying candidates concurrently with cancellation
//! - Persisting working links in a deduplicated result file

pub mod engine;
pub mod fetcher;
pub mod models;
pub mod parser;
pub mod port;
pub mod probe;
pub mod qualifier;
pub mod store;

pub use engine::{render_config, EngineConfig, EngineInstance};
pub use fetcher::{
    Attempt, DohResolver, FetchStrategy, FetcherConfig, HttpExecutor, Origin, SourceFetcher,
    StrategyExecutor,
};
pub use models::{
    CandidateSet, Credentials, Descriptor, Latency, Network, QualificationOutcome, Scheme,
    Security, Transport,
};
pub use parser::DescriptorParser;
pub use port::allocate_port;
pub use probe::{EngineProbe, Probe, ProbeTarget};
pub use qualifier::{
    Progress, Qualification, Qualifier, QualifierConfig, RunContext, RunHandle, RunReport,
};
pub use store::{merge_uris, ResultStore};
