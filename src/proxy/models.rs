//! Descriptor and qualification outcome models

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Share-link scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Vmess,
    Vless,
    Shadowsocks,
    Trojan,
}

impl Scheme {
    /// URI prefix used by share links of this scheme
    pub fn prefix(&self) -> &'static str {
        match self {
            Scheme::Vmess => "vmess://",
            Scheme::Vless => "vless://",
            Scheme::Shadowsocks => "ss://",
            Scheme::Trojan => "trojan://",
        }
    }

    /// Outbound protocol name understood by the proxy engine
    pub fn protocol(&self) -> &'static str {
        match self {
            Scheme::Vmess => "vmess",
            Scheme::Vless => "vless",
            Scheme::Shadowsocks => "shadowsocks",
            Scheme::Trojan => "trojan",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.protocol())
    }
}

/// Protocol-specific credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum Credentials {
    Vmess {
        id: String,
        alter_id: u16,
        cipher: String,
    },
    Vless {
        id: String,
        encryption: String,
        flow: Option<String>,
    },
    Shadowsocks {
        method: String,
        password: String,
    },
    Trojan {
        password: String,
    },
}

impl Credentials {
    pub fn scheme(&self) -> Scheme {
        match self {
            Credentials::Vmess { .. } => Scheme::Vmess,
            Credentials::Vless { .. } => Scheme::Vless,
            Credentials::Shadowsocks { .. } => Scheme::Shadowsocks,
            Credentials::Trojan { .. } => Scheme::Trojan,
        }
    }
}

/// Transport network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Ws,
    Grpc,
    H2,
}

impl Network {
    /// Parse a network name as it appears in share links
    ///
    /// An empty value means tcp; `http` is an alias of `h2`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" | "raw" => Some(Network::Tcp),
            "ws" | "websocket" => Some(Network::Ws),
            "grpc" | "gun" => Some(Network::Grpc),
            "h2" | "http" => Some(Network::H2),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Ws => "ws",
            Network::Grpc => "grpc",
            Network::H2 => "h2",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport security layer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality {
        public_key: String,
        short_id: String,
    },
}

impl Security {
    pub fn as_str(&self) -> &'static str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
            Security::Reality { .. } => "reality",
        }
    }

    pub fn is_secured(&self) -> bool {
        !matches!(self, Security::None)
    }
}

/// Transport parameters shared by all schemes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transport {
    pub network: Network,
    pub security: Security,
    /// TLS server name
    pub sni: Option<String>,
    /// HTTP host header (ws/h2)
    pub host: Option<String>,
    /// Request path (ws/h2)
    pub path: Option<String>,
    /// gRPC service name
    pub service_name: Option<String>,
    /// TLS client fingerprint
    pub fingerprint: Option<String>,
    pub alpn: Vec<String>,
    pub allow_insecure: bool,
}

/// Normalized connection parameters for one candidate endpoint
///
/// Only ever produced complete by [`DescriptorParser`](super::DescriptorParser).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub address: String,
    pub port: u16,
    pub credentials: Credentials,
    pub transport: Transport,
    pub remark: Option<String>,
}

impl Descriptor {
    pub fn scheme(&self) -> Scheme {
        self.credentials.scheme()
    }

    /// `host:port` of the remote endpoint
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{} ({}/{})",
            self.scheme(),
            self.endpoint(),
            self.transport.network,
            self.transport.security.as_str()
        )
    }
}

/// Probe latency: a finite millisecond value or unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Latency {
    Millis(u64),
    Unreachable,
}

impl Latency {
    pub fn is_finite(&self) -> bool {
        matches!(self, Latency::Millis(_))
    }

    pub fn millis(&self) -> Option<u64> {
        match self {
            Latency::Millis(ms) => Some(*ms),
            Latency::Unreachable => None,
        }
    }
}

impl Ord for Latency {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Latency::Millis(a), Latency::Millis(b)) => a.cmp(b),
            (Latency::Millis(_), Latency::Unreachable) => Ordering::Less,
            (Latency::Unreachable, Latency::Millis(_)) => Ordering::Greater,
            (Latency::Unreachable, Latency::Unreachable) => Ordering::Equal,
        }
    }
}

impl PartialOrd for Latency {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Latency::Millis(ms) => write!(f, "{}ms", ms),
            Latency::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Result of probing one raw share link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualificationOutcome {
    pub uri: String,
    pub latency: Latency,
}

impl QualificationOutcome {
    pub fn working(uri: impl Into<String>, millis: u64) -> Self {
        Self {
            uri: uri.into(),
            latency: Latency::Millis(millis),
        }
    }

    pub fn unreachable(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            latency: Latency::Unreachable,
        }
    }

    pub fn is_working(&self) -> bool {
        self.latency.is_finite()
    }
}

/// Deduplicated ordered list of raw share links from one fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSet {
    uris: Vec<String>,
}

impl CandidateSet {
    /// Build from raw lines: trims, drops empty lines, keeps first occurrence
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = std::collections::HashSet::new();
        let uris = lines
            .into_iter()
            .filter_map(|line| {
                let line = line.as_ref().trim();
                if line.is_empty() || !seen.insert(line.to_string()) {
                    None
                } else {
                    Some(line.to_string())
                }
            })
            .collect();
        Self { uris }
    }

    /// Build from fetched text, newest (last appended) lines first
    pub fn from_text_reversed(text: &str) -> Self {
        Self::from_lines(text.lines().rev())
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.uris.iter()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.uris
    }
}

impl IntoIterator for CandidateSet {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.uris.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_ordering() {
        let mut values = vec![Latency::Unreachable, Latency::Millis(80), Latency::Millis(50)];
        values.sort();
        assert_eq!(
            values,
            vec![Latency::Millis(50), Latency::Millis(80), Latency::Unreachable]
        );
    }

    #[test]
    fn test_outcome_constructors() {
        let ok = QualificationOutcome::working("vless://a", 42);
        assert!(ok.is_working());
        assert_eq!(ok.latency.millis(), Some(42));

        let bad = QualificationOutcome::unreachable("vless://b");
        assert!(!bad.is_working());
        assert_eq!(bad.latency.to_string(), "unreachable");
    }

    #[test]
    fn test_candidate_set_dedup_and_trim() {
        let set = CandidateSet::from_lines(["  a ", "", "b", "a", "c", "b"]);
        assert_eq!(set.into_vec(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_candidate_set_reversed() {
        let set = CandidateSet::from_text_reversed("old\nmid\n\nnew\nmid\n");
        assert_eq!(set.into_vec(), vec!["mid", "new", "old"]);
    }

    #[test]
    fn test_network_names() {
        assert_eq!(Network::from_name(""), Some(Network::Tcp));
        assert_eq!(Network::from_name("WS"), Some(Network::Ws));
        assert_eq!(Network::from_name("http"), Some(Network::H2));
        assert_eq!(Network::from_name("kcp"), None);
    }

    #[test]
    fn test_descriptor_endpoint_ipv6() {
        let descriptor = Descriptor {
            address: "2001:db8::1".to_string(),
            port: 443,
            credentials: Credentials::Trojan {
                password: "pw".to_string(),
            },
            transport: Transport::default(),
            remark: None,
        };
        assert_eq!(descriptor.endpoint(), "[2001:db8::1]:443");
        assert_eq!(descriptor.scheme(), Scheme::Trojan);
    }
}
