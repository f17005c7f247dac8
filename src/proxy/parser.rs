//! Share-link parser producing normalized descriptors
//!
//! Supports:
//! - `vmess://` base64-encoded JSON (short and long key names)
//! - `vless://id@host:port?type=..&security=..#remark`
//! - `trojan://password@host:port?sni=..#remark` (always TLS)
//! - `ss://` in both SIP002 (`method:password@host:port`, optionally base64
//!   userinfo) and legacy fully-base64 form

use crate::error::ParseError;
use crate::proxy::models::{Credentials, Descriptor, Network, Scheme, Security, Transport};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use url::Url;

/// `host:port` or `[v6]:port`
static HOST_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\[([0-9A-Fa-f:.]+)\]|([^:\[\]/?#@\s]+)):(\d{1,5})$")
        .expect("Invalid host:port regex")
});

const DEFAULT_VMESS_CIPHER: &str = "auto";
const DEFAULT_VLESS_ENCRYPTION: &str = "none";

/// Parser turning one raw share link into a [`Descriptor`]
pub struct DescriptorParser;

impl DescriptorParser {
    /// Parse a single share link
    ///
    /// Either returns a complete descriptor or an error; nothing in between.
    pub fn parse(raw: &str) -> Result<Descriptor, ParseError> {
        let raw = raw.trim();
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| ParseError::UnsupportedScheme(preview(raw)))?;

        match scheme.to_ascii_lowercase().as_str() {
            "vmess" => Self::parse_vmess(rest),
            "vless" => Self::parse_authority_link(raw, Scheme::Vless),
            "trojan" => Self::parse_authority_link(raw, Scheme::Trojan),
            "ss" => Self::parse_shadowsocks(rest),
            other => Err(ParseError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Parse the base64 JSON payload of a vmess link
    fn parse_vmess(payload: &str) -> Result<Descriptor, ParseError> {
        let json = decode_base64(payload)?;
        let fields = match serde_json::from_str::<Value>(&json) {
            Ok(Value::Object(map)) => VmessFields(map),
            Ok(_) => return Err(ParseError::malformed("vmess payload is not a json object")),
            Err(e) => return Err(ParseError::malformed(format!("invalid vmess json: {}", e))),
        };

        let address = fields.text(&["add", "address"]).ok_or_else(|| missing("add"))?;
        let port = fields
            .text(&["port"])
            .ok_or_else(|| missing("port"))
            .and_then(|p| parse_port(&p))?;
        let id = fields.text(&["id"]).ok_or_else(|| missing("id"))?;
        let alter_id = match fields.text(&["aid", "alterId"]) {
            Some(aid) => aid
                .parse::<u16>()
                .map_err(|_| ParseError::malformed(format!("invalid alterId `{}`", aid)))?,
            None => 0,
        };
        let cipher = fields
            .text(&["scy", "security"])
            .unwrap_or_else(|| DEFAULT_VMESS_CIPHER.to_string());

        let network_name = fields.text(&["net", "network"]).unwrap_or_default();
        let network = Network::from_name(&network_name).ok_or_else(|| {
            ParseError::malformed(format!("unsupported network `{}`", network_name))
        })?;

        let security = match fields.value(&["tls"]) {
            None | Some(Value::Bool(false)) => Security::None,
            Some(Value::Bool(true)) => Security::Tls,
            Some(value) => match scalar_string(value)
                .unwrap_or_default()
                .to_ascii_lowercase()
                .as_str()
            {
                "" | "none" => Security::None,
                "tls" => Security::Tls,
                other => {
                    return Err(ParseError::malformed(format!(
                        "unsupported vmess tls `{}`",
                        other
                    )))
                }
            },
        };

        let host = fields.text(&["host"]);
        let path = fields.text(&["path"]);
        // vmess reuses `path` as the gRPC service name
        let service_name = if network == Network::Grpc {
            path.clone()
        } else {
            None
        };

        Ok(Descriptor {
            address,
            port,
            credentials: Credentials::Vmess {
                id,
                alter_id,
                cipher,
            },
            transport: Transport {
                network,
                security,
                sni: fields.text(&["sni"]),
                host,
                path,
                service_name,
                fingerprint: fields.text(&["fp"]),
                alpn: split_list(fields.text(&["alpn"]).as_deref()),
                allow_insecure: false,
            },
            remark: fields.text(&["ps"]),
        })
    }

    /// Parse `scheme://user@host:port?query#fragment` links (vless, trojan)
    fn parse_authority_link(raw: &str, scheme: Scheme) -> Result<Descriptor, ParseError> {
        let url =
            Url::parse(raw).map_err(|e| ParseError::malformed(format!("invalid uri: {}", e)))?;

        let user = decode_component(url.username());
        let user = match url.password() {
            Some(rest) => format!("{}:{}", user, decode_component(rest)),
            None => user,
        };
        if user.is_empty() {
            return Err(missing("user"));
        }

        let address = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| missing("host"))?;
        let port = url.port().ok_or_else(|| missing("port"))?;
        if port == 0 {
            return Err(ParseError::malformed("port 0"));
        }

        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let mut transport = transport_from_query(&params, scheme)?;

        let credentials = match scheme {
            Scheme::Vless => Credentials::Vless {
                id: user,
                encryption: params
                    .get("encryption")
                    .filter(|e| !e.is_empty())
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_VLESS_ENCRYPTION.to_string()),
                flow: params.get("flow").filter(|f| !f.is_empty()).cloned(),
            },
            Scheme::Trojan => {
                if transport.sni.is_none() {
                    transport.sni = params.get("peer").filter(|p| !p.is_empty()).cloned();
                }
                Credentials::Trojan { password: user }
            }
            Scheme::Vmess | Scheme::Shadowsocks => {
                return Err(ParseError::UnsupportedScheme(scheme.to_string()))
            }
        };

        Ok(Descriptor {
            address,
            port,
            credentials,
            transport,
            remark: url.fragment().map(decode_component).filter(|r| !r.is_empty()),
        })
    }

    /// Parse a shadowsocks link, modern form first, then legacy base64
    fn parse_shadowsocks(rest: &str) -> Result<Descriptor, ParseError> {
        let (body, remark) = match rest.split_once('#') {
            Some((body, fragment)) => (body, Some(decode_component(fragment))),
            None => (rest, None),
        };
        // plugin options are not carried into the engine config
        let body = body.split('?').next().unwrap_or_default().trim_end_matches('/');

        let (method, password, host_port) = match body
            .rsplit_once('@')
            .and_then(|(userinfo, host_port)| {
                modern_credentials(userinfo).map(|(m, p)| (m, p, host_port.to_string()))
            }) {
            Some(parts) => parts,
            None => {
                let decoded = decode_base64(body)?;
                let (creds, host_port) = decoded
                    .rsplit_once('@')
                    .ok_or_else(|| ParseError::malformed("shadowsocks link lacks `@host:port`"))?;
                let (method, password) = creds.split_once(':').ok_or_else(|| {
                    ParseError::malformed("shadowsocks credentials lack `method:password`")
                })?;
                (method.to_string(), password.to_string(), host_port.to_string())
            }
        };

        if method.is_empty() || password.is_empty() {
            return Err(ParseError::malformed("empty shadowsocks method or password"));
        }
        let (address, port) = split_host_port(&host_port)?;

        Ok(Descriptor {
            address,
            port,
            credentials: Credentials::Shadowsocks {
                method: method.to_ascii_lowercase(),
                password,
            },
            transport: Transport::default(),
            remark: remark.filter(|r| !r.is_empty()),
        })
    }
}

/// vmess share-link JSON object; publishers use short or long key names
struct VmessFields(Map<String, Value>);

impl VmessFields {
    /// First non-null value among `keys`
    fn value(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .find_map(|key| self.0.get(*key).filter(|v| !v.is_null()))
    }

    /// First non-empty string or number among `keys`
    fn text(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|key| self.0.get(*key))
            .filter_map(scalar_string)
            .find(|v| !v.is_empty())
    }
}

/// Transport parameters from a vless/trojan query string
fn transport_from_query(
    params: &HashMap<String, String>,
    scheme: Scheme,
) -> Result<Transport, ParseError> {
    let get = |key: &str| params.get(key).filter(|v| !v.is_empty()).cloned();

    let network_name = get("type").unwrap_or_default();
    let network = Network::from_name(&network_name)
        .ok_or_else(|| ParseError::malformed(format!("unsupported network `{}`", network_name)))?;

    let security_name = get("security").unwrap_or_default().to_ascii_lowercase();
    let security = match (scheme, security_name.as_str()) {
        (_, "reality") => Security::Reality {
            public_key: get("pbk").ok_or_else(|| missing("pbk"))?,
            short_id: get("sid").unwrap_or_default(),
        },
        // trojan always runs over TLS whatever the link claims
        (Scheme::Trojan, _) => Security::Tls,
        (_, "" | "none") => Security::None,
        (_, "tls" | "xtls") => Security::Tls,
        (_, other) => {
            return Err(ParseError::malformed(format!(
                "unsupported security `{}`",
                other
            )))
        }
    };

    Ok(Transport {
        network,
        security,
        sni: get("sni"),
        host: get("host"),
        path: get("path"),
        service_name: get("serviceName"),
        fingerprint: get("fp"),
        alpn: split_list(params.get("alpn").map(String::as_str)),
        allow_insecure: matches!(
            params.get("allowInsecure").map(String::as_str),
            Some("1") | Some("true")
        ),
    })
}

/// SIP002 userinfo: plain `method:password` or base64 of it
fn modern_credentials(userinfo: &str) -> Option<(String, String)> {
    let plain = decode_component(userinfo);
    if let Some((method, password)) = plain.split_once(':') {
        return Some((method.to_string(), password.to_string()));
    }
    let decoded = decode_base64(userinfo).ok()?;
    let (method, password) = decoded.split_once(':')?;
    Some((method.to_string(), password.to_string()))
}

/// Decode base64 in either alphabet, with or without padding
fn decode_base64(input: &str) -> Result<String, ParseError> {
    let mut normalized: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    let unpadded = normalized.trim_end_matches('=').len();
    normalized.truncate(unpadded);
    while normalized.len() % 4 != 0 {
        normalized.push('=');
    }

    let bytes = URL_SAFE
        .decode(normalized.as_bytes())
        .map_err(|e| ParseError::malformed(format!("invalid base64: {}", e)))?;
    String::from_utf8(bytes).map_err(|_| ParseError::malformed("base64 payload is not utf-8"))
}

fn split_host_port(input: &str) -> Result<(String, u16), ParseError> {
    let caps = HOST_PORT_REGEX
        .captures(input.trim())
        .ok_or_else(|| ParseError::malformed(format!("invalid host:port `{}`", input)))?;
    let host = caps
        .get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| missing("host"))?;
    let port = parse_port(&caps[3])?;
    Ok((host, port))
}

fn parse_port(input: &str) -> Result<u16, ParseError> {
    match input.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ParseError::malformed(format!("invalid port `{}`", input))),
    }
}

/// JSON string or number as a string
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn decode_component(input: &str) -> String {
    urlencoding::decode(input)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| input.to_string())
}

fn missing(field: &str) -> ParseError {
    ParseError::malformed(format!("missing `{}`", field))
}

fn preview(raw: &str) -> String {
    raw.chars().take(24).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
    use pretty_assertions::assert_eq;

    const UUID: &str = "11111111-1111-1111-1111-111111111111";

    fn vmess_link(json: &str) -> String {
        format!("vmess://{}", URL_SAFE.encode(json))
    }

    #[test]
    fn test_parse_vmess_ws() {
        let link = vmess_link(&format!(
            r#"{{"add":"ex.example","port":443,"id":"{}","net":"ws","path":"/ws","host":"cdn.example"}}"#,
            UUID
        ));
        let descriptor = DescriptorParser::parse(&link).unwrap();
        assert_eq!(descriptor.address, "ex.example");
        assert_eq!(descriptor.port, 443);
        assert_eq!(descriptor.transport.network, Network::Ws);
        assert_eq!(descriptor.transport.path.as_deref(), Some("/ws"));
        assert_eq!(descriptor.transport.host.as_deref(), Some("cdn.example"));
        assert_eq!(
            descriptor.credentials,
            Credentials::Vmess {
                id: UUID.to_string(),
                alter_id: 0,
                cipher: "auto".to_string(),
            }
        );
        assert_eq!(descriptor.transport.security, Security::None);
    }

    #[test]
    fn test_parse_vmess_long_keys_and_string_port() {
        let json = format!(
            r#"{{"address":"1.2.3.4","port":"8443","id":"{}","alterId":"2","security":"aes-128-gcm","network":"grpc","path":"svc","tls":"tls","ps":"node"}}"#,
            UUID
        );
        // standard alphabet without padding, as many publishers emit it
        let link = format!("vmess://{}", STANDARD_NO_PAD.encode(json));
        let descriptor = DescriptorParser::parse(&link).unwrap();
        assert_eq!(descriptor.port, 8443);
        assert_eq!(descriptor.transport.network, Network::Grpc);
        assert_eq!(descriptor.transport.service_name.as_deref(), Some("svc"));
        assert_eq!(descriptor.transport.security, Security::Tls);
        assert_eq!(descriptor.remark.as_deref(), Some("node"));
        assert!(matches!(
            descriptor.credentials,
            Credentials::Vmess { alter_id: 2, ref cipher, .. } if cipher == "aes-128-gcm"
        ));
    }

    #[test]
    fn test_parse_vmess_malformed() {
        assert!(matches!(
            DescriptorParser::parse("vmess://!!!not-base64!!!"),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            DescriptorParser::parse(&vmess_link("not json")),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            DescriptorParser::parse(&vmess_link(r#"{"add":"a.example","port":443}"#)),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            DescriptorParser::parse(&vmess_link(&format!(
                r#"{{"add":"a.example","port":0,"id":"{}"}}"#,
                UUID
            ))),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_vmess_short_and_long_keys_together() {
        let json = format!(
            r#"{{"add":"short.example","address":"long.example","port":443,"id":"{}","aid":"0","alterId":"0","net":"ws","network":"ws"}}"#,
            UUID
        );
        let descriptor = DescriptorParser::parse(&vmess_link(&json)).unwrap();
        assert_eq!(descriptor.address, "short.example");
        assert_eq!(descriptor.transport.network, Network::Ws);
        assert!(matches!(
            descriptor.credentials,
            Credentials::Vmess { alter_id: 0, .. }
        ));
    }

    #[test]
    fn test_parse_vmess_bool_tls() {
        let with_tls = format!(
            r#"{{"add":"b.example","port":443,"id":"{}","tls":true}}"#,
            UUID
        );
        let descriptor = DescriptorParser::parse(&vmess_link(&with_tls)).unwrap();
        assert_eq!(descriptor.transport.security, Security::Tls);

        let without_tls = format!(
            r#"{{"add":"b.example","port":80,"id":"{}","tls":false}}"#,
            UUID
        );
        let descriptor = DescriptorParser::parse(&vmess_link(&without_tls)).unwrap();
        assert_eq!(descriptor.transport.security, Security::None);
    }

    #[test]
    fn test_parse_vless_ws_tls() {
        let link = format!(
            "vless://{}@vl.example:443?type=ws&security=tls&sni=sni.example&path=%2Fray&host=h.example#My%20Node",
            UUID
        );
        let descriptor = DescriptorParser::parse(&link).unwrap();
        assert_eq!(descriptor.scheme(), Scheme::Vless);
        assert_eq!(descriptor.address, "vl.example");
        assert_eq!(descriptor.port, 443);
        assert_eq!(descriptor.transport.network, Network::Ws);
        assert_eq!(descriptor.transport.security, Security::Tls);
        assert_eq!(descriptor.transport.sni.as_deref(), Some("sni.example"));
        assert_eq!(descriptor.transport.path.as_deref(), Some("/ray"));
        assert_eq!(descriptor.remark.as_deref(), Some("My Node"));
    }

    #[test]
    fn test_parse_vless_defaults() {
        let descriptor = DescriptorParser::parse(&format!("vless://{}@10.0.0.1:8080", UUID)).unwrap();
        assert_eq!(descriptor.transport.network, Network::Tcp);
        assert_eq!(descriptor.transport.security, Security::None);
        assert_eq!(
            descriptor.credentials,
            Credentials::Vless {
                id: UUID.to_string(),
                encryption: "none".to_string(),
                flow: None,
            }
        );
    }

    #[test]
    fn test_parse_vless_reality() {
        let link = format!(
            "vless://{}@r.example:443?security=reality&pbk=PUBKEY&sid=ab12&fp=chrome&flow=xtls-rprx-vision",
            UUID
        );
        let descriptor = DescriptorParser::parse(&link).unwrap();
        assert_eq!(
            descriptor.transport.security,
            Security::Reality {
                public_key: "PUBKEY".to_string(),
                short_id: "ab12".to_string(),
            }
        );
        assert_eq!(descriptor.transport.fingerprint.as_deref(), Some("chrome"));

        let missing_key = format!("vless://{}@r.example:443?security=reality", UUID);
        assert!(DescriptorParser::parse(&missing_key).is_err());
    }

    #[test]
    fn test_parse_vless_malformed() {
        assert!(DescriptorParser::parse("vless://vl.example:443").is_err());
        assert!(DescriptorParser::parse(&format!("vless://{}@vl.example", UUID)).is_err());
        assert!(DescriptorParser::parse(&format!("vless://{}@vl.example:99999", UUID)).is_err());
        assert!(
            DescriptorParser::parse(&format!("vless://{}@vl.example:443?type=kcp", UUID)).is_err()
        );
    }

    #[test]
    fn test_parse_trojan_always_tls() {
        let descriptor =
            DescriptorParser::parse("trojan://secret@tj.example:443?security=none&peer=p.example")
                .unwrap();
        assert_eq!(descriptor.transport.security, Security::Tls);
        assert_eq!(descriptor.transport.sni.as_deref(), Some("p.example"));
        assert_eq!(
            descriptor.credentials,
            Credentials::Trojan {
                password: "secret".to_string()
            }
        );
    }

    #[test]
    fn test_parse_trojan_unknown_security_is_tls() {
        for security in ["auto", "ssl", "tls", ""] {
            let link = format!("trojan://secret@tj.example:443?security={}", security);
            let descriptor = DescriptorParser::parse(&link).unwrap();
            assert_eq!(descriptor.transport.security, Security::Tls, "security={}", security);
        }

        let reality = DescriptorParser::parse(
            "trojan://secret@tj.example:443?security=reality&pbk=PUBKEY",
        )
        .unwrap();
        assert!(matches!(
            reality.transport.security,
            Security::Reality { ref public_key, .. } if public_key == "PUBKEY"
        ));

        // vless stays strict about what it accepts
        let vless = format!("vless://{}@vl.example:443?security=ssl", UUID);
        assert!(matches!(
            DescriptorParser::parse(&vless),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_trojan_ipv6() {
        let descriptor = DescriptorParser::parse("trojan://pw@[2001:db8::1]:443").unwrap();
        assert_eq!(descriptor.address, "2001:db8::1");
        assert_eq!(descriptor.port, 443);
    }

    #[test]
    fn test_parse_shadowsocks_plain_userinfo() {
        let descriptor =
            DescriptorParser::parse("ss://chacha20-ietf-poly1305:p%40ss@1.2.3.4:8388#home").unwrap();
        assert_eq!(descriptor.address, "1.2.3.4");
        assert_eq!(descriptor.port, 8388);
        assert_eq!(
            descriptor.credentials,
            Credentials::Shadowsocks {
                method: "chacha20-ietf-poly1305".to_string(),
                password: "p@ss".to_string(),
            }
        );
        assert_eq!(descriptor.remark.as_deref(), Some("home"));
    }

    #[test]
    fn test_parse_shadowsocks_base64_userinfo() {
        let userinfo = URL_SAFE.encode("aes-256-gcm:secret");
        let link = format!("ss://{}@ss.example:443/?plugin=none#x", userinfo);
        let descriptor = DescriptorParser::parse(&link).unwrap();
        assert_eq!(descriptor.address, "ss.example");
        assert_eq!(
            descriptor.credentials,
            Credentials::Shadowsocks {
                method: "aes-256-gcm".to_string(),
                password: "secret".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_shadowsocks_legacy() {
        let link = format!("ss://{}#old", STANDARD.encode("aes-256-gcm:secret@5.6.7.8:8388"));
        let descriptor = DescriptorParser::parse(&link).unwrap();
        assert_eq!(descriptor.address, "5.6.7.8");
        assert_eq!(descriptor.port, 8388);
        assert_eq!(descriptor.remark.as_deref(), Some("old"));
    }

    #[test]
    fn test_parse_shadowsocks_missing_separator() {
        let link = format!("ss://{}", STANDARD.encode("aes256gcmsecret@5.6.7.8:8388"));
        assert!(matches!(
            DescriptorParser::parse(&link),
            Err(ParseError::Malformed(_))
        ));
        assert!(DescriptorParser::parse("ss://@5.6.7.8:8388").is_err());
    }

    #[test]
    fn test_parse_unsupported_scheme() {
        assert!(matches!(
            DescriptorParser::parse("http://1.2.3.4:8080"),
            Err(ParseError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            DescriptorParser::parse("just some text"),
            Err(ParseError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("a.example:80").unwrap(), ("a.example".to_string(), 80));
        assert_eq!(split_host_port("[::1]:80").unwrap(), ("::1".to_string(), 80));
        assert!(split_host_port("a.example").is_err());
        assert!(split_host_port("a.example:0").is_err());
    }
}
