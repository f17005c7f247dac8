//! External proxy engine: configuration synthesis and process lifecycle
//!
//! The engine is an opaque binary started as `<engine> run -config <path>`
//! that opens a SOCKS listener on the requested local port and forwards
//! through one outbound built from a [`Descriptor`].

use crate::error::ProbeError;
use crate::proxy::models::{Credentials, Descriptor, Network, Security, Transport};
use serde_json::{json, Map, Value};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

/// Default engine binary name
const DEFAULT_ENGINE_BINARY: &str = "xray";

/// Default time a fresh engine may take to open its listener
const DEFAULT_STARTUP_GRACE_MS: u64 = 1500;

/// Default time between graceful terminate and forced kill
const DEFAULT_STOP_GRACE_MS: u64 = 500;

/// Interval between listener readiness checks
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Configuration for spawning engine instances
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine executable
    pub binary: PathBuf,
    /// Time allowed for the engine to start listening
    pub startup_grace: Duration,
    /// Time allowed for the engine to exit after terminate
    pub stop_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_ENGINE_BINARY),
            startup_grace: Duration::from_millis(DEFAULT_STARTUP_GRACE_MS),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// Build the engine configuration for one descriptor
///
/// One SOCKS inbound on `127.0.0.1:local_port`, one outbound for the descriptor.
pub fn render_config(descriptor: &Descriptor, local_port: u16) -> Value {
    json!({
        "log": { "loglevel": "none" },
        "inbounds": [{
            "tag": "socks-in",
            "listen": Ipv4Addr::LOCALHOST.to_string(),
            "port": local_port,
            "protocol": "socks",
            "settings": { "auth": "noauth", "udp": false }
        }],
        "outbounds": [render_outbound(descriptor)]
    })
}

fn render_outbound(descriptor: &Descriptor) -> Value {
    let address = &descriptor.address;
    let port = descriptor.port;

    let settings = match &descriptor.credentials {
        Credentials::Vmess {
            id,
            alter_id,
            cipher,
        } => json!({
            "vnext": [{
                "address": address,
                "port": port,
                "users": [{ "id": id, "alterId": alter_id, "security": cipher }]
            }]
        }),
        Credentials::Vless {
            id,
            encryption,
            flow,
        } => {
            let mut user = json!({ "id": id, "encryption": encryption });
            if let Some(flow) = flow {
                user["flow"] = json!(flow);
            }
            json!({ "vnext": [{ "address": address, "port": port, "users": [user] }] })
        }
        Credentials::Shadowsocks { method, password } => json!({
            "servers": [{
                "address": address,
                "port": port,
                "method": method,
                "password": password
            }]
        }),
        Credentials::Trojan { password } => json!({
            "servers": [{ "address": address, "port": port, "password": password }]
        }),
    };

    json!({
        "tag": "proxy",
        "protocol": descriptor.scheme().protocol(),
        "settings": settings,
        "streamSettings": render_stream_settings(&descriptor.transport, address)
    })
}

fn render_stream_settings(transport: &Transport, address: &str) -> Value {
    let mut stream = json!({
        "network": transport.network.as_str(),
        "security": transport.security.as_str()
    });

    let server_name = transport
        .sni
        .clone()
        .or_else(|| transport.host.clone())
        .unwrap_or_else(|| address.to_string());

    match &transport.security {
        Security::None => {}
        Security::Tls => {
            let mut tls = Map::new();
            tls.insert("serverName".into(), json!(server_name));
            tls.insert("allowInsecure".into(), json!(transport.allow_insecure));
            if let Some(fp) = &transport.fingerprint {
                tls.insert("fingerprint".into(), json!(fp));
            }
            if !transport.alpn.is_empty() {
                tls.insert("alpn".into(), json!(transport.alpn));
            }
            stream["tlsSettings"] = Value::Object(tls);
        }
        Security::Reality {
            public_key,
            short_id,
        } => {
            stream["realitySettings"] = json!({
                "serverName": server_name,
                "publicKey": public_key,
                "shortId": short_id,
                "fingerprint": transport.fingerprint.as_deref().unwrap_or("chrome")
            });
        }
    }

    let path = transport.path.as_deref().unwrap_or("/");
    match transport.network {
        Network::Tcp => {}
        Network::Ws => {
            let mut ws = json!({ "path": path });
            if let Some(host) = &transport.host {
                ws["headers"] = json!({ "Host": host });
            }
            stream["wsSettings"] = ws;
        }
        Network::Grpc => {
            stream["grpcSettings"] = json!({
                "serviceName": transport.service_name.as_deref().unwrap_or_default()
            });
        }
        Network::H2 => {
            let mut http = json!({ "path": path });
            if let Some(host) = &transport.host {
                http["host"] = json!([host]);
            }
            stream["httpSettings"] = http;
        }
    }

    stream
}

/// A running engine process together with its configuration file
///
/// Dropping an instance kills the process and deletes the file; [`shutdown`]
/// does the same gracefully.
///
/// [`shutdown`]: EngineInstance::shutdown
pub struct EngineInstance {
    child: Child,
    config_file: NamedTempFile,
    port: u16,
}

impl EngineInstance {
    /// Write the configuration to a unique temp file and spawn the engine on it
    pub async fn start(
        config: &EngineConfig,
        descriptor: &Descriptor,
        port: u16,
    ) -> Result<Self, ProbeError> {
        let mut config_file = tempfile::Builder::new()
            .prefix("engine-")
            .suffix(".json")
            .tempfile()
            .map_err(ProbeError::ConfigWrite)?;
        serde_json::to_writer(config_file.as_file_mut(), &render_config(descriptor, port))
            .map_err(|e| ProbeError::ConfigWrite(e.into()))?;
        config_file.as_file_mut().flush().map_err(ProbeError::ConfigWrite)?;

        let mut command = Command::new(&config.binary);
        command
            .arg("run")
            .arg("-config")
            .arg(config_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let child = command.spawn().map_err(ProbeError::Spawn)?;
        debug!(port, config = %config_file.path().display(), "engine started");

        Ok(Self {
            child,
            config_file,
            port,
        })
    }

    /// Local SOCKS port of this instance
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config_path(&self) -> &Path {
        self.config_file.path()
    }

    /// Wait until the SOCKS listener accepts connections
    ///
    /// Fails when the process exits first or `grace` elapses.
    pub async fn wait_ready(&mut self, grace: Duration) -> Result<(), ProbeError> {
        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.child.try_wait().map_err(ProbeError::Spawn)? {
                return Err(ProbeError::EngineExited(status));
            }
            if TcpStream::connect((Ipv4Addr::LOCALHOST, self.port))
                .await
                .is_ok()
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProbeError::EngineNotReady(grace));
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Terminate the process (forced kill after `grace`) and remove the config file
    pub async fn shutdown(mut self, grace: Duration) {
        terminate(&mut self.child);
        if timeout(grace, self.child.wait()).await.is_err() {
            if let Err(e) = self.child.kill().await {
                debug!(error = %e, "failed to kill engine");
            }
        }
        if let Err(e) = self.config_file.close() {
            debug!(error = %e, "failed to remove engine config");
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `Child::id` is Some only until this owned handle reaps the
        // child through `wait`/`try_wait`. Until then the kernel keeps the pid
        // reserved (at worst as a zombie), so it cannot name a recycled process.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}
