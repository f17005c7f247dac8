//! Local port allocation for ephemeral engine listeners

use rand::Rng;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;
use tracing::debug;

/// Ports probed for a free listener
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

/// Random candidates tried before giving up
pub const MAX_PORT_ATTEMPTS: usize = 10;

/// Used when no random candidate could be bound
pub const FALLBACK_PORT: u16 = 10808;

/// Find a local TCP port that is currently free
///
/// The bind test is not synchronized with other probes; a lost race shows up
/// as an engine that fails to listen and is reported as unreachable.
pub fn allocate_port() -> u16 {
    let mut rng = rand::thread_rng();
    for _ in 0..MAX_PORT_ATTEMPTS {
        let port = rng.gen_range(EPHEMERAL_PORTS);
        if is_port_free(port) {
            return port;
        }
    }
    debug!(port = FALLBACK_PORT, "no free random port, using fallback");
    FALLBACK_PORT
}

/// Whether a listener can currently be bound on `127.0.0.1:port`
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
