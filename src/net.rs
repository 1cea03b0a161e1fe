//! Plain socket helpers shared by the sessions and the latency estimator.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream, lookup_host};
use tracing::trace;

use crate::error::StatusError;

/// A host and port to connect to. The host can be a domain or an ip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, or just `host` with the given default port.
    pub fn parse(s: &str, default_port: u16) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Some(Self::new(addr.ip().to_string(), addr.port()));
        }
        // bare ipv6 addresses contain colons but no port
        if s.parse::<IpAddr>().is_ok() {
            return Some(Self::new(s, default_port));
        }
        match s.rsplit_once(':') {
            Some((host, port)) => Some(Self::new(host, port.parse().ok()?)),
            None => Some(Self::new(s, default_port)),
        }
    }

    pub async fn resolve(&self) -> std::io::Result<Vec<SocketAddr>> {
        Ok(lookup_host((self.host.as_str(), self.port)).await?.collect())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Open a tcp connection and return how long the handshake took. The socket
/// is closed right away.
pub async fn timed_connect(addr: SocketAddr, timeout: Duration) -> Result<Duration, StatusError> {
    let start = Instant::now();
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(stream) => stream?,
        Err(_) => return Err(StatusError::Timeout(timeout)),
    };
    let elapsed = start.elapsed();
    drop(stream);
    trace!("connected to {addr} in {elapsed:?}");
    Ok(elapsed)
}

/// Whether the address is reachable from the public internet, as opposed to
/// loopback, lan, link-local, or carrier-grade nat space.
pub fn is_public_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            let is_shared = octets[0] == 100 && (octets[1] & 0b1100_0000) == 64;
            // 0.0.0.0/8 is "this network"
            let is_this_network = octets[0] == 0;
            let is_benchmarking = octets[0] == 198 && (octets[1] & 0xfe) == 18;
            // 240.0.0.0/4, which includes broadcast
            let is_reserved = octets[0] & 0xf0 == 240;
            !(ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_multicast()
                || ip.is_documentation()
                || is_shared
                || is_this_network
                || is_benchmarking
                || is_reserved)
        }
        IpAddr::V6(ip) => {
            if let Some(v4) = ip.to_ipv4_mapped() {
                return is_public_address(IpAddr::V4(v4));
            }
            let first = ip.segments()[0];
            let is_unique_local = (first & 0xfe00) == 0xfc00;
            let is_unicast_link_local = (first & 0xffc0) == 0xfe80;
            !(ip.is_loopback() || ip.is_unspecified() || is_unique_local || is_unicast_link_local)
        }
    }
}
