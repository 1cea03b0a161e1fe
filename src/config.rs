use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::net::Endpoint;

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub target: TargetConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub latency: LatencyConfig,

    /// How long the whole status + ping exchange can take. Defaults to 10
    /// seconds.
    #[serde(default)]
    pub status_timeout_secs: Option<u64>,

    /// The number of seconds between polls. Defaults to 30 seconds.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,

    /// A toml file with the modpack's `name`, `version`, and `projectID`,
    /// which take priority over what the server advertises.
    #[serde(default)]
    pub modpack_file: Option<PathBuf>,

    /// If set, debug logs are also written to a daily rotating file in this
    /// directory.
    #[serde(default)]
    pub logging_dir: Option<PathBuf>,

    /// If true, the program will exit after the first poll. This is primarily
    /// meant for debugging purposes.
    #[serde(default)]
    pub exit_on_done: bool,
}

impl Config {
    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs.unwrap_or(10))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(30))
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.target.host.clone(), self.target.port)
    }

    pub fn query_endpoint(&self) -> Option<Endpoint> {
        self.query.enabled.then(|| {
            Endpoint::new(
                self.target.host.clone(),
                self.query.port.unwrap_or(self.target.port),
            )
        })
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// The protocol version sent in the handshake. Servers reply to status
    /// requests regardless of the version, so this barely matters.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: i32,
}

fn default_port() -> u16 {
    25565
}
fn default_protocol_version() -> i32 {
    767
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to the same port as the target, which is what `query.port` in
    /// server.properties defaults to.
    #[serde(default)]
    pub port: Option<u16>,
    /// Hosts to try if the target host doesn't answer queries, in order.
    #[serde(default = "default_query_fallback_hosts")]
    pub fallback_hosts: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(5))
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: None,
            fallback_hosts: default_query_fallback_hosts(),
            timeout_secs: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_query_fallback_hosts() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "localhost".to_string()]
}

/// Settings for the latency estimator. The thresholds are guesses about what
/// internal routing looks like, tune them for your network.
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LatencyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Timeout for each individual connection or ping.
    #[serde(default = "default_latency_timeout_ms")]
    pub timeout_ms: u64,
    /// Well-known `host:port`s we tcp connect to for a baseline.
    #[serde(default = "default_reference_endpoints")]
    pub reference_endpoints: Vec<String>,
    /// Hosts we run the system `ping` against.
    #[serde(default = "default_ping_hosts")]
    pub ping_hosts: Vec<String>,
    /// Public dns resolvers used to look up the target independently of the
    /// local resolver.
    #[serde(default = "default_dns_resolvers")]
    pub dns_resolvers: Vec<String>,
    /// Anything faster than this probably never left the machine or lan.
    #[serde(default = "default_internal_threshold_ms")]
    pub internal_threshold_ms: f64,
    /// The reference median has to be at least this for a fast target to be
    /// considered internally routed.
    #[serde(default = "default_reference_min_ms")]
    pub reference_min_ms: f64,
    /// Multiplied with the reference median when the target is internally
    /// routed.
    #[serde(default = "default_damping_factor")]
    pub damping_factor: f64,
}

impl LatencyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_latency_timeout_ms(),
            reference_endpoints: default_reference_endpoints(),
            ping_hosts: default_ping_hosts(),
            dns_resolvers: default_dns_resolvers(),
            internal_threshold_ms: default_internal_threshold_ms(),
            reference_min_ms: default_reference_min_ms(),
            damping_factor: default_damping_factor(),
        }
    }
}

fn default_latency_timeout_ms() -> u64 {
    3000
}
fn default_reference_endpoints() -> Vec<String> {
    vec![
        "1.1.1.1:53".to_string(),
        "8.8.8.8:53".to_string(),
        "www.google.com:443".to_string(),
    ]
}
fn default_ping_hosts() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]
}
fn default_dns_resolvers() -> Vec<String> {
    vec![
        "1.1.1.1:53".to_string(),
        "8.8.8.8:53".to_string(),
        "9.9.9.9:53".to_string(),
    ]
}
fn default_internal_threshold_ms() -> f64 {
    10.
}
fn default_reference_min_ms() -> f64 {
    15.
}
fn default_damping_factor() -> f64 {
    0.9
}
