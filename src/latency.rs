//! Estimating the latency between players and the server.
//!
//! Connecting to the server from the machine it runs on (or from the same
//! network) gives a meaninglessly low number, so we try a few strategies and
//! correct for internal routing when it looks like that's happening.

pub mod external_ping;
pub mod reference;
pub mod resolver;

use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    config::LatencyConfig,
    net::{Endpoint, is_public_address},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LatencyMethod {
    /// Plain tcp connect time to the target.
    TcpConnect,
    /// The target looked internally routed, so the reference servers' latency
    /// was used instead.
    TcpReferenceCorrected,
    /// The system ping against well-known hosts.
    ExternalPing,
    /// Tcp connect to the addresses public dns resolvers gave for the target.
    ExternalDns,
}

impl LatencyMethod {
    /// Whether this method measures the target directly, so a tiny value
    /// could mean we're talking to it over the lan.
    pub fn is_raw(self) -> bool {
        matches!(self, Self::TcpConnect | Self::ExternalDns)
    }
}

impl fmt::Display for LatencyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TcpConnect => "tcp-connect",
            Self::TcpReferenceCorrected => "tcp-reference-corrected",
            Self::ExternalPing => "external-ping",
            Self::ExternalDns => "external-dns",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyResult {
    pub method: LatencyMethod,
    pub value_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyMeasurement {
    pub value_ms: u64,
    /// The methods that contributed, joined with `+`.
    pub method: String,
    pub confidence_level: Confidence,
    /// A raw measurement was suspiciously low for a public address.
    pub suspect: bool,
    pub strategies: Vec<StrategyResult>,
}

/// The thresholds used for detecting internal routing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyPolicy {
    pub internal_threshold_ms: f64,
    pub reference_min_ms: f64,
    pub damping_factor: f64,
}

impl From<&LatencyConfig> for LatencyPolicy {
    fn from(config: &LatencyConfig) -> Self {
        Self {
            internal_threshold_ms: config.internal_threshold_ms,
            reference_min_ms: config.reference_min_ms,
            damping_factor: config.damping_factor,
        }
    }
}

impl Default for LatencyPolicy {
    fn default() -> Self {
        Self::from(&LatencyConfig::default())
    }
}

pub fn median(mut values: Vec<f64>) -> Option<f64> {
    values.retain(|v| v.is_finite());
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.)
    } else {
        Some(values[mid])
    }
}

/// Combine the strategies that succeeded into one measurement. Returns `None`
/// if none of them did, since 0 would be a lie.
pub fn combine(
    results: Vec<StrategyResult>,
    target_is_public: bool,
    policy: &LatencyPolicy,
) -> Option<LatencyMeasurement> {
    let value = median(results.iter().map(|r| r.value_ms).collect())?;

    let suspect = target_is_public
        && results
            .iter()
            .any(|r| r.method.is_raw() && r.value_ms < policy.internal_threshold_ms);

    let mut confidence_level = match results.as_slice() {
        [_, _, ..] => Confidence::High,
        [only] if only.method.is_raw() => Confidence::Low,
        _ => Confidence::Medium,
    };
    if suspect {
        confidence_level = Confidence::Low;
    }

    let method = results
        .iter()
        .map(|r| r.method.to_string())
        .collect::<Vec<_>>()
        .join("+");

    Some(LatencyMeasurement {
        value_ms: value.round() as u64,
        method,
        confidence_level,
        suspect,
        strategies: results,
    })
}

/// Run every strategy against the target and combine whatever worked.
pub async fn estimate(target: &Endpoint, config: &LatencyConfig) -> Option<LatencyMeasurement> {
    let policy = LatencyPolicy::from(config);
    let timeout = config.timeout();

    let local_addrs = match tokio::time::timeout(timeout, target.resolve()).await {
        Ok(Ok(addrs)) => addrs,
        Ok(Err(err)) => {
            debug!("couldn't resolve {target} locally: {err}");
            Vec::new()
        }
        Err(_) => {
            debug!("resolving {target} locally timed out");
            Vec::new()
        }
    };

    let dns_future = async {
        let addresses = resolver::resolve_target(target, &config.dns_resolvers, timeout).await;
        let result = resolver::measure(target, &addresses, timeout).await;
        (result, addresses)
    };
    let (reference, ping, (dns, mut addresses)) = tokio::join!(
        reference::measure(&local_addrs, &config.reference_endpoints, &policy, timeout),
        external_ping::measure(&config.ping_hosts, &policy, timeout),
        dns_future,
    );

    let mut results = Vec::new();
    match reference {
        Ok(r) => results.push(r),
        Err(err) => debug!("tcp reference strategy failed: {err}"),
    }
    match ping {
        Ok(r) => results.push(r),
        Err(err) => debug!("external ping strategy failed: {err}"),
    }
    match dns {
        Ok(r) => results.push(r),
        Err(err) => debug!("external dns strategy failed: {err}"),
    }
    // prefer the addresses from the public resolvers when deciding whether the
    // target is public, even if we couldn't connect to them, since the local
    // resolver might know about lan names
    if addresses.is_empty() {
        addresses = local_addrs.iter().map(|a| a.ip()).collect();
    }
    let target_is_public = addresses.into_iter().any(is_public_address);

    let measurement = combine(results, target_is_public, &policy);
    match &measurement {
        Some(m) => info!(
            "latency to {target}: {}ms via {} ({:?} confidence{})",
            m.value_ms,
            m.method,
            m.confidence_level,
            if m.suspect { ", suspect" } else { "" }
        ),
        None => info!("latency to {target} is unavailable, every strategy failed"),
    }
    measurement
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(method: LatencyMethod, value_ms: f64) -> StrategyResult {
        StrategyResult { method, value_ms }
    }

    #[test]
    fn test_median() {
        assert_eq!(median(vec![]), None);
        assert_eq!(median(vec![5.]), Some(5.));
        assert_eq!(median(vec![40., 10., 20.]), Some(20.));
        assert_eq!(median(vec![40., 10., 20., 30.]), Some(25.));
        assert_eq!(median(vec![f64::NAN, 3.]), Some(3.));
    }

    #[test]
    fn test_no_results_is_unavailable() {
        assert_eq!(combine(vec![], true, &LatencyPolicy::default()), None);
    }

    #[test]
    fn test_two_strategies_is_high_confidence() {
        let m = combine(
            vec![
                result(LatencyMethod::TcpConnect, 30.),
                result(LatencyMethod::ExternalPing, 40.),
            ],
            true,
            &LatencyPolicy::default(),
        )
        .unwrap();
        assert_eq!(m.value_ms, 35);
        assert_eq!(m.confidence_level, Confidence::High);
        assert_eq!(m.method, "tcp-connect+external-ping");
        assert!(!m.suspect);
    }

    #[test]
    fn test_single_strategy_confidence() {
        let policy = LatencyPolicy::default();
        let corrected = combine(
            vec![result(LatencyMethod::TcpReferenceCorrected, 36.)],
            true,
            &policy,
        )
        .unwrap();
        assert_eq!(corrected.confidence_level, Confidence::Medium);

        let raw = combine(vec![result(LatencyMethod::ExternalDns, 25.)], true, &policy).unwrap();
        assert_eq!(raw.confidence_level, Confidence::Low);
    }

    #[test]
    fn test_fast_public_target_is_suspect() {
        let policy = LatencyPolicy::default();
        let m = combine(
            vec![
                result(LatencyMethod::TcpConnect, 2.),
                result(LatencyMethod::ExternalDns, 3.),
            ],
            true,
            &policy,
        )
        .unwrap();
        assert!(m.suspect);
        assert_eq!(m.confidence_level, Confidence::Low);

        // on a lan address, fast is expected
        let m = combine(vec![result(LatencyMethod::TcpConnect, 2.)], false, &policy).unwrap();
        assert!(!m.suspect);
        assert_eq!(m.value_ms, 2);
    }

    /// Answers every A query with a public address that nothing here can
    /// connect to.
    async fn spawn_public_resolver() -> String {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let mut reply = buf[..n].to_vec();
                // response bit, one answer
                reply[2] |= 0x80;
                reply[7] = 1;
                reply.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 1, 44, 0, 4]);
                reply.extend_from_slice(&[93, 184, 216, 34]);
                let _ = socket.send_to(&reply, from).await;
            }
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_fast_local_connect_to_public_target_is_suspect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // localhost might resolve to ::1 first
        let _listener_v6 = tokio::net::TcpListener::bind(("::1", port)).await;

        let config = LatencyConfig {
            timeout_ms: 300,
            reference_endpoints: vec![],
            ping_hosts: vec![],
            dns_resolvers: vec![spawn_public_resolver().await],
            ..Default::default()
        };
        let m = estimate(&Endpoint::new("localhost", port), &config)
            .await
            .unwrap();
        assert!(
            m.strategies
                .iter()
                .any(|s| s.method == LatencyMethod::TcpConnect && s.value_ms < 10.)
        );
        assert!(m.suspect);
        assert_eq!(m.confidence_level, Confidence::Low);
    }

    #[tokio::test]
    async fn test_fast_local_connect_to_private_target_is_trusted() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = LatencyConfig {
            timeout_ms: 300,
            reference_endpoints: vec![],
            ping_hosts: vec![],
            dns_resolvers: vec![],
            ..Default::default()
        };
        let m = estimate(&Endpoint::new("127.0.0.1", port), &config)
            .await
            .unwrap();
        assert!(!m.suspect);
        assert_eq!(m.confidence_level, Confidence::High);
    }

    #[test]
    fn test_serialization() {
        let m = combine(
            vec![result(LatencyMethod::TcpReferenceCorrected, 36.)],
            false,
            &LatencyPolicy::default(),
        )
        .unwrap();
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["valueMs"], 36);
        assert_eq!(json["confidenceLevel"], "medium");
        assert_eq!(json["strategies"][0]["method"], "tcp-reference-corrected");
    }
}
