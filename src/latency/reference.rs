//! Tcp connect timing to the target, checked against well-known reference
//! servers.

use std::{net::SocketAddr, time::Duration};

use eyre::bail;
use futures_util::future::join_all;
use tracing::{debug, trace};

use super::{LatencyMethod, LatencyPolicy, StrategyResult, median};
use crate::{
    error::StatusError,
    net::{Endpoint, timed_connect},
};

pub async fn measure(
    target_addrs: &[SocketAddr],
    reference_endpoints: &[String],
    policy: &LatencyPolicy,
    timeout: Duration,
) -> eyre::Result<StrategyResult> {
    if target_addrs.is_empty() {
        bail!("target didn't resolve to any addresses");
    }

    let references = join_all(
        reference_endpoints
            .iter()
            .filter_map(|s| Endpoint::parse(s, 443))
            .map(|endpoint| connect_to_reference(endpoint, timeout)),
    );
    let (references, target) = tokio::join!(references, connect_to_target(target_addrs, timeout));

    let target_ms = target?.as_secs_f64() * 1000.;
    let reference_ms = references.into_iter().flatten().collect::<Vec<_>>();
    trace!("target took {target_ms:.1}ms, references took {reference_ms:?}ms");

    Ok(correct_for_internal_routing(target_ms, reference_ms, policy))
}

/// Connect to the target's addresses in order until one works, like a normal
/// client would.
async fn connect_to_target(
    target_addrs: &[SocketAddr],
    timeout: Duration,
) -> Result<Duration, StatusError> {
    let mut last_err = StatusError::ConnectionClosed;
    for &addr in target_addrs {
        match timed_connect(addr, timeout).await {
            Ok(elapsed) => return Ok(elapsed),
            Err(err) => {
                trace!("couldn't connect to {addr}: {err}");
                last_err = err;
            }
        }
    }
    Err(last_err)
}

async fn connect_to_reference(endpoint: Endpoint, timeout: Duration) -> Option<f64> {
    let addr = match tokio::time::timeout(timeout, endpoint.resolve()).await {
        Ok(Ok(addrs)) => addrs.into_iter().next()?,
        _ => {
            debug!("couldn't resolve reference endpoint {endpoint}");
            return None;
        }
    };
    match timed_connect(addr, timeout).await {
        Ok(elapsed) => Some(elapsed.as_secs_f64() * 1000.),
        Err(err) => {
            debug!("couldn't connect to reference endpoint {endpoint}: {err}");
            None
        }
    }
}

/// If the target answered much faster than anything on the internet could,
/// we're probably connecting to it over loopback or the lan. In that case the
/// reference servers are a better guess for what players see.
pub fn correct_for_internal_routing(
    target_ms: f64,
    reference_ms: Vec<f64>,
    policy: &LatencyPolicy,
) -> StrategyResult {
    if target_ms < policy.internal_threshold_ms
        && let Some(reference_median) = median(reference_ms)
        && reference_median >= policy.reference_min_ms
    {
        debug!(
            "target took {target_ms:.1}ms but references took {reference_median:.1}ms, assuming internal routing"
        );
        return StrategyResult {
            method: LatencyMethod::TcpReferenceCorrected,
            value_ms: reference_median * policy.damping_factor,
        };
    }

    StrategyResult {
        method: LatencyMethod::TcpConnect,
        value_ms: target_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latency::{Confidence, combine};

    #[test]
    fn test_internal_routing_is_corrected() {
        let policy = LatencyPolicy::default();
        let result = correct_for_internal_routing(3., vec![38., 40., 45.], &policy);
        assert_eq!(result.method, LatencyMethod::TcpReferenceCorrected);
        assert!((34. ..=38.).contains(&result.value_ms), "{}", result.value_ms);

        let measurement = combine(vec![result], true, &policy).unwrap();
        assert!((34..=38).contains(&measurement.value_ms));
        assert!(!measurement.suspect);
        assert!(measurement.confidence_level >= Confidence::Medium);
    }

    #[test]
    fn test_fast_references_mean_no_correction() {
        let result =
            correct_for_internal_routing(3., vec![5., 6., 12.], &LatencyPolicy::default());
        assert_eq!(result.method, LatencyMethod::TcpConnect);
        assert_eq!(result.value_ms, 3.);
    }

    #[test]
    fn test_slow_target_is_reported_raw() {
        let result = correct_for_internal_routing(55., vec![40.], &LatencyPolicy::default());
        assert_eq!(result.method, LatencyMethod::TcpConnect);
        assert_eq!(result.value_ms, 55.);
    }

    #[test]
    fn test_no_references_means_no_correction() {
        let result = correct_for_internal_routing(3., vec![], &LatencyPolicy::default());
        assert_eq!(result.method, LatencyMethod::TcpConnect);
    }

    #[tokio::test]
    async fn test_measure_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // no reference endpoints, so nothing can be corrected
        let result = measure(&[addr], &[], &LatencyPolicy::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.method, LatencyMethod::TcpConnect);
    }

    #[tokio::test]
    async fn test_measure_skips_dead_addresses() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let result = measure(
            &[dead_addr, addr],
            &[],
            &LatencyPolicy::default(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(result.method, LatencyMethod::TcpConnect);
    }

    #[tokio::test]
    async fn test_measure_without_addresses() {
        assert!(
            measure(&[], &[], &LatencyPolicy::default(), Duration::from_secs(1))
                .await
                .is_err()
        );
    }
}
