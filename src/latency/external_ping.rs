//! Icmp ping to well-known hosts, using the system's `ping` since raw sockets
//! need root.

use std::{sync::LazyLock, time::Duration};

use eyre::{bail, eyre};
use futures_util::future::join_all;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use super::{LatencyMethod, LatencyPolicy, StrategyResult, median};

// linux and mac print `time=12.3 ms`, windows prints `time=12ms` or `time<1ms`
static PING_TIME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time[=<]\s*([\d.]+)\s*ms").unwrap());

pub fn parse_ping_output(output: &str) -> Option<f64> {
    PING_TIME_REGEX
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

async fn ping_once(host: &str, timeout: Duration) -> eyre::Result<f64> {
    let mut command = Command::new("ping");
    if cfg!(windows) {
        let timeout_ms = timeout.as_millis().to_string();
        command.args(["-n", "1", "-w", timeout_ms.as_str(), host]);
    } else {
        let timeout_secs = timeout.as_secs().max(1).to_string();
        command.args(["-c", "1", "-W", timeout_secs.as_str(), host]);
    }
    command.kill_on_drop(true);

    // give the process a little longer than its own timeout before giving up
    let output = tokio::time::timeout(timeout + Duration::from_secs(1), command.output())
        .await
        .map_err(|_| eyre!("ping to {host} timed out"))??;
    if !output.status.success() {
        bail!("ping to {host} exited with {}", output.status);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ping_output(&stdout).ok_or_else(|| eyre!("no time in ping output for {host}"))
}

/// Drop anything faster than the internal threshold, since those replies
/// probably came from something on our own network.
pub fn filter_external(values: Vec<f64>, policy: &LatencyPolicy) -> Vec<f64> {
    values
        .into_iter()
        .filter(|&v| v >= policy.internal_threshold_ms)
        .collect()
}

pub async fn measure(
    hosts: &[String],
    policy: &LatencyPolicy,
    timeout: Duration,
) -> eyre::Result<StrategyResult> {
    let results = join_all(hosts.iter().map(|host| ping_once(host, timeout))).await;

    let mut values = Vec::new();
    for (host, result) in hosts.iter().zip(results) {
        match result {
            Ok(ms) => values.push(ms),
            Err(err) => debug!("external ping to {host} failed: {err}"),
        }
    }

    let Some(value_ms) = median(filter_external(values, policy)) else {
        bail!("no usable ping replies");
    };
    Ok(StrategyResult {
        method: LatencyMethod::ExternalPing,
        value_ms,
    })
}
