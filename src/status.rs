//! Everything the http layer needs: one call for the server's status and one
//! for latency.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::{Config, LatencyConfig},
    latency::{self, LatencyMeasurement},
    net::Endpoint,
    processing::{
        QueryInfo, StatusResponse, merge_modpack, modpack::ModpackMetadata, read_modpack_metadata,
        reconcile,
    },
    session::{
        query::{self, DEFAULT_QUERY_TIMEOUT},
        status::{self, DEFAULT_STATUS_TIMEOUT},
    },
};

/// The combined status of the server. This is built fresh for every request
/// and always serializes to something the frontend can show.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedStatus {
    pub online: bool,
    #[serde(flatten)]
    pub status: Option<StatusResponse>,
    /// Extra details from the query protocol, if the server has it enabled.
    pub query: Option<QueryInfo>,
    /// The round trip time of the server list ping.
    pub status_latency_ms: Option<u64>,
    pub latency: Option<LatencyMeasurement>,
    pub error: Option<String>,
    pub queried_at: DateTime<Utc>,
}

impl UnifiedStatus {
    pub fn online(status: StatusResponse, query: Option<QueryInfo>) -> Self {
        Self {
            online: true,
            status: Some(status),
            query,
            status_latency_ms: None,
            latency: None,
            error: None,
            queried_at: Utc::now(),
        }
    }

    pub fn offline(error: impl Into<String>) -> Self {
        Self {
            online: false,
            status: None,
            query: None,
            status_latency_ms: None,
            latency: None,
            error: Some(error.into()),
            queried_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusOptions {
    pub protocol_version: i32,
    pub status_timeout: Duration,
    pub query_timeout: Duration,
    /// Hosts to try the query on after the query endpoint's own host.
    pub query_fallback_hosts: Vec<String>,
    pub modpack_metadata: Option<ModpackMetadata>,
}

impl Default for StatusOptions {
    fn default() -> Self {
        Self {
            protocol_version: 767,
            status_timeout: DEFAULT_STATUS_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            query_fallback_hosts: Vec::new(),
            modpack_metadata: None,
        }
    }
}

impl StatusOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            protocol_version: config.target.protocol_version,
            status_timeout: config.status_timeout(),
            query_timeout: config.query.timeout(),
            query_fallback_hosts: config.query.fallback_hosts.clone(),
            modpack_metadata: config
                .modpack_file
                .as_deref()
                .and_then(read_modpack_metadata),
        }
    }
}

/// Get the status of the server, enriched with query data when it's
/// available. This never fails, an unreachable server is reported as offline.
pub async fn get_unified_status(
    endpoint: &Endpoint,
    query_endpoint: Option<&Endpoint>,
    options: &StatusOptions,
) -> UnifiedStatus {
    let status_future =
        status::ping_status(endpoint, options.protocol_version, options.status_timeout);
    let query_future = async {
        let query_endpoint = query_endpoint?;
        let candidates = query::query_candidates(query_endpoint, &options.query_fallback_hosts);
        match query::query_first_success(&candidates, options.query_timeout).await {
            Ok(response) => Some(response),
            Err(err) => {
                debug!("query enrichment unavailable: {err}");
                None
            }
        }
    };
    let (status_result, query_result) = tokio::join!(status_future, query_future);

    let outcome = match status_result {
        Ok(outcome) => outcome,
        Err(err) => {
            if err.is_connection_failure() {
                info!("{endpoint} is offline: {err}");
            } else {
                warn!("status session with {endpoint} failed: {err}");
            }
            return UnifiedStatus::offline(err.to_string());
        }
    };

    let mut status = outcome.status;
    status.modpack_info = merge_modpack(
        status.modpack_info.take(),
        options.modpack_metadata.as_ref(),
    );

    let mut unified = reconcile(status, query_result);
    unified.status_latency_ms = Some(outcome.latency.as_millis() as u64);
    unified
}

/// Estimate the latency players have to the server. `None` means every
/// strategy failed and the latency is unknown.
pub async fn get_latency(endpoint: &Endpoint, config: &LatencyConfig) -> Option<LatencyMeasurement> {
    latency::estimate(endpoint, config).await
}

/// One full poll as configured: status, query, and latency all at once.
pub async fn poll(config: &Config) -> UnifiedStatus {
    let endpoint = config.endpoint();
    let query_endpoint = config.query_endpoint();
    let options = StatusOptions::from_config(config);

    let latency_future = async {
        if config.latency.enabled {
            get_latency(&endpoint, &config.latency).await
        } else {
            None
        }
    };
    let (mut unified, latency) = tokio::join!(
        get_unified_status(&endpoint, query_endpoint.as_ref(), &options),
        latency_future
    );
    unified.latency = latency;
    unified
}
