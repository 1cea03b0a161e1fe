//! Resolve the target through public dns resolvers and time tcp connections to
//! whatever they return. This avoids split-horizon dns or hosts file entries
//! pointing us at a lan address.

use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use eyre::{bail, eyre};
use futures_util::future::join_all;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{LatencyMethod, StrategyResult, median};
use crate::net::{Endpoint, timed_connect};

const DNS_HEADER_LENGTH: usize = 12;
const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
/// Recursion desired.
const FLAG_RD: u16 = 0x0100;
const FLAG_QR: u16 = 0x8000;
const MAX_NAME_JUMPS: usize = 16;

/// Build a dns query for the A records of `host`.
pub fn build_query(id: u16, host: &str) -> eyre::Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(DNS_HEADER_LENGTH + host.len() + 6);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&FLAG_RD.to_be_bytes());
    // one question, no answers, authorities, or additionals
    packet.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);

    for label in host.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            bail!("invalid dns label in {host:?}");
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&TYPE_A.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(packet)
}

/// Return the offset right after the name starting at `offset`.
fn skip_name(packet: &[u8], mut offset: usize) -> Option<usize> {
    for _ in 0..MAX_NAME_JUMPS * 8 {
        let len = *packet.get(offset)?;
        if len == 0 {
            return Some(offset + 1);
        }
        if len & 0xc0 == 0xc0 {
            // compression pointer, the name ends here as far as we care
            packet.get(offset + 1)?;
            return Some(offset + 2);
        }
        offset += 1 + len as usize;
    }
    None
}

fn read_u16(packet: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*packet.get(offset)?, *packet.get(offset + 1)?]))
}

/// Parse the A records out of a dns response.
pub fn parse_response(id: u16, packet: &[u8]) -> eyre::Result<Vec<Ipv4Addr>> {
    let truncated = || eyre!("truncated dns response");

    if packet.len() < DNS_HEADER_LENGTH {
        return Err(truncated());
    }
    let response_id = read_u16(packet, 0).ok_or_else(truncated)?;
    if response_id != id {
        bail!("dns response id {response_id} doesn't match query id {id}");
    }
    let flags = read_u16(packet, 2).ok_or_else(truncated)?;
    if flags & FLAG_QR == 0 {
        bail!("dns packet isn't a response");
    }
    let rcode = flags & 0x000f;
    if rcode != 0 {
        bail!("dns response has error code {rcode}");
    }
    let question_count = read_u16(packet, 4).ok_or_else(truncated)?;
    let answer_count = read_u16(packet, 6).ok_or_else(truncated)?;

    let mut offset = DNS_HEADER_LENGTH;
    for _ in 0..question_count {
        // name, type, class
        offset = skip_name(packet, offset).ok_or_else(truncated)? + 4;
    }

    let mut addresses = Vec::new();
    for _ in 0..answer_count {
        offset = skip_name(packet, offset).ok_or_else(truncated)?;
        let record_type = read_u16(packet, offset).ok_or_else(truncated)?;
        let record_class = read_u16(packet, offset + 2).ok_or_else(truncated)?;
        // skip the ttl
        let data_length = read_u16(packet, offset + 8).ok_or_else(truncated)? as usize;
        let data_start = offset + 10;
        let data = packet
            .get(data_start..data_start + data_length)
            .ok_or_else(truncated)?;
        if record_type == TYPE_A && record_class == CLASS_IN && data.len() == 4 {
            addresses.push(Ipv4Addr::new(data[0], data[1], data[2], data[3]));
        }
        offset = data_start + data_length;
    }
    Ok(addresses)
}

/// Ask one resolver for the A records of `host`.
pub async fn resolve_with(
    resolver: SocketAddr,
    host: &str,
    timeout: Duration,
) -> eyre::Result<Vec<Ipv4Addr>> {
    let id = rand::random::<u16>();
    let query = build_query(id, host)?;

    let bind_addr: SocketAddr = if resolver.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(resolver).await?;
    socket.send(&query).await?;

    let mut buffer = [0u8; 1500];
    let n = tokio::time::timeout(timeout, socket.recv(&mut buffer))
        .await
        .map_err(|_| eyre!("resolver {resolver} timed out"))??;
    parse_response(id, &buffer[..n])
}

/// Resolvers are `ip:port`, or just an ip for port 53.
fn parse_resolver(s: &str) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    Some(SocketAddr::new(s.parse().ok()?, 53))
}

/// Resolve the target with every resolver. An ip target is returned as is.
/// The addresses are kept even if none of them can be connected to, since
/// they still tell us whether the target is public.
pub async fn resolve_target(
    target: &Endpoint,
    resolvers: &[String],
    timeout: Duration,
) -> Vec<IpAddr> {
    if let Ok(ip) = target.host.parse::<IpAddr>() {
        return vec![ip];
    }

    let resolvers = resolvers
        .iter()
        .filter_map(|r| parse_resolver(r))
        .collect::<Vec<_>>();
    let results = join_all(
        resolvers
            .iter()
            .map(|&resolver| resolve_with(resolver, &target.host, timeout)),
    )
    .await;

    let mut seen = HashSet::new();
    let mut addresses = Vec::new();
    for (resolver, result) in resolvers.iter().zip(results) {
        match result {
            Ok(addrs) => {
                for addr in addrs {
                    if seen.insert(addr) {
                        addresses.push(IpAddr::V4(addr));
                    }
                }
            }
            Err(err) => debug!("resolving {} with {resolver} failed: {err}", target.host),
        }
    }
    addresses
}

/// Connect to every address the resolvers returned for the target.
pub async fn measure(
    target: &Endpoint,
    addresses: &[IpAddr],
    timeout: Duration,
) -> eyre::Result<StrategyResult> {
    if addresses.is_empty() {
        bail!("no resolver returned an address for {}", target.host);
    }

    let timings = join_all(
        addresses
            .iter()
            .map(|&ip| timed_connect(SocketAddr::new(ip, target.port), timeout)),
    )
    .await;
    let values = timings
        .into_iter()
        .filter_map(|t| t.ok())
        .map(|t| t.as_secs_f64() * 1000.)
        .collect::<Vec<_>>();

    let Some(value_ms) = median(values) else {
        bail!("couldn't connect to any address of {}", target.host);
    };
    Ok(StrategyResult {
        method: LatencyMethod::ExternalDns,
        value_ms,
    })
}
