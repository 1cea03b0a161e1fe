//! The udp query protocol, which gives us the full player list, the map, and
//! plugins.
//!
//! Packets from the client start with the magic `FE FD`, then a type byte and
//! the session id. Responses start with the type byte and the session id we
//! sent.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::{
    error::{ProtocolError, StatusError},
    net::Endpoint,
};

const MAGIC: [u8; 2] = [0xfe, 0xfd];
pub const HANDSHAKE_TYPE: u8 = 9;
pub const STAT_TYPE: u8 = 0;
/// Servers only look at the low four bits of each byte of the session id.
const SESSION_ID_MASK: u32 = 0x0f0f_0f0f;
/// type + session id + `splitnum\0\x80\0`
const FULL_STAT_HEADER_LENGTH: usize = 16;
const PLAYER_SECTION_MARKER: &[u8] = b"\x01player_\x00\x00";
const MAX_DATAGRAM_SIZE: usize = 65_535;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    pub hostname: String,
    pub gametype: String,
    pub game_id: Option<String>,
    pub version: Option<String>,
    pub map: String,
    pub num_players: u32,
    pub max_players: u32,
    pub player_names: Vec<String>,
    pub software_name: Option<String>,
    pub plugins: Vec<String>,
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    AwaitHandshake,
    AwaitFullStats { challenge_token: i32 },
    Done,
    Failed,
}

/// The query state machine, without any sockets.
pub struct QuerySession {
    session_id: u32,
    state: QueryState,
}

impl Default for QuerySession {
    fn default() -> Self {
        Self::new()
    }
}

impl QuerySession {
    pub fn new() -> Self {
        Self::with_session_id(rand::random::<u32>())
    }

    pub fn with_session_id(session_id: u32) -> Self {
        Self {
            session_id: session_id & SESSION_ID_MASK,
            state: QueryState::AwaitHandshake,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn handshake_request(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(8);
        packet.extend_from_slice(&MAGIC);
        packet.push(HANDSHAKE_TYPE);
        packet.extend_from_slice(&self.session_id.to_be_bytes());
        packet.push(0);
        packet
    }

    /// Handle the handshake response and return the full stat request to send.
    pub fn on_handshake_response(&mut self, datagram: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let result = self.handle_handshake(datagram);
        if result.is_err() {
            self.state = QueryState::Failed;
        }
        result
    }

    fn handle_handshake(&mut self, datagram: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if self.state != QueryState::AwaitHandshake {
            return Err(ProtocolError::MalformedQueryResponse("unexpected handshake"));
        }
        let body = self.check_header(datagram, HANDSHAKE_TYPE)?;

        // the challenge token is sent as a null-terminated decimal string
        let (token, _) = read_cstr(body, 0)
            .ok_or(ProtocolError::MalformedQueryResponse("unterminated challenge token"))?;
        let challenge_token = token
            .trim()
            .parse::<i64>()
            .map_err(|_| ProtocolError::MalformedQueryResponse("challenge token isn't a number"))?
            as i32;

        self.state = QueryState::AwaitFullStats { challenge_token };

        let mut packet = Vec::with_capacity(15);
        packet.extend_from_slice(&MAGIC);
        packet.push(STAT_TYPE);
        packet.extend_from_slice(&self.session_id.to_be_bytes());
        packet.extend_from_slice(&challenge_token.to_be_bytes());
        // four bytes of padding make it a full stat request instead of a basic one
        packet.extend_from_slice(&[0, 0, 0, 0]);
        Ok(packet)
    }

    pub fn on_full_stats(&mut self, datagram: &[u8]) -> Result<QueryResponse, ProtocolError> {
        let result = match self.state {
            QueryState::AwaitFullStats { .. } => self
                .check_header(datagram, STAT_TYPE)
                .and_then(|_| parse_full_stats(datagram)),
            _ => Err(ProtocolError::MalformedQueryResponse("unexpected full stat")),
        };
        self.state = if result.is_ok() {
            QueryState::Done
        } else {
            QueryState::Failed
        };
        result
    }

    /// Verify the type and session id, and return the rest of the datagram.
    fn check_header<'a>(
        &self,
        datagram: &'a [u8],
        expected_type: u8,
    ) -> Result<&'a [u8], ProtocolError> {
        if datagram.len() < 5 {
            return Err(ProtocolError::MalformedQueryResponse("datagram too short"));
        }
        if datagram[0] != expected_type {
            return Err(ProtocolError::MalformedQueryResponse("unexpected packet type"));
        }
        let received = u32::from_be_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
        if received != self.session_id {
            return Err(ProtocolError::SessionMismatch {
                sent: self.session_id,
                received,
            });
        }
        Ok(&datagram[5..])
    }
}

/// Read a null-terminated string, returning it and the offset after the null.
fn read_cstr(buffer: &[u8], offset: usize) -> Option<(String, usize)> {
    let rest = buffer.get(offset..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    // servers send latin-1 here, so lossy is the best we can do
    let s = String::from_utf8_lossy(&rest[..end]).into_owned();
    Some((s, offset + end + 1))
}

fn parse_full_stats(datagram: &[u8]) -> Result<QueryResponse, ProtocolError> {
    if datagram.len() < FULL_STAT_HEADER_LENGTH {
        return Err(ProtocolError::MalformedQueryResponse("full stat header too short"));
    }
    let mut offset = FULL_STAT_HEADER_LENGTH;

    let mut info = HashMap::new();
    loop {
        let (key, next) = read_cstr(datagram, offset)
            .ok_or(ProtocolError::MalformedQueryResponse("unterminated key"))?;
        offset = next;
        if key.is_empty() {
            break;
        }
        let (value, next) = read_cstr(datagram, offset)
            .ok_or(ProtocolError::MalformedQueryResponse("unterminated value"))?;
        offset = next;
        info.insert(key, value);
    }

    let rest = datagram
        .get(offset..)
        .ok_or(ProtocolError::MalformedQueryResponse("missing player section"))?;
    if rest.starts_with(PLAYER_SECTION_MARKER) {
        offset += PLAYER_SECTION_MARKER.len();
    } else if rest.first() == Some(&0) {
        offset += 1;
    } else {
        return Err(ProtocolError::MalformedQueryResponse("missing player section"));
    }

    let mut player_names = Vec::new();
    loop {
        let (name, next) = read_cstr(datagram, offset)
            .ok_or(ProtocolError::MalformedQueryResponse("unterminated player list"))?;
        offset = next;
        if name.is_empty() {
            break;
        }
        player_names.push(name);
    }

    let (software_name, plugins) = parse_plugins(info.get("plugins").map(String::as_str));

    let mut take = |key: &str| info.remove(key);
    Ok(QueryResponse {
        hostname: take("hostname").unwrap_or_default(),
        gametype: take("gametype").unwrap_or_default(),
        game_id: take("game_id"),
        version: take("version"),
        map: take("map").unwrap_or_default(),
        num_players: take("numplayers")
            .and_then(|n| n.parse().ok())
            .unwrap_or(player_names.len() as u32),
        max_players: take("maxplayers").and_then(|n| n.parse().ok()).unwrap_or_default(),
        host_ip: take("hostip"),
        host_port: take("hostport").and_then(|p| p.parse().ok()),
        player_names,
        software_name,
        plugins,
    })
}

/// Split `"Paper on 1.21.1: WorldEdit 7.3; LuckPerms 5.4"` into the server
/// software and the plugin list. Vanilla sends just the software name.
fn parse_plugins(plugins: Option<&str>) -> (Option<String>, Vec<String>) {
    let Some(plugins) = plugins.map(str::trim).filter(|p| !p.is_empty()) else {
        return (None, Vec::new());
    };
    match plugins.split_once(':') {
        Some((software, list)) => (
            Some(software.trim().to_owned()),
            list.split(';')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect(),
        ),
        None => (Some(plugins.to_owned()), Vec::new()),
    }
}

/// The hosts to try the query against: the configured one first, then the
/// fallbacks (usually loopback, for when the dashboard runs next to the
/// server). Duplicates are skipped.
pub fn query_candidates(endpoint: &Endpoint, fallback_hosts: &[String]) -> Vec<Endpoint> {
    let mut candidates = vec![endpoint.clone()];
    for host in fallback_hosts {
        let candidate = Endpoint::new(host.clone(), endpoint.port);
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}

/// Run one query session against one host. The socket is dropped when this
/// returns.
pub async fn query(endpoint: &Endpoint, timeout: Duration) -> Result<QueryResponse, StatusError> {
    match tokio::time::timeout(timeout, query_inner(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(StatusError::Timeout(timeout)),
    }
}

async fn query_inner(endpoint: &Endpoint) -> Result<QueryResponse, StatusError> {
    let addr = endpoint
        .resolve()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"))?;
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;

    let mut session = QuerySession::new();
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

    socket.send(&session.handshake_request()).await?;
    let n = socket.recv(&mut buffer).await?;
    let stat_request = session.on_handshake_response(&buffer[..n])?;

    socket.send(&stat_request).await?;
    let n = socket.recv(&mut buffer).await?;
    Ok(session.on_full_stats(&buffer[..n])?)
}

/// Try each candidate in order and return the first successful response. The
/// remaining candidates aren't tried once one succeeds, or once one answers
/// for a different session.
pub async fn query_first_success(
    candidates: &[Endpoint],
    timeout: Duration,
) -> Result<QueryResponse, StatusError> {
    let mut last_err = None;
    for candidate in candidates {
        match query(candidate, timeout).await {
            Ok(response) => {
                debug!(
                    "query to {candidate} succeeded ({} players)",
                    response.player_names.len()
                );
                return Ok(response);
            }
            Err(err) => {
                if matches!(err, StatusError::Protocol(ProtocolError::SessionMismatch { .. })) {
                    warn!("query to {candidate} got a reply for a different session, giving up");
                    return Err(err);
                }
                debug!("query to {candidate} failed: {err}");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or(StatusError::ConnectionClosed))
}
