//! The server list ping exchange over tcp.
//!
//! [`StatusSession`] doesn't touch any sockets. Bytes go in through
//! [`StatusSession::receive`] and [`StatusSession::advance`] says what to do
//! next, so the same state machine works no matter how the stream is chunked.
//! [`ping_status`] drives it over a real connection.

use std::{
    mem,
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, trace};

use crate::{
    codec::{self, MAX_STATUS_JSON_LENGTH},
    error::{ProtocolError, StatusError},
    net::Endpoint,
    processing::status::{StatusResponse, parse_status_response},
};

pub const HANDSHAKE_PACKET_ID: u32 = 0x00;
pub const STATUS_PACKET_ID: u32 = 0x00;
pub const PING_PACKET_ID: u32 = 0x01;
/// The "next state" in the handshake, 1 means status.
const NEXT_STATE_STATUS: u32 = 1;

pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitStatusResponse,
    AwaitPongResponse { sent_at: Instant },
    Done,
    Failed,
}

/// What the driver should do after [`StatusSession::advance`].
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// The buffer doesn't have a complete packet yet, read more.
    NeedMoreData,
    /// We got the status, write this ping packet and keep reading.
    SendPing(Vec<u8>),
    Done(StatusOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusOutcome {
    /// The raw status json.
    pub status_payload: String,
    pub status: StatusResponse,
    pub latency: Duration,
}

pub struct StatusSession {
    state: SessionState,
    hostname: String,
    port: u16,
    protocol_version: i32,
    buffer: Vec<u8>,
    ping_payload: [u8; 8],
    status: Option<(String, StatusResponse)>,
}

impl StatusSession {
    /// Every session gets a fresh random ping payload.
    pub fn new(hostname: &str, port: u16, protocol_version: i32) -> Self {
        Self {
            state: SessionState::Connecting,
            hostname: hostname.to_owned(),
            port,
            protocol_version,
            buffer: Vec::new(),
            ping_payload: rand::random(),
            status: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn ping_payload(&self) -> [u8; 8] {
        self.ping_payload
    }

    /// Called once the connection is open. Returns the handshake followed by
    /// the status request, which are sent together.
    pub fn on_connect(&mut self) -> Vec<u8> {
        self.state = SessionState::AwaitStatusResponse;
        build_status_request(&self.hostname, self.port, self.protocol_version)
    }

    pub fn receive(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to handle one packet from the front of the buffer.
    pub fn advance(&mut self, now: Instant) -> Result<Progress, StatusError> {
        let result = self.advance_inner(now);
        if result.is_err() {
            self.state = SessionState::Failed;
        }
        result
    }

    fn advance_inner(&mut self, now: Instant) -> Result<Progress, StatusError> {
        match self.state {
            SessionState::AwaitStatusResponse | SessionState::AwaitPongResponse { .. } => {}
            SessionState::Connecting | SessionState::Done | SessionState::Failed => {
                return Ok(Progress::NeedMoreData);
            }
        }

        let Some((packet, consumed)) = codec::read_packet(&self.buffer)? else {
            trace!("waiting for more data ({} bytes buffered)", self.buffer.len());
            return Ok(Progress::NeedMoreData);
        };
        // anything after the packet stays for next time
        self.buffer.drain(..consumed);

        match self.state {
            SessionState::AwaitStatusResponse => {
                if packet.id != STATUS_PACKET_ID {
                    return Err(ProtocolError::UnexpectedPacket {
                        expected: STATUS_PACKET_ID,
                        received: packet.id,
                    }
                    .into());
                }
                let Some((json, _)) =
                    codec::decode_string_with_limit(&packet.payload, 0, MAX_STATUS_JSON_LENGTH)?
                else {
                    return Err(ProtocolError::MalformedStatusJson(
                        "string is longer than its packet".to_string(),
                    )
                    .into());
                };
                let status = parse_status_response(&json)?;
                debug!(
                    "got status from {}:{} ({} bytes), sending ping",
                    self.hostname,
                    self.port,
                    json.len()
                );
                self.status = Some((json, status));
                self.state = SessionState::AwaitPongResponse { sent_at: now };
                Ok(Progress::SendPing(codec::encode_packet(
                    PING_PACKET_ID,
                    &self.ping_payload,
                )))
            }
            SessionState::AwaitPongResponse { sent_at } => {
                if packet.id != PING_PACKET_ID {
                    return Err(ProtocolError::UnexpectedPacket {
                        expected: PING_PACKET_ID,
                        received: packet.id,
                    }
                    .into());
                }
                if packet.payload != self.ping_payload {
                    return Err(ProtocolError::PingPayloadMismatch.into());
                }
                let latency = now.saturating_duration_since(sent_at);
                let Some((status_payload, status)) = self.status.take() else {
                    // can't be in this state without a status
                    return Err(StatusError::ConnectionClosed);
                };
                self.state = SessionState::Done;
                Ok(Progress::Done(StatusOutcome {
                    status_payload,
                    status,
                    latency,
                }))
            }
            _ => Ok(Progress::NeedMoreData),
        }
    }

    /// Bytes that were received but not consumed by a packet yet.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn take_buffer(&mut self) -> Vec<u8> {
        mem::take(&mut self.buffer)
    }
}

/// The handshake packet immediately followed by an empty status request.
pub fn build_status_request(hostname: &str, port: u16, protocol_version: i32) -> Vec<u8> {
    let mut handshake = Vec::new();
    // negative versions (like -1) are sent as their two's complement
    codec::write_varint(&mut handshake, protocol_version as u32);
    // some server implementations require hostname and port to be properly set
    // (notchian does not)
    codec::write_string(&mut handshake, hostname);
    handshake.extend_from_slice(&port.to_be_bytes());
    codec::write_varint(&mut handshake, NEXT_STATE_STATUS);

    let mut full_buffer = codec::encode_packet(HANDSHAKE_PACKET_ID, &handshake);
    full_buffer.extend(codec::encode_packet(STATUS_PACKET_ID, &[]));
    full_buffer
}

/// Connect to the server, get its status, and measure the ping. The socket is
/// closed when this returns, whether it succeeded or not.
pub async fn ping_status(
    endpoint: &Endpoint,
    protocol_version: i32,
    timeout: Duration,
) -> Result<StatusOutcome, StatusError> {
    match tokio::time::timeout(timeout, ping_status_inner(endpoint, protocol_version)).await {
        Ok(result) => result,
        Err(_) => {
            debug!("status session with {endpoint} timed out after {timeout:?}");
            Err(StatusError::Timeout(timeout))
        }
    }
}

async fn ping_status_inner(
    endpoint: &Endpoint,
    protocol_version: i32,
) -> Result<StatusOutcome, StatusError> {
    let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    let _ = stream.set_nodelay(true);

    let mut session = StatusSession::new(&endpoint.host, endpoint.port, protocol_version);
    stream.write_all(&session.on_connect()).await?;

    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(StatusError::ConnectionClosed);
        }
        session.receive(&chunk[..n]);

        loop {
            match session.advance(Instant::now())? {
                Progress::NeedMoreData => break,
                Progress::SendPing(ping) => stream.write_all(&ping).await?,
                Progress::Done(outcome) => {
                    let _ = stream.shutdown().await;
                    return Ok(outcome);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_packet, encode_string};

    const STATUS_JSON: &str = r#"{"version":{"name":"1.21.1","protocol":767},"players":{"max":20,"online":0},"description":"test server"}"#;

    fn status_packet() -> Vec<u8> {
        encode_packet(STATUS_PACKET_ID, &encode_string(STATUS_JSON))
    }

    fn connected_session() -> StatusSession {
        let mut session = StatusSession::new("localhost", 25565, 767);
        session.on_connect();
        session
    }

    fn feed_until_progress(session: &mut StatusSession, bytes: &[u8], now: Instant) -> Progress {
        for (i, byte) in bytes.iter().enumerate() {
            session.receive(&[*byte]);
            let progress = session.advance(now).unwrap();
            if progress != Progress::NeedMoreData {
                assert_eq!(i, bytes.len() - 1, "packet finished early");
                return progress;
            }
        }
        Progress::NeedMoreData
    }

    #[test]
    fn test_handshake_bytes() {
        let request = build_status_request("localhost", 25565, 767);
        assert_eq!(
            request,
            vec![
                // length, handshake id, protocol 767
                0x10, 0x00, 0xff, 0x05, // "localhost"
                0x09, b'l', b'o', b'c', b'a', b'l', b'h', b'o', b's', b't', // port, next state
                0x63, 0xdd, 0x01, // status request
                0x01, 0x00,
            ]
        );
    }

    #[test]
    fn test_byte_by_byte_matches_all_at_once() {
        let now = Instant::now();

        let mut whole = connected_session();
        whole.receive(&status_packet());
        let Progress::SendPing(whole_ping) = whole.advance(now).unwrap() else {
            panic!("expected a ping");
        };

        let mut split = connected_session();
        let Progress::SendPing(split_ping) = feed_until_progress(&mut split, &status_packet(), now)
        else {
            panic!("expected a ping");
        };

        assert_eq!(whole_ping, encode_packet(PING_PACKET_ID, &whole.ping_payload()));
        assert_eq!(split_ping, encode_packet(PING_PACKET_ID, &split.ping_payload()));

        let later = now + Duration::from_millis(42);
        whole.receive(&encode_packet(PING_PACKET_ID, &whole.ping_payload()));
        let pong = encode_packet(PING_PACKET_ID, &split.ping_payload());
        let Progress::Done(whole_outcome) = whole.advance(later).unwrap() else {
            panic!("expected done");
        };
        let Progress::Done(split_outcome) = feed_until_progress(&mut split, &pong, later) else {
            panic!("expected done");
        };

        assert_eq!(whole_outcome, split_outcome);
        assert_eq!(whole_outcome.status_payload, STATUS_JSON);
        assert_eq!(whole_outcome.status.version_name.as_deref(), Some("1.21.1"));
        assert_eq!(whole_outcome.latency, Duration::from_millis(42));
        assert_eq!(whole.state(), &SessionState::Done);
    }

    #[test]
    fn test_remainder_is_kept() {
        let mut session = connected_session();
        let mut bytes = status_packet();
        bytes.extend(encode_packet(PING_PACKET_ID, &session.ping_payload()));
        session.receive(&bytes);

        let now = Instant::now();
        assert!(matches!(session.advance(now).unwrap(), Progress::SendPing(_)));
        assert_eq!(session.buffered().len(), 10);
        assert!(matches!(session.advance(now).unwrap(), Progress::Done(_)));
        assert!(session.buffered().is_empty());
    }

    #[test]
    fn test_pong_mismatch() {
        let mut session = connected_session();
        session.receive(&status_packet());
        let now = Instant::now();
        session.advance(now).unwrap();

        let mut wrong = session.ping_payload();
        wrong[0] ^= 0xff;
        session.receive(&encode_packet(PING_PACKET_ID, &wrong));
        let err = session.advance(now).unwrap_err();
        assert!(matches!(
            err,
            StatusError::Protocol(ProtocolError::PingPayloadMismatch)
        ));
        assert_eq!(session.state(), &SessionState::Failed);
    }

    #[test]
    fn test_malformed_status_json() {
        let mut session = connected_session();
        session.receive(&encode_packet(STATUS_PACKET_ID, &encode_string("{not json")));
        let err = session.advance(Instant::now()).unwrap_err();
        assert!(matches!(
            err,
            StatusError::Protocol(ProtocolError::MalformedStatusJson(_))
        ));
        assert_eq!(session.state(), &SessionState::Failed);
    }

    #[test]
    fn test_unexpected_packet_id() {
        let mut session = connected_session();
        session.receive(&encode_packet(0x02, &encode_string(STATUS_JSON)));
        assert!(matches!(
            session.advance(Instant::now()).unwrap_err(),
            StatusError::Protocol(ProtocolError::UnexpectedPacket {
                expected: 0x00,
                received: 0x02
            })
        ));
    }

    #[test]
    fn test_ping_payloads_are_unique() {
        let a = StatusSession::new("localhost", 25565, 767);
        let b = StatusSession::new("localhost", 25565, 767);
        assert_ne!(a.ping_payload(), b.ping_payload());
    }

    #[test]
    fn test_nothing_happens_before_connect() {
        let mut session = StatusSession::new("localhost", 25565, 767);
        session.receive(&status_packet());
        assert_eq!(session.advance(Instant::now()).unwrap(), Progress::NeedMoreData);
        assert_eq!(session.take_buffer(), status_packet());
    }
}
