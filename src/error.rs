use std::{io, time::Duration};

use thiserror::Error;

/// The peer sent something that doesn't follow the protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("varint is longer than 5 bytes")]
    VarIntTooLarge,
    #[error("string length {0} is out of range")]
    InvalidStringLength(u32),
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("packet length {0} is out of range")]
    InvalidPacketLength(u32),
    #[error("expected packet {expected:#04x}, got {received:#04x}")]
    UnexpectedPacket { expected: u32, received: u32 },
    #[error("malformed status json: {0}")]
    MalformedStatusJson(String),
    #[error("session id mismatch (sent {sent:#010x}, got {received:#010x})")]
    SessionMismatch { sent: u32, received: u32 },
    #[error("pong payload doesn't match the ping we sent")]
    PingPayloadMismatch,
    #[error("malformed query response: {0}")]
    MalformedQueryResponse(&'static str),
}

/// Why a status or query session failed.
#[derive(Error, Debug)]
pub enum StatusError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),
    #[error("connection closed before the exchange finished")]
    ConnectionClosed,
}

impl StatusError {
    /// Whether this failure means we never reached the server at all.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::ConnectionClosed)
    }
}
