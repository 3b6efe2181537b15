//! # Protocol — Line-Delimited JSON Coordination Messages
//!
//! Wire format for the coordinator link: UTF-8 JSON, one envelope per
//! `\n`-terminated line (`\r` tolerated before the `\n`). The envelope is
//! `{"type": <UPPER_SNAKE kind>, "body": <object>}`; bodies use camelCase
//! field names.
//!
//! ## Session Shape
//!
//! ```text
//! worker ──CLIENT_REGISTER──▶ coordinator        (forward connection, then closed)
//! worker ◀──SERVER_HELLO───── coordinator        (reverse connection)
//! worker ──CLIENT_HELLO_ACK─▶ coordinator
//! worker ◀──ASSIGN_WORK────── coordinator
//! worker ──CHECKPOINT*──────▶ coordinator
//! worker ──WORK_RESULT──────▶ coordinator
//! worker ◀──STOP───────────── coordinator        (broadcast, any time)
//! ```
//!
//! Malformed frames and unknown types decode to [`ProtocolError`]; callers
//! log and skip them — they never terminate a session.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
}

// ── Message Bodies ──────────────────────────────────────────────────

/// Worker → coordinator on the forward connection, which is closed
/// immediately afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegister {
    pub node_id: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub threads: usize,
}

/// Coordinator → worker, first frame on the reverse connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHello {
    pub server_time: DateTime<FixedOffset>,
    pub node_id: String,
}

/// Worker → coordinator, completes the reverse handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHelloAck {
    pub node_id: String,
    pub ok: bool,
}

/// Coordinator → worker: one slice of the candidate index space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignWork {
    pub job_id: String,
    pub stored_hash: String,
    pub start_index: i64,
    pub count: i64,
    pub checkpoint_every: i32,
}

/// Worker → coordinator: the first `tried` indices of the slice are done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub job_id: String,
    pub tried: u64,
    /// `start_index + tried - 1`, the last absolute index covered.
    pub last_index: i64,
    pub ts: DateTime<FixedOffset>,
}

/// Worker → coordinator: final outcome of one assignment. `password` is
/// omitted from the wire when no match was found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkResult {
    pub job_id: String,
    pub found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub tried: u64,
    pub duration_ms: u64,
}

/// Coordinator → worker broadcast; terminal for the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub reason: String,
}

// ── Envelope ────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    body: serde_json::Value,
}

/// Closed sum over every message kind the protocol defines.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ClientRegister(ClientRegister),
    ServerHello(ServerHello),
    ClientHelloAck(ClientHelloAck),
    AssignWork(AssignWork),
    Checkpoint(Checkpoint),
    WorkResult(WorkResult),
    Stop(Stop),
}

impl Message {
    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ClientRegister(_) => "CLIENT_REGISTER",
            Message::ServerHello(_) => "SERVER_HELLO",
            Message::ClientHelloAck(_) => "CLIENT_HELLO_ACK",
            Message::AssignWork(_) => "ASSIGN_WORK",
            Message::Checkpoint(_) => "CHECKPOINT",
            Message::WorkResult(_) => "WORK_RESULT",
            Message::Stop(_) => "STOP",
        }
    }

    /// Encode as one newline-terminated envelope line.
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let body = match self {
            Message::ClientRegister(b) => serde_json::to_value(b)?,
            Message::ServerHello(b) => serde_json::to_value(b)?,
            Message::ClientHelloAck(b) => serde_json::to_value(b)?,
            Message::AssignWork(b) => serde_json::to_value(b)?,
            Message::Checkpoint(b) => serde_json::to_value(b)?,
            Message::WorkResult(b) => serde_json::to_value(b)?,
            Message::Stop(b) => serde_json::to_value(b)?,
        };
        let envelope = Envelope {
            kind: self.kind().to_string(),
            body,
        };
        let mut line = serde_json::to_string(&envelope)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one envelope line. The body is decoded lazily, only after the
    /// `type` tag selects a variant.
    pub fn decode(line: &str) -> Result<Message, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(line.trim())?;
        let message = match envelope.kind.as_str() {
            "CLIENT_REGISTER" => Message::ClientRegister(serde_json::from_value(envelope.body)?),
            "SERVER_HELLO" => Message::ServerHello(serde_json::from_value(envelope.body)?),
            "CLIENT_HELLO_ACK" => Message::ClientHelloAck(serde_json::from_value(envelope.body)?),
            "ASSIGN_WORK" => Message::AssignWork(serde_json::from_value(envelope.body)?),
            "CHECKPOINT" => Message::Checkpoint(serde_json::from_value(envelope.body)?),
            "WORK_RESULT" => Message::WorkResult(serde_json::from_value(envelope.body)?),
            "STOP" => Message::Stop(serde_json::from_value(envelope.body)?),
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(message)
    }
}

// ── Receive Framing ─────────────────────────────────────────────────

/// Accumulates partial socket reads and yields complete lines in order.
/// Multiple frames buffered by one read are drained before the next read.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> FrameBuffer {
        FrameBuffer::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pop the next complete line, without its terminator. `\r\n` is
    /// accepted as a terminator; a bare `\r` is content.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Bytes still waiting for a terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
