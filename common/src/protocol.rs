//! Wire protocol (v1) between the hub and the sensor devices.
//!
//! Every frame carries a JSON object `{v: 1, type, id?, ..., timestamp}`.
//! Devices send `cmd` frames naming one of the fixed [`Command`]s; the hub
//! answers with one of the other message types.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Protocol version stamped on every message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Features advertised in `capabilities` responses.
pub const FEATURES: &[&str] = &[
    "tcp_communication",
    "length_prefixed_framing",
    "time_sync",
    "flash_sync",
    "file_transfer",
    "preview_stream",
];

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Integer nanoseconds from a JSON timestamp. Floats are accepted only
/// when they hold a whole number.
pub fn timestamp_ns(value: &Value) -> Option<i64> {
    let Value::Number(n) = value else {
        return None;
    };
    n.as_i64().or_else(|| {
        let f = n.as_f64()?;
        (f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
    })
}

// ── commands ─────────────────────────────────────────────────────────────

/// The closed set of commands the hub understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    QueryCapabilities,
    StartRecording,
    StopRecording,
    FlashSync,
    Heartbeat,
    TransferFiles,
    TimeSync,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::QueryCapabilities,
        Command::StartRecording,
        Command::StopRecording,
        Command::FlashSync,
        Command::Heartbeat,
        Command::TransferFiles,
        Command::TimeSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::QueryCapabilities => "query_capabilities",
            Command::StartRecording => "start_recording",
            Command::StopRecording => "stop_recording",
            Command::FlashSync => "flash_sync",
            Command::Heartbeat => "heartbeat",
            Command::TransferFiles => "transfer_files",
            Command::TimeSync => "time_sync",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| SyncError::UnknownCommand(s.to_string()))
    }
}

/// Status carried in `ack` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    RecordingStarted,
    RecordingStopped,
    FlashExecuted,
    ReadyForTransfer,
}

// ── messages ─────────────────────────────────────────────────────────────

/// Body of a protocol message, tagged by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Cmd {
        command: Command,
        #[serde(flatten)]
        args: Map<String, Value>,
    },
    Ack {
        command: Command,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flash_timestamp: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_port: Option<u16>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
    Event {
        name: String,
        device_id: String,
        jpeg_base64: String,
        ts: i64,
    },
    HeartbeatAck {
        server_time: i64,
        client_time: Value,
    },
    TimeSyncResponse {
        /// Hub clock when the request arrived.
        server_timestamp: i64,
        /// The requester's send time, echoed.
        client_timestamp: i64,
        /// Time the hub held the request before replying, in ns. The
        /// requester subtracts it from its own measured round trip.
        round_trip_time: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    Capabilities {
        version: String,
        supported_commands: Vec<Command>,
        features: Vec<String>,
    },
}

fn default_version() -> u8 {
    PROTOCOL_VERSION
}

/// A [`Message`] together with its v1 envelope fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub v: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub message: Message,
    /// Sender clock in ns when the message was built.
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Wrap `message`, stamping it with the current time.
    pub fn new(message: Message) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: None,
            message,
            timestamp: now_ns(),
        }
    }

    pub fn with_id(mut self, id: Option<u64>) -> Self {
        self.id = id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// A `cmd` frame with extra arguments.
    pub fn cmd(command: Command, args: Map<String, Value>) -> Self {
        Self::new(Message::Cmd { command, args })
    }

    /// `error` frame describing `err`.
    pub fn error(err: &SyncError) -> Self {
        Self::new(Message::Error {
            code: Some(err.code().to_string()),
            message: err.to_string(),
        })
    }

    /// `start_recording` for the given session.
    pub fn start_recording(session_id: &str) -> Self {
        let mut args = Map::new();
        args.insert("session_id".into(), Value::from(session_id));
        Self::cmd(Command::StartRecording, args)
    }

    /// `time_sync` request; the envelope timestamp is the send time `t0`.
    pub fn time_sync_request(seq: u64, t0: i64) -> Self {
        let mut args = Map::new();
        args.insert("seq".into(), Value::from(seq));
        Self::cmd(Command::TimeSync, args).with_timestamp(t0)
    }

    /// `preview_frame` event carrying a JPEG thumbnail.
    pub fn preview_frame(device_id: &str, jpeg: &[u8], ts_ns: i64) -> Self {
        Self::new(Message::Event {
            name: "preview_frame".to_string(),
            device_id: device_id.to_string(),
            jpeg_base64: base64::engine::general_purpose::STANDARD.encode(jpeg),
            ts: ts_ns,
        })
    }

    /// `type` field of the wrapped message.
    pub fn kind(&self) -> &'static str {
        match &self.message {
            Message::Cmd { .. } => "cmd",
            Message::Ack { .. } => "ack",
            Message::Error { .. } => "error",
            Message::Event { .. } => "event",
            Message::HeartbeatAck { .. } => "heartbeat_ack",
            Message::TimeSyncResponse { .. } => "time_sync_response",
            Message::Capabilities { .. } => "capabilities",
        }
    }
}
