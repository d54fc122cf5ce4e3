use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum message size (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Returned by `process` when the session id is unknown
pub const NULL_PROCESS: &str = "null";

// ── Handshake ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionHandshake {
    pub version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: u32,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ── Session id ───────────────────────────────────────────────

/// Opaque PTY session identifier assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Broker (Client → Spawner) ────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum BrokerCommand {
    Spawn { identity: String },
    Kill { pid: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BrokerResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl BrokerResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            message: None,
            pid: None,
            port: None,
        }
    }

    pub fn spawned(pid: u32, port: u16) -> Self {
        Self {
            pid: Some(pid),
            port: Some(port),
            ..Self::ok()
        }
    }

    pub fn err(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(code.to_string()),
            message: Some(message.into()),
            pid: None,
            port: None,
        }
    }
}

// ── Server commands (Client → Server) ────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ServerCommand {
    Spawn {
        seq: u64,
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
    },
    Data {
        id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    /// Both dimensions are optional on the wire so that a short request
    /// can be recognised and dropped instead of failing the whole frame.
    Resize {
        id: SessionId,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    Process {
        seq: u64,
        id: SessionId,
    },
    Ping {
        id: SessionId,
    },
    Destroy {
        id: SessionId,
    },
}

pub fn default_cols() -> u16 {
    80
}

pub fn default_rows() -> u16 {
    24
}

// ── Server events (Server → Client) ──────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Reply to `spawn`; `id` is absent when the PTY could not be created.
    Spawned {
        seq: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<SessionId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Reply to `process`; `name` is [`NULL_PROCESS`] for unknown ids.
    Process { seq: u64, name: String },
    Data {
        id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    Kill { id: SessionId },
}

impl ServerEvent {
    /// Sequence number of a reply event, `None` for broadcasts.
    pub fn reply_seq(&self) -> Option<u64> {
        match self {
            ServerEvent::Spawned { seq, .. } | ServerEvent::Process { seq, .. } => Some(*seq),
            ServerEvent::Data { .. } | ServerEvent::Kill { .. } => None,
        }
    }
}

// ── Error Codes ──────────────────────────────────────────────

pub const ERR_VERSION_MISMATCH: &str = "VERSION_MISMATCH";
pub const ERR_INVALID_COMMAND: &str = "INVALID_COMMAND";
pub const ERR_IDENTITY_UNKNOWN: &str = "IDENTITY_UNKNOWN";
pub const ERR_IDENTITY_FORBIDDEN: &str = "IDENTITY_FORBIDDEN";
pub const ERR_PORTS_EXHAUSTED: &str = "PORTS_EXHAUSTED";
pub const ERR_SPAWN_FAILED: &str = "SPAWN_FAILED";
pub const ERR_INTERNAL: &str = "INTERNAL_ERROR";

mod base64_bytes {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
