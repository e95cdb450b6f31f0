//! Wire protocol types for client-worker communication.
//!
//! Every envelope is a JSON header plus an ordered transfer list of binary
//! buffers. Binary fields are skipped by serde and moved in and out of the
//! transfer list through [`Transfer`], so the header never embeds payload
//! bytes.
//!
//! - **Request** `{id, type, payload}`: client to worker
//! - **Response** `{id, result}` or `{id, error}`: worker to client
//! - **Ready** `{ready: {...}}`: worker handshake, sent once before any response

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use tokio_util::bytes::Bytes;

use crate::engine::{MmlError, SoundfontInfo};
use crate::version::VersionInfo;

/// Correlation id tying a response to the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame truncated: {0}")]
    Truncated(&'static str),

    #[error("transfer list mismatch: expected {expected} buffer(s), got {actual}")]
    TransferMismatch { expected: usize, actual: usize },
}

/// Moves binary fields between an envelope and its transfer list.
pub trait Transfer {
    /// Take every binary field out, in declaration order. The fields are left empty.
    fn take_transfer(&mut self) -> Vec<Bytes>;

    /// Put buffers taken by [`Transfer::take_transfer`] back.
    fn restore_transfer(&mut self, transfer: Vec<Bytes>) -> Result<(), ProtocolError>;
}

fn take_slot(slot: Option<&mut Bytes>) -> Vec<Bytes> {
    slot.map(std::mem::take).into_iter().collect()
}

fn restore_slot(slot: Option<&mut Bytes>, mut transfer: Vec<Bytes>) -> Result<(), ProtocolError> {
    let expected = usize::from(slot.is_some());
    if transfer.len() != expected {
        return Err(ProtocolError::TransferMismatch {
            expected,
            actual: transfer.len(),
        });
    }
    if let (Some(slot), Some(buf)) = (slot, transfer.pop()) {
        *slot = buf;
    }
    Ok(())
}

/// Request from client to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: CallId,
    #[serde(flatten)]
    pub command: Command,
}

/// Operation requested of the worker. Binary inputs ride in the transfer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Command {
    /// Load (or replace) the soundfont, instantiating the engine on first use.
    Init {
        #[serde(skip)]
        soundfont: Bytes,
    },

    Info {},

    /// Render a Standard MIDI File to WAV with the loaded soundfont.
    Compute {
        #[serde(skip)]
        smf: Bytes,
    },

    MmlToSmf {
        mml: String,
    },

    SmfToMml {
        #[serde(skip)]
        smf: Bytes,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Info {} => "info",
            Self::Compute { .. } => "compute",
            Self::MmlToSmf { .. } => "mml_to_smf",
            Self::SmfToMml { .. } => "smf_to_mml",
        }
    }

    fn binary_mut(&mut self) -> Option<&mut Bytes> {
        match self {
            Self::Init { soundfont } => Some(soundfont),
            Self::Compute { smf } | Self::SmfToMml { smf } => Some(smf),
            Self::Info {} | Self::MmlToSmf { .. } => None,
        }
    }
}

impl Transfer for Request {
    fn take_transfer(&mut self) -> Vec<Bytes> {
        take_slot(self.command.binary_mut())
    }

    fn restore_transfer(&mut self, transfer: Vec<Bytes>) -> Result<(), ProtocolError> {
        restore_slot(self.command.binary_mut(), transfer)
    }
}

/// Response from worker to client. Exactly one of `result` / `error` is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: CallId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Response {
    pub fn result(id: CallId, reply: Reply) -> Self {
        Self {
            id,
            outcome: Outcome::Result(reply),
        }
    }

    pub fn error(id: CallId, error: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Result(Reply),
    Error(String),
}

/// Success value of a response. Binary outputs ride in the transfer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Initialized,

    Info(SoundfontInfo),

    Wav {
        #[serde(skip)]
        wav: Bytes,
    },

    Smf {
        #[serde(skip)]
        smf: Bytes,
    },

    Mml {
        mml: String,
    },

    MmlErrors {
        errors: Vec<MmlError>,
    },
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Info(_) => "info",
            Self::Wav { .. } => "wav",
            Self::Smf { .. } => "smf",
            Self::Mml { .. } => "mml",
            Self::MmlErrors { .. } => "mml_errors",
        }
    }

    fn binary_mut(&mut self) -> Option<&mut Bytes> {
        match self {
            Self::Wav { wav } => Some(wav),
            Self::Smf { smf } => Some(smf),
            Self::Initialized | Self::Info(_) | Self::Mml { .. } | Self::MmlErrors { .. } => None,
        }
    }
}

impl Transfer for Response {
    fn take_transfer(&mut self) -> Vec<Bytes> {
        match &mut self.outcome {
            Outcome::Result(reply) => take_slot(reply.binary_mut()),
            Outcome::Error(_) => Vec::new(),
        }
    }

    fn restore_transfer(&mut self, transfer: Vec<Bytes>) -> Result<(), ProtocolError> {
        match &mut self.outcome {
            Outcome::Result(reply) => restore_slot(reply.binary_mut(), transfer),
            Outcome::Error(_) => restore_slot(None, transfer),
        }
    }
}

/// Everything the worker sends to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    /// Startup handshake. Sent exactly once, before any response.
    Ready(VersionInfo),
    Response(Response),
}

#[derive(Serialize)]
struct ReadyRef<'a> {
    ready: &'a VersionInfo,
}

impl Serialize for WorkerMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Ready(info) => ReadyRef { ready: info }.serialize(serializer),
            Self::Response(response) => response.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for WorkerMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value.get("ready") {
            Some(ready) => VersionInfo::deserialize(ready)
                .map(Self::Ready)
                .map_err(de::Error::custom),
            None => Response::deserialize(value)
                .map(Self::Response)
                .map_err(de::Error::custom),
        }
    }
}

impl Transfer for WorkerMessage {
    fn take_transfer(&mut self) -> Vec<Bytes> {
        match self {
            Self::Ready(_) => Vec::new(),
            Self::Response(response) => response.take_transfer(),
        }
    }

    fn restore_transfer(&mut self, transfer: Vec<Bytes>) -> Result<(), ProtocolError> {
        match self {
            Self::Ready(_) => restore_slot(None, transfer),
            Self::Response(response) => response.restore_transfer(transfer),
        }
    }
}
