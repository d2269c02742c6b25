//! IPC protocol types
//!
//! Request/response shapes for client-daemon communication over a
//! length-prefixed binary protocol with bincode serialization. `Decrypt` is
//! the one server-streaming method: the daemon answers with a sequence of
//! [`Response::Step`] frames ending in a terminal step.

use serde::{Deserialize, Serialize};

use crate::inventory::ConfigElement;
use crate::search::Filter;

/// Requests sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Query the daemon lifecycle state.
    GetState,

    /// Read the encrypted inventory at `path` into memory.
    LoadConfigFile { path: String },

    /// Run the decrypt-and-index pipeline; streamed reply.
    Decrypt { password: Vec<u8> },

    /// Single best tag for a query.
    Match { query: String },

    /// Top-n candidate tags for a query.
    MatchN { query: String, n: u32 },

    /// Filtered inventory listing.
    List { filter: Filter, limit: i32 },
}

/// Daemon lifecycle state as visible to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateKind {
    ConfigFileRequired,
    DecryptionRequired,
    Ready,
}

/// Outcome marker shared by load replies and pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Success,
    Failure,
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    DecodeBase64,
    Decrypt,
    Unmarshal,
    Validate,
    BuildIndex,
    Done,
}

impl StepKind {
    pub fn describe(&self) -> &'static str {
        match self {
            StepKind::DecodeBase64 => "decoding configuration file",
            StepKind::Decrypt => "decrypting configuration file",
            StepKind::Unmarshal => "unmarshalling configuration file",
            StepKind::Validate => "validating configuration file",
            StepKind::BuildIndex => "building search index",
            StepKind::Done => "done",
        }
    }
}

/// One progress event from the decrypt-and-index pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptStep {
    pub step: StepKind,
    pub status: OpStatus,
    pub reason: Option<String>,
}

impl DecryptStep {
    pub fn success(step: StepKind) -> Self {
        Self {
            step,
            status: OpStatus::Success,
            reason: None,
        }
    }

    pub fn failure(step: StepKind, reason: impl Into<String>) -> Self {
        Self {
            step,
            status: OpStatus::Failure,
            reason: Some(reason.into()),
        }
    }

    /// A stream ends after exactly one terminal step: any failure, or a
    /// successful `Done`.
    pub fn is_terminal(&self) -> bool {
        self.status == OpStatus::Failure || self.step == StepKind::Done
    }
}

/// Full connection details returned by `Match`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerPayload {
    pub host: String,
    pub dir: String,
    pub port: u16,
    pub username: String,
    pub password: Vec<u8>,
}

impl From<&ConfigElement> for ServerPayload {
    fn from(element: &ConfigElement) -> Self {
        Self {
            host: element.server.host.clone(),
            dir: element.server.dir.clone(),
            port: element.server.port,
            username: element.server.username.clone(),
            password: element.server.password.clone().into_bytes(),
        }
    }
}

/// Connection details safe to display: no credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicServerInfo {
    pub host: String,
    pub directory: String,
}

/// One row of a `List` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    pub tag: String,
    pub info: PublicServerInfo,
}

/// Records sharing a `"<group> - <env>"` title.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub title: String,
    pub entries: Vec<GroupEntry>,
}

/// Responses sent from daemon to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Reply to `GetState`.
    State(StateKind),

    /// Reply to `LoadConfigFile`.
    Load {
        status: OpStatus,
        reason: Option<String>,
    },

    /// One frame of the `Decrypt` stream.
    Step(DecryptStep),

    /// Successful `Match`.
    Match { tag: String, server: ServerPayload },

    /// `Match` with no hit; a distinct variant, not a failure.
    NotFound,

    /// Reply to `MatchN`.
    Tags(Vec<String>),

    /// Reply to `List`.
    Groups(Vec<Group>),

    /// The operation requires READY state.
    WrongState,

    /// Internal daemon error.
    Error { reason: String },
}

impl Response {
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.into(),
        }
    }
}

/// Hard cap on one wire frame.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Encode a message with a u32-LE length prefix.
pub fn encode_message<T: Serialize>(msg: &T) -> anyhow::Result<Vec<u8>> {
    let payload = bincode::serialize(msg)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        anyhow::bail!("message too large: {} bytes", payload.len());
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a message payload (after the length prefix has been consumed).
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> anyhow::Result<T> {
    Ok(bincode::deserialize(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = Request::List {
            filter: Filter {
                env: Some("eu".into()),
                ..Filter::default()
            },
            limit: 10,
        };

        let encoded = encode_message(&req).unwrap();
        assert!(encoded.len() > 4);

        let decoded: Request = decode_message(&encoded[4..]).unwrap();
        match decoded {
            Request::List { filter, limit } => {
                assert_eq!(filter.env.as_deref(), Some("eu"));
                assert_eq!(limit, 10);
            }
            other => panic!("wrong request type: {other:?}"),
        }
    }

    #[test]
    fn response_roundtrip() {
        let resp = Response::Step(DecryptStep::failure(StepKind::Decrypt, "bad password"));
        let encoded = encode_message(&resp).unwrap();
        let decoded: Response = decode_message(&encoded[4..]).unwrap();
        match decoded {
            Response::Step(step) => {
                assert_eq!(step.step, StepKind::Decrypt);
                assert_eq!(step.status, OpStatus::Failure);
                assert!(step.is_terminal());
            }
            other => panic!("wrong response type: {other:?}"),
        }
    }

    #[test]
    fn terminal_steps() {
        assert!(DecryptStep::success(StepKind::Done).is_terminal());
        assert!(DecryptStep::failure(StepKind::DecodeBase64, "x").is_terminal());
        assert!(!DecryptStep::success(StepKind::Validate).is_terminal());
    }
}
