//! Wire protocol types for client-backend communication.
//!
//! Two channels share the call envelope:
//! - **Duplex channel** (WebSocket): correlated calls plus out-of-band pushes
//! - **One-shot channel** (HTTP POST): a single uncorrelated exchange
//!
//! Response envelopes are closed tagged unions, so an out-of-band kind
//! cannot carry a correlation id and an unknown kind fails to parse.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method the bridge issues to advance a remote generator, args `[key, send_val]`.
pub const ANEXT_METHOD: &str = "wahu_anext";

/// Method the bridge issues to release a remote generator, args `[key]`.
pub const DISPOSE_METHOD: &str = "wahu_dispose_generator";

/// Correlation id linking a duplex call to its response.
///
/// Drawn from `0..CALL_ID_SPACE`; the correlation table guarantees an id is
/// never shared by two live calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u32);

/// Size of the id space. Small enough to stay a plain JSON integer,
/// large enough that collisions among in-flight calls are negligible.
pub const CALL_ID_SPACE: u32 = 100_000_000;

impl CallId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for CallId {
    fn from(raw: u32) -> Self {
        Self(raw % CALL_ID_SPACE)
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound call envelope.
///
/// `mcid` is present only on the duplex channel; the one-shot channel
/// correlates by the request/response pairing itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub method: String,
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcid: Option<CallId>,
}

impl CallEnvelope {
    pub fn duplex(method: impl Into<String>, args: Vec<Value>, mcid: CallId) -> Self {
        Self {
            method: method.into(),
            args,
            mcid: Some(mcid),
        }
    }

    pub fn one_shot(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            mcid: None,
        }
    }
}

/// Generator key payload: one call may mint a single generator or fan out
/// into several independent ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeneratorKeys {
    One(String),
    Many(Vec<String>),
}

/// Backend-side exception, decoded from the two-element `failure` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct RemoteFailure {
    /// Exception class name on the backend.
    pub kind: String,
    /// Human-readable description.
    pub detail: String,
}

impl From<(String, String)> for RemoteFailure {
    fn from((kind, detail): (String, String)) -> Self {
        Self { kind, detail }
    }
}

impl From<RemoteFailure> for (String, String) {
    fn from(failure: RemoteFailure) -> Self {
        (failure.kind, failure.detail)
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// Inbound envelope on the duplex channel.
///
/// `Normal`/`Generator`/`Failure` settle a pending call; `DlProgress` and
/// `Warning` are pushed by the backend and carry no correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DuplexResponse {
    Normal {
        #[serde(rename = "return")]
        value: Value,
        mcid: CallId,
    },

    Generator {
        #[serde(rename = "return")]
        keys: GeneratorKeys,
        mcid: CallId,
    },

    Failure {
        #[serde(rename = "return")]
        failure: RemoteFailure,
        mcid: CallId,
    },

    /// Download progress push, forwarded to progress subscribers.
    DlProgress {
        #[serde(rename = "return")]
        report: Value,
    },

    /// Backend warning push, forwarded to the notification sink.
    Warning {
        #[serde(rename = "return")]
        message: String,
    },
}

/// Inbound envelope on the one-shot channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostResponse {
    Normal {
        #[serde(rename = "return")]
        value: Value,
    },

    Generator {
        #[serde(rename = "return")]
        keys: GeneratorKeys,
    },

    /// The backend raised while executing the call; payload is the traceback.
    Error {
        #[serde(rename = "return")]
        traceback: String,
    },
}

/// Undecorated outcome of a settled call: a plain value or the generator
/// key(s) the backend minted. The transport layer wraps keys into proxies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawReply {
    Value(Value),
    Generator(GeneratorKeys),
}
