//! wahu-bridge: async client bridge for the Wahu RPC protocol.
//!
//! Two transports share one wire vocabulary:
//! - **Duplex channel** ([`DuplexChannel`]): a persistent WebSocket carrying
//!   correlated calls and out-of-band pushes, with automatic reconnect
//! - **One-shot channel** ([`PostChannel`]): a single HTTP POST exchange
//!
//! Either transport can return a [`RemoteGenerator`]: a lazy proxy over
//! backend-side iteration state, advanced one `wahu_anext` exchange at a
//! time with optional send-values flowing back into the remote generator.
//!
//! [`WahuBridge`] owns both transports plus the notification routing and is
//! the intended entry point:
//!
//! ```ignore
//! use wahu_bridge::{BridgeConfig, WahuBridge};
//!
//! let bridge = WahuBridge::connect(BridgeConfig::new("127.0.0.1:8080"));
//! let title = bridge
//!     .call("ilst_detail", vec![serde_json::json!(90123456)])
//!     .await?
//!     .into_value()?;
//! ```

pub mod bridge;
mod correlation;
pub mod duplex;
pub mod error;
pub mod generator;
pub mod oob;
pub mod post;
pub mod protocol;

#[cfg(test)]
pub(crate) mod testutil;

pub use bridge::{BridgeConfig, POST_RPC_PATH, WS_RPC_PATH, WahuBridge};
pub use duplex::{ConnectionState, DuplexChannel, OpenHookGuard, ReconnectConfig};
pub use error::BridgeError;
pub use generator::{RemoteGenerator, Reply, RpcCaller};
pub use oob::{LogSink, NotificationSink, OobRouter, ProgressGuard, Severity};
pub use post::PostChannel;
pub use protocol::{
    ANEXT_METHOD, CallEnvelope, CallId, DISPOSE_METHOD, DuplexResponse, GeneratorKeys,
    PostResponse, RawReply, RemoteFailure,
};
