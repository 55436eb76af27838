//! Error taxonomy for the bridge.

use crate::protocol::RemoteFailure;

/// Failures a caller can observe from either transport.
///
/// `Remote` means the backend executed the call and the operation raised;
/// everything else is the bridge's own machinery failing.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The exchange failed below the protocol layer (HTTP status, socket IO).
    #[error("transport error: {0}")]
    Transport(String),

    /// An envelope that breaks the wire contract: unknown kind, malformed
    /// payload, or a kind that cannot legally appear where it did. Indicates
    /// a client/backend version mismatch.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The backend raised while executing the call.
    #[error("remote failure: {0}")]
    Remote(RemoteFailure),

    /// The duplex channel dropped (or gave up reconnecting) before the call
    /// settled.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Advance on a generator proxy that was already disposed.
    #[error("generator disposed")]
    GeneratorDisposed,
}
