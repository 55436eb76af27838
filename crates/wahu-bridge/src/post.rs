//! One-shot request/response channel (Transport B).
//!
//! A single HTTP POST per call, no persistent state. Generator replies are
//! the one wrinkle: the minted proxies advance through the duplex channel's
//! call seam, so iteration always rides the persistent connection.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::BridgeError;
use crate::generator::{Reply, RpcCaller};
use crate::oob::OobRouter;
use crate::protocol::{CallEnvelope, PostResponse, RawReply, RemoteFailure};

pub struct PostChannel {
    client: reqwest::Client,
    url: String,
    router: Arc<OobRouter>,
    duplex: Arc<dyn RpcCaller>,
}

impl PostChannel {
    pub fn new(url: impl Into<String>, router: Arc<OobRouter>, duplex: Arc<dyn RpcCaller>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            url: url.into(),
            router,
            duplex,
        }
    }

    /// Perform one stateless exchange. Non-success statuses are transport
    /// errors; every failure is mirrored to the notification sink.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply, BridgeError> {
        let envelope = CallEnvelope::one_shot(method, args);
        tracing::debug!(method = %envelope.method, "issuing one-shot call");

        let response = match self.client.post(&self.url).json(&envelope).send().await {
            Ok(response) => response,
            Err(error) => {
                let error = BridgeError::Transport(format!("one-shot request failed: {error}"));
                self.router.error(&error.to_string());
                return Err(error);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let error = BridgeError::Transport(format!("one-shot call returned status {status}"));
            self.router.error(&error.to_string());
            return Err(error);
        }

        let parsed: PostResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(error) => {
                let error = BridgeError::Protocol(format!("malformed one-shot response: {error}"));
                self.router.error(&error.to_string());
                return Err(error);
            }
        };

        match parsed {
            PostResponse::Normal { value } => Ok(Reply::Value(value)),
            PostResponse::Generator { keys } => Ok(Reply::from_raw(
                RawReply::Generator(keys),
                Arc::clone(&self.duplex),
            )),
            PostResponse::Error { traceback } => {
                let failure = RemoteFailure {
                    kind: "error".to_string(),
                    detail: traceback,
                };
                self.router.error(&format!("remote failure: {failure}"));
                Err(BridgeError::Remote(failure))
            }
        }
    }
}
