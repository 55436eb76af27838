//! Remote generator proxies.
//!
//! A `generator`-kind response hands the client an opaque key instead of a
//! value; the backend keeps the suspended iteration state. The proxy turns
//! that key into a local lazy sequence by issuing one `wahu_anext` exchange
//! per step, optionally sending a value into the remote generator's
//! suspension point (the coroutine send/next duality, flattened into
//! ordinary request/response pairs).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BridgeError;
use crate::protocol::{ANEXT_METHOD, DISPOSE_METHOD, GeneratorKeys, RawReply};

/// Transport seam for issuing raw calls.
///
/// Production proxies hold the duplex channel; tests substitute a scripted
/// implementation. One-shot-minted generators also advance through this
/// seam, which is how their iteration rides the persistent channel.
#[async_trait]
pub trait RpcCaller: Send + Sync {
    async fn raw_call(&self, method: &str, args: Vec<Value>) -> Result<RawReply, BridgeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GeneratorState {
    Active,
    /// Backend returned the end-of-sequence sentinel.
    Ended,
    /// Locally disposed; remote state released (best-effort).
    Disposed,
}

/// Local proxy for a backend generator.
///
/// Non-restartable single-consumer sequence; `&mut self` on `advance` keeps
/// at most one exchange in flight, so backpressure is structural.
pub struct RemoteGenerator {
    key: String,
    caller: Arc<dyn RpcCaller>,
    state: GeneratorState,
}

impl RemoteGenerator {
    pub(crate) fn new(key: String, caller: Arc<dyn RpcCaller>) -> Self {
        Self {
            key,
            caller,
            state: GeneratorState::Active,
        }
    }

    /// Backend-issued key identifying the remote iteration state.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Request the next value, forwarding `send_val` into the remote
    /// generator's suspension point. `Ok(None)` means the sequence ended;
    /// after that the proxy never issues another advance call.
    pub async fn advance(&mut self, send_val: Option<Value>) -> Result<Option<Value>, BridgeError> {
        match self.state {
            GeneratorState::Disposed => return Err(BridgeError::GeneratorDisposed),
            GeneratorState::Ended => return Ok(None),
            GeneratorState::Active => {}
        }

        let args = vec![
            Value::String(self.key.clone()),
            send_val.unwrap_or(Value::Null),
        ];
        match self.caller.raw_call(ANEXT_METHOD, args).await? {
            RawReply::Value(Value::Null) => {
                tracing::debug!(key = %self.key, "generator exhausted");
                self.state = GeneratorState::Ended;
                Ok(None)
            }
            RawReply::Value(value) => Ok(Some(value)),
            RawReply::Generator(_) => Err(BridgeError::Protocol(format!(
                "advance of generator {} returned a nested generator",
                self.key
            ))),
        }
    }

    /// Shorthand for `advance(None)`.
    pub async fn next(&mut self) -> Result<Option<Value>, BridgeError> {
        self.advance(None).await
    }

    /// Ask the backend to release the remote iteration state and terminate
    /// the proxy. Fire-and-forget: the proxy is terminated even if the
    /// dispose call fails. Disposing a non-active proxy is a no-op.
    pub async fn dispose(&mut self) {
        if self.state != GeneratorState::Active {
            return;
        }
        self.state = GeneratorState::Disposed;

        let args = vec![Value::String(self.key.clone())];
        if let Err(error) = self.caller.raw_call(DISPOSE_METHOD, args).await {
            tracing::warn!(key = %self.key, %error, "generator dispose call failed");
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state != GeneratorState::Active
    }

    /// Consume the proxy as a `futures::Stream` for callers that never send
    /// values in. The stream ends after the first error.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<Value, BridgeError>> + Send {
        futures::stream::unfold(Some(self), |generator| async move {
            let mut generator = generator?;
            match generator.advance(None).await {
                Ok(Some(value)) => Some((Ok(value), Some(generator))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

impl std::fmt::Debug for RemoteGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteGenerator")
            .field("key", &self.key)
            .field("state", &self.state)
            .finish()
    }
}

/// Decoded outcome of a bridge call.
#[derive(Debug)]
pub enum Reply {
    /// Plain JSON result.
    Value(Value),
    /// The call minted one remote generator.
    Generator(RemoteGenerator),
    /// Fan-out: one call minted several independent generators.
    Generators(Vec<RemoteGenerator>),
}

impl Reply {
    pub(crate) fn from_raw(raw: RawReply, caller: Arc<dyn RpcCaller>) -> Self {
        match raw {
            RawReply::Value(value) => Reply::Value(value),
            RawReply::Generator(GeneratorKeys::One(key)) => {
                Reply::Generator(RemoteGenerator::new(key, caller))
            }
            RawReply::Generator(GeneratorKeys::Many(keys)) => Reply::Generators(
                keys.into_iter()
                    .map(|key| RemoteGenerator::new(key, Arc::clone(&caller)))
                    .collect(),
            ),
        }
    }

    /// Unwrap a plain value, treating a generator reply as a contract breach.
    pub fn into_value(self) -> Result<Value, BridgeError> {
        match self {
            Reply::Value(value) => Ok(value),
            other => Err(BridgeError::Protocol(format!(
                "expected a plain value, got {other:?}"
            ))),
        }
    }

    /// Unwrap a single generator, treating anything else as a contract breach.
    pub fn into_generator(self) -> Result<RemoteGenerator, BridgeError> {
        match self {
            Reply::Generator(generator) => Ok(generator),
            other => Err(BridgeError::Protocol(format!(
                "expected a generator, got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedCaller;
    use serde_json::json;

    fn value(v: Value) -> Result<RawReply, BridgeError> {
        Ok(RawReply::Value(v))
    }

    #[tokio::test]
    async fn advance_yields_until_sentinel() {
        let caller = ScriptedCaller::new(vec![
            value(json!("a")),
            value(json!("b")),
            value(Value::Null),
        ]);
        let mut generator = RemoteGenerator::new("gen-1".to_string(), caller.clone());

        assert_eq!(generator.advance(None).await.unwrap(), Some(json!("a")));
        assert_eq!(generator.advance(None).await.unwrap(), Some(json!("b")));
        assert_eq!(generator.advance(None).await.unwrap(), None);
        assert!(generator.is_terminated());
    }

    #[tokio::test]
    async fn ended_generator_issues_no_further_calls() {
        let caller = ScriptedCaller::new(vec![value(Value::Null)]);
        let mut generator = RemoteGenerator::new("gen-1".to_string(), caller.clone());

        assert_eq!(generator.advance(None).await.unwrap(), None);
        assert_eq!(generator.advance(None).await.unwrap(), None);
        assert_eq!(generator.next().await.unwrap(), None);
        assert_eq!(caller.calls().len(), 1);
    }

    #[tokio::test]
    async fn advance_forwards_key_and_send_value() {
        let caller = ScriptedCaller::new(vec![value(json!("ok"))]);
        let mut generator = RemoteGenerator::new("gen-7".to_string(), caller.clone());

        generator.advance(Some(json!({"page": 2}))).await.unwrap();
        assert_eq!(
            caller.calls(),
            vec![(
                ANEXT_METHOD.to_string(),
                vec![json!("gen-7"), json!({"page": 2})]
            )]
        );
    }

    #[tokio::test]
    async fn send_value_defaults_to_null() {
        let caller = ScriptedCaller::new(vec![value(json!(1))]);
        let mut generator = RemoteGenerator::new("gen-7".to_string(), caller.clone());

        generator.advance(None).await.unwrap();
        assert_eq!(caller.calls()[0].1, vec![json!("gen-7"), Value::Null]);
    }

    #[tokio::test]
    async fn dispose_issues_one_call_and_terminates() {
        let caller = ScriptedCaller::new(vec![value(json!(true)), value(json!(true))]);
        let mut generator = RemoteGenerator::new("gen-3".to_string(), caller.clone());

        generator.dispose().await;
        generator.dispose().await;
        assert!(generator.is_terminated());
        assert_eq!(
            caller.calls(),
            vec![(DISPOSE_METHOD.to_string(), vec![json!("gen-3")])]
        );
    }

    #[tokio::test]
    async fn dispose_survives_a_failing_call() {
        let caller = ScriptedCaller::new(vec![Err(BridgeError::ChannelClosed(
            "connection lost".to_string(),
        ))]);
        let mut generator = RemoteGenerator::new("gen-3".to_string(), caller.clone());

        generator.dispose().await;
        assert!(generator.is_terminated());
        assert!(matches!(
            generator.advance(None).await,
            Err(BridgeError::GeneratorDisposed)
        ));
    }

    #[tokio::test]
    async fn advance_after_dispose_is_an_error() {
        let caller = ScriptedCaller::new(vec![value(json!(true))]);
        let mut generator = RemoteGenerator::new("gen-3".to_string(), caller.clone());

        generator.dispose().await;
        assert!(matches!(
            generator.advance(None).await,
            Err(BridgeError::GeneratorDisposed)
        ));
        // Only the dispose call went out.
        assert_eq!(caller.calls().len(), 1);
    }

    #[tokio::test]
    async fn nested_generator_reply_is_a_protocol_violation() {
        let caller = ScriptedCaller::new(vec![Ok(RawReply::Generator(GeneratorKeys::One(
            "gen-9".to_string(),
        )))]);
        let mut generator = RemoteGenerator::new("gen-1".to_string(), caller);

        assert!(matches!(
            generator.advance(None).await,
            Err(BridgeError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn into_stream_collects_values() {
        use futures::StreamExt;

        let caller = ScriptedCaller::new(vec![
            value(json!("a")),
            value(json!("b")),
            value(Value::Null),
        ]);
        let generator = RemoteGenerator::new("gen-1".to_string(), caller);

        let items: Vec<Value> = generator
            .into_stream()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn fan_out_builds_independent_proxies() {
        let caller = ScriptedCaller::new(vec![value(json!("x")), value(Value::Null)]);
        let reply = Reply::from_raw(
            RawReply::Generator(GeneratorKeys::Many(vec![
                "gen-1".to_string(),
                "gen-2".to_string(),
            ])),
            caller.clone(),
        );

        let mut generators = match reply {
            Reply::Generators(generators) => generators,
            other => panic!("expected fan-out, got {other:?}"),
        };
        assert_eq!(generators.len(), 2);

        // Ending one proxy leaves the other active.
        assert_eq!(generators[0].advance(None).await.unwrap(), Some(json!("x")));
        assert_eq!(generators[1].advance(None).await.unwrap(), None);
        assert!(generators[1].is_terminated());
        assert!(!generators[0].is_terminated());
    }

    #[tokio::test]
    async fn single_key_builds_one_proxy() {
        let caller = ScriptedCaller::new(vec![]);
        let reply = Reply::from_raw(
            RawReply::Generator(GeneratorKeys::One("gen-1".to_string())),
            caller,
        );
        assert_eq!(reply.into_generator().unwrap().key(), "gen-1");
    }

    #[tokio::test]
    async fn into_value_rejects_generators() {
        let caller = ScriptedCaller::new(vec![]);
        let reply = Reply::from_raw(
            RawReply::Generator(GeneratorKeys::One("gen-1".to_string())),
            caller,
        );
        assert!(matches!(
            reply.into_value(),
            Err(BridgeError::Protocol(_))
        ));
    }
}
