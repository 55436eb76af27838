//! Bridge instance: both transports plus the out-of-band router, owned by
//! one object.
//!
//! Everything that used to be ambient (socket, correlation table, hook list)
//! hangs off a `WahuBridge`, so independent instances coexist and tests get
//! isolation for free.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use crate::duplex::{ConnectionState, DuplexChannel, OpenHookGuard, ReconnectConfig};
use crate::error::BridgeError;
use crate::generator::{Reply, RpcCaller};
use crate::oob::{LogSink, NotificationSink, OobRouter, ProgressGuard};
use crate::post::PostChannel;

/// Default duplex endpoint path.
pub const WS_RPC_PATH: &str = "/wsrpc";

/// Default one-shot endpoint path.
pub const POST_RPC_PATH: &str = "/postrpc";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub duplex_url: String,
    pub post_url: String,
    pub reconnect: ReconnectConfig,
}

impl BridgeConfig {
    /// Endpoint URLs derived from `host:port` with the default paths.
    pub fn new(host: impl AsRef<str>) -> Self {
        let host = host.as_ref();
        Self {
            duplex_url: format!("ws://{host}{WS_RPC_PATH}"),
            post_url: format!("http://{host}{POST_RPC_PATH}"),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_duplex_url(mut self, url: impl Into<String>) -> Self {
        self.duplex_url = url.into();
        self
    }

    pub fn with_post_url(mut self, url: impl Into<String>) -> Self {
        self.post_url = url.into();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Entry point for callers: the two call primitives, the open-hook and
/// progress registrations, and the connection-state observable.
pub struct WahuBridge {
    duplex: DuplexChannel,
    post: PostChannel,
    router: Arc<OobRouter>,
}

impl WahuBridge {
    /// Connect with the default log-backed notification sink.
    pub fn connect(config: BridgeConfig) -> Self {
        Self::with_sink(config, Arc::new(LogSink))
    }

    /// Connect with a caller-supplied notification sink. Spawns the duplex
    /// connection task, so this must run inside a tokio runtime.
    pub fn with_sink(config: BridgeConfig, sink: Arc<dyn NotificationSink>) -> Self {
        let router = Arc::new(OobRouter::new(sink));
        let duplex =
            DuplexChannel::connect(config.duplex_url, config.reconnect, Arc::clone(&router));
        let caller: Arc<dyn RpcCaller> = Arc::new(duplex.clone());
        let post = PostChannel::new(config.post_url, Arc::clone(&router), caller);
        Self {
            duplex,
            post,
            router,
        }
    }

    /// Invoke a remote method over the persistent duplex channel.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply, BridgeError> {
        self.duplex.call(method, args).await
    }

    /// Invoke a remote method over the one-shot channel. A generator reply
    /// still iterates over the duplex channel.
    pub async fn post_call(&self, method: &str, args: Vec<Value>) -> Result<Reply, BridgeError> {
        self.post.call(method, args).await
    }

    /// Register a hook fired once per connection-open event.
    pub fn on_open(&self, hook: Arc<dyn Fn() + Send + Sync>) -> OpenHookGuard {
        self.duplex.on_open(hook)
    }

    /// Read-only observable of the duplex connection state.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.duplex.state()
    }

    /// Register a subscriber for backend progress pushes.
    pub fn subscribe_progress(
        &self,
        subscriber: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ProgressGuard {
        self.router.subscribe_progress(subscriber)
    }

    /// Shut the duplex channel down. Terminal.
    pub fn close(&self) {
        self.duplex.close();
    }
}
