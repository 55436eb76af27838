//! Persistent duplex channel (Transport A).
//!
//! One long-lived WebSocket carries every correlated call and every
//! out-of-band push. A spawned connection task owns the socket and the
//! reconnect loop; `DuplexChannel` is the cheaply clonable handle callers
//! multiplex onto.
//!
//! Lifecycle: `Closed -> Connecting -> Open -> Closed -> ...`, with bounded
//! exponential backoff between attempts and a terminal `Failed` state once
//! the retry budget is spent.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::correlation::{CorrelationTable, entropy_u64};
use crate::error::BridgeError;
use crate::generator::{Reply, RpcCaller};
use crate::oob::OobRouter;
use crate::protocol::{CallEnvelope, CallId, DuplexResponse, RawReply};

/// Connection state of the duplex channel, published through a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    /// Retry budget exhausted; the channel will not reconnect.
    Failed,
}

/// Reconnect policy: exponential backoff with full jitter, capped delay,
/// bounded attempt count.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// First-attempt delay ceiling; doubles per attempt.
    pub base: Duration,
    /// Upper bound on the delay ceiling.
    pub cap: Duration,
    /// Consecutive failed attempts before giving up. 0 means retry forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(
                std::env::var("WAHU_RECONNECT_BASE_MILLIS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
            ),
            cap: Duration::from_secs(30),
            max_attempts: 20,
        }
    }
}

impl ReconnectConfig {
    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let ceiling = config.base.saturating_mul(1 << exponent).min(config.cap);
    let millis = ceiling.as_millis() as u64;
    if millis <= 1 {
        return ceiling;
    }
    // Full jitter: a uniform draw from [1, ceiling] keeps a herd of
    // reconnecting clients from thundering in lockstep.
    Duration::from_millis(1 + entropy_u64() % millis)
}

type OpenHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct OpenHookRegistry {
    hooks: Mutex<Vec<(u64, OpenHook)>>,
    next_id: AtomicU64,
}

impl OpenHookRegistry {
    /// Returns None when the exact same hook (by `Arc` identity) is already
    /// registered.
    fn register(&self, hook: OpenHook) -> Option<u64> {
        let mut hooks = self.hooks.lock().unwrap();
        if hooks.iter().any(|(_, existing)| Arc::ptr_eq(existing, &hook)) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        hooks.push((id, hook));
        Some(id)
    }

    fn deregister(&self, id: u64) {
        self.hooks
            .lock()
            .unwrap()
            .retain(|(hook_id, _)| *hook_id != id);
    }

    fn fire(&self) {
        let hooks: Vec<OpenHook> = self
            .hooks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            // A panicking hook must not block the ones registered after it.
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                tracing::warn!("open hook panicked");
            }
        }
    }
}

/// Deregistration capability for an open-hook.
///
/// Dropping the guard leaves the hook registered; only `deregister` removes
/// it. A duplicate registration yields an inert guard.
pub struct OpenHookGuard {
    shared: Weak<ChannelShared>,
    id: Option<u64>,
}

impl OpenHookGuard {
    pub fn deregister(self) {
        if let (Some(shared), Some(id)) = (self.shared.upgrade(), self.id) {
            shared.hooks.deregister(id);
        }
    }
}

struct ChannelShared {
    table: CorrelationTable,
    router: Arc<OobRouter>,
    hooks: OpenHookRegistry,
    outbound_tx: mpsc::UnboundedSender<CallEnvelope>,
    state_rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

/// Handle to the persistent duplex channel.
#[derive(Clone)]
pub struct DuplexChannel {
    shared: Arc<ChannelShared>,
}

impl DuplexChannel {
    /// Spawn the connection task and begin connecting immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        url: impl Into<String>,
        reconnect: ReconnectConfig,
        router: Arc<OobRouter>,
    ) -> Self {
        let url = url.into();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let shared = Arc::new(ChannelShared {
            table: CorrelationTable::new(),
            router,
            hooks: OpenHookRegistry::default(),
            outbound_tx,
            state_rx,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(run_connection(
            url,
            reconnect,
            state_tx,
            outbound_rx,
            Arc::clone(&shared),
        ));
        Self { shared }
    }

    /// Issue a call and decode the settled reply, wrapping generator keys
    /// into proxies bound to this channel.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Reply, BridgeError> {
        let raw = self.issue(method, args).await?;
        let caller: Arc<dyn RpcCaller> = Arc::new(self.clone());
        Ok(Reply::from_raw(raw, caller))
    }

    /// Read-only observable of the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_rx.clone()
    }

    /// Register a hook fired once per connection-open event, in registration
    /// order. Registering the same `Arc` twice is a no-op.
    pub fn on_open(&self, hook: Arc<dyn Fn() + Send + Sync>) -> OpenHookGuard {
        let id = self.shared.hooks.register(hook);
        if id.is_none() {
            tracing::debug!("open hook already registered, ignoring duplicate");
        }
        OpenHookGuard {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// Drop the connection and stop reconnecting. Terminal: outstanding and
    /// future calls fail with `ChannelClosed`.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    /// Suspend until the channel is open. Never spins: wakes only on state
    /// transitions.
    async fn wait_open(&self) -> Result<(), BridgeError> {
        let mut state_rx = self.shared.state_rx.clone();
        loop {
            match *state_rx.borrow_and_update() {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Failed => {
                    return Err(BridgeError::ChannelClosed(
                        "connection permanently failed".to_string(),
                    ));
                }
                ConnectionState::Closed | ConnectionState::Connecting => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(BridgeError::ChannelClosed(
                    "connection task exited".to_string(),
                ));
            }
        }
    }

    async fn issue(&self, method: &str, args: Vec<Value>) -> Result<RawReply, BridgeError> {
        self.wait_open().await?;

        let (mcid, pending) = self.shared.table.register();
        let envelope = CallEnvelope::duplex(method, args, mcid);
        tracing::debug!(%mcid, method, "issuing duplex call");

        if self.shared.outbound_tx.send(envelope).is_err() {
            self.shared.table.discard(mcid);
            return Err(BridgeError::ChannelClosed(
                "connection task exited".to_string(),
            ));
        }

        match pending.await {
            Ok(settlement) => settlement,
            Err(_) => Err(BridgeError::ChannelClosed(
                "pending result dropped".to_string(),
            )),
        }
    }
}

#[async_trait]
impl RpcCaller for DuplexChannel {
    async fn raw_call(&self, method: &str, args: Vec<Value>) -> Result<RawReply, BridgeError> {
        self.issue(method, args).await
    }
}

async fn run_connection(
    url: String,
    reconnect: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    mut outbound_rx: mpsc::UnboundedReceiver<CallEnvelope>,
    shared: Arc<ChannelShared>,
) {
    let mut attempt: u32 = 0;
    loop {
        state_tx.send_replace(ConnectionState::Connecting);
        tracing::debug!(%url, "connecting duplex channel");

        let connected = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = shared.cancel.cancelled() => {
                state_tx.send_replace(ConnectionState::Closed);
                return;
            }
        };

        match connected {
            Ok((socket, _response)) => {
                attempt = 0;
                state_tx.send_replace(ConnectionState::Open);
                tracing::info!(%url, "duplex channel open");
                shared.router.success("duplex channel connected");
                shared.hooks.fire();

                let reason = drive(socket, &mut outbound_rx, &shared).await;

                state_tx.send_replace(ConnectionState::Closed);
                tracing::warn!(%url, %reason, "duplex channel closed");
                shared.router.warning(&format!("duplex channel closed: {reason}"));
                shared
                    .table
                    .reject_all(|| BridgeError::ChannelClosed(reason.clone()));

                // Queued envelopes belong to calls on the dead connection;
                // reject any that registered after the sweep above.
                while let Ok(envelope) = outbound_rx.try_recv() {
                    if let Some(mcid) = envelope.mcid {
                        shared
                            .table
                            .reject(mcid, BridgeError::ChannelClosed(reason.clone()));
                    }
                }

                if shared.cancel.is_cancelled() {
                    return;
                }
            }
            Err(error) => {
                state_tx.send_replace(ConnectionState::Closed);
                tracing::warn!(%url, %error, "duplex connect failed");
                shared
                    .router
                    .warning(&format!("duplex connect failed: {error}"));
            }
        }

        attempt += 1;
        if reconnect.max_attempts != 0 && attempt >= reconnect.max_attempts {
            state_tx.send_replace(ConnectionState::Failed);
            tracing::error!(%url, attempt, "duplex channel giving up");
            shared
                .router
                .error("duplex channel failed permanently, giving up");
            shared.table.reject_all(|| {
                BridgeError::ChannelClosed("connection permanently failed".to_string())
            });
            return;
        }

        let delay = backoff_delay(&reconnect, attempt);
        tracing::debug!(attempt, delay_millis = delay.as_millis() as u64, "scheduling reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.cancel.cancelled() => {
                state_tx.send_replace(ConnectionState::Closed);
                return;
            }
        }
    }
}

/// Pump one live connection. Returns the close reason.
async fn drive(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outbound_rx: &mut mpsc::UnboundedReceiver<CallEnvelope>,
    shared: &ChannelShared,
) -> String {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return "closed locally".to_string();
            }

            envelope = outbound_rx.recv() => {
                let Some(envelope) = envelope else {
                    return "all channel handles dropped".to_string();
                };
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(error) => {
                        tracing::error!(%error, "failed to encode call envelope");
                        continue;
                    }
                };
                if let Err(error) = sink.send(Message::text(text)).await {
                    return format!("send failed: {error}");
                }
            }

            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => dispatch(text.as_str(), shared),
                    Some(Ok(Message::Close(_))) => return "closed by backend".to_string(),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(other)) => {
                        tracing::warn!(?other, "ignoring non-text frame");
                    }
                    Some(Err(error)) => return format!("socket error: {error}"),
                    None => return "stream ended".to_string(),
                }
            }
        }
    }
}

/// Route one inbound envelope to the correlation table or the out-of-band
/// router.
fn dispatch(text: &str, shared: &ChannelShared) {
    let response: DuplexResponse = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(error) => {
            // Unknown kind or malformed payload: a contract breach, surfaced
            // loudly rather than dropped.
            tracing::error!(%error, "unparseable response envelope");
            shared.router.error(&format!("protocol violation: {error}"));
            // Fail the waiting call if the envelope still names one.
            if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(text)
                && let Some(mcid) = fields.get("mcid").and_then(Value::as_u64)
            {
                shared.table.reject(
                    CallId::from(mcid as u32),
                    BridgeError::Protocol(format!("unrecognized response envelope: {error}")),
                );
            }
            return;
        }
    };

    match response {
        DuplexResponse::Normal { value, mcid } => {
            if !shared.table.resolve(mcid, RawReply::Value(value)) {
                tracing::warn!(%mcid, "normal response for unknown call id");
            }
        }
        DuplexResponse::Generator { keys, mcid } => {
            if !shared.table.resolve(mcid, RawReply::Generator(keys)) {
                tracing::warn!(%mcid, "generator response for unknown call id");
            }
        }
        DuplexResponse::Failure { failure, mcid } => {
            shared.router.error(&format!("remote failure: {failure}"));
            if !shared.table.reject(mcid, BridgeError::Remote(failure)) {
                tracing::warn!(%mcid, "failure response for unknown call id");
            }
        }
        DuplexResponse::DlProgress { report } => shared.router.progress(&report),
        DuplexResponse::Warning { message } => shared.router.warning(&message),
    }
}
