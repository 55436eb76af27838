//! In-process backend pieces shared by the transport tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use crate::error::BridgeError;
use crate::generator::RpcCaller;
use crate::oob::{NotificationSink, Severity};
use crate::protocol::RawReply;

pub(crate) type WsConn = WebSocketStream<TcpStream>;

/// Notification sink that records every notice for assertions.
pub(crate) struct RecordingSink {
    notices: Mutex<Vec<(Severity, String)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notices: Mutex::new(Vec::new()),
        })
    }

    pub fn notices(&self) -> Vec<(Severity, String)> {
        self.notices.lock().unwrap().clone()
    }

    pub fn has(&self, severity: Severity, fragment: &str) -> bool {
        self.notices()
            .iter()
            .any(|(s, message)| *s == severity && message.contains(fragment))
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, severity: Severity, message: &str) {
        self.notices
            .lock()
            .unwrap()
            .push((severity, message.to_string()));
    }
}

/// Bind a loopback listener and return its ws:// URL.
pub(crate) async fn bind() -> (String, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (format!("ws://{addr}"), listener)
}

pub(crate) async fn accept(listener: &TcpListener) -> WsConn {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

pub(crate) fn parse_call(msg: Message) -> (String, Vec<Value>, u64) {
    let text = msg.into_text().unwrap();
    let envelope: Value = serde_json::from_str(text.as_str()).unwrap();
    (
        envelope["method"].as_str().unwrap().to_string(),
        envelope["args"].as_array().unwrap().clone(),
        envelope["mcid"].as_u64().unwrap(),
    )
}

pub(crate) fn normal(value: Value, mcid: u64) -> Message {
    Message::text(json!({"type": "normal", "return": value, "mcid": mcid}).to_string())
}

pub(crate) fn generator(keys: Value, mcid: u64) -> Message {
    Message::text(json!({"type": "generator", "return": keys, "mcid": mcid}).to_string())
}

pub(crate) fn failure(kind: &str, detail: &str, mcid: u64) -> Message {
    Message::text(json!({"type": "failure", "return": [kind, detail], "mcid": mcid}).to_string())
}

pub(crate) fn warning(message: &str) -> Message {
    Message::text(json!({"type": "warning", "return": message}).to_string())
}

pub(crate) fn dl_progress(report: Value) -> Message {
    Message::text(json!({"type": "dl_progress", "return": report}).to_string())
}

/// Caller seam that replays a scripted list of settlements and records every
/// issued call.
pub(crate) struct ScriptedCaller {
    replies: Mutex<VecDeque<Result<RawReply, BridgeError>>>,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
}

impl ScriptedCaller {
    pub fn new(replies: Vec<Result<RawReply, BridgeError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RpcCaller for ScriptedCaller {
    async fn raw_call(&self, method: &str, args: Vec<Value>) -> Result<RawReply, BridgeError> {
        self.calls.lock().unwrap().push((method.to_string(), args));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(RawReply::Value(Value::Null)))
    }
}

/// Scripted backend for one connection: echo, a two-value stream, a failing
/// method, and the generator advance/dispose bookkeeping.
pub(crate) async fn serve_methods(conn: WsConn) {
    serve_methods_with(conn, HashMap::new()).await
}

/// `serve_methods` with pre-minted generator streams.
pub(crate) async fn serve_methods_with(mut conn: WsConn, mut streams: HashMap<String, Vec<Value>>) {
    let mut cursors: HashMap<String, usize> = HashMap::new();

    while let Some(Ok(msg)) = conn.next().await {
        if !msg.is_text() {
            continue;
        }
        let (method, args, mcid) = parse_call(msg);
        let reply = match method.as_str() {
            "echo" => normal(args[0].clone(), mcid),
            "stream" => {
                let key = format!("gen-{}", streams.len() + 1);
                streams.insert(key.clone(), vec![json!("a"), json!("b")]);
                generator(json!(key), mcid)
            }
            "fan_out" => {
                for key in ["gen-a", "gen-b"] {
                    streams.insert(key.to_string(), vec![json!(key)]);
                }
                generator(json!(["gen-a", "gen-b"]), mcid)
            }
            "boom" => failure("ValueError", "bad input", mcid),
            "wahu_anext" => {
                let key = args[0].as_str().unwrap().to_string();
                let cursor = cursors.entry(key.clone()).or_insert(0);
                let value = streams
                    .get(&key)
                    .and_then(|values| values.get(*cursor))
                    .cloned()
                    .unwrap_or(Value::Null);
                *cursor += 1;
                normal(value, mcid)
            }
            "wahu_dispose_generator" => {
                let key = args[0].as_str().unwrap();
                normal(json!(streams.remove(key).is_some()), mcid)
            }
            other => failure("AttributeError", &format!("no method {other}"), mcid),
        };
        if conn.send(reply).await.is_err() {
            break;
        }
    }
}
