//! JSON-RPC envelopes and response correlation.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::Result;

/// JSON-RPC error code used when declining server-initiated requests.
pub const METHOD_NOT_SUPPORTED: i64 = -32601;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AppServerRequestId {
    String(String),
    Integer(i64),
}

impl AppServerRequestId {
    /// Integer view of the id; numeric strings are accepted.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::String(value) => value.trim().parse().ok(),
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    fn from_value(value: &Value) -> Self {
        Self {
            code: value.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
            data: value.get("data").cloned(),
        }
    }

    pub fn is_already_initialized(&self) -> bool {
        self.message.to_ascii_lowercase().contains("already initialized")
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "App-server error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// One parsed envelope from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: AppServerRequestId,
        outcome: std::result::Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Value,
    },
    Request {
        id: AppServerRequestId,
        method: String,
        params: Value,
    },
}

/// Split a text message into envelopes. Blank and malformed lines are dropped.
pub fn parse_incoming(text: &str) -> Vec<Incoming> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Option<Incoming> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "dropping malformed app-server payload");
            return None;
        }
    };

    let id = value
        .get("id")
        .filter(|id| !id.is_null())
        .and_then(|id| serde_json::from_value::<AppServerRequestId>(id.clone()).ok());

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        return Some(match id {
            Some(id) => Incoming::Request {
                id,
                method: method.to_string(),
                params,
            },
            None => Incoming::Notification {
                method: method.to_string(),
                params,
            },
        });
    }

    let Some(id) = id else {
        debug!("dropping app-server payload without id or method");
        return None;
    };
    let outcome = match value.get("error").filter(|error| !error.is_null()) {
        Some(error) => Err(RpcError::from_value(error)),
        None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
    };
    Some(Incoming::Response { id, outcome })
}

/// An outstanding request and the context its response will be applied with.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest<C> {
    pub method: String,
    pub context: C,
}

/// Allocates request ids and remembers what each request was for.
#[derive(Debug)]
pub struct RpcDispatcher<C> {
    next_id: i64,
    pending: HashMap<i64, PendingRequest<C>>,
}

impl<C> Default for RpcDispatcher<C> {
    fn default() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }
}

impl<C> RpcDispatcher<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize a request and register its context. Returns the id and wire text.
    pub fn request(&mut self, method: &str, params: Value, context: C) -> Result<(i64, String)> {
        let id = self.next_id;
        let text = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))?;
        self.next_id += 1;
        self.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                context,
            },
        );
        Ok((id, text))
    }

    pub fn notification(&self, method: &str, params: Option<Value>) -> Result<String> {
        let mut envelope = json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            envelope["params"] = params;
        }
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Error reply for a server-initiated request this client does not handle.
    pub fn unsupported_reply(&self, id: &AppServerRequestId, method: &str) -> Result<String> {
        Ok(serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": METHOD_NOT_SUPPORTED,
                "message": format!("{method} is not supported by this client"),
            },
        }))?)
    }

    /// Remove and return the pending entry for a response id.
    pub fn resolve(&mut self, id: &AppServerRequestId) -> Option<PendingRequest<C>> {
        id.as_integer().and_then(|id| self.pending.remove(&id))
    }

    /// Remove every outstanding request, oldest first.
    pub fn drain(&mut self) -> Vec<PendingRequest<C>> {
        let mut pending: Vec<(i64, PendingRequest<C>)> = self.pending.drain().collect();
        pending.sort_by_key(|(id, _)| *id);
        pending.into_iter().map(|(_, entry)| entry).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: i64) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_methods(&self) -> impl Iterator<Item = &str> {
        self.pending.values().map(|entry| entry.method.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_increase_and_resolve_once() {
        let mut rpc = RpcDispatcher::new();
        let (first, text) = rpc
            .request("thread/list", json!({"limit": 50}), "list")
            .expect("encode");
        let (second, _) = rpc.request("model/list", json!({}), "models").expect("encode");
        assert_eq!(second, first + 1);

        let envelope: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(envelope["jsonrpc"], "2.0");
        assert_eq!(envelope["method"], "thread/list");
        assert_eq!(envelope["params"]["limit"], 50);

        let resolved = rpc
            .resolve(&AppServerRequestId::Integer(first))
            .expect("pending");
        assert_eq!(resolved.context, "list");
        assert!(rpc.resolve(&AppServerRequestId::Integer(first)).is_none());
        assert!(rpc.resolve(&AppServerRequestId::String(second.to_string())).is_some());
    }

    #[test]
    fn drain_returns_pending_in_request_order() {
        let mut rpc = RpcDispatcher::new();
        let (id, _) = rpc.request("initialize", json!({}), 1).expect("encode");
        rpc.request("thread/list", json!({}), 2).expect("encode");
        let drained: Vec<i32> = rpc.drain().into_iter().map(|entry| entry.context).collect();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(rpc.pending_len(), 0);
        assert!(!rpc.is_pending(id));
        assert!(rpc.resolve(&AppServerRequestId::Integer(id)).is_none());
    }

    #[test]
    fn classifies_newline_delimited_envelopes() {
        let text = concat!(
            "{\"id\":1,\"result\":{\"ok\":true}}\n",
            "\n",
            "not json\n",
            "{\"id\":2,\"error\":{\"code\":-32000,\"message\":\"Already initialized\"}}\n",
            "{\"method\":\"turn/started\",\"params\":{\"threadId\":\"t1\"}}\n",
            "{\"id\":\"srv-1\",\"method\":\"item/commandExecution/requestApproval\",\"params\":{}}\n",
            "{\"result\":{}}"
        );
        let incoming = parse_incoming(text);
        assert_eq!(incoming.len(), 4);

        assert_eq!(
            incoming[0],
            Incoming::Response {
                id: AppServerRequestId::Integer(1),
                outcome: Ok(json!({"ok": true})),
            }
        );
        match &incoming[1] {
            Incoming::Response {
                outcome: Err(error),
                ..
            } => {
                assert_eq!(error.code, -32000);
                assert!(error.is_already_initialized());
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            &incoming[2],
            Incoming::Notification { method, .. } if method == "turn/started"
        ));
        assert!(matches!(
            &incoming[3],
            Incoming::Request { id: AppServerRequestId::String(id), .. } if id == "srv-1"
        ));
    }

    #[test]
    fn unsupported_reply_echoes_request_id() {
        let rpc: RpcDispatcher<()> = RpcDispatcher::new();
        let text = rpc
            .unsupported_reply(&AppServerRequestId::String("abc".into()), "item/tool/call")
            .expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["id"], "abc");
        assert_eq!(value["error"]["code"], METHOD_NOT_SUPPORTED);
    }

    #[test]
    fn notification_omits_absent_params() {
        let rpc: RpcDispatcher<()> = RpcDispatcher::new();
        let text = rpc.notification("initialized", None).expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "initialized"}));
    }
}
