//! WebSocket JSON-RPC connection to an XRPL node
//!
//! One `RpcConnection` is shared by every request of a gateway. The socket is
//! opened on first use, dropped on any transport error and reopened by the
//! next request. Requests on the connection are serialized; each one waits
//! for the response carrying its own `id` and ignores unrelated stream
//! messages.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    /// Connect, send or receive failed; the connection was discarded
    #[error("transport error: {0}")]
    Transport(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The node answered with `status: error`
    #[error("{error}: {message}")]
    Rejected { error: String, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// XRPL error token for rejections, e.g. `txnNotFound`
    pub fn code(&self) -> Option<&str> {
        match self {
            RpcError::Rejected { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Build a command frame: `{"id": .., "command": .., ...params}`
pub(crate) fn command_frame(id: u64, command: &str, params: Value) -> Value {
    let mut frame = match params {
        Value::Object(map) => Value::Object(map),
        _ => json!({}),
    };
    frame["id"] = json!(id);
    frame["command"] = json!(command);
    frame
}

/// Extract `result` from a response frame, mapping `status: error` to `Rejected`
pub(crate) fn response_result(frame: Value) -> Result<Value, RpcError> {
    match frame.get("status").and_then(Value::as_str) {
        Some("success") => frame
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError::Malformed("success response without result".to_string())),
        Some("error") => {
            let error = frame
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknownError")
                .to_string();
            let message = frame
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Err(RpcError::Rejected { error, message })
        }
        other => Err(RpcError::Malformed(format!("unexpected status {:?}", other))),
    }
}

/// Lazily connected, self-healing request/response channel
#[derive(Debug)]
pub struct RpcConnection {
    url: String,
    request_timeout: Duration,
    socket: Mutex<Option<WsStream>>,
    next_id: AtomicU64,
}

impl RpcConnection {
    pub fn new(url: String, request_timeout: Duration) -> Self {
        Self {
            url,
            request_timeout,
            socket: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Send one command and wait for its response
    ///
    /// Any transport failure or timeout drops the socket so the next call
    /// reconnects.
    pub async fn request(&self, command: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = command_frame(id, command, params);

        let mut guard = self.socket.lock().await;
        if guard.is_none() {
            let (socket, _) = timeout(self.request_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| RpcError::Timeout(self.request_timeout))?
                .map_err(|e| RpcError::Transport(format!("connect {}: {}", self.url, e)))?;
            info!(url = %self.url, "Settlement RPC connected");
            *guard = Some(socket);
        }

        let result = match guard.as_mut() {
            Some(socket) => {
                timeout(self.request_timeout, Self::exchange(socket, id, &frame))
                    .await
                    .unwrap_or(Err(RpcError::Timeout(self.request_timeout)))
            }
            None => Err(RpcError::Transport("not connected".to_string())),
        };

        if let Err(RpcError::Transport(_) | RpcError::Timeout(_)) = &result {
            warn!(url = %self.url, command, "Dropping settlement RPC connection");
            *guard = None;
        }
        result
    }

    async fn exchange(socket: &mut WsStream, id: u64, frame: &Value) -> Result<Value, RpcError> {
        socket
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        while let Some(message) = socket.next().await {
            let message = message.map_err(|e| RpcError::Transport(e.to_string()))?;
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => {
                    return Err(RpcError::Transport("closed by peer".to_string()))
                }
                _ => continue,
            };

            let response: Value =
                serde_json::from_str(&text).map_err(|e| RpcError::Malformed(e.to_string()))?;
            if response.get("id").and_then(Value::as_u64) == Some(id) {
                return response_result(response);
            }
            debug!(id, "Skipping unrelated RPC frame");
        }

        Err(RpcError::Transport("stream ended".to_string()))
    }

    /// Close the socket if one is open
    pub async fn close(&self) {
        if let Some(mut socket) = self.socket.lock().await.take() {
            let _ = socket.close(None).await;
            info!(url = %self.url, "Settlement RPC connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_frame_flattens_params() {
        let frame = command_frame(7, "account_info", json!({"account": "rA", "ledger_index": "validated"}));

        assert_eq!(frame["id"], 7);
        assert_eq!(frame["command"], "account_info");
        assert_eq!(frame["account"], "rA");
        assert_eq!(frame["ledger_index"], "validated");
    }

    #[test]
    fn test_response_result_success() {
        let result = response_result(json!({
            "id": 1,
            "status": "success",
            "type": "response",
            "result": {"ledger_index": 10}
        }))
        .unwrap();

        assert_eq!(result["ledger_index"], 10);
    }

    #[test]
    fn test_response_result_error_is_rejected() {
        let error = response_result(json!({
            "id": 1,
            "status": "error",
            "error": "actNotFound",
            "error_message": "Account not found."
        }))
        .unwrap_err();

        assert_eq!(error.code(), Some("actNotFound"));
        assert_eq!(error.to_string(), "actNotFound: Account not found.");
    }

    #[test]
    fn test_response_result_without_status_is_malformed() {
        let error = response_result(json!({"id": 1})).unwrap_err();
        assert!(matches!(error, RpcError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_request_to_unreachable_node_is_transport_error() {
        let connection = RpcConnection::new("ws://127.0.0.1:1".to_string(), Duration::from_secs(2));

        let error = connection.request("server_info", json!({})).await.unwrap_err();

        assert!(matches!(error, RpcError::Transport(_) | RpcError::Timeout(_)));
    }
}
