//! How an engine opens its byte stream to an app-server.

use std::time::Duration;

use async_trait::async_trait;
use codex_ws_client::{BoxedStream, ClientError, WsTarget, open_stream};

/// Opens the byte stream a connection attempt upgrades.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open(&self, target: &WsTarget, timeout: Duration) -> Result<BoxedStream, ClientError>;
}

/// TCP, plus TLS for `wss://` targets.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl StreamConnector for TcpConnector {
    async fn open(&self, target: &WsTarget, timeout: Duration) -> Result<BoxedStream, ClientError> {
        open_stream(target, timeout).await
    }
}
