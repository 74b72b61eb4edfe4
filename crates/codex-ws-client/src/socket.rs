//! Byte-stream setup: TCP dial, optional TLS, and the upgrade exchange.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, crypto};
use tracing::debug;

use crate::endpoint::WsTarget;
use crate::error::{ClientError, Result};
use crate::handshake::{HandshakeOutcome, HandshakeParser, build_request};

/// Any duplex byte stream the transport can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Dial `target`, wrapping the socket in TLS for `wss://`.
pub async fn open_stream(target: &WsTarget, connect_timeout: Duration) -> Result<BoxedStream> {
    let address = (target.host.as_str(), target.port);
    let tcp = timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| {
            ClientError::Timeout(format!(
                "connect to {}:{} timed out after {connect_timeout:?}",
                target.host, target.port
            ))
        })??;
    let _ = tcp.set_nodelay(true);
    debug!(url = %target, "tcp connected");

    if !target.secure {
        return Ok(Box::new(tcp));
    }

    let connector = TlsConnector::from(Arc::new(tls_config()?));
    let server_name = ServerName::try_from(target.host.clone())
        .map_err(|err| ClientError::Tls(format!("invalid server name {}: {err}", target.host)))?;
    let tls = timeout(connect_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| ClientError::Timeout(format!("TLS handshake with {} timed out", target.host)))?
        .map_err(|err| ClientError::Tls(err.to_string()))?;
    debug!(url = %target, "tls established");
    Ok(Box::new(tls))
}

fn tls_config() -> Result<ClientConfig> {
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|err| ClientError::Tls(err.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// Send the upgrade request and read until the header block ends.
///
/// Returns bytes received after the headers, which belong to the frame stream.
pub async fn perform_handshake<S>(stream: &mut S, target: &WsTarget) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let request = build_request(target);
    stream.write_all(&request.bytes).await?;
    stream.flush().await?;

    let mut parser = HandshakeParser::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(ClientError::Closed {
                code: 1006,
                reason: "connection closed during handshake".to_string(),
            });
        }
        match parser.push(&chunk[..read]) {
            HandshakeOutcome::Incomplete => {}
            HandshakeOutcome::Accepted { leftover } => {
                debug!(url = %target, leftover = leftover.len(), "handshake accepted");
                return Ok(leftover);
            }
            HandshakeOutcome::Rejected { status, preview } => {
                return Err(ClientError::HandshakeRejected { status, preview });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::parse_endpoint;

    #[tokio::test]
    async fn handshake_over_duplex_returns_leftover() {
        let target = parse_endpoint("ws://localhost:1/").expect("target");
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let mut received = Vec::new();
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let read = server.read(&mut buf).await.expect("read");
                received.extend_from_slice(&buf[..read]);
            }
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\n\x81\x00")
                .await
                .expect("write");
            String::from_utf8(received).expect("utf8")
        });

        let leftover = perform_handshake(&mut client, &target).await.expect("handshake");
        assert_eq!(leftover, b"\x81\x00");
        let request = server_task.await.expect("join");
        assert!(request.starts_with("GET / HTTP/1.1"));
    }

    #[tokio::test]
    async fn handshake_rejection_surfaces_status() {
        let target = parse_endpoint("ws://localhost:1/").expect("target");
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await;
            let _ = server
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\ndenied")
                .await;
        });

        let err = perform_handshake(&mut client, &target)
            .await
            .expect_err("rejected");
        match err {
            ClientError::HandshakeRejected { status, preview } => {
                assert_eq!(status, "HTTP/1.1 403 Forbidden");
                assert_eq!(preview, "denied");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn dial_timeout_or_refusal_is_an_error() {
        let target = parse_endpoint("ws://127.0.0.1:1").expect("target");
        assert!(open_stream(&target, Duration::from_millis(500)).await.is_err());
    }
}
