//! Endpoint URL validation and connection candidates.

use url::{Host, Url};

use crate::error::{ClientError, Result};

/// Path tried when the server root does not accept the upgrade.
pub const FALLBACK_PATH: &str = "/ws";

/// A validated `ws://` or `wss://` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsTarget {
    pub url: Url,
    pub secure: bool,
    /// Host to dial, without IPv6 brackets.
    pub host: String,
    pub port: u16,
    /// Request target including any query string.
    pub path: String,
}

impl WsTarget {
    /// Value for the `Host` request header.
    pub fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or(&self.host);
        format!("{host}:{}", self.port)
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Same endpoint with a different request path.
    pub fn with_path(&self, path: &str) -> Self {
        let mut url = self.url.clone();
        url.set_path(path);
        url.set_query(None);
        Self {
            url,
            secure: self.secure,
            host: self.host.clone(),
            port: self.port,
            path: path.to_string(),
        }
    }
}

impl std::fmt::Display for WsTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Parse and validate an endpoint. Bare `host:port` input is treated as `ws://`.
pub fn parse_endpoint(raw: &str) -> Result<WsTarget> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ClientError::InvalidUrl("URL is empty".to_string()));
    }

    let normalized = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };

    let url = Url::parse(&normalized)?;
    let secure = match url.scheme() {
        "ws" => false,
        "wss" => true,
        other => {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {other}"
            )));
        }
    };

    let host = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        _ => return Err(ClientError::InvalidUrl(format!("missing host in {trimmed}"))),
    };

    let port = url
        .port_or_known_default()
        .ok_or_else(|| ClientError::InvalidUrl(format!("missing port in {trimmed}")))?;

    let mut path = if url.path().is_empty() {
        "/".to_string()
    } else {
        url.path().to_string()
    };
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    Ok(WsTarget {
        url,
        secure,
        host,
        port,
        path,
    })
}

/// Candidates tried in order before the first successful handshake.
///
/// A root path gets one `/ws` fallback; an explicit path is used as given.
pub fn candidate_urls(target: &WsTarget) -> Vec<WsTarget> {
    let mut candidates = vec![target.clone()];
    if target.path == "/" {
        candidates.push(target.with_path(FALLBACK_PATH));
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_port_defaults_to_ws() {
        let target = parse_endpoint("192.168.1.20:4500").expect("target");
        assert!(!target.secure);
        assert_eq!(target.host, "192.168.1.20");
        assert_eq!(target.port, 4500);
        assert_eq!(target.path, "/");
        assert_eq!(target.as_str(), "ws://192.168.1.20:4500/");
    }

    #[test]
    fn secure_scheme_uses_default_port() {
        let target = parse_endpoint("wss://codex.example.com/app?token=abc").expect("target");
        assert!(target.secure);
        assert_eq!(target.port, 443);
        assert_eq!(target.path, "/app?token=abc");
        assert_eq!(target.host_header(), "codex.example.com:443");
    }

    #[test]
    fn ipv6_hosts_dial_without_brackets() {
        let target = parse_endpoint("ws://[::1]:9000").expect("target");
        assert_eq!(target.host, "::1");
        assert_eq!(target.host_header(), "[::1]:9000");
    }

    #[test]
    fn rejects_other_schemes_and_empty_input() {
        assert!(matches!(
            parse_endpoint("http://localhost:4500"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(matches!(parse_endpoint("   "), Err(ClientError::InvalidUrl(_))));
        assert!(parse_endpoint("ws://").is_err());
    }

    #[test]
    fn root_path_gets_single_ws_fallback() {
        let root = parse_endpoint("ws://localhost:4500").expect("target");
        let candidates = candidate_urls(&root);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[1].path, "/ws");
        assert_eq!(candidates[1].as_str(), "ws://localhost:4500/ws");

        let explicit = parse_endpoint("ws://localhost:4500/custom").expect("target");
        assert_eq!(candidate_urls(&explicit), vec![explicit]);
    }
}
