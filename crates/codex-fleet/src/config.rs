//! Persisted list of app-server endpoints.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use codex_ws_client::parse_endpoint;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const ENDPOINTS_SCHEMA_VERSION: u32 = 1;
pub const ENDPOINTS_FILE_NAME: &str = "codex-fleet-endpoints.v1.json";
pub const ENDPOINTS_PATH_ENV: &str = "CODEX_FLEET_ENDPOINTS_PATH";
const LEGACY_ENDPOINT_NAME: &str = "Default";

/// Accent used to tell connections apart in merged lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointColor {
    #[default]
    Blue,
    Green,
    Orange,
    Purple,
    Red,
    Teal,
    Yellow,
    Gray,
}

impl EndpointColor {
    pub const ALL: [Self; 8] = [
        Self::Blue,
        Self::Green,
        Self::Orange,
        Self::Purple,
        Self::Red,
        Self::Teal,
        Self::Yellow,
        Self::Gray,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
            Self::Orange => "orange",
            Self::Purple => "purple",
            Self::Red => "red",
            Self::Teal => "teal",
            Self::Yellow => "yellow",
            Self::Gray => "gray",
        }
    }

    /// Round-robin pick for the `index`-th endpoint.
    pub const fn for_index(index: usize) -> Self {
        Self::ALL[index % Self::ALL.len()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub id: String,
    pub name: String,
    /// Host name or address. A full `ws://`/`wss://` URL is used verbatim.
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub color: EndpointColor,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            host: host.into(),
            port,
            color: EndpointColor::default(),
            enabled: true,
        }
    }

    /// Build an endpoint from a URL or `host:port` string.
    pub fn from_url(name: impl Into<String>, raw: &str) -> Result<Self> {
        let target = parse_endpoint(raw).with_context(|| format!("invalid endpoint URL {raw}"))?;
        let host = if target.secure || target.path != "/" {
            target.as_str().to_string()
        } else {
            target.host.clone()
        };
        Ok(Self::new(name, host, target.port))
    }

    pub fn url(&self) -> String {
        let host = self.host.trim();
        if host.contains("://") {
            return host.to_string();
        }
        if host.contains(':') && !host.starts_with('[') {
            return format!("ws://[{host}]:{}", self.port);
        }
        format!("ws://{host}:{}", self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EndpointDocument {
    version: u32,
    endpoints: Vec<EndpointConfig>,
}

/// Single-URL document written by earlier releases.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyDocument {
    server_url: Option<String>,
    url: Option<String>,
}

/// Ordered endpoint list backed by a versioned JSON file.
#[derive(Debug, Clone, Default)]
pub struct EndpointStore {
    path: PathBuf,
    endpoints: Vec<EndpointConfig>,
}

impl EndpointStore {
    pub fn load_default() -> Self {
        Self::load(default_endpoints_path())
    }

    /// Missing or unreadable files load as empty. A legacy document is
    /// migrated and rewritten once.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let Ok(raw) = fs::read_to_string(&path) else {
            return Self {
                path,
                endpoints: Vec::new(),
            };
        };

        if let Ok(document) = serde_json::from_str::<EndpointDocument>(&raw)
            && document.version == ENDPOINTS_SCHEMA_VERSION
        {
            return Self {
                path,
                endpoints: document.endpoints,
            };
        }

        let mut store = Self {
            path,
            endpoints: Vec::new(),
        };
        match legacy_endpoint(&raw) {
            Some(endpoint) => {
                info!(path = %store.path.display(), url = %endpoint.url(), "migrating legacy endpoint file");
                store.endpoints.push(endpoint);
                if let Err(error) = store.save() {
                    warn!(error = %error, "failed to rewrite migrated endpoint file");
                }
            }
            None => warn!(path = %store.path.display(), "ignoring unreadable endpoint file"),
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn endpoints(&self) -> &[EndpointConfig] {
        &self.endpoints
    }

    pub fn get(&self, id: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|endpoint| endpoint.id == id)
    }

    pub fn add(&mut self, mut endpoint: EndpointConfig) -> Result<()> {
        if self.get(&endpoint.id).is_some() {
            anyhow::bail!("endpoint {} already exists", endpoint.id);
        }
        if endpoint.color == EndpointColor::default() && !self.endpoints.is_empty() {
            endpoint.color = EndpointColor::for_index(self.endpoints.len());
        }
        self.endpoints.push(endpoint);
        self.save()
    }

    /// Replace the endpoint with the same id. Returns false when unknown.
    pub fn update(&mut self, endpoint: EndpointConfig) -> Result<bool> {
        let Some(existing) = self.endpoints.iter_mut().find(|known| known.id == endpoint.id) else {
            return Ok(false);
        };
        *existing = endpoint;
        self.save()?;
        Ok(true)
    }

    pub fn delete(&mut self, id: &str) -> Result<bool> {
        let before = self.endpoints.len();
        self.endpoints.retain(|endpoint| endpoint.id != id);
        if self.endpoints.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<bool> {
        let Some(endpoint) = self.endpoints.iter_mut().find(|endpoint| endpoint.id == id) else {
            return Ok(false);
        };
        if endpoint.enabled == enabled {
            return Ok(true);
        }
        endpoint.enabled = enabled;
        self.save()?;
        Ok(true)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let encoded = serde_json::to_string_pretty(&EndpointDocument {
            version: ENDPOINTS_SCHEMA_VERSION,
            endpoints: self.endpoints.clone(),
        })
        .context("failed to encode endpoint file")?;
        fs::write(&self.path, encoded)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

fn legacy_endpoint(raw: &str) -> Option<EndpointConfig> {
    let legacy = serde_json::from_str::<LegacyDocument>(raw).ok()?;
    let url = legacy.server_url.or(legacy.url)?;
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    EndpointConfig::from_url(LEGACY_ENDPOINT_NAME, url).ok()
}

pub fn default_endpoints_path() -> PathBuf {
    if let Some(path) = std::env::var_os(ENDPOINTS_PATH_ENV).filter(|path| !path.is_empty()) {
        return PathBuf::from(path);
    }

    if let Some(mut data_dir) = dirs::data_local_dir() {
        data_dir.push("codex-fleet");
        data_dir.push(ENDPOINTS_FILE_NAME);
        return data_dir;
    }

    if let Some(mut home_dir) = dirs::home_dir() {
        home_dir.push(".codex-fleet");
        home_dir.push(ENDPOINTS_FILE_NAME);
        return home_dir;
    }

    PathBuf::from(ENDPOINTS_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("nested").join(ENDPOINTS_FILE_NAME)
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EndpointStore::load(temp_path(&dir));
        assert!(store.endpoints().is_empty());
    }

    #[test]
    fn endpoints_persist_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = temp_path(&dir);
        let mut store = EndpointStore::load(&path);
        let first = EndpointConfig::new("laptop", "127.0.0.1", 4500);
        let second = EndpointConfig::new("build box", "10.0.0.8", 4501);
        store.add(first.clone()).expect("add first");
        store.add(second.clone()).expect("add second");

        let reloaded = EndpointStore::load(&path);
        let names: Vec<&str> = reloaded.endpoints().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["laptop", "build box"]);
        assert_eq!(reloaded.endpoints()[0].color, EndpointColor::Blue);
        assert_eq!(reloaded.endpoints()[1].color, EndpointColor::Green);

        let raw = fs::read_to_string(&path).expect("read");
        let document: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(document["version"], 1);
    }

    #[test]
    fn update_delete_and_toggle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = temp_path(&dir);
        let mut store = EndpointStore::load(&path);
        let mut endpoint = EndpointConfig::new("box", "box.local", 4500);
        store.add(endpoint.clone()).expect("add");

        endpoint.port = 4600;
        assert!(store.update(endpoint.clone()).expect("update"));
        assert!(store.set_enabled(&endpoint.id, false).expect("disable"));
        assert!(!store.set_enabled("missing", false).expect("unknown id"));

        let reloaded = EndpointStore::load(&path);
        let saved = reloaded.get(&endpoint.id).expect("saved");
        assert_eq!(saved.port, 4600);
        assert!(!saved.enabled);

        let mut store = reloaded;
        assert!(store.delete(&endpoint.id).expect("delete"));
        assert!(!store.delete(&endpoint.id).expect("second delete"));
        assert!(EndpointStore::load(&path).endpoints().is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = EndpointStore::load(temp_path(&dir));
        let endpoint = EndpointConfig::new("a", "a.local", 1);
        store.add(endpoint.clone()).expect("add");
        assert!(store.add(endpoint).is_err());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(ENDPOINTS_FILE_NAME);
        fs::write(&path, "{ not json").expect("write");
        assert!(EndpointStore::load(&path).endpoints().is_empty());

        fs::write(&path, r#"{"version": 99, "endpoints": []}"#).expect("write");
        assert!(EndpointStore::load(&path).endpoints().is_empty());
    }

    #[test]
    fn legacy_document_is_migrated_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(ENDPOINTS_FILE_NAME);
        fs::write(&path, r#"{"serverUrl": "ws://192.168.1.20:4500"}"#).expect("write");

        let store = EndpointStore::load(&path);
        assert_eq!(store.endpoints().len(), 1);
        let endpoint = &store.endpoints()[0];
        assert_eq!(endpoint.name, "Default");
        assert_eq!(endpoint.host, "192.168.1.20");
        assert_eq!(endpoint.port, 4500);
        assert!(endpoint.enabled);

        let raw = fs::read_to_string(&path).expect("read");
        let document: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(document["version"], 1);
        let reloaded = EndpointStore::load(&path);
        assert_eq!(reloaded.endpoints()[0].id, endpoint.id);
    }

    #[test]
    fn legacy_url_key_and_secure_urls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(ENDPOINTS_FILE_NAME);
        fs::write(&path, r#"{"url": "wss://codex.example.com/rpc"}"#).expect("write");
        let store = EndpointStore::load(&path);
        assert_eq!(store.endpoints()[0].url(), "wss://codex.example.com/rpc");
        assert_eq!(store.endpoints()[0].port, 443);
    }

    #[test]
    fn urls_from_host_and_port() {
        assert_eq!(EndpointConfig::new("a", "10.0.0.2", 4500).url(), "ws://10.0.0.2:4500");
        assert_eq!(EndpointConfig::new("b", "::1", 4500).url(), "ws://[::1]:4500");
        assert_eq!(
            EndpointConfig::from_url("c", "devbox:4510").expect("parse").url(),
            "ws://devbox:4510"
        );
    }
}
