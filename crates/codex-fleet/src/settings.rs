//! Engine tunables.

use std::time::Duration;

use codex_ws_client::ClientInfo;

/// Tunables for a connection engine.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Covers TCP dial, TLS and the upgrade exchange for one candidate.
    pub connect_timeout: Duration,
    pub thread_list_page_size: u32,
    /// One entry per automatic retry of an empty or failed fresh thread list.
    pub thread_list_retry_delays: Vec<Duration>,
    pub model_page_size: u32,
    pub command_timeout: Duration,
    pub client_info: ClientInfo,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            thread_list_page_size: 50,
            thread_list_retry_delays: vec![Duration::from_millis(700), Duration::from_millis(2000)],
            model_page_size: 100,
            command_timeout: Duration::from_secs(15),
            client_info: ClientInfo {
                name: "codex-fleet".to_string(),
                title: Some("Codex Fleet".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}
