//! Client configuration.
//!
//! The teacher carried build-time constants (`APP_ID`, `VERSION`, ...) for a
//! desktop app reading a TOML file off disk. This crate is embedded in a host
//! application instead, so configuration is a plain struct supplied by the
//! caller; defaults mirror the teacher's `SignalServers::default()`.

use std::time::Duration;

/// Relay + directory service endpoints.
#[derive(Clone, Debug)]
pub struct ServiceUrls {
    /// Atlas directory/identity service base URL.
    pub atlas_url: String,
    /// Signal relay HTTP base URL.
    pub signal_url: String,
    /// Signal relay WebSocket base URL (`wss://...`).
    pub signal_websocket_url: String,
}

impl Default for ServiceUrls {
    fn default() -> Self {
        Self {
            atlas_url: "https://api.forsta.io".to_string(),
            signal_url: "https://signal.forsta.io".to_string(),
            signal_websocket_url: "wss://signal.forsta.io".to_string(),
        }
    }
}

/// Top-level client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub services: ServiceUrls,
    /// Human-readable device label sent at registration/provisioning time.
    pub device_label: String,
    /// `User-Agent` sent on HTTP + websocket requests.
    pub user_agent: String,
    /// Applied to the underlying `reqwest::Client`; spec.md SS5 leaves HTTP
    /// timeout implementation-defined.
    pub request_timeout: Duration,
    /// Number of unsigned prekeys generated at registration (spec.md SS3: "a
    /// batch of ~100").
    pub prekey_batch_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            services: ServiceUrls::default(),
            device_label: "forsta-core".to_string(),
            user_agent: concat!("forsta-core/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_secs(10),
            prekey_batch_size: 100,
        }
    }
}

/// Socket reconnection backoff policy (spec.md SS9 Open Question: the source
/// reconnects immediately with no backoff; this crate adds jittered
/// exponential backoff instead, as the REDESIGN FLAGS section recommends).
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}
