//! Hub configuration.
//!
//! Every recognized option with its default. Configs deserialize from TOML
//! with unset fields falling back to defaults, so a file only needs the
//! options it changes.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// The recognized option set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Retry cadence for transport reconnection, seconds.
    pub reconnect_interval_sec: u64,
    /// Reconnection attempts before pending requests are failed.
    pub reconnect_max_attempts: u32,
    /// Default request deadline, seconds.
    pub request_timeout_sec: u64,
    /// Maximum fallback rewrites per request.
    pub fallback_max_depth: u8,
    /// Minimum similarity score for approximate resolution, inclusive.
    pub approximation_threshold: f64,
    /// Certificate chain presented by a serving hub; also the trust anchor
    /// a connecting hub verifies its upstream against.
    pub tls_cert_path: Option<PathBuf>,
    /// Private key matching `tls_cert_path`.
    pub tls_key_path: Option<PathBuf>,
    /// Require and verify peer certificates on TLS channels.
    pub verify_peer: bool,
    /// Allow unverified connections (plain TCP, or TLS without peer
    /// verification). Off by default.
    pub insecure: bool,
    /// Listen address for serving hubs.
    pub bind_address: String,
    /// Listen port for serving hubs. `0` picks an ephemeral port.
    pub bind_port: u16,
    /// Depth of outgoing frame queues.
    pub outgoing_depth: usize,
    /// Depth of per-subscription delivery queues; deliveries that would
    /// overflow are dropped and counted.
    pub subscription_depth: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_sec: 5,
            reconnect_max_attempts: 3,
            request_timeout_sec: 30,
            fallback_max_depth: 8,
            approximation_threshold: 0.8,
            tls_cert_path: None,
            tls_key_path: None,
            verify_peer: true,
            insecure: false,
            bind_address: "127.0.0.1".into(),
            bind_port: 0,
            outgoing_depth: 64,
            subscription_depth: 64,
        }
    }
}

impl HubConfig {
    /// Load from a TOML file, defaulting unset options.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, HubError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| HubError::Transport(format!("config read failed: {e}")))?;
        toml::from_str(&text).map_err(|e| HubError::Transport(format!("config parse failed: {e}")))
    }

    /// The default request deadline as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }

    /// The reconnect cadence as a [`Duration`].
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.reconnect_interval_sec, 5);
        assert_eq!(cfg.reconnect_max_attempts, 3);
        assert_eq!(cfg.request_timeout_sec, 30);
        assert_eq!(cfg.fallback_max_depth, 8);
        assert_eq!(cfg.approximation_threshold, 0.8);
        assert!(cfg.verify_peer);
        assert!(!cfg.insecure);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: HubConfig =
            toml::from_str("request_timeout_sec = 5\napproximation_threshold = 0.75\n").unwrap();
        assert_eq!(cfg.request_timeout_sec, 5);
        assert_eq!(cfg.approximation_threshold, 0.75);
        assert_eq!(cfg.fallback_max_depth, 8);
    }
}
