//! Configuration file management.
//!
//! TOML with serde defaults throughout; environment variables fill in any
//! value the file left at its default, and the file always wins when both
//! are present.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vireo_crypto::argon2id::KdfParams;
use vireo_sync::{PeerSetting, SyncSettings};
use vireo_transport::TransportConfig;

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub bbs: BbsConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub mail: MailSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// BBS identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BbsConfig {
    #[serde(default = "default_bbs_name")]
    pub name: String,
    /// Uppercase callsign used in wire verbs.
    #[serde(default = "default_callsign")]
    pub callsign: String,
    /// Data directory. Empty = ./data.
    #[serde(default)]
    pub data_dir: String,
}

/// Radio adapter selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// "loopback" is built in; hardware adapters implement the radio trait
    /// out of tree and register under their own names.
    #[serde(default = "default_radio_driver")]
    pub driver: String,
    /// Minimum seconds between sends.
    #[serde(default = "default_send_interval")]
    pub min_send_interval_secs: f64,
}

/// Key-derivation budget, tuned for small single-board computers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    #[serde(default = "default_argon2_memory")]
    pub argon2_memory_kib: u32,
    #[serde(default = "default_argon2_passes")]
    pub argon2_passes: u32,
    #[serde(default = "default_argon2_lanes")]
    pub argon2_lanes: u32,
}

/// Mail engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSection {
    #[serde(default = "default_mail_expiry")]
    pub expiry_days: i64,
    #[serde(default = "default_legacy_window")]
    pub legacy_aad_window_secs: i64,
}

/// Sync engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub peers: Vec<PeerSetting>,
    #[serde(default = "default_true")]
    pub rap_enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: i64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: i64,
    #[serde(default = "default_route_share_interval")]
    pub route_share_interval_secs: i64,
    #[serde(default = "default_route_expiry")]
    pub route_expiry_secs: i64,
    #[serde(default = "default_pending_expiry")]
    pub pending_mail_expiry_secs: i64,
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// "debug" | "info" | "warn" | "error"
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions

fn default_bbs_name() -> String {
    "vireo".to_string()
}

fn default_callsign() -> String {
    "ADV".to_string()
}

fn default_radio_driver() -> String {
    "loopback".to_string()
}

fn default_send_interval() -> f64 {
    3.5
}

fn default_argon2_memory() -> u32 {
    32768
}

fn default_argon2_passes() -> u32 {
    3
}

fn default_argon2_lanes() -> u32 {
    1
}

fn default_mail_expiry() -> i64 {
    30
}

fn default_legacy_window() -> i64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> i64 {
    43_200
}

fn default_heartbeat_timeout() -> i64 {
    60
}

fn default_route_share_interval() -> i64 {
    86_400
}

fn default_route_expiry() -> i64 {
    129_600
}

fn default_pending_expiry() -> i64 {
    86_400
}

fn default_max_hops() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BbsConfig {
    fn default() -> Self {
        Self {
            name: default_bbs_name(),
            callsign: default_callsign(),
            data_dir: String::new(),
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            driver: default_radio_driver(),
            min_send_interval_secs: default_send_interval(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_memory_kib: default_argon2_memory(),
            argon2_passes: default_argon2_passes(),
            argon2_lanes: default_argon2_lanes(),
        }
    }
}

impl Default for MailSection {
    fn default() -> Self {
        Self {
            expiry_days: default_mail_expiry(),
            legacy_aad_window_secs: default_legacy_window(),
        }
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            enabled: true,
            peers: Vec::new(),
            rap_enabled: true,
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            route_share_interval_secs: default_route_share_interval(),
            route_expiry_secs: default_route_expiry(),
            pending_mail_expiry_secs: default_pending_expiry(),
            max_hops: default_max_hops(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Environment fallbacks: applied only where the file kept the default.
const ENV_FALLBACKS: &[(&str, fn(&mut DaemonConfig, &str))] = &[
    ("VIREO_NAME", |c, v| c.bbs.name = v.to_string()),
    ("VIREO_CALLSIGN", |c, v| c.bbs.callsign = v.to_string()),
    ("VIREO_DATA_DIR", |c, v| c.bbs.data_dir = v.to_string()),
    ("VIREO_RADIO_DRIVER", |c, v| c.radio.driver = v.to_string()),
    ("VIREO_LOG_LEVEL", |c, v| c.logging.level = v.to_string()),
];

impl DaemonConfig {
    /// Load configuration from a TOML file, falling back to defaults and
    /// environment variables.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env_fallbacks();
        Ok(config)
    }

    fn apply_env_fallbacks(&mut self) {
        let defaults = Self::default();
        for (var, apply) in ENV_FALLBACKS {
            if let Ok(value) = std::env::var(var) {
                // File values beat the environment: only fill defaults.
                let untouched = match *var {
                    "VIREO_NAME" => self.bbs.name == defaults.bbs.name,
                    "VIREO_CALLSIGN" => self.bbs.callsign == defaults.bbs.callsign,
                    "VIREO_DATA_DIR" => self.bbs.data_dir == defaults.bbs.data_dir,
                    "VIREO_RADIO_DRIVER" => self.radio.driver == defaults.radio.driver,
                    "VIREO_LOG_LEVEL" => self.logging.level == defaults.logging.level,
                    _ => false,
                };
                if untouched {
                    apply(self, &value);
                }
            }
        }
    }

    /// Validate; every error is fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bbs.name.is_empty() {
            errors.push("bbs.name cannot be empty".to_string());
        }
        if let Err(e) = vireo_types::ident::validate_callsign(&self.bbs.callsign) {
            errors.push(format!("bbs.callsign: {e}"));
        }
        if let Err(e) = self.kdf_params().validate() {
            errors.push(format!("crypto: {e}"));
        }
        if self.radio.min_send_interval_secs < 0.0 {
            errors.push("radio.min_send_interval_secs cannot be negative".to_string());
        }
        for peer in &self.sync.peers {
            if peer.node_id.is_empty() {
                errors.push(format!("sync.peers: peer '{}' has no node_id", peer.name));
            }
        }

        errors
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        if self.bbs.data_dir.is_empty() {
            PathBuf::from("./data")
        } else {
            PathBuf::from(&self.bbs.data_dir)
        }
    }

    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            m_cost_kib: self.crypto.argon2_memory_kib,
            t_cost: self.crypto.argon2_passes,
            p_cost: self.crypto.argon2_lanes,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            min_send_interval: Duration::from_secs_f64(self.radio.min_send_interval_secs),
            ..TransportConfig::default()
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            enabled: self.sync.enabled,
            callsign: self.bbs.callsign.to_uppercase(),
            bbs_name: self.bbs.name.clone(),
            peers: self.sync.peers.clone(),
            rap_enabled: self.sync.rap_enabled,
            heartbeat_interval_secs: self.sync.heartbeat_interval_secs,
            heartbeat_timeout_secs: self.sync.heartbeat_timeout_secs,
            route_share_interval_secs: self.sync.route_share_interval_secs,
            route_expiry_secs: self.sync.route_expiry_secs,
            pending_mail_expiry_secs: self.sync.pending_mail_expiry_secs,
            max_hops: self.sync.max_hops,
            ..SyncSettings::default()
        }
    }

    pub fn mail_config(&self) -> vireo_mail::MailConfig {
        vireo_mail::MailConfig {
            callsign: self.bbs.callsign.to_uppercase(),
            expiry_days: self.mail.expiry_days,
            legacy_aad_window_secs: self.mail.legacy_aad_window_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.bbs.callsign, "ADV");
        assert_eq!(config.sync.heartbeat_interval_secs, 43_200);
        assert_eq!(config.sync.route_expiry_secs, 129_600);
    }

    #[test]
    fn test_roundtrip_serialization() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: DaemonConfig = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed.bbs.callsign, config.bbs.callsign);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let parsed: DaemonConfig = toml::from_str(
            r#"
            [bbs]
            callsign = "MV51"

            [[sync.peers]]
            node_id = "!peer0001"
            name = "GL42"
            "#,
        )
        .expect("parse");
        assert_eq!(parsed.bbs.callsign, "MV51");
        assert_eq!(parsed.bbs.name, "vireo");
        assert_eq!(parsed.sync.peers.len(), 1);
        assert!(parsed.sync.peers[0].enabled);
    }

    #[test]
    fn test_validation_catches_bad_values() {
        let mut config = DaemonConfig::default();
        config.bbs.callsign = "lower".to_string();
        config.crypto.argon2_memory_kib = 1_000_000;
        let errors = config.validate();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_sync_settings_mapping() {
        let mut config = DaemonConfig::default();
        config.bbs.callsign = "mv51".to_string();
        let settings = config.sync_settings();
        assert_eq!(settings.callsign, "MV51");
    }
}
