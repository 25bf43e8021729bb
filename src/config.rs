//! Daemon and transfer configuration.
//!
//! Values are layered with figment: built-in defaults, then the TOML file,
//! then `OFFLOADER_*` environment variables, then CLI overrides. The
//! `[transfer]` table is re-read by [`FileConfigProvider`] at every job start
//! so edits apply to the next job without touching the running one.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::transfer_engine::CopierType;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/offloader/config.toml";
const CONFIG_PATH_ENV: &str = "OFFLOADER_CONFIG";
const ENV_PREFIX: &str = "OFFLOADER_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub rpc_bind: SocketAddr,
    pub http_bind: SocketAddr,
    pub data_dir: PathBuf,
    pub source_mount: PathBuf,
    pub destination_mount: PathBuf,
    pub sample_interval_ms: u64,
    /// How often attached drives are polled
    pub drive_poll_ms: u64,
    pub copy_engine: CopierType,
    pub simulation: bool,
    pub verbose: bool,
    pub log_json: bool,
    #[serde(skip)]
    pub config_path: PathBuf,
    pub transfer: TransferConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 9847)),
            http_bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            data_dir: PathBuf::from("/var/lib/offloader"),
            source_mount: PathBuf::from("/mnt/offloader/usb"),
            destination_mount: PathBuf::from("/mnt/offloader/nas"),
            sample_interval_ms: 1000,
            drive_poll_ms: 2000,
            copy_engine: CopierType::Native,
            simulation: false,
            verbose: false,
            log_json: false,
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            transfer: TransferConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location, applying CLI overrides.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        Self::load_from(&config_path_from_env(), overrides)
    }

    pub fn load_from<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self> {
        let mut figment = base_figment(path);
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let mut config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("offloader.db")
    }

    pub fn sample_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sample_interval_ms.max(50))
    }

    pub fn drive_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.drive_poll_ms.max(200))
    }
}

fn base_figment(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(AppConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

fn config_path_from_env() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Settings that govern a single transfer. Read once when a job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Primary share address (e.g. the VPN address of the NAS)
    pub nas_address: String,
    /// Tried when the primary address is unreachable (e.g. the LAN address)
    pub nas_address_fallback: Option<String>,
    pub share_name: String,
    /// Destination folder inside the share
    pub subfolder: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol_version: String,
    pub verify_checksums: bool,
    /// Block device to mount as the source; detected when unset
    pub source_device: Option<PathBuf>,
    pub min_file_size: u64,
    pub failure_threshold: u32,
    pub file_retries: u32,
    pub mount_retries: u32,
    pub mount_retry_delay_ms: u64,
    /// Bytes written by the destination speed test
    pub speed_test_bytes: u64,
    pub notifications: NotificationConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            nas_address: "100.109.23.38".to_string(),
            nas_address_fallback: Some("192.168.88.20".to_string()),
            share_name: "archive".to_string(),
            subfolder: String::new(),
            username: None,
            password: None,
            protocol_version: "3.0".to_string(),
            verify_checksums: false,
            source_device: None,
            min_file_size: 1024 * 1024,
            failure_threshold: 3,
            file_retries: 1,
            mount_retries: 3,
            mount_retry_delay_ms: 1500,
            speed_test_bytes: 256 * 1024 * 1024,
            notifications: NotificationConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Copy safe to hand to clients: the password is dropped.
    pub fn redacted(&self) -> RedactedTransferConfig {
        let mut config = self.clone();
        let has_password = config.password.take().is_some_and(|p| !p.is_empty());
        RedactedTransferConfig {
            config,
            has_password,
        }
    }

    /// Apply a partial update expressed as a JSON object.
    ///
    /// Keys absent from `patch` keep their current value. An empty password
    /// string keeps the stored password, matching how the dashboard submits
    /// the form without re-entering secrets.
    pub fn merged_with(&self, patch: &serde_json::Value) -> Result<Self> {
        let patch = patch
            .as_object()
            .context("Configuration update must be a JSON object")?;

        let mut current = serde_json::to_value(self).context("Failed to serialize config")?;
        if let Some(target) = current.as_object_mut() {
            for (key, value) in patch {
                if key == "password" && value.as_str().is_some_and(str::is_empty) {
                    continue;
                }
                if key == "notifications" {
                    if let (Some(existing), Some(update)) = (
                        target.get_mut(key).and_then(|v| v.as_object_mut()),
                        value.as_object(),
                    ) {
                        for (k, v) in update {
                            existing.insert(k.clone(), v.clone());
                        }
                        continue;
                    }
                }
                target.insert(key.clone(), value.clone());
            }
        }

        serde_json::from_value(current).context("Invalid configuration update")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RedactedTransferConfig {
    #[serde(flatten)]
    pub config: TransferConfig,
    pub has_password: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Discord,
    Slack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub channel: NotificationChannelType,
    pub webhook_url: Option<String>,
    pub milestones: Vec<u8>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel: NotificationChannelType::None,
            webhook_url: None,
            milestones: vec![25, 50, 75, 100],
        }
    }
}

/// Source of transfer settings, consulted once per job start.
pub trait TransferConfigProvider: Send + Sync {
    fn load(&self) -> Result<TransferConfig>;
}

/// Reads the `[transfer]` table from the daemon's config file.
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `transfer` as the file's `[transfer]` table, keeping every
    /// other key already present.
    pub fn save(&self, transfer: &TransferConfig) -> Result<()> {
        let mut document = if self.path.exists() {
            let content = std::fs::read_to_string(&self.path)
                .with_context(|| format!("Failed to read {}", self.path.display()))?;
            content
                .parse::<toml::Table>()
                .context("Failed to parse config file")?
        } else {
            toml::Table::new()
        };

        let value = toml::Value::try_from(transfer).context("Failed to serialize config")?;
        document.insert("transfer".to_string(), value);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(&document).context("Failed to serialize config")?;
        std::fs::write(&self.path, content).context("Failed to write config file")?;
        Ok(())
    }
}

impl TransferConfigProvider for FileConfigProvider {
    fn load(&self) -> Result<TransferConfig> {
        base_figment(&self.path)
            .extract_inner("transfer")
            .with_context(|| format!("Failed to load transfer settings from {}", self.path.display()))
    }
}

/// Fixed settings, used by tests and embedders that manage config themselves.
pub struct StaticConfigProvider(pub TransferConfig);

impl TransferConfigProvider for StaticConfigProvider {
    fn load(&self) -> Result<TransferConfig> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_file() {
        let temp = tempdir().unwrap();
        let config = AppConfig::load_from(&temp.path().join("missing.toml"), None::<&()>).unwrap();

        assert_eq!(config.transfer.share_name, "archive");
        assert_eq!(config.transfer.notifications.milestones, vec![25, 50, 75, 100]);
        assert_eq!(config.transfer.failure_threshold, 3);
        assert_eq!(config.sample_interval_ms, 1000);
        assert_eq!(config.drive_poll_interval(), std::time::Duration::from_secs(2));
        assert_eq!(config.transfer.speed_test_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            source_mount = "/tmp/usb"

            [transfer]
            nas_address = "10.0.0.5"
            verify_checksums = true

            [transfer.notifications]
            channel = "discord"
            webhook_url = "https://example.invalid/hook"
            "#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path, None::<&()>).unwrap();
        assert_eq!(config.source_mount, PathBuf::from("/tmp/usb"));
        assert_eq!(config.transfer.nas_address, "10.0.0.5");
        assert!(config.transfer.verify_checksums);
        assert_eq!(
            config.transfer.notifications.channel,
            NotificationChannelType::Discord
        );
        // Untouched keys keep their defaults
        assert_eq!(config.transfer.protocol_version, "3.0");

        let provider = FileConfigProvider::new(&path);
        let transfer = provider.load().unwrap();
        assert_eq!(transfer, config.transfer);
    }

    #[test]
    fn test_cli_overrides_win() {
        #[derive(Serialize)]
        struct Overrides {
            simulation: bool,
        }

        let temp = tempdir().unwrap();
        let config = AppConfig::load_from(
            &temp.path().join("missing.toml"),
            Some(&Overrides { simulation: true }),
        )
        .unwrap();
        assert!(config.simulation);
    }

    #[test]
    fn test_redacted_hides_password() {
        let config = TransferConfig {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let redacted = config.redacted();
        assert!(redacted.has_password);

        let json = serde_json::to_string(&redacted).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains(r#""has_password":true"#));
    }

    #[test]
    fn test_merge_keeps_password_on_empty_string() {
        let config = TransferConfig {
            password: Some("secret".to_string()),
            ..Default::default()
        };
        let patch = serde_json::json!({
            "password": "",
            "subfolder": "2026/shoot",
            "notifications": { "milestones": [50, 100] }
        });

        let merged = config.merged_with(&patch).unwrap();
        assert_eq!(merged.password.as_deref(), Some("secret"));
        assert_eq!(merged.subfolder, "2026/shoot");
        assert_eq!(merged.notifications.milestones, vec![50, 100]);
        assert_eq!(merged.notifications.channel, NotificationChannelType::None);
    }

    #[test]
    fn test_save_round_trips_through_provider() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "http_bind = \"127.0.0.1:9000\"\n").unwrap();

        let provider = FileConfigProvider::new(&path);
        let transfer = TransferConfig {
            share_name: "footage".to_string(),
            ..Default::default()
        };
        provider.save(&transfer).unwrap();

        assert_eq!(provider.load().unwrap().share_name, "footage");
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("http_bind"));
    }
}
