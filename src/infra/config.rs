//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Nordic UART service, the common transport for BLE barcode scanners
const DEFAULT_SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
/// Nordic UART TX characteristic (peripheral -> central notifications)
const DEFAULT_CHARACTERISTIC_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// Raw bytes are text (lossy UTF-8)
    Utf8,
    /// Bytes are a base64 string wrapping the text
    Base64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionPlatform {
    Android,
    Ios,
    Desktop,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanSection {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_symbologies")]
    pub symbologies: Vec<String>,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self { cooldown_ms: default_cooldown_ms(), symbologies: default_symbologies() }
    }
}

fn default_cooldown_ms() -> u64 {
    2000
}

fn default_symbologies() -> Vec<String> {
    ["qr", "ean13", "ean8", "code128", "code39", "upc_a", "upc_e"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BleSection {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: String,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// Report every advertisement instead of one per peripheral
    #[serde(default)]
    pub allow_duplicates: bool,
    #[serde(default = "default_payload_encoding")]
    pub payload_encoding: PayloadEncoding,
}

impl Default for BleSection {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            allow_duplicates: false,
            payload_encoding: default_payload_encoding(),
        }
    }
}

fn default_service_uuid() -> String {
    DEFAULT_SERVICE_UUID.to_string()
}

fn default_characteristic_uuid() -> String {
    DEFAULT_CHARACTERISTIC_UUID.to_string()
}

fn default_discovery_timeout_ms() -> u64 {
    15_000
}

fn default_payload_encoding() -> PayloadEncoding {
    PayloadEncoding::Utf8
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionsSection {
    #[serde(default = "default_platform")]
    pub platform: PermissionPlatform,
    /// Android SDK level; 31+ uses the split scan/connect permissions
    #[serde(default = "default_android_api_level")]
    pub android_api_level: u32,
}

impl Default for PermissionsSection {
    fn default() -> Self {
        Self { platform: default_platform(), android_api_level: default_android_api_level() }
    }
}

fn default_platform() -> PermissionPlatform {
    PermissionPlatform::Android
}

fn default_android_api_level() -> u32 {
    31
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsSection {
    #[serde(default = "default_inbound_capacity")]
    pub camera_capacity: usize,
    #[serde(default = "default_inbound_capacity")]
    pub ble_capacity: usize,
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for ChannelsSection {
    fn default() -> Self {
        Self {
            camera_capacity: default_inbound_capacity(),
            ble_capacity: default_inbound_capacity(),
            command_capacity: default_command_capacity(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

fn default_inbound_capacity() -> usize {
    256
}

fn default_command_capacity() -> usize {
    32
}

fn default_broadcast_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: default_log_level(), json: false }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSection {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub scan: ScanSection,
    #[serde(default)]
    pub ble: BleSection,
    #[serde(default)]
    pub permissions: PermissionsSection,
    #[serde(default)]
    pub channels: ChannelsSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub metrics: MetricsSection,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    cooldown_ms: u64,
    symbologies: Vec<String>,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    discovery_timeout_ms: u64,
    allow_duplicates: bool,
    payload_encoding: PayloadEncoding,
    platform: PermissionPlatform,
    android_api_level: u32,
    camera_channel_capacity: usize,
    ble_channel_capacity: usize,
    command_channel_capacity: usize,
    broadcast_capacity: usize,
    log_level: String,
    log_json: bool,
    metrics_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_file: "default".to_string(),
            cooldown_ms: default_cooldown_ms(),
            symbologies: default_symbologies(),
            service_uuid: Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e),
            characteristic_uuid: Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            allow_duplicates: false,
            payload_encoding: PayloadEncoding::Utf8,
            platform: default_platform(),
            android_api_level: default_android_api_level(),
            camera_channel_capacity: default_inbound_capacity(),
            ble_channel_capacity: default_inbound_capacity(),
            command_channel_capacity: default_command_capacity(),
            broadcast_capacity: default_broadcast_capacity(),
            log_level: default_log_level(),
            log_json: false,
            metrics_interval_secs: default_metrics_interval(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_file = path.display().to_string();
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)?;

        let service_uuid = Uuid::parse_str(&toml_config.ble.service_uuid).with_context(|| {
            format!("Invalid ble.service_uuid '{}'", toml_config.ble.service_uuid)
        })?;
        let characteristic_uuid = Uuid::parse_str(&toml_config.ble.characteristic_uuid)
            .with_context(|| {
                format!("Invalid ble.characteristic_uuid '{}'", toml_config.ble.characteristic_uuid)
            })?;

        if toml_config.scan.symbologies.is_empty() {
            anyhow::bail!("scan.symbologies must list at least one symbology");
        }

        Ok(Self {
            config_file: "inline".to_string(),
            cooldown_ms: toml_config.scan.cooldown_ms,
            symbologies: toml_config.scan.symbologies,
            service_uuid,
            characteristic_uuid,
            discovery_timeout_ms: toml_config.ble.discovery_timeout_ms,
            allow_duplicates: toml_config.ble.allow_duplicates,
            payload_encoding: toml_config.ble.payload_encoding,
            platform: toml_config.permissions.platform,
            android_api_level: toml_config.permissions.android_api_level,
            // Zero-capacity channels panic in tokio; clamp to 1
            camera_channel_capacity: toml_config.channels.camera_capacity.max(1),
            ble_channel_capacity: toml_config.channels.ble_capacity.max(1),
            command_channel_capacity: toml_config.channels.command_capacity.max(1),
            broadcast_capacity: toml_config.channels.broadcast_capacity.max(1),
            log_level: toml_config.logging.level,
            log_json: toml_config.logging.json,
            metrics_interval_secs: toml_config.metrics.interval_secs,
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn cooldown_ms(&self) -> u64 {
        self.cooldown_ms
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn symbologies(&self) -> &[String] {
        &self.symbologies
    }

    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    pub fn characteristic_uuid(&self) -> Uuid {
        self.characteristic_uuid
    }

    pub fn discovery_timeout_ms(&self) -> u64 {
        self.discovery_timeout_ms
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn allow_duplicates(&self) -> bool {
        self.allow_duplicates
    }

    pub fn payload_encoding(&self) -> PayloadEncoding {
        self.payload_encoding
    }

    pub fn platform(&self) -> PermissionPlatform {
        self.platform
    }

    pub fn android_api_level(&self) -> u32 {
        self.android_api_level
    }

    pub fn camera_channel_capacity(&self) -> usize {
        self.camera_channel_capacity
    }

    pub fn ble_channel_capacity(&self) -> usize {
        self.ble_channel_capacity
    }

    pub fn command_channel_capacity(&self) -> usize {
        self.command_channel_capacity
    }

    pub fn broadcast_capacity(&self) -> usize {
        self.broadcast_capacity
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn log_json(&self) -> bool {
        self.log_json
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    /// Builder method to tune the camera duplicate-suppression window
    pub fn with_cooldown_ms(mut self, ms: u64) -> Self {
        self.cooldown_ms = ms;
        self
    }

    /// Builder method to tune the discovery session length
    pub fn with_discovery_timeout_ms(mut self, ms: u64) -> Self {
        self.discovery_timeout_ms = ms;
        self
    }

    pub fn with_payload_encoding(mut self, encoding: PayloadEncoding) -> Self {
        self.payload_encoding = encoding;
        self
    }

    pub fn with_platform(mut self, platform: PermissionPlatform, android_api_level: u32) -> Self {
        self.platform = platform;
        self.android_api_level = android_api_level;
        self
    }
}
