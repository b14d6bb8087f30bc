// MIT License - Copyright (c) 2026 Peter Wright
// Configuration files: device inventory (JSON) and bus/bridge settings (TOML)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_DEVICES_FILE: &str = "devices.json";
pub const DEFAULT_SETTINGS_FILE: &str = "tuya2mqtt.toml";

// ---------------------------------------------------------------------------
// Device inventory
// ---------------------------------------------------------------------------

/// One top-level record of the device inventory.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    pub id: String,
    #[serde(alias = "address")]
    pub ip: String,
    pub key: String,
    #[serde(deserialize_with = "deserialize_version")]
    pub version: String,
    #[serde(default, rename = "subDevices")]
    pub sub_devices: Option<Vec<SubDeviceRecord>>,
    /// Datapoints to refresh on the slow poll gate, overriding `[bridge].refresh_dps`.
    #[serde(default)]
    pub refresh_dps: Option<Vec<u32>>,
}

/// A device reached through a gateway's connection.
#[derive(Debug, Clone, Deserialize)]
pub struct SubDeviceRecord {
    pub name: String,
    pub id: String,
    pub cid: String,
}

/// Protocol versions show up both as `3.3` and `"3.3"` in inventories.
fn deserialize_version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Version {
        Number(f64),
        Text(String),
    }

    match Version::deserialize(deserializer)? {
        Version::Number(v) if v.fract() == 0.0 => Ok(format!("{v:.1}")),
        Version::Number(v) => Ok(v.to_string()),
        Version::Text(s) if s.trim().is_empty() => {
            Err(serde::de::Error::custom("empty protocol version"))
        }
        Version::Text(s) => Ok(s.trim().to_string()),
    }
}

/// Parse an inventory document.
pub fn parse_inventory(text: &str) -> Result<Vec<DeviceRecord>, ConfigError> {
    serde_json::from_str(text).map_err(|e| ConfigError::InvalidInventory(e.to_string()))
}

/// Read and parse the inventory file at `path`.
pub fn load_inventory(path: &Path) -> Result<Vec<DeviceRecord>, ConfigError> {
    parse_inventory(&read_file(path)?)
}

// ---------------------------------------------------------------------------
// Bus and bridge settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub bridge: BridgeSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttSettings {
    pub hostname: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub base_topic: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    30
}

/// Timing and recovery knobs shared by every bridge loop.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSettings {
    #[serde(default = "default_tick")]
    pub tick_secs: u64,
    /// Devices drop connections after ~30s of silence.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_poll")]
    pub poll_secs: u64,
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// 0 keeps retrying for as long as the process runs.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub refresh_dps: Vec<u32>,
}

fn default_tick() -> u64 {
    5
}
fn default_heartbeat() -> u64 {
    9
}
fn default_poll() -> u64 {
    60
}
fn default_receive_timeout() -> u64 {
    250
}
fn default_response_timeout() -> u64 {
    5000
}
fn default_reconnect_delay() -> u64 {
    2000
}
fn default_max_reconnect_attempts() -> u32 {
    0
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            tick_secs: default_tick(),
            heartbeat_secs: default_heartbeat(),
            poll_secs: default_poll(),
            receive_timeout_ms: default_receive_timeout(),
            response_timeout_ms: default_response_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            refresh_dps: Vec::new(),
        }
    }
}

impl BridgeSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Backoff before reconnect attempt `attempt` (1-based): base, 2x, 4x, 8x, 16x, 16x, ...
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(4);
        Duration::from_millis(self.reconnect_delay_ms.saturating_mul(1u64 << shift))
    }

    /// Whether another attempt follows failed attempt `attempt` (1-based).
    pub fn retries_after(&self, attempt: u32) -> bool {
        self.max_reconnect_attempts == 0 || attempt < self.max_reconnect_attempts
    }
}

/// Parse a settings document.
pub fn parse_settings(text: &str) -> Result<Settings, ConfigError> {
    let settings: Settings =
        toml::from_str(text).map_err(|e| ConfigError::InvalidBus(e.to_string()))?;

    if settings.mqtt.hostname.trim().is_empty() {
        return Err(ConfigError::InvalidBus("mqtt.hostname is empty".into()));
    }
    if settings.mqtt.base_topic.trim().is_empty() {
        return Err(ConfigError::InvalidBus("mqtt.base_topic is empty".into()));
    }
    if settings.mqtt.base_topic.contains(['+', '#']) {
        return Err(ConfigError::InvalidBus(format!(
            "mqtt.base_topic must not contain wildcards: {}",
            settings.mqtt.base_topic
        )));
    }
    if settings.bridge.tick_secs == 0 {
        return Err(ConfigError::InvalidBus("bridge.tick_secs must be > 0".into()));
    }
    Ok(settings)
}

/// Read and parse the settings file at `path`.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    parse_settings(&read_file(path)?)
}

// ---------------------------------------------------------------------------
// File discovery
// ---------------------------------------------------------------------------

/// Resolve a configuration file.
///
/// An explicit path is used as-is. Otherwise `default_name` is looked up in
/// each of `search_dirs` in order.
pub fn locate(
    explicit: Option<&Path>,
    default_name: &str,
    search_dirs: &[PathBuf],
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::Missing {
            name: path.display().to_string(),
        });
    }

    search_dirs
        .iter()
        .map(|dir| dir.join(default_name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| ConfigError::Missing {
            name: default_name.to_string(),
        })
}

/// Current directory first, then the directory holding the executable.
pub fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd);
    }
    if let Ok(exe) = std::env::current_exe()
        && let Some(parent) = exe.parent()
    {
        dirs.push(parent.to_path_buf());
    }
    dirs
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::Missing {
                name: path.display().to_string(),
            }
        } else {
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inventory_with_gateway() {
        let records = parse_inventory(
            r#"[
                {"name": "Plug", "id": "p1", "ip": "10.0.0.2", "key": "k1", "version": 3.3},
                {"name": "Hub", "id": "g1", "ip": "10.0.0.3", "key": "k2", "version": "3.4",
                 "subDevices": [{"name": "Lamp", "id": "s1", "cid": "c1"}]}
            ]"#,
        )
        .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].version, "3.3");
        assert!(records[0].sub_devices.is_none());
        assert_eq!(records[1].version, "3.4");
        let subs = records[1].sub_devices.as_ref().unwrap();
        assert_eq!(subs[0].cid, "c1");
    }

    #[test]
    fn test_whole_number_version() {
        let records = parse_inventory(
            r#"[{"name": "A", "id": "a", "address": "h", "key": "k", "version": 3}]"#,
        )
        .unwrap();
        assert_eq!(records[0].version, "3.0");
        assert_eq!(records[0].ip, "h");
    }

    #[test]
    fn test_malformed_inventory() {
        let err = parse_inventory("{not json").unwrap_err();
        assert_eq!(err.exit_code(), 3);

        let err = parse_inventory(r#"[{"name": "A"}]"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInventory(_)));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = parse_settings(
            r#"
            [mqtt]
            hostname = "broker.local"
            username = "u"
            password = "p"
            base_topic = "tuya"
            "#,
        )
        .unwrap();

        assert_eq!(settings.mqtt.port, 1883);
        assert_eq!(settings.bridge.tick(), Duration::from_secs(5));
        assert_eq!(settings.bridge.heartbeat_interval(), Duration::from_secs(9));
        assert_eq!(settings.bridge.poll_interval(), Duration::from_secs(60));
        assert!(settings.bridge.refresh_dps.is_empty());
    }

    #[test]
    fn test_settings_bridge_overrides() {
        let settings = parse_settings(
            r#"
            [mqtt]
            hostname = "broker.local"
            base_topic = "home/tuya"

            [bridge]
            tick_secs = 1
            refresh_dps = [18, 19, 20]
            "#,
        )
        .unwrap();
        assert_eq!(settings.bridge.tick_secs, 1);
        assert_eq!(settings.bridge.refresh_dps, vec![18, 19, 20]);
        assert_eq!(settings.bridge.heartbeat_secs, 9);
    }

    #[test]
    fn test_malformed_settings() {
        let err = parse_settings("[mqtt]\nusername = \"u\"\n").unwrap_err();
        assert_eq!(err.exit_code(), 4);

        let err = parse_settings("[mqtt]\nhostname = \"\"\nbase_topic = \"t\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBus(_)));

        let err = parse_settings("[mqtt]\nhostname = \"h\"\nbase_topic = \"a/#\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBus(_)));
    }

    #[test]
    fn test_reconnect_backoff() {
        let bridge = BridgeSettings {
            reconnect_delay_ms: 100,
            ..BridgeSettings::default()
        };
        assert_eq!(bridge.reconnect_delay(1), Duration::from_millis(100));
        assert_eq!(bridge.reconnect_delay(2), Duration::from_millis(200));
        assert_eq!(bridge.reconnect_delay(5), Duration::from_millis(1600));
        assert_eq!(bridge.reconnect_delay(9), Duration::from_millis(1600));

        let huge = BridgeSettings {
            reconnect_delay_ms: u64::MAX / 4,
            ..BridgeSettings::default()
        };
        assert_eq!(huge.reconnect_delay(5), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_reconnect_budget() {
        let unlimited = BridgeSettings::default();
        assert!(unlimited.retries_after(1));
        assert!(unlimited.retries_after(10_000));

        let bounded = BridgeSettings {
            max_reconnect_attempts: 3,
            ..BridgeSettings::default()
        };
        assert!(bounded.retries_after(2));
        assert!(!bounded.retries_after(3));
    }

    #[test]
    fn test_locate_missing() {
        let err = locate(None, "definitely-not-here.json", &[]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));
        assert_eq!(err.exit_code(), 2);
    }
}
